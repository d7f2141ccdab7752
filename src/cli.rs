use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use crate::broker::{Broker, MemoryBroker, NatsBroker};
use crate::config::{BrokerConfig, BrokerKind, GatewayConfig, load_route_rules};
use crate::gateway_log::{self, Level};
use crate::server::{Gateway, GatewayServer};
use crate::worker::{EchoHandler, MessageHandler, run_worker, spawn_worker};

#[derive(Parser)]
#[command(name = "restmq-gateway")]
#[command(about = "Expose message-queue workers as HTTP endpoints", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Serve(ServeArgs),
    Worker(WorkerArgs),
    CheckConfig(CheckConfigArgs),
}

#[derive(Parser)]
#[command(
    about = "Run the gateway HTTP server.",
    long_about = "Serves the configured API routes, the ticket polling endpoints and the heart-beat. Routes are reloaded from the config file on SIGHUP.",
    after_help = "Main options:\n  --config <PATH>\n\nOptional options:\n  --echo-worker <QUEUE> (repeatable; answers every ticket on QUEUE with \"ok\")"
)]
struct ServeArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long = "echo-worker", value_name = "QUEUE")]
    echo_workers: Vec<String>,
}

#[derive(Parser)]
#[command(
    about = "Run an echo worker against a shared broker.",
    after_help = "Main options:\n  --config <PATH>\n  --queue <NAME>\n\nOptional options:\n  --delay-ms <N> (default: 0)"
)]
struct WorkerArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    queue: String,
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[derive(Parser)]
#[command(about = "Validate a config file and print the compiled routes.")]
struct CheckConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Serve(args) => args.run(),
            Command::Worker(args) => args.run(),
            Command::CheckConfig(args) => args.run(),
        }
    }
}

impl ServeArgs {
    fn run(self) -> Result<()> {
        let config = GatewayConfig::load(&self.config)?;
        init_logging(config.log_dir.clone(), config.log_level)?;
        let runtime = Runtime::new().context("failed to create gateway runtime")?;
        runtime.block_on(self.serve(config))
    }

    async fn serve(self, config: GatewayConfig) -> Result<()> {
        let broker = connect_broker(&config.broker).await?;
        let gateway = Arc::new(Gateway::new(config, Arc::clone(&broker)));
        let replies = gateway
            .start_reply_consumer()
            .await
            .context("failed to start reply consumer")?;

        let mut workers = Vec::new();
        for queue in &self.echo_workers {
            let handler: Arc<dyn MessageHandler> = Arc::new(EchoHandler::new());
            workers.push(spawn_worker(Arc::clone(&broker), queue, handler).await?);
        }

        let server = GatewayServer::bind(Arc::clone(&gateway)).await?;
        println!(
            "restmq-gateway listening on http://{}; press Ctrl+C to stop.",
            server.local_addr()
        );
        wait_for_shutdown(&gateway, &self.config).await?;
        println!("shutting down restmq-gateway...");

        server.stop().await?;
        replies.abort();
        for worker in workers {
            worker.abort();
        }
        Ok(())
    }
}

impl WorkerArgs {
    fn run(self) -> Result<()> {
        let config = GatewayConfig::load(&self.config)?;
        if config.broker.kind == BrokerKind::Memory {
            anyhow::bail!(
                "the worker command needs a shared broker; set broker.kind to nats in {}",
                self.config.display()
            );
        }
        init_logging(config.log_dir.clone(), config.log_level)?;
        let handler: Arc<dyn MessageHandler> = if self.delay_ms > 0 {
            Arc::new(EchoHandler::with_delay(Duration::from_millis(self.delay_ms)))
        } else {
            Arc::new(EchoHandler::new())
        };

        let runtime = Runtime::new().context("failed to create worker runtime")?;
        runtime.block_on(async {
            let broker = connect_broker(&config.broker).await?;
            tokio::select! {
                result = run_worker(broker, &self.queue, handler) => result?,
                result = tokio::signal::ctrl_c() => result?,
            }
            Ok::<(), anyhow::Error>(())
        })
    }
}

impl CheckConfigArgs {
    fn run(self) -> Result<()> {
        let config = GatewayConfig::load(&self.config)?;
        println!("listen: {}", config.bind_addr);
        println!(
            "api prefix: {}",
            if config.api_prefix.is_empty() {
                "/"
            } else {
                config.api_prefix.as_str()
            }
        );
        println!("reply queue: {}", config.reply_queue);
        println!("routes ({}):", config.routes.len());
        for rule in config.routes.rules() {
            println!(
                "  {} {} [{:?}] -> {}",
                rule.methods,
                rule.pattern,
                rule.match_type,
                rule.kind().as_str()
            );
        }
        Ok(())
    }
}

fn init_logging(log_dir: Option<PathBuf>, level: Level) -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level.as_tracing())
        .with_writer(std::io::stderr)
        .try_init();
    if let Some(dir) = gateway_log::init(log_dir, level)? {
        println!("gateway logs: {}", dir.join("gateway.log").display());
    }
    Ok(())
}

async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.kind {
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
        BrokerKind::Nats => {
            let broker = NatsBroker::connect(&config.url, config.queue_group.clone())
                .await
                .with_context(|| format!("failed to connect to {}", config.url))?;
            Ok(Arc::new(broker))
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(gateway: &Gateway, config_path: &Path) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(());
            }
            _ = hangup.recv() => reload_routes(gateway, config_path),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_gateway: &Gateway, _config_path: &Path) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg_attr(not(unix), allow(dead_code))]
fn reload_routes(gateway: &Gateway, config_path: &Path) {
    let rules = match load_route_rules(config_path) {
        Ok(rules) => rules,
        Err(err) => {
            gateway_log::error(module_path!(), format!("route reload failed: {err:#}"));
            return;
        }
    };
    if let Err(err) = gateway.reload_routes(&rules) {
        gateway_log::error(
            module_path!(),
            format!("route reload rejected, keeping current routes: {err}"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_serve_with_echo_workers() {
        let cli = Cli::try_parse_from([
            "restmq-gateway",
            "serve",
            "--config",
            "gateway.yaml",
            "--echo-worker",
            "q1",
            "--echo-worker",
            "q2",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.config, PathBuf::from("gateway.yaml"));
        assert_eq!(args.echo_workers, vec!["q1", "q2"]);
    }

    #[test]
    fn worker_defaults_to_no_delay() {
        let cli = Cli::try_parse_from([
            "restmq-gateway",
            "worker",
            "--config",
            "gateway.yaml",
            "--queue",
            "q1",
        ])
        .unwrap();
        let Command::Worker(args) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!(args.delay_ms, 0);
        assert_eq!(args.queue, "q1");
    }

    #[test]
    fn check_config_accepts_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "api:\n  - path: /v1/t1\n    handler: message_queue\n    queue_name: q1\n",
        )
        .unwrap();
        CheckConfigArgs { config: path }.run().unwrap();
    }

    #[test]
    fn check_config_reports_bad_route() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "api:\n  - path: /v1/t1\n    handler: message_queue\n").unwrap();
        let err = CheckConfigArgs { config: path }.run().unwrap_err();
        assert!(format!("{err:#}").contains("queue_name"));
    }
}
