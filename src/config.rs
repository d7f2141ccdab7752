use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngExt, rng};
use serde::Deserialize;
use uuid::Uuid;

use crate::correlator::CorrelatorSettings;
use crate::error::ConfigError;
use crate::gateway_log::Level;
use crate::routes::{RawRouteRule, RouteTable};
use crate::ticket::ExpiryPolicy;

/// The configuration file as written, before validation.
#[derive(Clone, Debug, Deserialize)]
pub struct RawGatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reply_queue: Option<String>,
    #[serde(default)]
    pub internal_url: Option<String>,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub file_storage: Option<PathBuf>,
    #[serde(default)]
    pub tickets: TicketsConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub api: Vec<RawRouteRule>,
}

impl Default for RawGatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            log_level: None,
            log_dir: None,
            jwt_secret: None,
            broker: BrokerConfig::default(),
            reply_queue: None,
            internal_url: None,
            api_prefix: default_api_prefix(),
            file_storage: None,
            tickets: TicketsConfig::default(),
            correlator: CorrelatorConfig::default(),
            max_body_bytes: default_max_body_bytes(),
            api: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Memory,
    Nats,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_queue_group")]
    pub queue_group: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: default_nats_url(),
            queue_group: default_queue_group(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TicketsConfig {
    #[serde(default = "default_sync_ttl")]
    pub sync_ttl_secs: u64,
    #[serde(default = "default_async_ttl")]
    pub async_ttl_secs: u64,
    #[serde(default = "default_internal_ttl")]
    pub internal_ttl_secs: u64,
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            sync_ttl_secs: default_sync_ttl(),
            async_ttl_secs: default_async_ttl(),
            internal_ttl_secs: default_internal_ttl(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_reply_ttl")]
    pub reply_ttl_secs: u64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            reply_ttl_secs: default_reply_ttl(),
            poll_timeout_secs: default_poll_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_max_body_bytes() -> usize {
    200 * 1024 * 1024
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_queue_group() -> String {
    "restmq-gateway".to_string()
}

fn default_sync_ttl() -> u64 {
    120
}

fn default_async_ttl() -> u64 {
    24 * 60 * 60
}

fn default_internal_ttl() -> u64 {
    60 * 60
}

fn default_reply_ttl() -> u64 {
    60 * 60
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    30
}

/// Validated gateway configuration. Built once at startup; nothing downstream re-checks it.
#[derive(Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub log_level: Level,
    pub log_dir: Option<PathBuf>,
    pub jwt_secret: String,
    pub broker: BrokerConfig,
    pub reply_queue: String,
    pub internal_url: String,
    /// Empty when routes are mounted at the root.
    pub api_prefix: String,
    pub file_storage: PathBuf,
    pub expiry: ExpiryPolicy,
    pub correlator: CorrelatorSettings,
    pub max_body_bytes: usize,
    pub routes: RouteTable,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field("broker", &self.broker)
            .field("reply_queue", &self.reply_queue)
            .field("internal_url", &self.internal_url)
            .field("api_prefix", &self.api_prefix)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    pub fn from_raw(raw: RawGatewayConfig) -> Result<Self, ConfigError> {
        let bind_addr: SocketAddr = format!("{}:{}", raw.bind_addr, raw.port)
            .parse()
            .map_err(|err| {
                ConfigError::Invalid(format!("bind address {}: {err}", raw.bind_addr))
            })?;
        let routes = RouteTable::compile(&raw.api)?;

        let tickets = &raw.tickets;
        let expiry = ExpiryPolicy {
            sync_ttl: positive_duration("tickets.sync_ttl_secs", tickets.sync_ttl_secs)?,
            async_ttl: positive_duration("tickets.async_ttl_secs", tickets.async_ttl_secs)?,
            internal_ttl: positive_duration(
                "tickets.internal_ttl_secs",
                tickets.internal_ttl_secs,
            )?,
        };
        let correlator = CorrelatorSettings {
            reply_ttl: positive_secs("correlator.reply_ttl_secs", raw.correlator.reply_ttl_secs)?,
            poll_timeout: positive_secs(
                "correlator.poll_timeout_secs",
                raw.correlator.poll_timeout_secs,
            )?,
            sweep_interval: positive_secs(
                "correlator.sweep_interval_secs",
                raw.correlator.sweep_interval_secs,
            )?,
        };
        if raw.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }

        let internal_url = match non_empty(raw.internal_url) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", raw.port),
        };

        Ok(Self {
            bind_addr,
            log_level: raw
                .log_level
                .as_deref()
                .map(Level::parse)
                .unwrap_or(Level::Warn),
            log_dir: raw.log_dir,
            jwt_secret: non_empty(raw.jwt_secret).unwrap_or_else(random_secret),
            broker: raw.broker,
            reply_queue: non_empty(raw.reply_queue)
                .unwrap_or_else(|| format!("restmq-reply-{}", Uuid::new_v4().simple())),
            internal_url,
            api_prefix: normalize_prefix(&raw.api_prefix),
            file_storage: raw
                .file_storage
                .unwrap_or_else(|| std::env::temp_dir().join("restmq-attachments")),
            expiry,
            correlator,
            max_body_bytes: raw.max_body_bytes,
            routes,
        })
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let raw = parse_raw(contents)?;
        Ok(Self::from_raw(raw)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = load_raw(path)?;
        Self::from_raw(raw).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn with_internal_url(mut self, internal_url: impl Into<String>) -> Self {
        self.internal_url = internal_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Strip the API mount point from a request path. `None` when the path is outside it.
    pub fn api_relative_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.api_prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.api_prefix.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

/// Route rules from a configuration file, for reloading without a restart.
pub fn load_route_rules(path: &Path) -> anyhow::Result<Vec<RawRouteRule>> {
    Ok(load_raw(path)?.api)
}

fn load_raw(path: &Path) -> anyhow::Result<RawGatewayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_raw(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_raw(contents: &str) -> anyhow::Result<RawGatewayConfig> {
    if contents
        .lines()
        .all(|line| line.trim().is_empty() || line.trim().starts_with('#'))
    {
        return Ok(RawGatewayConfig::default());
    }
    let raw: RawGatewayConfig = serde_yaml_bw::from_str(contents)?;
    Ok(raw)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn positive_secs(key: &str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_secs(value))
}

fn positive_duration(key: &str, value: u64) -> Result<chrono::Duration, ConfigError> {
    let duration = positive_secs(key, value)?;
    chrono::Duration::from_std(duration)
        .map_err(|err| ConfigError::Invalid(format!("{key} out of range: {err}")))
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// A fresh signing secret for deployments that do not configure one. Tokens then stop
/// verifying across restarts.
fn random_secret() -> String {
    let mut rng = rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.random_range(0..=u8::MAX)).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}
