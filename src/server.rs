use std::{convert::Infallible, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Limited};
use hyper::{
    Method, Request, StatusCode,
    body::{Bytes, Incoming},
    header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderValue},
    server::conn::http1::Builder as Http1Builder,
    service::service_fn,
};
use hyper_util::rt::tokio::TokioIo;
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::attachments::AttachmentStore;
use crate::broker::{Broker, BrokerError};
use crate::config::GatewayConfig;
use crate::correlator::{CorrelatorTasks, ReplyCorrelator};
use crate::error::ConfigError;
use crate::gateway_log;
use crate::guard::{TicketAccessGuard, authorize_attachment};
use crate::handler::{
    GatewayRequest, GatewayResponse, HandlerRegistry, bytes_response, empty_response,
    error_response, json_response,
};
use crate::ingress::{HttpTicketPoller, IngressSettings, MessageQueueHandler, TicketPoller};
use crate::proxy::ReverseProxyHandler;
use crate::routes::{RawRouteRule, RouteTable, SharedRouteTable};
use crate::ticket::Reply;
use crate::token::TokenCodec;

const HEART_BEAT_PATH: &str = "/heart-beat";
const TICKETS_PREFIX: &str = "/tickets/";
const CACHE_STATUS_ID: &str = "_cache";
/// Extra time the internal poll client allows on top of the poll timeout before giving up.
const POLL_GRACE: Duration = Duration::from_secs(5);

/// Everything a request needs, built once from a validated configuration.
pub struct Gateway {
    config: GatewayConfig,
    routes: SharedRouteTable,
    handlers: HandlerRegistry,
    correlator: Arc<ReplyCorrelator>,
    guard: TicketAccessGuard,
    attachments: AttachmentStore,
    broker: Arc<dyn Broker>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, broker: Arc<dyn Broker>) -> Self {
        let poller = Arc::new(HttpTicketPoller::new(
            config.correlator.poll_timeout + POLL_GRACE,
        ));
        Self::with_poller(config, broker, poller)
    }

    pub fn with_poller(
        config: GatewayConfig,
        broker: Arc<dyn Broker>,
        poller: Arc<dyn TicketPoller>,
    ) -> Self {
        let codec = Arc::new(TokenCodec::new(config.jwt_secret.as_bytes()));
        let attachments =
            AttachmentStore::new(config.file_storage.clone(), config.internal_url.clone());
        let message_queue = MessageQueueHandler::new(
            Arc::clone(&broker),
            Arc::clone(&codec),
            attachments.clone(),
            poller,
            IngressSettings {
                reply_queue: config.reply_queue.clone(),
                internal_url: config.internal_url.clone(),
                expiry: config.expiry,
            },
        );
        let handlers = HandlerRegistry {
            message_queue: Arc::new(message_queue),
            reverse_proxy: Arc::new(ReverseProxyHandler::new()),
        };
        Self {
            routes: SharedRouteTable::new(config.routes.clone()),
            correlator: Arc::new(ReplyCorrelator::new(Arc::clone(&codec), config.correlator)),
            guard: TicketAccessGuard::new(codec),
            handlers,
            attachments,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Arc<ReplyCorrelator> {
        &self.correlator
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.snapshot()
    }

    /// Compile and swap in a new route table. On error the current table stays in place.
    pub fn reload_routes(&self, raw_rules: &[RawRouteRule]) -> Result<usize, ConfigError> {
        let table = RouteTable::compile(raw_rules)?;
        let count = table.len();
        self.routes.replace(table);
        gateway_log::info(module_path!(), format!("loaded {count} route(s)"));
        Ok(count)
    }

    pub async fn start_reply_consumer(&self) -> Result<CorrelatorTasks, BrokerError> {
        Arc::clone(&self.correlator)
            .start(Arc::clone(&self.broker), &self.config.reply_queue)
            .await
    }

    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let path = request.uri.path().to_string();
        gateway_log::info(
            module_path!(),
            format!("request received: {} {}", request.method, path),
        );

        if path == HEART_BEAT_PATH {
            return json_response(StatusCode::OK, json!({ "status": "ok" }));
        }
        if let Some(rest) = path.strip_prefix(TICKETS_PREFIX) {
            return self.handle_ticket_route(&request, rest).await;
        }
        let Some(relative) = self.config.api_relative_path(&path) else {
            return error_response(StatusCode::NOT_FOUND, "no route");
        };
        let relative = relative.to_string();
        let routes = self.routes.snapshot();
        let Some(route) = routes.match_request(request.method.as_str(), &relative) else {
            return error_response(StatusCode::NOT_FOUND, "no route");
        };
        let handler = Arc::clone(self.handlers.handler_for(route.rule.kind()));
        handler.handle(request.with_path(relative), route).await
    }

    async fn handle_ticket_route(&self, request: &GatewayRequest, rest: &str) -> GatewayResponse {
        if request.method != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "only GET allowed");
        }
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [CACHE_STATUS_ID] => match serde_json::to_value(self.correlator.status()) {
                Ok(status) => json_response(StatusCode::OK, status),
                Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            },
            [ticket_id] if !ticket_id.is_empty() => self.poll_ticket(request, ticket_id).await,
            [ticket_id, "attachments", name] if !ticket_id.is_empty() && !name.is_empty() => {
                self.download_attachment(request, ticket_id, name).await
            }
            _ => error_response(StatusCode::NOT_FOUND, "no route"),
        }
    }

    async fn poll_ticket(&self, request: &GatewayRequest, ticket_id: &str) -> GatewayResponse {
        if let Err(err) = self.guard.authenticate(&request.headers, ticket_id) {
            return empty_response(err.status());
        }
        let timeout = self.config.correlator.poll_timeout;
        match self.correlator.await_reply(ticket_id, timeout).await {
            Ok(reply) => reply_response(&reply),
            Err(err) => {
                gateway_log::info(module_path!(), err.to_string());
                error_response(err.status(), err.to_string())
            }
        }
    }

    async fn download_attachment(
        &self,
        request: &GatewayRequest,
        ticket_id: &str,
        name: &str,
    ) -> GatewayResponse {
        let claims = match self.guard.authenticate(&request.headers, ticket_id) {
            Ok(claims) => claims,
            Err(err) => return empty_response(err.status()),
        };
        if let Err(err) = authorize_attachment(&claims, name) {
            return empty_response(err.status());
        }
        match self.attachments.read(ticket_id, name).await {
            Ok(Some(bytes)) => {
                let mut response = bytes_response(StatusCode::OK, Bytes::from(bytes));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                response
            }
            Ok(None) => empty_response(StatusCode::NOT_FOUND),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                empty_response(StatusCode::NOT_FOUND)
            }
            Err(err) => {
                gateway_log::error(
                    module_path!(),
                    format!("failed to read attachment {name} of ticket {ticket_id}: {err}"),
                );
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read attachment")
            }
        }
    }
}

/// The HTTP answer for a worker reply: its status, content type (or disposition) and body.
pub fn reply_response(reply: &Reply) -> GatewayResponse {
    let status = StatusCode::from_u16(reply.http_status).unwrap_or(StatusCode::OK);
    let mut response = bytes_response(status, Bytes::from(reply.body_bytes()));
    if let Ok(value) = HeaderValue::from_str(&reply.effective_content_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    if let Some(value) = reply
        .content_disposition
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    response
}

pub struct GatewayServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl GatewayServer {
    pub async fn bind(gateway: Arc<Gateway>) -> Result<Self> {
        let addr = gateway.config().bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway listener on {addr}"))?;
        Self::from_listener(listener, gateway)
    }

    pub fn from_listener(listener: TcpListener, gateway: Arc<Gateway>) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            gateway_log::info(
                module_path!(),
                format!("gateway listening on http://{local_addr}"),
            );
            let mut shutdown = rx;
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    accept = listener.accept() => match accept {
                        Ok((stream, peer)) => {
                            let connection_gateway = gateway.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    handle_request(req, connection_gateway.clone(), peer)
                                });
                                let http = Http1Builder::new();
                                let stream = TokioIo::new(stream);
                                if let Err(err) = http.serve_connection(stream, service).await {
                                    gateway_log::debug(
                                        module_path!(),
                                        format!("gateway connection error: {err}"),
                                    );
                                }
                            });
                        }
                        Err(err) => {
                            gateway_log::error(
                                module_path!(),
                                format!("gateway accept error: {err}"),
                            );
                        }
                    },
                }
            }
        });
        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|err| anyhow::anyhow!("gateway server task failed: {err}"))?;
        }
        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    peer: SocketAddr,
) -> Result<GatewayResponse, Infallible> {
    let (parts, body) = req.into_parts();
    let limit = gateway.config().max_body_bytes;
    let body = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                return Ok(error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "request body too large",
                ));
            }
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
            ));
        }
    };
    let request =
        GatewayRequest::new(parts.method, parts.uri, parts.headers, body).with_remote_addr(peer);
    Ok(gateway.handle(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::token::TicketClaims;
    use chrono::Utc;
    use hyper::HeaderMap;
    use hyper::header::AUTHORIZATION;
    use tempfile::TempDir;

    fn gateway(storage: &TempDir) -> Gateway {
        let yaml = format!(
            "jwt_secret: server-secret\nfile_storage: {}\ncorrelator:\n  poll_timeout_secs: 1\napi:\n  - path: /v1/t1\n    handler: message_queue\n    queue_name: q1\n",
            storage.path().display()
        );
        let config = GatewayConfig::from_yaml_str(&yaml).unwrap();
        Gateway::new(config, Arc::new(MemoryBroker::new()))
    }

    fn get(uri: &str, token: Option<&str>) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
            );
        }
        GatewayRequest::new(Method::GET, uri.parse().unwrap(), headers, Bytes::new())
    }

    fn sign(claims: TicketClaims) -> String {
        TokenCodec::new(b"server-secret").sign(&claims).unwrap()
    }

    async fn body_of(response: GatewayResponse) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn heart_beat_and_unknown_paths() {
        let storage = tempfile::tempdir().unwrap();
        let gateway = gateway(&storage);
        assert_eq!(
            gateway.handle(get("/heart-beat", None)).await.status(),
            StatusCode::OK
        );
        assert_eq!(
            gateway.handle(get("/api/v1/nope", None)).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            gateway.handle(get("/v1/t1", None)).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn cache_status_lists_unclaimed_replies() {
        let storage = tempfile::tempdir().unwrap();
        let gateway = gateway(&storage);
        let token = sign(TicketClaims::new("X", Utc::now() + chrono::Duration::minutes(1)));
        let payload = json!({"ticketId": "X", "body": "ok", "jwtToken": token}).to_string();
        gateway.correlator().consume_reply(payload.as_bytes()).unwrap();

        let response = gateway.handle(get("/tickets/_cache", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let status: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(status["cache_size"], 1);
        assert_eq!(status["cache_keys"], json!(["X"]));
        assert_eq!(status["pending_waiter_count"], 0);
    }

    #[tokio::test]
    async fn ticket_routes_are_get_only() {
        let storage = tempfile::tempdir().unwrap();
        let gateway = gateway(&storage);
        let request = GatewayRequest::new(
            Method::POST,
            "/tickets/abc".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
        );
        assert_eq!(
            gateway.handle(request).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn poll_without_reply_times_out() {
        let storage = tempfile::tempdir().unwrap();
        let gateway = gateway(&storage);
        let token = sign(TicketClaims::new("T", Utc::now() + chrono::Duration::minutes(1)));
        let response = gateway.handle(get("/tickets/T", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(gateway.correlator().status().pending_waiter_count, 0);
    }

    #[tokio::test]
    async fn attachment_download_checks_allow_list() {
        let storage = tempfile::tempdir().unwrap();
        let gateway = gateway(&storage);
        let stored = gateway
            .attachments()
            .persist("T", Some("a.txt"), None, b"payload")
            .await
            .unwrap();
        let token = sign(
            TicketClaims::new("T", Utc::now() + chrono::Duration::minutes(1))
                .with_attachments(vec![stored.name.clone()]),
        );

        let uri = format!("/tickets/T/attachments/{}", stored.name);
        let response = gateway.handle(get(&uri, Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, Bytes::from_static(b"payload"));

        let response = gateway
            .handle(get("/tickets/T/attachments/other", Some(&token)))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = gateway.handle(get(&uri, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn reload_keeps_old_table_on_error() {
        let storage = tempfile::tempdir().unwrap();
        let gateway = gateway(&storage);
        let bad: RawRouteRule =
            serde_json::from_value(json!({"path": "/x", "handler": "nope"})).unwrap();
        assert!(gateway.reload_routes(&[bad]).is_err());
        assert_eq!(gateway.routes().len(), 1);

        let good: RawRouteRule = serde_json::from_value(
            json!({"path": "/x", "handler": "message_queue", "queue_name": "qx"}),
        )
        .unwrap();
        assert_eq!(gateway.reload_routes(&[good]).unwrap(), 1);
        assert!(gateway.routes().match_request("GET", "/v1/t1").is_none());
        assert!(gateway.routes().match_request("GET", "/x").is_some());
    }

    #[test]
    fn reply_response_uses_reply_metadata() {
        let reply: Reply = serde_json::from_value(json!({
            "ticketId": "X",
            "httpStatus": 201,
            "contentType": "text/csv",
            "contentDisposition": "attachment; filename=\"out.csv\"",
            "body": "a,b",
            "jwtToken": "t"
        }))
        .unwrap();
        let response = reply_response(&reply);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/csv");
        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"out.csv\""
        );
    }
}
