//! Message-queue handler: turns a routed HTTP request into a ticket on a worker queue.
//!
//! Async callers get the ticket back immediately. Sync callers are parked on an internal poll of
//! the ticket endpoint, and whatever that poll returns is relayed to them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::{Map, Value};

use crate::attachments::AttachmentStore;
use crate::broker::Broker;
use crate::error::GatewayError;
use crate::gateway_log;
use crate::handler::{
    GatewayRequest, GatewayResponse, RequestHandler, error_response, json_response,
    relay_response,
};
use crate::routes::{RouteMatch, RouteTarget};
use crate::ticket::{
    AttachmentRef, ExpiryPolicy, QueueMessage, RequestSnapshot, TicketMode, TicketReceipt,
    mint_ticket_id, ticket_url,
};
use crate::token::{TicketClaims, TokenCodec};

#[derive(Clone, Debug)]
pub struct IngressSettings {
    pub reply_queue: String,
    /// Base URL the gateway reaches its own ticket endpoint on.
    pub internal_url: String,
    pub expiry: ExpiryPolicy,
}

/// A ticket that has been published to its worker queue.
#[derive(Clone, Debug)]
pub struct IssuedTicket {
    pub ticket_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Handed to the caller; proves ownership when polling.
    pub external_token: String,
}

impl IssuedTicket {
    pub fn receipt(&self) -> TicketReceipt {
        TicketReceipt {
            ticket_id: self.ticket_id.clone(),
            timestamp: self.issued_at.to_rfc3339(),
            expire_on: self.expires_at.timestamp(),
            jwt_token: self.external_token.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("ticket poll transport failure: {0}")]
    Transport(String),
    #[error("ticket poll failed: {0}")]
    Internal(String),
}

/// Fetches a ticket's outcome on behalf of a sync caller.
#[async_trait]
pub trait TicketPoller: Send + Sync {
    async fn poll(&self, url: &str, token: &str) -> Result<GatewayResponse, PollError>;
}

pub struct HttpTicketPoller {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpTicketPoller {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }
}

#[async_trait]
impl TicketPoller for HttpTicketPoller {
    async fn poll(&self, url: &str, token: &str) -> Result<GatewayResponse, PollError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Full::new(Bytes::new()))
            .map_err(|err| PollError::Internal(err.to_string()))?;
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| PollError::Transport(format!("no response from {url}")))?
            .map_err(|err| PollError::Transport(err.to_string()))?;
        relay_response(response)
            .await
            .map_err(|err| PollError::Transport(err.to_string()))
    }
}

pub struct MessageQueueHandler {
    broker: Arc<dyn Broker>,
    codec: Arc<TokenCodec>,
    attachments: AttachmentStore,
    poller: Arc<dyn TicketPoller>,
    settings: IngressSettings,
}

struct ParsedBody {
    body: Value,
    /// `None` unless the request was multipart.
    attachments: Option<Vec<AttachmentRef>>,
}

impl MessageQueueHandler {
    pub fn new(
        broker: Arc<dyn Broker>,
        codec: Arc<TokenCodec>,
        attachments: AttachmentStore,
        poller: Arc<dyn TicketPoller>,
        settings: IngressSettings,
    ) -> Self {
        Self {
            broker,
            codec,
            attachments,
            poller,
            settings,
        }
    }

    /// Mint a ticket for `request` and publish it to `queue`. Nothing is published unless the
    /// whole message could be built; stored attachments are removed on failure.
    pub async fn issue_ticket(
        &self,
        request: &GatewayRequest,
        queue: &str,
        mode: TicketMode,
    ) -> Result<IssuedTicket, GatewayError> {
        let issued_at = Utc::now();
        let expires_at = self.settings.expiry.expires_at(mode, issued_at);
        let ticket_id = mint_ticket_id();
        let external_token = self
            .codec
            .sign(&TicketClaims::new(&ticket_id, expires_at))
            .map_err(GatewayError::Signing)?;

        let published = self
            .publish_ticket(request, queue, &ticket_id, issued_at, expires_at)
            .await;
        if let Err(err) = published {
            if let Err(cleanup) = self.attachments.discard(&ticket_id).await {
                gateway_log::warn(
                    module_path!(),
                    format!("failed to discard attachments of ticket {ticket_id}: {cleanup}"),
                );
            }
            return Err(err);
        }
        Ok(IssuedTicket {
            ticket_id,
            issued_at,
            expires_at,
            external_token,
        })
    }

    async fn publish_ticket(
        &self,
        request: &GatewayRequest,
        queue: &str,
        ticket_id: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let parsed = self.read_body(request, ticket_id).await?;
        let mut internal_claims =
            TicketClaims::new(ticket_id, self.settings.expiry.internal_expires_at(issued_at));
        if let Some(stored) = &parsed.attachments {
            internal_claims = internal_claims
                .with_attachments(stored.iter().map(|item| item.name.clone()).collect());
        }
        let jwt_token = self
            .codec
            .sign(&internal_claims)
            .map_err(GatewayError::Signing)?;

        let message = QueueMessage {
            ticket_id: ticket_id.to_string(),
            expire_on: expires_at.to_rfc3339(),
            reply_to: self.settings.reply_queue.clone(),
            api: ticket_url(&self.settings.internal_url, ticket_id),
            jwt_token,
            attachments: parsed.attachments.unwrap_or_default(),
            request: RequestSnapshot {
                url: request.original_url(),
                hostname: request.hostname(),
                ip: request.ip(),
                headers: snapshot_headers(&request.headers),
                body: parsed.body,
            },
        };
        let payload = serde_json::to_vec(&message)?;

        self.broker
            .assert_queue(queue)
            .await
            .map_err(|source| GatewayError::QueueAssert {
                queue: queue.to_string(),
                source,
            })?;
        gateway_log::info(module_path!(), format!("proxying request to {queue}"));
        self.broker
            .publish(queue, payload)
            .await
            .map_err(|source| GatewayError::Publish {
                queue: queue.to_string(),
                source,
            })
    }

    async fn read_body(
        &self,
        request: &GatewayRequest,
        ticket_id: &str,
    ) -> Result<ParsedBody, GatewayError> {
        let content_type = request.content_type().unwrap_or_default();
        if !is_multipart(content_type) {
            return Ok(ParsedBody {
                body: parse_body(content_type, &request.body),
                attachments: None,
            });
        }
        let boundary = multer::parse_boundary(content_type)
            .map_err(|err| GatewayError::Multipart(err.to_string()))?;
        let body = request.body.clone();
        let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut fields = Map::new();
        let mut stored = Vec::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| GatewayError::Multipart(err.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let part_type = field.content_type().map(|mime| mime.to_string());
            match file_name {
                Some(original_name) => {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|err| GatewayError::Multipart(err.to_string()))?;
                    let attachment = self
                        .attachments
                        .persist(ticket_id, Some(&original_name), part_type.as_deref(), &bytes)
                        .await?;
                    stored.push(attachment);
                }
                None => {
                    let text = field
                        .text()
                        .await
                        .map_err(|err| GatewayError::Multipart(err.to_string()))?;
                    fields.insert(name, Value::String(text));
                }
            }
        }
        Ok(ParsedBody {
            body: Value::Object(fields),
            attachments: Some(stored),
        })
    }

    async fn relay(&self, issued: &IssuedTicket) -> GatewayResponse {
        let url = ticket_url(&self.settings.internal_url, &issued.ticket_id);
        gateway_log::info(module_path!(), format!("awaiting result at {url}"));
        match self.poller.poll(&url, &issued.external_token).await {
            Ok(response) => response,
            Err(PollError::Transport(message)) => {
                gateway_log::error(
                    module_path!(),
                    format!("ticket {} poll failed: {message}", issued.ticket_id),
                );
                error_response(StatusCode::GATEWAY_TIMEOUT, "timed out waiting for reply")
            }
            Err(err) => {
                gateway_log::error(
                    module_path!(),
                    format!("ticket {} poll failed: {err}", issued.ticket_id),
                );
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to await reply")
            }
        }
    }
}

#[async_trait]
impl RequestHandler for MessageQueueHandler {
    async fn handle(&self, request: GatewayRequest, route: RouteMatch) -> GatewayResponse {
        let RouteTarget::MessageQueue { queue_name } = &route.rule.target else {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "route is not bound to a queue",
            );
        };
        let mode = TicketMode::from_query(&request.query);
        let issued = match self.issue_ticket(&request, queue_name, mode).await {
            Ok(issued) => issued,
            Err(err) => {
                gateway_log::error(
                    module_path!(),
                    format!("failed to issue ticket for {}: {err}", request.path),
                );
                return error_response(err.status(), "failed to issue ticket");
            }
        };
        match mode {
            TicketMode::Async => match serde_json::to_value(issued.receipt()) {
                Ok(receipt) => json_response(StatusCode::OK, receipt),
                Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            },
            TicketMode::Sync => self.relay(&issued).await,
        }
    }
}

fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/")
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Decode a non-multipart body the way a worker expects to see it. Bodies that are neither
/// JSON, form data nor text are passed as base64.
pub fn parse_body(content_type: &str, body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    let media_type = media_type(content_type);
    if media_type == "application/json" || media_type.ends_with("+json") {
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
    }
    if media_type == "application/x-www-form-urlencoded" {
        let fields: Map<String, Value> = url::form_urlencoded::parse(body)
            .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
            .collect();
        return Value::Object(fields);
    }
    match std::str::from_utf8(body) {
        Ok(text) if media_type.is_empty() || media_type.starts_with("text/") => {
            Value::String(text.to_string())
        }
        _ => Value::String(STANDARD.encode(body)),
    }
}

fn snapshot_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut snapshot: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        snapshot
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, Consumer, MemoryBroker};
    use crate::handler::bytes_response;
    use crate::routes::{RawRouteRule, RouteTable};
    use hyper::header::{CONTENT_TYPE, HeaderValue};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const SECRET: &[u8] = b"ingress-secret";

    struct StubPoller {
        calls: Mutex<Vec<(String, String)>>,
        outcome: fn() -> Result<GatewayResponse, PollError>,
    }

    impl StubPoller {
        fn new(outcome: fn() -> Result<GatewayResponse, PollError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                outcome,
            })
        }
    }

    #[async_trait]
    impl TicketPoller for StubPoller {
        async fn poll(&self, url: &str, token: &str) -> Result<GatewayResponse, PollError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), token.to_string()));
            (self.outcome)()
        }
    }

    struct FailingBroker;

    #[async_trait]
    impl Broker for FailingBroker {
        async fn assert_queue(&self, _queue: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn publish(&self, queue: &str, _payload: Vec<u8>) -> Result<(), BrokerError> {
            Err(BrokerError::Closed(queue.to_string()))
        }

        async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
            Err(BrokerError::Closed(queue.to_string()))
        }
    }

    struct Fixture {
        handler: MessageQueueHandler,
        broker: MemoryBroker,
        poller: Arc<StubPoller>,
        storage: TempDir,
    }

    fn fixture_with(
        broker: Arc<dyn Broker>,
        memory: MemoryBroker,
        outcome: fn() -> Result<GatewayResponse, PollError>,
    ) -> Fixture {
        let storage = tempfile::tempdir().unwrap();
        let poller = StubPoller::new(outcome);
        let handler = MessageQueueHandler::new(
            broker,
            Arc::new(TokenCodec::new(SECRET)),
            AttachmentStore::new(storage.path(), "http://gateway.internal"),
            poller.clone(),
            IngressSettings {
                reply_queue: "replies".to_string(),
                internal_url: "http://gateway.internal".to_string(),
                expiry: ExpiryPolicy::default(),
            },
        );
        Fixture {
            handler,
            broker: memory,
            poller,
            storage,
        }
    }

    fn fixture(outcome: fn() -> Result<GatewayResponse, PollError>) -> Fixture {
        let broker = MemoryBroker::new();
        fixture_with(Arc::new(broker.clone()), broker, outcome)
    }

    fn ok_reply() -> Result<GatewayResponse, PollError> {
        Ok(bytes_response(StatusCode::OK, Bytes::from_static(b"ok")))
    }

    fn route() -> RouteMatch {
        let raw: RawRouteRule = serde_json::from_value(json!({
            "path": "/v1/t1",
            "handler": "message_queue",
            "queue_name": "q1"
        }))
        .unwrap();
        RouteTable::compile(&[raw])
            .unwrap()
            .match_request("GET", "/v1/t1")
            .unwrap()
    }

    fn request(uri: &str, content_type: Option<&str>, body: &'static [u8]) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("localhost:8080"));
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        }
        GatewayRequest::new(
            Method::POST,
            uri.parse().unwrap(),
            headers,
            Bytes::from_static(body),
        )
        .with_path("/v1/t1")
    }

    async fn next_message(broker: &MemoryBroker, queue: &str) -> QueueMessage {
        let mut consumer = broker.consume(queue).await.unwrap();
        let delivery = consumer.next().await.unwrap();
        serde_json::from_slice(&delivery.payload).unwrap()
    }

    async fn body_json(response: GatewayResponse) -> Value {
        use http_body_util::BodyExt;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn async_request_returns_receipt_and_publishes() {
        let fixture = fixture(ok_reply);
        let response = fixture
            .handler
            .handle(
                request("/api/v1/t1?async=true", Some("application/json"), br#"{"a":1}"#),
                route(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let receipt = body_json(response).await;
        let ticket_id = receipt["ticket_id"].as_str().unwrap().to_string();
        let expire_on = receipt["expire_on"].as_i64().unwrap();
        assert!((expire_on - (Utc::now().timestamp() + 86_400)).abs() <= 5);

        let codec = TokenCodec::new(SECRET);
        let external = codec
            .verify_for_ticket(receipt["jwt_token"].as_str().unwrap(), &ticket_id)
            .unwrap();
        assert_eq!(external.exp, expire_on);

        let message = next_message(&fixture.broker, "q1").await;
        assert_eq!(message.ticket_id, ticket_id);
        assert_eq!(message.reply_to, "replies");
        assert_eq!(
            message.api,
            format!("http://gateway.internal/tickets/{ticket_id}")
        );
        assert_eq!(message.request.body, json!({"a": 1}));
        assert_eq!(message.request.hostname, "localhost");
        assert_eq!(message.request.url, "/api/v1/t1?async=true");
        let internal = codec
            .verify_for_ticket(&message.jwt_token, &ticket_id)
            .unwrap();
        assert!(internal.attachments.is_none());
        assert!(fixture.poller.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_request_relays_internal_poll() {
        let fixture = fixture(ok_reply);
        let response = fixture
            .handler
            .handle(request("/api/v1/t1", None, b""), route())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let message = next_message(&fixture.broker, "q1").await;
        let calls = fixture.poller.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].0,
            format!("http://gateway.internal/tickets/{}", message.ticket_id)
        );
        let claims = TokenCodec::new(SECRET)
            .verify_for_ticket(&calls[0].1, &message.ticket_id)
            .unwrap();
        assert!(claims.exp <= Utc::now().timestamp() + 120);
    }

    #[tokio::test]
    async fn sync_transport_failure_is_504() {
        let refused = fixture(|| Err(PollError::Transport("connection refused".to_string())));
        let response = refused
            .handler
            .handle(request("/api/v1/t1", None, b""), route())
            .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let broken = fixture(|| Err(PollError::Internal("bad uri".to_string())));
        let response = broken
            .handler
            .handle(request("/api/v1/t1", None, b""), route())
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn multipart_upload_is_stored_and_listed_in_token() {
        let fixture = fixture(ok_reply);
        let body: &'static [u8] = b"--XBOUNDARY\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\r\n\
hi\r\n\
--XBOUNDARY\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
hello\r\n\
--XBOUNDARY--\r\n";
        let response = fixture
            .handler
            .handle(
                request(
                    "/api/v1/t1?async=1",
                    Some("multipart/form-data; boundary=XBOUNDARY"),
                    body,
                ),
                route(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let message = next_message(&fixture.broker, "q1").await;
        assert_eq!(message.request.body, json!({"note": "hi"}));
        assert_eq!(message.attachments.len(), 1);
        let attachment = &message.attachments[0];
        assert_eq!(attachment.size, 5);
        assert_eq!(attachment.original_name.as_deref(), Some("a.txt"));
        assert_eq!(attachment.content_type.as_deref(), Some("text/plain"));

        let stored = fixture
            .storage
            .path()
            .join(&message.ticket_id)
            .join(&attachment.name);
        assert_eq!(std::fs::read(stored).unwrap(), b"hello".to_vec());

        let claims = TokenCodec::new(SECRET)
            .verify_for_ticket(&message.jwt_token, &message.ticket_id)
            .unwrap();
        assert!(claims.allows_attachment(&attachment.name));
    }

    #[tokio::test]
    async fn publish_failure_is_500_and_discards_attachments() {
        let fixture = fixture_with(Arc::new(FailingBroker), MemoryBroker::new(), ok_reply);
        let body: &'static [u8] = b"--B\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\r\n\
hello\r\n\
--B--\r\n";
        let response = fixture
            .handler
            .handle(
                request(
                    "/api/v1/t1?async=true",
                    Some("multipart/form-data; boundary=B"),
                    body,
                ),
                route(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let leftovers = std::fs::read_dir(fixture.storage.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn parses_bodies_by_content_type() {
        assert_eq!(parse_body("application/json", b""), Value::Null);
        assert_eq!(
            parse_body("application/json; charset=utf-8", br#"{"k":[1]}"#),
            json!({"k": [1]})
        );
        assert_eq!(
            parse_body("application/x-www-form-urlencoded", b"a=1&b=two+words"),
            json!({"a": "1", "b": "two words"})
        );
        assert_eq!(parse_body("text/plain", b"hello"), json!("hello"));
        assert_eq!(
            parse_body("application/octet-stream", &[0xff, 0x00]),
            json!(STANDARD.encode([0xff, 0x00]))
        );
    }

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        let snapshot = snapshot_headers(&headers);
        assert_eq!(snapshot.get("x-tag").map(String::as_str), Some("a, b"));
    }
}
