//! Worker-side helpers: decode ticket messages from a queue and publish replies.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{Map, Value};
use sysinfo::System;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerError, Consumer};
use crate::error::ValidationError;
use crate::gateway_log;
use crate::ticket::{AttachmentRef, Reply, RequestSnapshot};

const REQUEST_FIELDS: [&str; 5] = ["url", "hostname", "ip", "headers", "body"];

/// A ticket message as a worker sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerMessage {
    pub ticket_id: String,
    pub reply_to: String,
    pub expire_on: DateTime<FixedOffset>,
    pub jwt_token: String,
    pub api: String,
    pub attachments: Vec<AttachmentRef>,
    pub request: RequestSnapshot,
}

impl WorkerMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;
        let Value::Object(object) = value else {
            return Err(ValidationError::Malformed("expected a JSON object".to_string()));
        };

        let ticket_id = required_str(&object, "ticketId")?;
        let reply_to = required_str(&object, "replyTo")?;
        let expire_on = DateTime::parse_from_rfc3339(&required_str(&object, "expireOn")?)
            .map_err(|_| ValidationError::InvalidFormat("expireOn"))?;

        let request = object
            .get("request")
            .ok_or(ValidationError::MissingField("request"))?;
        let fields = request
            .as_object()
            .ok_or(ValidationError::InvalidFormat("request"))?;
        for field in REQUEST_FIELDS {
            if !fields.contains_key(field) {
                return Err(ValidationError::MissingField(field));
            }
        }
        let request: RequestSnapshot = serde_json::from_value(request.clone())
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;

        let jwt_token = required_str(&object, "jwtToken")?;
        let attachments = match object.get("attachments") {
            Some(Value::Null) | None => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|_| ValidationError::InvalidFormat("attachments"))?,
        };
        let api = object
            .get("api")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            ticket_id,
            reply_to,
            expire_on,
            jwt_token,
            api,
            attachments,
            request,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_on.with_timezone(&Utc) <= now
    }

    pub fn reply(&self) -> ReplyBuilder {
        ReplyBuilder::for_message(self)
    }
}

fn required_str(object: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    match object.get(field) {
        None => Err(ValidationError::MissingField(field)),
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        Some(Value::String(_)) | Some(Value::Null) => Err(ValidationError::EmptyField(field)),
        Some(_) => Err(ValidationError::InvalidFormat(field)),
    }
}

/// Builds the reply for one ticket. The ticket id and token are echoed back unchanged.
#[derive(Clone, Debug)]
pub struct ReplyBuilder {
    ticket_id: String,
    jwt_token: String,
    http_status: u16,
    content_type: Option<String>,
    content_disposition: Option<String>,
}

impl ReplyBuilder {
    pub fn for_message(message: &WorkerMessage) -> Self {
        Self {
            ticket_id: message.ticket_id.clone(),
            jwt_token: message.jwt_token.clone(),
            http_status: 200,
            content_type: None,
            content_disposition: None,
        }
    }

    pub fn status(mut self, http_status: u16) -> Self {
        self.http_status = http_status;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_disposition(mut self, disposition: impl Into<String>) -> Self {
        self.content_disposition = Some(disposition.into());
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Reply {
        if self.content_type.is_none() {
            self.content_type = Some("text/plain".to_string());
        }
        self.build(Value::String(body.into()))
    }

    pub fn json(mut self, body: Value) -> Reply {
        if self.content_type.is_none() {
            self.content_type = Some("application/json".to_string());
        }
        self.build(body)
    }

    fn build(self, body: Value) -> Reply {
        Reply {
            ticket_id: self.ticket_id,
            http_status: self.http_status,
            content_type: self.content_type,
            content_disposition: self.content_disposition,
            body,
            jwt_token: self.jwt_token,
            created_on: Some(Utc::now().to_rfc3339()),
            pid: Some(std::process::id()),
            host: System::host_name(),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &WorkerMessage) -> Result<Reply>;
}

/// Replies `ok` to every message, optionally after a delay.
#[derive(Clone, Debug, Default)]
pub struct EchoHandler {
    delay: Option<Duration>,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: &WorkerMessage) -> Result<Reply> {
        gateway_log::info(
            module_path!(),
            format!("ticket {} for {}", message.ticket_id, message.request.url),
        );
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(message.reply().text("ok"))
    }
}

/// Consume `queue` until the broker closes it.
pub async fn run_worker(
    broker: Arc<dyn Broker>,
    queue: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), BrokerError> {
    broker.assert_queue(queue).await?;
    let consumer = broker.consume(queue).await?;
    serve(broker, consumer, handler).await;
    Ok(())
}

/// Like [`run_worker`], but returns once the consumer is attached.
pub async fn spawn_worker(
    broker: Arc<dyn Broker>,
    queue: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<JoinHandle<()>, BrokerError> {
    broker.assert_queue(queue).await?;
    let consumer = broker.consume(queue).await?;
    Ok(tokio::spawn(serve(broker, consumer, handler)))
}

async fn serve(broker: Arc<dyn Broker>, mut consumer: Consumer, handler: Arc<dyn MessageHandler>) {
    gateway_log::info(
        module_path!(),
        format!("worker consuming {}", consumer.queue()),
    );
    while let Some(delivery) = consumer.next().await {
        let payload = delivery.payload.clone();
        delivery.ack();
        let message = match WorkerMessage::parse(&payload) {
            Ok(message) => message,
            Err(err) => {
                gateway_log::warn(module_path!(), format!("dropping queue message: {err}"));
                continue;
            }
        };
        let reply = match handler.handle(&message).await {
            Ok(reply) => reply,
            Err(err) => {
                gateway_log::error(
                    module_path!(),
                    format!("handler failed for ticket {}: {err:#}", message.ticket_id),
                );
                message.reply().status(500).text(err.to_string())
            }
        };
        let bytes = match serde_json::to_vec(&reply) {
            Ok(bytes) => bytes,
            Err(err) => {
                gateway_log::error(module_path!(), format!("failed to encode reply: {err}"));
                continue;
            }
        };
        if let Err(err) = broker.publish(&message.reply_to, bytes).await {
            gateway_log::error(
                module_path!(),
                format!("failed to publish reply for ticket {}: {err}", message.ticket_id),
            );
        }
    }
    gateway_log::warn(
        module_path!(),
        format!("worker for {} stopped", consumer.queue()),
    );
}
