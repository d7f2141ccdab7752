//! Tickets and the wire messages exchanged with workers.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

/// Query parameter that switches a request to async mode.
pub const ASYNC_QUERY_FLAG: &str = "async";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TicketMode {
    Sync,
    Async,
}

impl TicketMode {
    /// Async when the `async` flag is present with a truthy value.
    pub fn from_query(query: &[(String, String)]) -> Self {
        let truthy = query
            .iter()
            .filter(|(key, _)| key == ASYNC_QUERY_FLAG)
            .any(|(_, value)| is_truthy(value));
        if truthy { Self::Async } else { Self::Sync }
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no"
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub sync_ttl: Duration,
    pub async_ttl: Duration,
    /// Lifetime of the worker-facing token carried inside the queue message.
    pub internal_ttl: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            sync_ttl: Duration::minutes(2),
            async_ttl: Duration::days(1),
            internal_ttl: Duration::hours(1),
        }
    }
}

impl ExpiryPolicy {
    pub fn expires_at(&self, mode: TicketMode, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        match mode {
            TicketMode::Sync => issued_at + self.sync_ttl,
            TicketMode::Async => issued_at + self.async_ttl,
        }
    }

    pub fn internal_expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        issued_at + self.internal_ttl
    }
}

/// Ticket ids double as access-control subjects, so they come from a random v4 UUID.
pub fn mint_ticket_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn ticket_url(base_url: &str, ticket_id: &str) -> String {
    format!("{}/tickets/{}", base_url.trim_end_matches('/'), ticket_id)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub size: u64,
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// The caller's request as seen by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestSnapshot {
    pub url: String,
    pub hostname: String,
    pub ip: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// Published to the route's worker queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub ticket_id: String,
    pub expire_on: String,
    pub reply_to: String,
    pub api: String,
    pub jwt_token: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    pub request: RequestSnapshot,
}

/// Returned to async callers in place of the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketReceipt {
    pub ticket_id: String,
    pub timestamp: String,
    pub expire_on: i64,
    pub jwt_token: String,
}

/// A worker's answer, read from the reply queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(default)]
    pub ticket_id: String,
    #[serde(default = "default_http_status")]
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub jwt_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

fn default_http_status() -> u16 {
    200
}

impl Reply {
    /// Decode a reply and check the fields correlation depends on. The token itself is verified
    /// by the correlator.
    pub fn parse(payload: &[u8]) -> Result<Self, ValidationError> {
        let reply: Reply = serde_json::from_slice(payload)
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;
        if reply.ticket_id.is_empty() {
            return Err(ValidationError::MissingField("ticketId"));
        }
        if reply.body.is_null() {
            return Err(ValidationError::MissingField("body"));
        }
        if reply.jwt_token.is_empty() {
            return Err(ValidationError::MissingField("jwtToken"));
        }
        Ok(reply)
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            Value::String(text) => text.as_bytes().to_vec(),
            other => serde_json::to_vec(other).unwrap_or_default(),
        }
    }

    pub fn effective_content_type(&self) -> String {
        if let Some(content_type) = self.content_type.as_deref().filter(|v| !v.is_empty()) {
            return content_type.to_string();
        }
        match &self.body {
            Value::String(_) => "text/plain; charset=utf-8".to_string(),
            _ => "application/json".to_string(),
        }
    }
}
