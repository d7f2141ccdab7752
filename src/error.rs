//! Error taxonomy shared by the gateway components.
//!
//! Each family maps to one surface: configuration errors stop startup, validation errors drop a
//! queue message, access and correlator errors become HTTP statuses, and gateway errors are
//! upstream failures answered with 500.

use hyper::StatusCode;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::token::TokenError;

/// A bad route rule or configuration shape. Only raised at startup or reconfiguration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid path in route #{index}")]
    InvalidPath { index: usize },
    #[error("invalid method in route {path}")]
    InvalidMethod { path: String },
    #[error("invalid route handler at route {path}")]
    InvalidHandler { path: String },
    #[error("must specify queue_name when using message_queue handler (route {path})")]
    MissingQueueName { path: String },
    #[error("must specify redirect_path when using reverse_proxy handler (route {path})")]
    MissingRedirectPath { path: String },
    #[error("invalid regex in route {path}: {message}")]
    InvalidPattern { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A malformed queue message. Dropped and negatively acknowledged, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message is not valid JSON: {0}")]
    Malformed(String),
    #[error("message missing field {0}")]
    MissingField(&'static str),
    #[error("field {0} must not be empty")]
    EmptyField(&'static str),
    #[error("invalid format - {0}")]
    InvalidFormat(&'static str),
    #[error("reply token rejected: {0}")]
    Token(#[from] TokenError),
}

/// Ticket access failures surfaced to the polling caller.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("missing or malformed bearer credential")]
    Unauthorized,
    #[error("credential does not grant access to this ticket")]
    Forbidden,
    #[error("ticket not found")]
    NotFound,
}

impl AccessError {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("no reply for ticket {ticket_id} before the deadline")]
    Timeout { ticket_id: String },
    #[error("ticket {ticket_id} already has a pending poll")]
    DuplicateWaiter { ticket_id: String },
}

impl CorrelatorError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::DuplicateWaiter { .. } => StatusCode::CONFLICT,
        }
    }
}

/// Upstream failures while issuing a ticket. Answered with 500 and logged with context.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to assert queue {queue}: {source}")]
    QueueAssert {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to publish to queue {queue}: {source}")]
    Publish {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to sign ticket token: {0}")]
    Signing(#[source] TokenError),
    #[error("failed to persist attachment: {0}")]
    Attachment(#[from] std::io::Error),
    #[error("failed to parse multipart body: {0}")]
    Multipart(String),
    #[error("failed to serialize queue message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
