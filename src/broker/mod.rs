//! Message broker boundary.
//!
//! The gateway only needs three primitives from a broker: make sure a queue exists, publish bytes
//! to it, and consume deliveries from it with explicit settlement.

use std::fmt;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod memory;
pub mod nats;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection closed for queue {0}")]
    Closed(String),
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("publish to {queue} failed: {message}")]
    Publish { queue: String, message: String },
    #[error("subscribe to {queue} failed: {message}")]
    Subscribe { queue: String, message: String },
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
}

type SettleFn = Box<dyn FnOnce(Settlement) + Send>;

/// One message taken off a queue. Dropping it unsettled is treated as neither ack nor nack.
pub struct Delivery {
    pub payload: Vec<u8>,
    settle: Option<SettleFn>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            settle: None,
        }
    }

    pub fn with_settlement(payload: Vec<u8>, settle: impl FnOnce(Settlement) + Send + 'static) -> Self {
        Self {
            payload,
            settle: Some(Box::new(settle)),
        }
    }

    pub fn ack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle(Settlement::Ack);
        }
    }

    /// Reject without requeue.
    pub fn nack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle(Settlement::Nack);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("settled", &self.settle.is_none())
            .finish()
    }
}

pub struct Consumer {
    queue: String,
    stream: BoxStream<'static, Delivery>,
}

impl Consumer {
    pub fn new(queue: impl Into<String>, stream: BoxStream<'static, Delivery>) -> Self {
        Self {
            queue: queue.into(),
            stream,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// `None` once the broker side has gone away.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.stream.next().await
    }
}
