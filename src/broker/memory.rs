use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::{Broker, BrokerError, Consumer, Delivery, Settlement};

/// In-process broker backed by unbounded tokio channels.
///
/// Queues are created on first use. Several consumers of one queue compete for deliveries, the
/// same way workers on an AMQP queue do.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, MemoryQueue>,
    settlements: HashMap<String, SettlementCounts>,
}

struct MemoryQueue {
    sender: UnboundedSender<Vec<u8>>,
    receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SettlementCounts {
    pub acked: usize,
    pub nacked: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let Ok(state) = self.inner.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn settlements(&self, queue: &str) -> SettlementCounts {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.settlements.get(queue).copied())
            .unwrap_or_default()
    }

    fn with_queue<T>(
        &self,
        queue: &str,
        f: impl FnOnce(&MemoryQueue) -> T,
    ) -> Result<T, BrokerError> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| BrokerError::Closed(queue.to_string()))?;
        let entry = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(MemoryQueue::new);
        Ok(f(entry))
    }

    fn settle_fn(&self, queue: &str) -> impl FnOnce(Settlement) + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();
        move |outcome| {
            if let Ok(mut state) = inner.lock() {
                let counts = state.settlements.entry(queue).or_default();
                match outcome {
                    Settlement::Ack => counts.acked += 1,
                    Settlement::Nack => counts.nacked += 1,
                }
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.with_queue(queue, |_| ())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let sender = self.with_queue(queue, |entry| entry.sender.clone())?;
        sender
            .send(payload)
            .map_err(|_| BrokerError::Closed(queue.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let receiver = self.with_queue(queue, |entry| Arc::clone(&entry.receiver))?;
        let broker = self.clone();
        let name = queue.to_string();
        let stream = futures::stream::unfold(
            (receiver, broker, name),
            |(receiver, broker, name)| async move {
                let payload = receiver.lock().await.recv().await?;
                let delivery = Delivery::with_settlement(payload, broker.settle_fn(&name));
                Some((delivery, (receiver, broker, name)))
            },
        );
        Ok(Consumer::new(queue, stream.boxed()))
    }
}
