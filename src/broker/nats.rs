use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;

use super::{Broker, BrokerError, Consumer, Delivery};
use crate::gateway_log;

/// Core NATS as a broker: a queue is a subject and consumers join a shared queue group.
///
/// Core NATS has no acknowledgements, so deliveries settle as no-ops and there is nothing to
/// declare up front.
#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
    queue_group: String,
}

impl NatsBroker {
    pub async fn connect(url: &str, queue_group: impl Into<String>) -> Result<Self, BrokerError> {
        gateway_log::info(module_path!(), format!("connecting to NATS at {url}"));
        let client = async_nats::ConnectOptions::new()
            .name("restmq-gateway")
            .connect(url)
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        Ok(Self::from_client(client, queue_group))
    }

    pub fn from_client(client: Client, queue_group: impl Into<String>) -> Self {
        Self {
            client,
            queue_group: queue_group.into(),
        }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn assert_queue(&self, _queue: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(queue.to_string(), payload.into())
            .await
            .map_err(|err| BrokerError::Publish {
                queue: queue.to_string(),
                message: err.to_string(),
            })?;
        // Replies must not sit in the client buffer while a caller is waiting.
        self.client
            .flush()
            .await
            .map_err(|err| BrokerError::Publish {
                queue: queue.to_string(),
                message: err.to_string(),
            })
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let subscriber = self
            .client
            .queue_subscribe(queue.to_string(), self.queue_group.clone())
            .await
            .map_err(|err| BrokerError::Subscribe {
                queue: queue.to_string(),
                message: err.to_string(),
            })?;
        let stream = subscriber.map(|message| Delivery::new(message.payload.to_vec()));
        Ok(Consumer::new(queue, stream.boxed()))
    }
}
