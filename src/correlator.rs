//! Reply correlation.
//!
//! Worker replies arrive on the reply queue in any order and at any time. Each one is handed to
//! the HTTP request currently parked on its ticket, or kept in a short-lived cache until a poll
//! claims it. Both maps live behind one mutex so "check cache, else register" and "check waiter,
//! else cache" are each a single step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerError};
use crate::error::{CorrelatorError, ValidationError};
use crate::gateway_log;
use crate::ticket::Reply;
use crate::token::TokenCodec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelatorSettings {
    /// How long an unclaimed reply is kept.
    pub reply_ttl: Duration,
    /// How long a poll waits before answering 504.
    pub poll_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            reply_ttl: Duration::from_secs(60 * 60),
            poll_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyDisposition {
    Delivered,
    Cached,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CorrelatorStatus {
    pub cache_size: usize,
    pub cache_keys: Vec<String>,
    pub pending_waiter_count: usize,
}

struct CachedReply {
    reply: Reply,
    inserted_at: Instant,
}

struct PendingWaiter {
    waiter_id: u64,
    sender: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct CorrelationTable {
    cache: HashMap<String, CachedReply>,
    waiters: HashMap<String, PendingWaiter>,
}

enum Claim<'a> {
    Ready(Reply),
    Waiting(WaiterGuard<'a>),
}

pub struct ReplyCorrelator {
    table: Mutex<CorrelationTable>,
    next_waiter_id: AtomicU64,
    codec: Arc<TokenCodec>,
    settings: CorrelatorSettings,
}

impl ReplyCorrelator {
    pub fn new(codec: Arc<TokenCodec>, settings: CorrelatorSettings) -> Self {
        Self {
            table: Mutex::new(CorrelationTable::default()),
            next_waiter_id: AtomicU64::new(1),
            codec,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CorrelationTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse a raw reply and check that its token is valid for the ticket it claims to answer.
    pub fn validate_reply(&self, payload: &[u8]) -> Result<Reply, ValidationError> {
        let reply = Reply::parse(payload)?;
        self.codec
            .verify_for_ticket(&reply.jwt_token, &reply.ticket_id)?;
        Ok(reply)
    }

    /// Hand `reply` to its waiter, or cache it when nobody is waiting. A later reply for the
    /// same ticket replaces an unclaimed one.
    pub fn resolve(&self, reply: Reply) -> ReplyDisposition {
        let mut table = self.lock();
        let ticket_id = reply.ticket_id.clone();
        let reply = match table.waiters.remove(&ticket_id) {
            Some(waiter) => match waiter.sender.send(reply) {
                Ok(()) => return ReplyDisposition::Delivered,
                Err(reply) => reply,
            },
            None => reply,
        };
        table.cache.insert(
            ticket_id,
            CachedReply {
                reply,
                inserted_at: Instant::now(),
            },
        );
        ReplyDisposition::Cached
    }

    pub fn consume_reply(&self, payload: &[u8]) -> Result<ReplyDisposition, ValidationError> {
        let reply = self.validate_reply(payload)?;
        Ok(self.resolve(reply))
    }

    /// Take the cached reply for `ticket_id`, or wait up to `timeout` for one to arrive.
    ///
    /// Only one poll may wait on a ticket at a time; a second concurrent poll gets
    /// [`CorrelatorError::DuplicateWaiter`]. Dropping the returned future (for example when the
    /// client disconnects) removes the registration.
    pub async fn await_reply(
        &self,
        ticket_id: &str,
        timeout: Duration,
    ) -> Result<Reply, CorrelatorError> {
        let mut guard = match self.claim_or_register(ticket_id)? {
            Claim::Ready(reply) => return Ok(reply),
            Claim::Waiting(guard) => guard,
        };
        let outcome = tokio::time::timeout(timeout, &mut guard.receiver).await;
        if let Ok(Ok(reply)) = outcome {
            guard.settled = true;
            return Ok(reply);
        }
        // A reply that lands between the deadline and the cancel is still ours.
        match guard.cancel() {
            Some(reply) => Ok(reply),
            None => Err(CorrelatorError::Timeout {
                ticket_id: ticket_id.to_string(),
            }),
        }
    }

    fn claim_or_register(&self, ticket_id: &str) -> Result<Claim<'_>, CorrelatorError> {
        let mut table = self.lock();
        if let Some(cached) = table.cache.remove(ticket_id) {
            if cached.inserted_at.elapsed() < self.settings.reply_ttl {
                return Ok(Claim::Ready(cached.reply));
            }
        }
        if let Some(existing) = table.waiters.get(ticket_id) {
            if !existing.sender.is_closed() {
                return Err(CorrelatorError::DuplicateWaiter {
                    ticket_id: ticket_id.to_string(),
                });
            }
        }
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        table
            .waiters
            .insert(ticket_id.to_string(), PendingWaiter { waiter_id, sender });
        Ok(Claim::Waiting(WaiterGuard {
            correlator: self,
            ticket_id: ticket_id.to_string(),
            waiter_id,
            receiver,
            settled: false,
        }))
    }

    /// Evict expired cache entries and waiters whose poll has gone away. Returns how many
    /// entries were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.settings.reply_ttl;
        let mut table = self.lock();
        let before = table.cache.len() + table.waiters.len();
        table.cache.retain(|_, cached| cached.inserted_at.elapsed() < ttl);
        table.waiters.retain(|_, waiter| !waiter.sender.is_closed());
        before - (table.cache.len() + table.waiters.len())
    }

    pub fn status(&self) -> CorrelatorStatus {
        let ttl = self.settings.reply_ttl;
        let table = self.lock();
        let mut cache_keys: Vec<String> = table
            .cache
            .iter()
            .filter(|(_, cached)| cached.inserted_at.elapsed() < ttl)
            .map(|(key, _)| key.clone())
            .collect();
        cache_keys.sort();
        CorrelatorStatus {
            cache_size: cache_keys.len(),
            cache_keys,
            pending_waiter_count: table.waiters.len(),
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(correlator.settings.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = correlator.sweep();
                if evicted > 0 {
                    gateway_log::debug(
                        module_path!(),
                        format!("evicted {evicted} stale correlation entries"),
                    );
                }
            }
        })
    }

    /// Start consuming `queue` and the periodic sweeper.
    pub async fn start(
        self: Arc<Self>,
        broker: Arc<dyn Broker>,
        queue: &str,
    ) -> Result<CorrelatorTasks, BrokerError> {
        broker.assert_queue(queue).await?;
        let mut consumer = broker.consume(queue).await?;
        gateway_log::info(module_path!(), format!("listening for replies on {queue}"));

        let correlator = Arc::clone(&self);
        let consumer_task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                gateway_log::debug(
                    module_path!(),
                    format!("received a reply ({} bytes)", delivery.payload.len()),
                );
                match correlator.consume_reply(&delivery.payload) {
                    Ok(disposition) => {
                        gateway_log::debug(
                            module_path!(),
                            format!("reply {disposition:?}"),
                        );
                        delivery.ack();
                    }
                    Err(err) => {
                        gateway_log::info(
                            module_path!(),
                            format!("invalid reply received, message dropped: {err}"),
                        );
                        delivery.nack();
                    }
                }
            }
            gateway_log::warn(
                module_path!(),
                format!("reply consumer for {} stopped", consumer.queue()),
            );
        });
        let sweeper = self.spawn_sweeper();
        Ok(CorrelatorTasks {
            consumer: consumer_task,
            sweeper,
        })
    }
}

/// Background tasks started by [`ReplyCorrelator::start`].
pub struct CorrelatorTasks {
    consumer: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl CorrelatorTasks {
    pub fn abort(&self) {
        self.consumer.abort();
        self.sweeper.abort();
    }
}

/// A poll's registration in the waiter table. Unless the poll completed normally, dropping the
/// guard removes the registration and moves any reply that raced in back into the cache.
struct WaiterGuard<'a> {
    correlator: &'a ReplyCorrelator,
    ticket_id: String,
    waiter_id: u64,
    receiver: oneshot::Receiver<Reply>,
    settled: bool,
}

impl WaiterGuard<'_> {
    fn cancel(&mut self) -> Option<Reply> {
        self.settled = true;
        {
            let mut table = self.correlator.lock();
            let ours = table
                .waiters
                .get(&self.ticket_id)
                .is_some_and(|waiter| waiter.waiter_id == self.waiter_id);
            if ours {
                table.waiters.remove(&self.ticket_id);
            }
        }
        self.receiver.try_recv().ok()
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(reply) = self.cancel() {
            self.correlator.resolve(reply);
        }
    }
}
