//! Broker seam — pub/sub channels plus key/value and counter operations.
//!
//! The router talks to its transport exclusively through [`MessageBroker`],
//! so a durable broker (Redis, NATS, ...) can be swapped in without touching
//! routing logic. [`InProcessBroker`] is the bundled implementation for
//! tests and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};

use crate::error::BureauError;

/// A raw message received from a subscribed channel.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Transport contract consumed by the router and the memory graph.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish a payload to a channel. Delivery to non-subscribed channels
    /// is a silent no-op.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BureauError>;

    /// Add a channel to this connection's subscription set.
    async fn subscribe(&self, channel: &str) -> Result<(), BureauError>;

    /// Remove a channel from this connection's subscription set.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BureauError>;

    /// Next message across all subscribed channels; `None` once the
    /// connection is closed.
    async fn next_message(&self) -> Option<BrokerMessage>;

    /// Store a value under a key with a TTL (0 = no expiry).
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), BureauError>;

    /// Fetch a value; expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BureauError>;

    /// Increment a counter, returning the new value.
    async fn incr(&self, counter: &str) -> Result<i64, BureauError>;

    /// Release transport resources. Default is a no-op.
    async fn close(&self) {}
}

struct BrokerInner {
    subscriptions: HashSet<String>,
    keys: HashMap<String, (Vec<u8>, Option<Instant>)>,
    counters: HashMap<String, i64>,
}

/// In-process broker backed by a single consumer stream.
///
/// One connection, one consumer: whoever calls `next_message` drains the
/// stream of everything published to subscribed channels.
pub struct InProcessBroker {
    inner: RwLock<BrokerInner>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
    stream: Mutex<UnboundedReceiverStream<BrokerMessage>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: RwLock::new(BrokerInner {
                subscriptions: HashSet::new(),
                keys: HashMap::new(),
                counters: HashMap::new(),
            }),
            tx,
            stream: Mutex::new(UnboundedReceiverStream::new(rx)),
        }
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InProcessBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BureauError> {
        let subscribed = self.inner.read().await.subscriptions.contains(channel);
        if !subscribed {
            return Ok(());
        }
        self.tx
            .send(BrokerMessage {
                channel: channel.to_string(),
                payload,
            })
            .map_err(|_| BureauError::Delivery("broker connection closed".to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BureauError> {
        self.inner
            .write()
            .await
            .subscriptions
            .insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BureauError> {
        self.inner.write().await.subscriptions.remove(channel);
        Ok(())
    }

    async fn next_message(&self) -> Option<BrokerMessage> {
        self.stream.lock().await.next().await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), BureauError> {
        let expires_at = if ttl_seconds > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_seconds))
        } else {
            None
        };
        self.inner
            .write()
            .await
            .keys
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BureauError> {
        let mut inner = self.inner.write().await;
        match inner.keys.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                inner.keys.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn incr(&self, counter: &str) -> Result<i64, BureauError> {
        let mut inner = self.inner.write().await;
        let value = inner.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}
