//! Message Router — pub/sub routing, request/response correlation, and
//! office lifecycle.
//!
//! The router:
//!   1. Owns one broker connection and a bounded inbound queue per office
//!   2. Correlates REQUEST/RESPONSE pairs through a pending-future map
//!   3. Dispatches inbound messages to per-office handlers by message type
//!   4. Runs a background listener and a best-effort heartbeat loop
//!   5. Chains lightweight step relays across offices via broker state

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerMessage, MessageBroker};
use crate::error::BureauError;
use crate::models::message::{Message, MessagePriority, MessageType};

/// What to do when an office queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the inbound message.
    #[default]
    RejectNewest,
    /// Evict the oldest queued message to make room.
    RejectOldest,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_publish_retry_limit")]
    pub publish_retry_limit: u32,
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
}

fn default_channel_prefix() -> String {
    "bureau".to_string()
}
fn default_max_queue_size() -> usize {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_publish_retry_limit() -> u32 {
    3
}
fn default_publish_backoff_ms() -> u64 {
    50
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            max_queue_size: default_max_queue_size(),
            overflow: OverflowPolicy::default(),
            default_timeout_secs: default_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            publish_retry_limit: default_publish_retry_limit(),
            publish_backoff_ms: default_publish_backoff_ms(),
        }
    }
}

/// Per-office message handler, resolved once at registration.
///
/// Only requests demand an implementation; the remaining hooks default to
/// no-ops. Handler failures are caught at the dispatch point and logged.
#[async_trait]
pub trait OfficeHandler: Send + Sync {
    async fn on_request(&self, message: Message) -> Result<(), BureauError>;

    async fn on_notification(&self, _message: Message) -> Result<(), BureauError> {
        Ok(())
    }

    async fn on_workflow(&self, _message: Message) -> Result<(), BureauError> {
        Ok(())
    }

    async fn on_memory_share(&self, _message: Message) -> Result<(), BureauError> {
        Ok(())
    }

    async fn on_error(&self, _message: Message) -> Result<(), BureauError> {
        Ok(())
    }
}

// ─── Step relay state ───────────────────────────────────────────────────

/// TTL for relay state parked in the broker.
const RELAY_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Initiated,
    InProgress,
    Completed,
}

/// One step of a cross-office relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStep {
    pub office: String,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Relay state stored (TTL'd) in the broker between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayState {
    pub workflow_id: String,
    pub steps: Vec<RelayStep>,
    pub current_step: usize,
    pub status: RelayStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ─── Router ─────────────────────────────────────────────────────────────

struct OfficeEntry {
    office_type: String,
    handler: Arc<dyn OfficeHandler>,
    queue: VecDeque<Message>,
}

struct RouterInner {
    offices: HashMap<String, OfficeEntry>,
}

/// Central message router for inter-office communication.
pub struct MessageRouter {
    config: RouterConfig,
    broker: Arc<dyn MessageBroker>,
    inner: Arc<RwLock<RouterInner>>,
    /// Pending request futures keyed by request message id. Removal from
    /// this map is the claim in the timeout-vs-arrival race: whichever side
    /// removes the sender wins, the other side's action is a no-op.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouter {
    /// Connect to the broker's system channels and start the background
    /// listener and heartbeat loops.
    pub async fn start(
        config: RouterConfig,
        broker: Arc<dyn MessageBroker>,
    ) -> Result<Arc<Self>, BureauError> {
        broker
            .subscribe(&format!("{}:system:broadcast", config.channel_prefix))
            .await?;
        broker
            .subscribe(&format!("{}:system:heartbeat", config.channel_prefix))
            .await?;

        let (shutdown_tx, _) = watch::channel(false);
        let router = Arc::new(Self {
            config,
            broker,
            inner: Arc::new(RwLock::new(RouterInner {
                offices: HashMap::new(),
            })),
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let listener = tokio::spawn(Self::listen_loop(
            router.clone(),
            router.shutdown_tx.subscribe(),
        ));
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            router.clone(),
            router.shutdown_tx.subscribe(),
        ));
        router.tasks.lock().await.extend([listener, heartbeat]);

        info!("[Router] started");
        Ok(router)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn office_channel(&self, office_id: &str) -> String {
        format!("{}:office:{}", self.config.channel_prefix, office_id)
    }

    fn broadcast_channel(&self) -> String {
        format!("{}:system:broadcast", self.config.channel_prefix)
    }

    fn heartbeat_channel(&self) -> String {
        format!("{}:system:heartbeat", self.config.channel_prefix)
    }

    fn relay_key(&self, workflow_id: &str) -> String {
        format!("{}:workflow:{}", self.config.channel_prefix, workflow_id)
    }

    // ─── Office lifecycle ───────────────────────────────────────────────

    /// Register an office with its handler. Idempotent: re-registration
    /// replaces the handler and queue without duplicating subscriptions.
    pub async fn register_office(
        &self,
        office_id: &str,
        office_type: &str,
        handler: Arc<dyn OfficeHandler>,
    ) -> Result<(), BureauError> {
        let already_registered = {
            let mut inner = self.inner.write().await;
            inner
                .offices
                .insert(
                    office_id.to_string(),
                    OfficeEntry {
                        office_type: office_type.to_string(),
                        handler,
                        queue: VecDeque::new(),
                    },
                )
                .is_some()
        };

        if !already_registered {
            self.broker
                .subscribe(&self.office_channel(office_id))
                .await?;
        }

        self.broadcast_notification(
            "system",
            "office_online",
            serde_json::json!({
                "office_id": office_id,
                "office_type": office_type,
                "timestamp": Utc::now(),
            }),
            MessagePriority::Normal,
        )
        .await?;

        info!("[Router] office registered: {} ({})", office_id, office_type);
        Ok(())
    }

    /// Unregister an office, freeing its queue and subscription.
    pub async fn unregister_office(&self, office_id: &str) -> Result<(), BureauError> {
        let existed = self.inner.write().await.offices.remove(office_id).is_some();
        if !existed {
            return Ok(());
        }

        self.broker
            .unsubscribe(&self.office_channel(office_id))
            .await?;
        self.broadcast_notification(
            "system",
            "office_offline",
            serde_json::json!({ "office_id": office_id }),
            MessagePriority::Normal,
        )
        .await?;

        info!("[Router] office unregistered: {}", office_id);
        Ok(())
    }

    /// Take every queued message for an office.
    pub async fn drain_queue(&self, office_id: &str) -> Vec<Message> {
        let mut inner = self.inner.write().await;
        match inner.offices.get_mut(office_id) {
            Some(entry) => entry.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Queue depth for an office; `None` if unregistered.
    pub async fn queue_depth(&self, office_id: &str) -> Option<usize> {
        self.inner
            .read()
            .await
            .offices
            .get(office_id)
            .map(|entry| entry.queue.len())
    }

    // ─── Sending ────────────────────────────────────────────────────────

    /// Send a message to its target office (or the broadcast channel when
    /// no target is set).
    ///
    /// With `wait_for_response` on a REQUEST, the calling task parks on a
    /// correlation future until a matching RESPONSE arrives or `timeout`
    /// elapses; timeouts re-send with an incremented `retry_count` up to
    /// `max_retries` before surfacing a terminal error.
    pub async fn send_message(
        &self,
        mut message: Message,
        wait_for_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, BureauError> {
        loop {
            self.track_message(&message).await;

            let channel = match &message.target_office {
                Some(target) => self.office_channel(target),
                None => self.broadcast_channel(),
            };

            let wants_reply =
                wait_for_response && message.message_type == MessageType::Request;
            let receiver = if wants_reply {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().await.insert(message.id.clone(), tx);
                Some(rx)
            } else {
                None
            };

            let bytes = message.to_bytes()?;
            if let Err(e) = self.publish_with_retry(&channel, bytes).await {
                if wants_reply {
                    self.pending.lock().await.remove(&message.id);
                }
                return Err(e);
            }

            let Some(receiver) = receiver else {
                return Ok(None);
            };

            let wait = timeout
                .unwrap_or_else(|| Duration::from_secs(self.config.default_timeout_secs));
            match tokio::time::timeout(wait, receiver).await {
                Ok(Ok(response)) => return Ok(Some(response)),
                Ok(Err(_)) => {
                    return Err(BureauError::Delivery(
                        "response future dropped before resolution".to_string(),
                    ))
                }
                Err(_) => {
                    // Claim the pending entry; if the listener resolved it in
                    // the same instant, the claim is a no-op and we retry.
                    self.pending.lock().await.remove(&message.id);

                    if message.retry_count < message.max_retries {
                        message.retry_count += 1;
                        debug!(
                            "[Router] request {} timed out, retry {}/{}",
                            message.id, message.retry_count, message.max_retries
                        );
                        continue;
                    }
                    return Err(BureauError::Timeout {
                        message_id: message.id.clone(),
                        attempts: message.retry_count + 1,
                    });
                }
            }
        }
    }

    /// Send a request to an office and wait for its response.
    pub async fn send_request(
        &self,
        sender_office: &str,
        target_office: &str,
        action: &str,
        params: Value,
        priority: MessagePriority,
        timeout: Option<Duration>,
    ) -> Result<Message, BureauError> {
        let message = Message::request(sender_office, target_office, action, params, priority);
        let message_id = message.id.clone();
        match self.send_message(message, true, timeout).await? {
            Some(response) => Ok(response),
            None => Err(BureauError::Delivery(format!(
                "request {} produced no response future",
                message_id
            ))),
        }
    }

    /// Reply to a request, preserving correlation and routing. Failure
    /// replies travel as `error` messages and do not resolve the caller's
    /// future.
    pub async fn send_response(
        &self,
        request: &Message,
        payload: Value,
        success: bool,
    ) -> Result<(), BureauError> {
        let response = Message::response_to(request, payload, success);
        self.send_message(response, false, None).await.map(|_| ())
    }

    /// Fire-and-forget notification to every office.
    pub async fn broadcast_notification(
        &self,
        sender_office: &str,
        event_type: &str,
        data: Value,
        priority: MessagePriority,
    ) -> Result<(), BureauError> {
        let message = Message::broadcast(sender_office, event_type, data, priority);
        self.send_message(message, false, None).await.map(|_| ())
    }

    async fn publish_with_retry(
        &self,
        channel: &str,
        bytes: Vec<u8>,
    ) -> Result<(), BureauError> {
        let mut backoff = Duration::from_millis(self.config.publish_backoff_ms);
        let mut attempt = 0;
        loop {
            match self.broker.publish(channel, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.config.publish_retry_limit => {
                    attempt += 1;
                    warn!(
                        "[Router] publish to {} failed (attempt {}): {}",
                        channel, attempt, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Per-office sent/received counters, best-effort.
    async fn track_message(&self, message: &Message) {
        let prefix = &self.config.channel_prefix;
        let sent = format!("{}:metrics:{}:sent", prefix, message.sender_office);
        if let Err(e) = self.broker.incr(&sent).await {
            debug!("[Router] metrics incr failed: {}", e);
        }
        if let Some(target) = &message.target_office {
            let received = format!("{}:metrics:{}:received", prefix, target);
            if let Err(e) = self.broker.incr(&received).await {
                debug!("[Router] metrics incr failed: {}", e);
            }
        }
    }

    // ─── Step relay ─────────────────────────────────────────────────────

    /// Park relay state in the broker and hand the first step to its office.
    pub async fn create_relay(
        &self,
        workflow_id: &str,
        steps: Vec<RelayStep>,
        initiating_office: &str,
    ) -> Result<(), BureauError> {
        let state = RelayState {
            workflow_id: workflow_id.to_string(),
            steps,
            current_step: 0,
            status: RelayStatus::Initiated,
            completed_at: None,
        };
        self.broker
            .set(
                &self.relay_key(workflow_id),
                serde_json::to_vec(&state)?,
                RELAY_TTL_SECS,
            )
            .await?;

        if let Some(first) = state.steps.first() {
            let mut message = Message::new(
                MessageType::Workflow,
                MessagePriority::High,
                initiating_office,
                Some(first.office.clone()),
                serde_json::to_value(&state)?,
            );
            message.require_ack = true;
            self.send_message(message, false, None).await?;
        }
        Ok(())
    }

    /// Record the current step's result and move the relay forward: hand
    /// the next step to its office, or mark completion and broadcast it.
    pub async fn advance_workflow(
        &self,
        workflow_id: &str,
        step_result: Value,
    ) -> Result<(), BureauError> {
        let key = self.relay_key(workflow_id);
        let raw = self
            .broker
            .get(&key)
            .await?
            .ok_or_else(|| BureauError::NotFound(format!("workflow {}", workflow_id)))?;
        let mut state: RelayState = serde_json::from_slice(&raw)?;

        let current = state.current_step;
        if let Some(step) = state.steps.get_mut(current) {
            step.result = Some(step_result);
            step.completed_at = Some(Utc::now());
        }

        let next = current + 1;
        if next < state.steps.len() {
            state.current_step = next;
            state.status = RelayStatus::InProgress;
            self.broker
                .set(&key, serde_json::to_vec(&state)?, RELAY_TTL_SECS)
                .await?;

            let target = state.steps[next].office.clone();
            let message = Message::new(
                MessageType::Workflow,
                MessagePriority::High,
                "workflow_relay",
                Some(target),
                serde_json::to_value(&state)?,
            );
            self.send_message(message, false, None).await?;
        } else {
            state.status = RelayStatus::Completed;
            state.completed_at = Some(Utc::now());
            self.broker
                .set(&key, serde_json::to_vec(&state)?, RELAY_TTL_SECS)
                .await?;

            let results: Vec<Value> = state
                .steps
                .iter()
                .map(|s| s.result.clone().unwrap_or(Value::Null))
                .collect();
            self.broadcast_notification(
                "workflow_relay",
                "workflow_completed",
                serde_json::json!({ "workflow_id": workflow_id, "results": results }),
                MessagePriority::Normal,
            )
            .await?;
        }
        Ok(())
    }

    // ─── Background loops ───────────────────────────────────────────────

    async fn listen_loop(router: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = router.broker.next_message() => match received {
                    Some(raw) => router.process_raw(raw).await,
                    None => break,
                },
            }
        }
        debug!("[Router] listener stopped");
    }

    async fn process_raw(&self, raw: BrokerMessage) {
        let message = match Message::from_bytes(&raw.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("[Router] undecodable message on {}: {}", raw.channel, e);
                return;
            }
        };

        if message.is_expired(Utc::now()) {
            debug!("[Router] dropping expired message {}", message.id);
            return;
        }

        match message.message_type {
            MessageType::Heartbeat => {}
            MessageType::Response => {
                let Some(correlation_id) = message.correlation_id.clone() else {
                    debug!("[Router] response {} without correlation id", message.id);
                    return;
                };
                // Single-winner claim; a stale or duplicate response finds
                // nothing here and is dropped.
                let sender = self.pending.lock().await.remove(&correlation_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => {
                        debug!(
                            "[Router] dropping response for unknown correlation {}",
                            correlation_id
                        );
                    }
                }
            }
            MessageType::Broadcast => {
                let mut inner = self.inner.write().await;
                let (max, policy) = (self.config.max_queue_size, self.config.overflow);
                for entry in inner.offices.values_mut() {
                    enqueue(entry, message.clone(), max, policy);
                }
            }
            _ => {
                let Some(target) = message.target_office.clone() else {
                    return;
                };
                let handler = {
                    let inner = self.inner.read().await;
                    inner.offices.get(&target).map(|e| e.handler.clone())
                };
                let Some(handler) = handler else {
                    debug!("[Router] no office registered for {}", target);
                    return;
                };

                // Handlers run detached so a slow office cannot stall the
                // listener; failures are logged, never fatal.
                let dispatched = message.clone();
                let office = target.clone();
                tokio::spawn(async move {
                    let result = match dispatched.message_type {
                        MessageType::Request => handler.on_request(dispatched).await,
                        MessageType::Notification => handler.on_notification(dispatched).await,
                        MessageType::Workflow => handler.on_workflow(dispatched).await,
                        MessageType::MemoryShare => handler.on_memory_share(dispatched).await,
                        MessageType::Error => handler.on_error(dispatched).await,
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!("[Router] handler for {} failed: {}", office, e);
                    }
                });

                let mut inner = self.inner.write().await;
                let (max, policy) = (self.config.max_queue_size, self.config.overflow);
                if let Some(entry) = inner.offices.get_mut(&target) {
                    enqueue(entry, message, max, policy);
                }
            }
        }
    }

    async fn heartbeat_loop(router: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(router.config.heartbeat_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let depths: Vec<(String, usize)> = {
                let inner = router.inner.read().await;
                inner
                    .offices
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.queue.len()))
                    .collect()
            };

            for (office_id, depth) in depths {
                let heartbeat = Message::new(
                    MessageType::Heartbeat,
                    MessagePriority::Low,
                    office_id,
                    None,
                    serde_json::json!({ "timestamp": Utc::now(), "queue_depth": depth }),
                );
                let bytes = match heartbeat.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                if let Err(e) = router
                    .broker
                    .publish(&router.heartbeat_channel(), bytes)
                    .await
                {
                    debug!("[Router] heartbeat publish failed: {}", e);
                }
            }
        }
        debug!("[Router] heartbeat stopped");
    }

    /// Stop the background loops and close the broker connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.broker.close().await;
        info!("[Router] shut down");
    }
}

fn enqueue(entry: &mut OfficeEntry, message: Message, max: usize, policy: OverflowPolicy) {
    if entry.queue.len() >= max {
        match policy {
            OverflowPolicy::RejectNewest => {
                debug!(
                    "[Router] queue full for {} office, dropping inbound message",
                    entry.office_type
                );
                return;
            }
            OverflowPolicy::RejectOldest => {
                entry.queue.pop_front();
            }
        }
    }
    entry.queue.push_back(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InProcessBroker;
    use serde_json::json;
    use std::time::Instant;

    struct NullHandler;

    #[async_trait]
    impl OfficeHandler for NullHandler {
        async fn on_request(&self, _message: Message) -> Result<(), BureauError> {
            Ok(())
        }
    }

    struct EchoHandler {
        router: Arc<MessageRouter>,
    }

    #[async_trait]
    impl OfficeHandler for EchoHandler {
        async fn on_request(&self, message: Message) -> Result<(), BureauError> {
            let action = message
                .payload
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.router
                .send_response(&message, json!({ "result": { "echo": action } }), true)
                .await
        }
    }

    fn quiet_config() -> RouterConfig {
        RouterConfig {
            heartbeat_interval_secs: 3600,
            ..RouterConfig::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_immediately() {
        let router = MessageRouter::start(quiet_config(), Arc::new(InProcessBroker::new()))
            .await
            .unwrap();

        let message = Message::request("a", "nobody", "ping", json!({}), MessagePriority::Normal);
        let started = Instant::now();
        let result = router.send_message(message, false, None).await.unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let router = MessageRouter::start(quiet_config(), Arc::new(InProcessBroker::new()))
            .await
            .unwrap();
        router
            .register_office("caller", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        router
            .register_office(
                "echo",
                "test",
                Arc::new(EchoHandler {
                    router: router.clone(),
                }),
            )
            .await
            .unwrap();

        let response = router
            .send_request(
                "caller",
                "echo",
                "ping",
                json!({}),
                MessagePriority::Normal,
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.payload["result"]["echo"], "ping");
        assert_eq!(response.target_office.as_deref(), Some("caller"));

        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_timeout_follows_retry_policy() {
        let router = MessageRouter::start(quiet_config(), Arc::new(InProcessBroker::new()))
            .await
            .unwrap();
        router
            .register_office("silent", "test", Arc::new(NullHandler))
            .await
            .unwrap();

        let mut message =
            Message::request("caller", "silent", "ping", json!({}), MessagePriority::Normal);
        message.max_retries = 1;

        let started = Instant::now();
        let result = router
            .send_message(message, true, Some(Duration::from_millis(200)))
            .await;

        match result {
            Err(BureauError::Timeout { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
        // One initial attempt plus one retry, each bounded by the timeout.
        assert!(started.elapsed() >= Duration::from_millis(400));

        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_correlation_response_is_dropped() {
        let broker = Arc::new(InProcessBroker::new());
        let router = MessageRouter::start(quiet_config(), broker.clone())
            .await
            .unwrap();
        router
            .register_office("banker", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        settle().await;
        router.drain_queue("banker").await;

        let mut stale = Message::new(
            MessageType::Response,
            MessagePriority::Normal,
            "economist",
            Some("banker".to_string()),
            json!({ "result": "late" }),
        );
        stale.correlation_id = Some("no-such-request".to_string());
        broker
            .publish("bureau:office:banker", stale.to_bytes().unwrap())
            .await
            .unwrap();
        settle().await;

        assert_eq!(router.queue_depth("banker").await, Some(0));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_queues() {
        let router = MessageRouter::start(quiet_config(), Arc::new(InProcessBroker::new()))
            .await
            .unwrap();
        router
            .register_office("a", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        router
            .register_office("b", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        settle().await;
        router.drain_queue("a").await;
        router.drain_queue("b").await;

        router
            .broadcast_notification("system", "announcement", json!({"n": 1}), MessagePriority::Normal)
            .await
            .unwrap();
        settle().await;

        for office in ["a", "b"] {
            let queued = router.drain_queue(office).await;
            assert_eq!(queued.len(), 1, "office {} missed the broadcast", office);
            assert_eq!(queued[0].payload["event_type"], "announcement");
        }
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_reject_newest() {
        let config = RouterConfig {
            max_queue_size: 2,
            ..quiet_config()
        };
        let router = MessageRouter::start(config, Arc::new(InProcessBroker::new()))
            .await
            .unwrap();
        router
            .register_office("a", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        settle().await;
        router.drain_queue("a").await;

        for n in 0..3 {
            router
                .broadcast_notification("system", "evt", json!({ "n": n }), MessagePriority::Normal)
                .await
                .unwrap();
        }
        settle().await;

        let queued = router.drain_queue("a").await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].payload["data"]["n"], 0);
        assert_eq!(queued[1].payload["data"]["n"], 1);
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_reject_oldest() {
        let config = RouterConfig {
            max_queue_size: 2,
            overflow: OverflowPolicy::RejectOldest,
            ..quiet_config()
        };
        let router = MessageRouter::start(config, Arc::new(InProcessBroker::new()))
            .await
            .unwrap();
        router
            .register_office("a", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        settle().await;
        router.drain_queue("a").await;

        for n in 0..3 {
            router
                .broadcast_notification("system", "evt", json!({ "n": n }), MessagePriority::Normal)
                .await
                .unwrap();
        }
        settle().await;

        let queued = router.drain_queue("a").await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].payload["data"]["n"], 1);
        assert_eq!(queued[1].payload["data"]["n"], 2);
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_frees_queue() {
        let router = MessageRouter::start(quiet_config(), Arc::new(InProcessBroker::new()))
            .await
            .unwrap();
        router
            .register_office("a", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        assert_eq!(router.queue_depth("a").await, Some(0));

        router.unregister_office("a").await.unwrap();
        assert_eq!(router.queue_depth("a").await, None);

        // Unregistering twice is a no-op.
        router.unregister_office("a").await.unwrap();
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_relay_advances_and_completes() {
        let broker = Arc::new(InProcessBroker::new());
        let router = MessageRouter::start(quiet_config(), broker.clone())
            .await
            .unwrap();
        router
            .register_office("astrologist", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        router
            .register_office("economist", "test", Arc::new(NullHandler))
            .await
            .unwrap();
        settle().await;
        router.drain_queue("astrologist").await;
        router.drain_queue("economist").await;

        let steps = vec![
            RelayStep {
                office: "astrologist".to_string(),
                action: "read_transits".to_string(),
                input: json!({}),
                result: None,
                completed_at: None,
            },
            RelayStep {
                office: "economist".to_string(),
                action: "forecast".to_string(),
                input: json!({}),
                result: None,
                completed_at: None,
            },
        ];
        router.create_relay("wf-1", steps, "system").await.unwrap();
        settle().await;

        let first = router.drain_queue("astrologist").await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_type, MessageType::Workflow);

        router
            .advance_workflow("wf-1", json!({ "transits": "favorable" }))
            .await
            .unwrap();
        settle().await;

        let second = router.drain_queue("economist").await;
        assert_eq!(second.len(), 1);
        let state: RelayState = serde_json::from_value(second[0].payload.clone()).unwrap();
        assert_eq!(state.current_step, 1);
        assert_eq!(state.status, RelayStatus::InProgress);
        assert_eq!(state.steps[0].result.as_ref().unwrap()["transits"], "favorable");

        router
            .advance_workflow("wf-1", json!({ "gdp": "up" }))
            .await
            .unwrap();
        settle().await;

        let stored = broker.get("bureau:workflow:wf-1").await.unwrap().unwrap();
        let state: RelayState = serde_json::from_slice(&stored).unwrap();
        assert_eq!(state.status, RelayStatus::Completed);

        // Completion is broadcast to every office.
        let broadcasts = router.drain_queue("astrologist").await;
        assert!(broadcasts
            .iter()
            .any(|m| m.payload["event_type"] == "workflow_completed"));

        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_advance_unknown_relay_is_not_found() {
        let router = MessageRouter::start(quiet_config(), Arc::new(InProcessBroker::new()))
            .await
            .unwrap();
        let result = router.advance_workflow("missing", json!({})).await;
        assert!(matches!(result, Err(BureauError::NotFound(_))));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_counters_increment() {
        let broker = Arc::new(InProcessBroker::new());
        let router = MessageRouter::start(quiet_config(), broker.clone())
            .await
            .unwrap();

        let message = Message::request("banker", "economist", "ping", json!({}), MessagePriority::Normal);
        router.send_message(message, false, None).await.unwrap();

        assert_eq!(broker.incr("bureau:metrics:banker:sent").await.unwrap(), 2);
        assert_eq!(
            broker.incr("bureau:metrics:economist:received").await.unwrap(),
            2
        );
        router.shutdown().await;
    }
}
