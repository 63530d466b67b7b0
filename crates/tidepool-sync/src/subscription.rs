//! Per-operation progress subscriptions with reconnect and backoff.
//!
//! Each subscribed operation id gets its own connection task and attempt
//! counter; stopping one never perturbs another. Every event updates the
//! durable registry snapshot before it reaches the handler, and a terminal
//! event removes both the registry entry and the subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use tidepool_proto::ProgressEvent;

use crate::channel::{ChannelError, ProgressChannel};
use crate::registry::{OperationRegistry, ResumableOperation};

/// Connection state reported to handlers via `on_state_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("reconnect attempts exhausted after {attempts} tries: {last}")]
    AttemptsExhausted { attempts: u32, last: ChannelError },
}

/// Callbacks for one subscription. `Closed` is reported synchronously from
/// within `stop()`; nothing else is delivered once `stop()` has returned.
/// Handlers must not call back into `stop()` for their own operation id;
/// terminal events end the subscription on their own.
pub trait SubscriptionHandler: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
    fn on_state_change(&self, operation_id: &str, state: ConnectionState) {
        let _ = (operation_id, state);
    }
    fn on_error(&self, operation_id: &str, error: &SubscribeError) {
        let _ = (operation_id, error);
    }
}

impl<F> SubscriptionHandler for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        (self)(event)
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Exponential delay for the given 1-based attempt, with uniform jitter
    /// in [0.5, 1.5), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(jitter).min(self.max_delay)
    }
}

/// Gate between the connection task and handler callbacks. Dispatch holds
/// the lock while invoking the handler, so `close()` cannot return while a
/// delivery is in flight; once closed, every later dispatch is a no-op.
#[derive(Default)]
struct DispatchGate {
    closed: Mutex<bool>,
}

impl DispatchGate {
    fn dispatch(&self, deliver: impl FnOnce()) {
        let closed = self.closed.lock();
        if !*closed {
            deliver();
        }
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}

struct Subscription {
    gate: Arc<DispatchGate>,
    handler: Arc<dyn SubscriptionHandler>,
    task: JoinHandle<()>,
}

type ActiveMap = Arc<Mutex<HashMap<String, Subscription>>>;

pub struct SubscriptionManager {
    channel: Arc<dyn ProgressChannel>,
    registry: Arc<OperationRegistry>,
    config: ReconnectConfig,
    active: ActiveMap,
}

impl SubscriptionManager {
    pub fn new(channel: Arc<dyn ProgressChannel>, registry: Arc<OperationRegistry>) -> Self {
        Self::with_config(channel, registry, ReconnectConfig::default())
    }

    pub fn with_config(
        channel: Arc<dyn ProgressChannel>,
        registry: Arc<OperationRegistry>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            channel,
            registry,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Opens (or reopens, tearing down the previous connection first) a
    /// subscription for the operation.
    pub fn subscribe(&self, operation_id: &str, handler: Arc<dyn SubscriptionHandler>) {
        self.spawn_subscription(operation_id, handler, false);
    }

    /// Tears down the transport and pending reconnect timers. Guarantees no
    /// further handler invocations once this returns, even if an in-flight
    /// network callback resolves afterwards.
    pub fn stop(&self, operation_id: &str) -> bool {
        let Some(subscription) = self.active.lock().remove(operation_id) else {
            return false;
        };
        subscription.gate.close();
        subscription.task.abort();
        subscription
            .handler
            .on_state_change(operation_id, ConnectionState::Closed);
        debug!(target = "sync::subscription", operation_id, "subscription stopped");
        true
    }

    pub fn is_active(&self, operation_id: &str) -> bool {
        self.active.lock().contains_key(operation_id)
    }

    /// Re-subscribes every operation still present in the registry, reporting
    /// `Reconnecting` first so the UI can flag state as stale until the first
    /// fresh event supersedes the persisted snapshot.
    pub fn resume_all(&self, handler: Arc<dyn SubscriptionHandler>) -> Vec<ResumableOperation> {
        let resumable = self.registry.resume_all();
        for operation in &resumable {
            self.spawn_subscription(&operation.operation_id, handler.clone(), true);
        }
        resumable
    }

    fn spawn_subscription(
        &self,
        operation_id: &str,
        handler: Arc<dyn SubscriptionHandler>,
        resuming: bool,
    ) {
        self.stop(operation_id);
        let gate = Arc::new(DispatchGate::default());
        // Holding the map lock across the spawn keeps the task from touching
        // the map before its entry exists.
        let mut active = self.active.lock();
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.channel),
            Arc::clone(&self.registry),
            self.config.clone(),
            Arc::clone(&self.active),
            operation_id.to_string(),
            Arc::clone(&handler),
            Arc::clone(&gate),
            resuming,
        ));
        active.insert(
            operation_id.to_string(),
            Subscription {
                gate,
                handler,
                task,
            },
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_subscription(
    channel: Arc<dyn ProgressChannel>,
    registry: Arc<OperationRegistry>,
    config: ReconnectConfig,
    active: ActiveMap,
    operation_id: String,
    handler: Arc<dyn SubscriptionHandler>,
    gate: Arc<DispatchGate>,
    resuming: bool,
) {
    let initial = if resuming {
        ConnectionState::Reconnecting
    } else {
        ConnectionState::Connecting
    };
    gate.dispatch(|| handler.on_state_change(&operation_id, initial));

    let mut attempt: u32 = 0;
    loop {
        let failure = match channel.open(&operation_id).await {
            Ok(mut stream) => {
                attempt = 0;
                gate.dispatch(|| handler.on_state_change(&operation_id, ConnectionState::Open));
                debug!(target = "sync::subscription", operation_id = %operation_id, "progress stream open");

                let mut failure = ChannelError::Dropped;
                let mut terminal = false;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            registry.apply(&event);
                            let is_terminal = event.is_terminal();
                            gate.dispatch(|| handler.on_event(&event));
                            if is_terminal {
                                terminal = true;
                                break;
                            }
                        }
                        Err(err) => {
                            failure = err;
                            break;
                        }
                    }
                }
                if terminal {
                    registry.complete(&operation_id);
                    remove_own_entry(&active, &operation_id, &gate);
                    debug!(
                        target = "sync::subscription",
                        operation_id = %operation_id,
                        "operation reached terminal status"
                    );
                    return;
                }
                failure
            }
            Err(err) => err,
        };

        attempt += 1;
        if attempt > config.max_attempts {
            let error = SubscribeError::AttemptsExhausted {
                attempts: config.max_attempts,
                last: failure,
            };
            warn!(
                target = "sync::subscription",
                operation_id = %operation_id,
                error = %error,
                "giving up on progress stream"
            );
            registry.complete(&operation_id);
            gate.dispatch(|| handler.on_error(&operation_id, &error));
            remove_own_entry(&active, &operation_id, &gate);
            return;
        }

        warn!(
            target = "sync::subscription",
            operation_id = %operation_id,
            attempt,
            error = %failure,
            "progress stream interrupted; reconnecting"
        );
        gate.dispatch(|| handler.on_state_change(&operation_id, ConnectionState::Reconnecting));
        sleep(config.delay_for_attempt(attempt)).await;
    }
}

/// Removes the map entry only if it still belongs to this task. A caller may
/// subscribe the same operation id again while we are tearing down, and that
/// fresh entry must stay in the map so `stop` can reach it.
fn remove_own_entry(active: &ActiveMap, operation_id: &str, gate: &Arc<DispatchGate>) {
    let mut entries = active.lock();
    let owned = entries
        .get(operation_id)
        .map(|sub| Arc::ptr_eq(&sub.gate, gate))
        .unwrap_or(false);
    if owned {
        entries.remove(operation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalProgressChannel;
    use crate::store::{KvStore, MemoryStore, StoreError};
    use tidepool_proto::{OperationKind, OperationStatus, ProgressDetail};

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<ProgressEvent>>,
        states: Mutex<Vec<ConnectionState>>,
        errors: Mutex<Vec<String>>,
    }

    impl SubscriptionHandler for RecordingHandler {
        fn on_event(&self, event: &ProgressEvent) {
            self.events.lock().push(event.clone());
        }
        fn on_state_change(&self, _operation_id: &str, state: ConnectionState) {
            self.states.lock().push(state);
        }
        fn on_error(&self, _operation_id: &str, error: &SubscribeError) {
            self.errors.lock().push(error.to_string());
        }
    }

    fn crawl_event(operation_id: &str, status: OperationStatus, percentage: f32) -> ProgressEvent {
        ProgressEvent {
            operation_id: operation_id.to_string(),
            status,
            percentage,
            logs: Vec::new(),
            detail: ProgressDetail::Crawl {
                pages_crawled: percentage as u64,
                pages_total: None,
                current_url: None,
            },
        }
    }

    fn fixture() -> (
        Arc<LocalProgressChannel>,
        Arc<OperationRegistry>,
        SubscriptionManager,
    ) {
        let channel = LocalProgressChannel::new();
        let registry = Arc::new(OperationRegistry::new(MemoryStore::new()));
        let manager = SubscriptionManager::with_config(
            channel.clone(),
            Arc::clone(&registry),
            ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 3,
            },
        );
        (channel, registry, manager)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time"
            );
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn delivers_events_in_order_and_completes_on_terminal() {
        let (channel, registry, manager) = fixture();
        registry.start("op-1", OperationKind::Crawl, serde_json::json!({}));

        let handler = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", handler.clone());
        wait_for(|| handler.states.lock().contains(&ConnectionState::Open)).await;

        channel
            .publish(crawl_event("op-1", OperationStatus::Running, 25.0))
            .unwrap();
        channel
            .publish(crawl_event("op-1", OperationStatus::Running, 75.0))
            .unwrap();
        channel
            .publish(crawl_event("op-1", OperationStatus::Completed, 100.0))
            .unwrap();

        wait_for(|| handler.events.lock().len() == 3).await;
        let percentages: Vec<f32> = handler.events.lock().iter().map(|e| e.percentage).collect();
        assert_eq!(percentages, vec![25.0, 75.0, 100.0]);

        wait_for(|| !manager.is_active("op-1")).await;
        assert!(registry.record("op-1").is_none());
    }

    #[tokio::test]
    async fn stop_suppresses_everything_afterwards() {
        let (channel, _registry, manager) = fixture();
        let handler = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", handler.clone());
        wait_for(|| handler.states.lock().contains(&ConnectionState::Open)).await;

        channel
            .publish(crawl_event("op-1", OperationStatus::Running, 10.0))
            .unwrap();
        wait_for(|| handler.events.lock().len() == 1).await;

        assert!(manager.stop("op-1"));
        assert_eq!(handler.states.lock().last(), Some(&ConnectionState::Closed));
        assert!(!manager.stop("op-1"));

        let _ = channel.publish(crawl_event("op-1", OperationStatus::Running, 90.0));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.events.lock().len(), 1);
        assert_eq!(handler.states.lock().last(), Some(&ConnectionState::Closed));
    }

    /// Storage adapter whose removal stalls, widening the window between a
    /// task observing a terminal event and it clearing its map entry.
    struct SlowRemoveStore {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    impl KvStore for SlowRemoveStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            self.inner.remove(key)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resubscribe_during_terminal_teardown_keeps_the_new_subscription() {
        let channel = LocalProgressChannel::new();
        let registry = Arc::new(OperationRegistry::new(Arc::new(SlowRemoveStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(200),
        })));
        let manager = SubscriptionManager::with_config(
            channel.clone(),
            Arc::clone(&registry),
            ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 3,
            },
        );
        registry.start("op-1", OperationKind::Crawl, serde_json::json!({}));

        let first = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", first.clone());
        wait_for(|| first.states.lock().contains(&ConnectionState::Open)).await;

        channel
            .publish(crawl_event("op-1", OperationStatus::Completed, 100.0))
            .unwrap();
        wait_for(|| first.events.lock().len() == 1).await;
        // The first task is now stalled inside the record removal.
        sleep(Duration::from_millis(20)).await;

        let second = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", second.clone());
        wait_for(|| second.states.lock().contains(&ConnectionState::Open)).await;

        channel
            .publish(crawl_event("op-1", OperationStatus::Running, 55.0))
            .unwrap();
        wait_for(|| second.events.lock().len() == 1).await;

        // Let the first task finish its teardown; it must not take the
        // second subscription's entry with it.
        sleep(Duration::from_millis(300)).await;
        assert!(manager.is_active("op-1"));

        assert!(manager.stop("op-1"));
        let _ = channel.publish(crawl_event("op-1", OperationStatus::Running, 90.0));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(second.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn reconnects_after_connect_failures() {
        let (channel, _registry, manager) = fixture();
        channel.fail_next_connects(2);

        let handler = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", handler.clone());
        wait_for(|| handler.states.lock().contains(&ConnectionState::Open)).await;

        assert_eq!(
            handler.states.lock().as_slice(),
            &[
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Open,
            ]
        );
    }

    #[tokio::test]
    async fn reconnects_after_a_severed_stream() {
        let (channel, _registry, manager) = fixture();
        let handler = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", handler.clone());
        wait_for(|| handler.states.lock().contains(&ConnectionState::Open)).await;

        channel.sever("op-1");
        wait_for(|| {
            let states = handler.states.lock();
            states.iter().filter(|s| **s == ConnectionState::Open).count() == 2
        })
        .await;

        channel
            .publish(crawl_event("op-1", OperationStatus::Running, 40.0))
            .unwrap();
        wait_for(|| handler.events.lock().len() == 1).await;
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_one_terminal_error() {
        let (channel, registry, manager) = fixture();
        registry.start("op-1", OperationKind::Upload, serde_json::json!({}));
        channel.fail_next_connects(100);

        let handler = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", handler.clone());

        wait_for(|| handler.errors.lock().len() == 1).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.errors.lock().len(), 1);
        assert!(registry.record("op-1").is_none());
        assert!(!manager.is_active("op-1"));
    }

    #[tokio::test]
    async fn stopping_one_operation_leaves_others_alone() {
        let (channel, _registry, manager) = fixture();
        let first = Arc::new(RecordingHandler::default());
        let second = Arc::new(RecordingHandler::default());
        manager.subscribe("op-1", first.clone());
        manager.subscribe("op-2", second.clone());
        wait_for(|| first.states.lock().contains(&ConnectionState::Open)).await;
        wait_for(|| second.states.lock().contains(&ConnectionState::Open)).await;

        manager.stop("op-1");
        channel
            .publish(crawl_event("op-2", OperationStatus::Running, 50.0))
            .unwrap();
        wait_for(|| second.events.lock().len() == 1).await;
        assert!(first.events.lock().is_empty());
        assert!(manager.is_active("op-2"));
    }

    #[tokio::test]
    async fn bare_closures_work_as_event_handlers() {
        let (channel, _registry, manager) = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            Arc::new(move |event: &ProgressEvent| {
                seen.lock().push(event.percentage);
            })
        };
        manager.subscribe("op-1", handler);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no event delivered");
            let _ = channel.publish(crawl_event("op-1", OperationStatus::Running, 10.0));
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.lock().first(), Some(&10.0));
    }

    #[test]
    fn backoff_delay_stays_within_bounds() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: 8,
        };
        for attempt in 1..=10 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(50), "attempt {attempt}");
            assert!(delay <= config.max_delay, "attempt {attempt}");
        }
        // first attempt jitters around the initial delay, never the cap
        let first = config.delay_for_attempt(1);
        assert!(first <= Duration::from_millis(150));
    }
}
