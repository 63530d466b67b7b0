//! Adaptive polling for data not covered by push streams.
//!
//! The cadence reacts to user settings, document visibility, and recent
//! failures. Any input change re-enters the interval computation at once
//! instead of waiting out the current tick, so a user flipping the
//! high-frequency switch sees the new cadence immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("poll action failed: {0}")]
pub struct PollError(pub String);

#[async_trait]
pub trait PollAction: Send + Sync {
    async fn run(&self) -> Result<(), PollError>;
}

#[async_trait]
impl<F, Fut> PollAction for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PollError>> + Send + 'static,
{
    async fn run(&self) -> Result<(), PollError> {
        (self)().await
    }
}

/// User-facing polling settings, delivered over a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub high_frequency_enabled: bool,
    pub polling_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            high_frequency_enabled: false,
            polling_interval: Duration::from_secs(30),
        }
    }
}

/// Grows the interval by `error_multiplier` per consecutive failure, capped
/// at `max_interval`; one success resets the growth.
#[derive(Debug, Clone)]
pub struct AdaptivePolicy {
    pub error_multiplier: u32,
    pub max_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub base_interval: Duration,
    pub immediate: bool,
    pub background_multiplier: u32,
    pub respect_high_frequency: bool,
    pub adaptive: Option<AdaptivePolicy>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            immediate: false,
            background_multiplier: 4,
            respect_high_frequency: true,
            adaptive: None,
        }
    }
}

/// Pure interval computation, shared by the scheduler loop and tests.
///
/// High-frequency mode lets the user's configured interval undercut the
/// caller's base interval; with it off, the configured interval can only
/// slow polling down. A hidden document multiplies the result.
pub fn effective_interval(
    config: &PollConfig,
    settings: &PollSettings,
    visible: bool,
    consecutive_errors: u32,
) -> Duration {
    let mut interval = if config.respect_high_frequency {
        if settings.high_frequency_enabled {
            settings.polling_interval.min(config.base_interval)
        } else {
            settings.polling_interval.max(config.base_interval)
        }
    } else {
        config.base_interval
    };
    if !visible {
        interval = interval.saturating_mul(config.background_multiplier);
    }
    if let Some(policy) = &config.adaptive {
        if consecutive_errors > 0 {
            let growth = policy
                .error_multiplier
                .saturating_pow(consecutive_errors.min(16));
            interval = interval.saturating_mul(growth).min(policy.max_interval);
        }
    }
    interval
}

/// Interval-based re-execution of an action. One scheduler per polled
/// resource; `stop()` is idempotent and safe from teardown paths.
pub struct PollScheduler {
    enabled_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn start<A>(
        config: PollConfig,
        action: Arc<A>,
        enabled: bool,
        visibility: watch::Receiver<bool>,
        settings: watch::Receiver<PollSettings>,
    ) -> Self
    where
        A: PollAction + 'static,
    {
        let (enabled_tx, enabled_rx) = watch::channel(enabled);
        let task = tokio::spawn(poll_loop(config, action, visibility, settings, enabled_rx));
        Self {
            enabled_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Flipping this restarts the cadence immediately.
    pub fn set_enabled(&self, enabled: bool) {
        let _ = self.enabled_tx.send(enabled);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!(target = "sync::poll", "poll scheduler stopped");
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop<A: PollAction>(
    config: PollConfig,
    action: Arc<A>,
    mut visibility: watch::Receiver<bool>,
    mut settings: watch::Receiver<PollSettings>,
    mut enabled: watch::Receiver<bool>,
) {
    let mut consecutive_errors: u32 = 0;

    if config.immediate && *enabled.borrow() {
        run_once(action.as_ref(), &mut consecutive_errors).await;
    }

    loop {
        if !*enabled.borrow() {
            if enabled.changed().await.is_err() {
                return;
            }
            continue;
        }

        let current_settings = settings.borrow().clone();
        let visible = *visibility.borrow();
        let interval = effective_interval(&config, &current_settings, visible, consecutive_errors);

        tokio::select! {
            _ = sleep(interval) => {
                run_once(action.as_ref(), &mut consecutive_errors).await;
            }
            changed = visibility.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = settings.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = enabled.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run_once<A: PollAction + ?Sized>(action: &A, consecutive_errors: &mut u32) {
    match action.run().await {
        Ok(()) => *consecutive_errors = 0,
        Err(err) => {
            *consecutive_errors += 1;
            warn!(
                target = "sync::poll",
                error = %err,
                consecutive_errors = *consecutive_errors,
                "poll action failed"
            );
        }
    }
}
