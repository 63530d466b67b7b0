//! Optimistic mutation reconciler.
//!
//! Maintains an authoritative baseline of JSON records plus an overlay of
//! speculative edits the user has made but the server has not confirmed.
//! Edits become visible immediately; the overlay is later confirmed, merged,
//! reverted, retried, or timed out against server responses.
//!
//! At most one pending entry exists per record id: concurrent optimistic
//! calls to the same id shallow-merge into it, so a burst of quick edits has
//! one timer, one confirm target, and one lifecycle. Every create or merge
//! stamps the entry with a monotonic version, and confirm/revert ignore
//! calls whose caller-held version predates the current entry, so a late
//! confirmation for an older edit can never clobber a newer pending one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::debug;

/// Caller-supplied closure that re-issues the transport call for a failed
/// edit. Invoked outside the reconciler lock, so it may call back in.
pub type RetryFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStatus {
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingChange {
    Patch(Value),
    Add(Value),
    Remove,
}

struct PendingUpdate {
    change: PendingChange,
    status: PendingStatus,
    error: Option<String>,
    retry: Option<RetryFn>,
    retry_count: u32,
    version: u64,
    created_at: Instant,
    timeout: Option<Duration>,
    timer: Option<AbortHandle>,
}

/// Options for one optimistic call. A timeout auto-reverts the entry if it
/// is neither confirmed nor reverted before expiry; the retry closure is
/// kept for [`Reconciler::retry`], latest one wins across merges.
#[derive(Default)]
pub struct UpdateOptions {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryFn>,
}

/// External view of a pending entry, for UI affordances.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStatus {
    pub is_pending: bool,
    pub is_failed: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub version: Option<u64>,
}

struct ReconcilerInner {
    baseline: HashMap<String, Value>,
    order: Vec<String>,
    pending: HashMap<String, PendingUpdate>,
    version_counter: u64,
}

impl ReconcilerInner {
    fn next_version(&mut self) -> u64 {
        self.version_counter += 1;
        self.version_counter
    }

    fn drop_pending(&mut self, id: &str) {
        if let Some(entry) = self.pending.remove(id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            if matches!(entry.change, PendingChange::Add(_)) && !self.baseline.contains_key(id) {
                self.order.retain(|existing| existing != id);
            }
        }
    }

    fn push_order(&mut self, id: &str) {
        if !self.order.iter().any(|existing| existing == id) {
            self.order.push(id.to_string());
        }
    }

    fn derived(&self, id: &str) -> Option<Value> {
        match self.pending.get(id) {
            Some(entry) => match &entry.change {
                PendingChange::Remove => None,
                PendingChange::Add(item) => Some(item.clone()),
                PendingChange::Patch(patch) => {
                    let mut value = self
                        .baseline
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default()));
                    shallow_merge(&mut value, patch);
                    Some(value)
                }
            },
            None => self.baseline.get(id).cloned(),
        }
    }
}

/// One instance per client session, shared by reference with consumers.
/// Timers require a tokio runtime, so construct it inside one when timeouts
/// are in play.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Mutex<ReconcilerInner>>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReconcilerInner {
                baseline: HashMap::new(),
                order: Vec::new(),
                pending: HashMap::new(),
                version_counter: 0,
            })),
        }
    }

    /// Replaces the authoritative baseline wholesale (a fresh list fetch).
    /// The speculative overlay is kept; optimistic adds stay at the tail of
    /// the collection order.
    pub fn set_baseline(&self, items: Vec<(String, Value)>) {
        let mut inner = self.inner.lock();
        inner.order = items.iter().map(|(id, _)| id.clone()).collect();
        inner.baseline = items.into_iter().collect();
        let added: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, entry)| matches!(entry.change, PendingChange::Add(_)))
            .map(|(id, _)| id.clone())
            .collect();
        for id in added {
            inner.push_order(&id);
        }
    }

    /// Feeds a single authoritative record without touching the overlay.
    pub fn insert_baseline(&self, id: &str, item: Value) {
        let mut inner = self.inner.lock();
        inner.baseline.insert(id.to_string(), item);
        inner.push_order(id);
    }

    /// Applies a patch to the derived view immediately and returns the
    /// version stamped on the pending entry. Merges into an existing entry
    /// for the same id; the latest retry closure and timeout win.
    pub fn optimistic_update(&self, id: &str, patch: Value, options: UpdateOptions) -> u64 {
        let mut inner = self.inner.lock();
        let version = inner.next_version();
        match inner.pending.get_mut(id) {
            Some(entry) => {
                entry.version = version;
                entry.status = PendingStatus::Pending;
                entry.error = None;
                match &mut entry.change {
                    PendingChange::Patch(existing) => shallow_merge(existing, &patch),
                    PendingChange::Add(item) => shallow_merge(item, &patch),
                    change @ PendingChange::Remove => *change = PendingChange::Patch(patch),
                }
                if options.retry.is_some() {
                    entry.retry = options.retry;
                }
                if options.timeout.is_some() {
                    entry.timeout = options.timeout;
                }
            }
            None => {
                inner.pending.insert(
                    id.to_string(),
                    PendingUpdate {
                        change: PendingChange::Patch(patch),
                        status: PendingStatus::Pending,
                        error: None,
                        retry: options.retry,
                        retry_count: 0,
                        version,
                        created_at: Instant::now(),
                        timeout: options.timeout,
                        timer: None,
                    },
                );
            }
        }
        self.arm_timer_locked(&mut inner, id);
        version
    }

    /// Adds an item to the derived collection immediately.
    pub fn optimistic_add(&self, id: &str, item: Value, options: UpdateOptions) -> u64 {
        let mut inner = self.inner.lock();
        let version = inner.next_version();
        match inner.pending.get_mut(id) {
            Some(entry) => {
                entry.change = PendingChange::Add(item);
                entry.version = version;
                entry.status = PendingStatus::Pending;
                entry.error = None;
                if options.retry.is_some() {
                    entry.retry = options.retry;
                }
                if options.timeout.is_some() {
                    entry.timeout = options.timeout;
                }
            }
            None => {
                inner.pending.insert(
                    id.to_string(),
                    PendingUpdate {
                        change: PendingChange::Add(item),
                        status: PendingStatus::Pending,
                        error: None,
                        retry: options.retry,
                        retry_count: 0,
                        version,
                        created_at: Instant::now(),
                        timeout: options.timeout,
                        timer: None,
                    },
                );
            }
        }
        inner.push_order(id);
        self.arm_timer_locked(&mut inner, id);
        version
    }

    /// Removes an item from the derived collection immediately. Removing an
    /// optimistic add of a never-confirmed item cancels the add outright.
    pub fn optimistic_remove(&self, id: &str, options: UpdateOptions) -> u64 {
        let mut inner = self.inner.lock();
        let version = inner.next_version();
        let cancels_add = matches!(
            inner.pending.get(id),
            Some(entry) if matches!(entry.change, PendingChange::Add(_))
        ) && !inner.baseline.contains_key(id);
        if cancels_add {
            inner.drop_pending(id);
            return version;
        }
        match inner.pending.get_mut(id) {
            Some(entry) => {
                entry.change = PendingChange::Remove;
                entry.version = version;
                entry.status = PendingStatus::Pending;
                entry.error = None;
                if options.retry.is_some() {
                    entry.retry = options.retry;
                }
                if options.timeout.is_some() {
                    entry.timeout = options.timeout;
                }
            }
            None => {
                inner.pending.insert(
                    id.to_string(),
                    PendingUpdate {
                        change: PendingChange::Remove,
                        status: PendingStatus::Pending,
                        error: None,
                        retry: options.retry,
                        retry_count: 0,
                        version,
                        created_at: Instant::now(),
                        timeout: options.timeout,
                        timer: None,
                    },
                );
            }
        }
        self.arm_timer_locked(&mut inner, id);
        version
    }

    /// Replaces the baseline with the authoritative server item and drops
    /// the pending entry. A confirmation older than the current entry
    /// version is ignored and returns false: the newer edit stays pending.
    pub fn confirm_update(&self, id: &str, server_item: Value, version: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.pending.get(id) {
            if entry.version > version {
                debug!(
                    target = "sync::reconciler",
                    id,
                    held = version,
                    current = entry.version,
                    "stale confirmation ignored"
                );
                return false;
            }
        }
        inner.baseline.insert(id.to_string(), server_item);
        inner.push_order(id);
        inner.drop_pending(id);
        true
    }

    /// Confirms an optimistic removal: the server deleted the record, so the
    /// baseline entry goes away too. Same staleness rule as
    /// [`Reconciler::confirm_update`].
    pub fn confirm_remove(&self, id: &str, version: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.pending.get(id) {
            if entry.version > version {
                debug!(
                    target = "sync::reconciler",
                    id,
                    held = version,
                    current = entry.version,
                    "stale removal confirmation ignored"
                );
                return false;
            }
        }
        inner.drop_pending(id);
        inner.baseline.remove(id);
        inner.order.retain(|existing| existing != id);
        true
    }

    /// Discards the overlay for the id, restoring the baseline value.
    pub fn revert_update(&self, id: &str, version: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending.get(id) {
            Some(entry) if entry.version > version => {
                debug!(
                    target = "sync::reconciler",
                    id,
                    held = version,
                    current = entry.version,
                    "stale revert ignored"
                );
                false
            }
            Some(_) => {
                inner.drop_pending(id);
                true
            }
            None => false,
        }
    }

    /// Records a transport failure on the entry. The optimistic value stays
    /// visible so the UI can offer retry or undo; the auto-revert timer is
    /// cancelled because a response did arrive.
    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.pending.get_mut(id) else {
            return false;
        };
        entry.status = PendingStatus::Failed;
        entry.error = Some(error.into());
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        true
    }

    /// Re-issues the stored retry closure: entry back to pending, retry
    /// count bumped, auto-revert timer re-armed.
    pub fn retry(&self, id: &str) -> bool {
        let retry_fn = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.pending.get_mut(id) else {
                return false;
            };
            let Some(retry_fn) = entry.retry.clone() else {
                return false;
            };
            entry.status = PendingStatus::Pending;
            entry.error = None;
            entry.retry_count += 1;
            self.arm_timer_locked(&mut inner, id);
            retry_fn
        };
        retry_fn();
        true
    }

    /// Reverts every pending entry back to baseline in one pass.
    pub fn rollback_all(&self) {
        let mut inner = self.inner.lock();
        let ids: Vec<String> = inner.pending.keys().cloned().collect();
        for id in ids {
            inner.drop_pending(&id);
        }
    }

    pub fn update_status(&self, id: &str) -> UpdateStatus {
        let inner = self.inner.lock();
        match inner.pending.get(id) {
            Some(entry) => UpdateStatus {
                is_pending: entry.status == PendingStatus::Pending,
                is_failed: entry.status == PendingStatus::Failed,
                error: entry.error.clone(),
                retry_count: entry.retry_count,
                version: Some(entry.version),
            },
            None => UpdateStatus::default(),
        }
    }

    /// Derived value for one id: baseline with the overlay applied.
    pub fn get(&self, id: &str) -> Option<Value> {
        self.inner.lock().derived(id)
    }

    /// Derived collection in creation order.
    pub fn items(&self) -> Vec<Value> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.derived(id))
            .collect()
    }

    pub fn is_optimistic(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// (Re)arms the auto-revert timer for the entry if it carries a timeout.
    /// The timer is stamped with the entry version; by the time it fires the
    /// entry may have been confirmed, reverted, failed, or merged again, and
    /// in all of those cases it must do nothing.
    fn arm_timer_locked(&self, inner: &mut ReconcilerInner, id: &str) {
        let (version, timeout) = match inner.pending.get_mut(id) {
            Some(entry) => {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                match entry.timeout {
                    Some(timeout) => (entry.version, timeout),
                    None => return,
                }
            }
            None => return,
        };

        let shared = Arc::clone(&self.inner);
        let owned_id = id.to_string();
        let handle = tokio::spawn(async move {
            sleep(timeout).await;
            let mut inner = shared.lock();
            let live = match inner.pending.get(&owned_id) {
                Some(entry) => {
                    entry.version == version && entry.status == PendingStatus::Pending
                }
                None => false,
            };
            if !live {
                return;
            }
            let age_ms = inner
                .pending
                .get(&owned_id)
                .map(|entry| entry.created_at.elapsed().as_millis() as u64)
                .unwrap_or_default();
            debug!(
                target = "sync::reconciler",
                id = %owned_id,
                age_ms,
                "unconfirmed optimistic update timed out; reverting"
            );
            inner.drop_pending(&owned_id);
        })
        .abort_handle();

        if let Some(entry) = inner.pending.get_mut(id) {
            entry.timer = Some(handle);
        }
    }
}

fn shallow_merge(target: &mut Value, patch: &Value) {
    if let (Some(target_map), Some(patch_map)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            target_map.insert(key.clone(), value.clone());
        }
        return;
    }
    *target = patch.clone();
}
