//! Durable bookkeeping of in-flight long-running operations.
//!
//! Records survive page reloads so the client can re-attach live progress
//! streams instead of presenting a dead spinner. The schema is deliberately
//! narrow: one well-known index record listing active operation ids, plus
//! one record per id. Resumption never scans or pattern-matches keys.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tidepool_proto::{OperationKind, OperationStatus, ProgressEvent};

use crate::store::KvStore;

const ACTIVE_INDEX_KEY: &str = "ops/active";

/// Long crawls can emit thousands of log lines; the backing store is
/// quota-limited, so only the most recent tail is persisted.
const MAX_PERSISTED_LOG_LINES: usize = 100;

fn record_key(operation_id: &str) -> String {
    format!("ops/{operation_id}")
}

/// Persisted snapshot of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub kind: OperationKind,
    pub metadata: serde_json::Value,
    pub status: OperationStatus,
    pub percentage: f32,
    pub logs: Vec<String>,
    pub started_at: SystemTime,
    pub last_updated: SystemTime,
}

/// What a caller needs to re-subscribe after a reload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableOperation {
    pub operation_id: String,
    pub kind: OperationKind,
    pub metadata: serde_json::Value,
}

/// Registry of live operations over a durable key-value store.
///
/// Storage failures are logged and swallowed: in-memory state stays
/// authoritative for the running session, and a failed write simply means
/// there is nothing to resume after the next reload.
pub struct OperationRegistry {
    store: Arc<dyn KvStore>,
}

impl OperationRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Idempotent upsert: re-starting an already tracked operation refreshes
    /// its kind and metadata but keeps the original start timestamp.
    pub fn start(&self, operation_id: &str, kind: OperationKind, metadata: serde_json::Value) {
        let now = SystemTime::now();
        let record = match self.load_record(operation_id) {
            Some(mut existing) => {
                existing.kind = kind;
                existing.metadata = metadata;
                existing.last_updated = now;
                existing
            }
            None => OperationRecord {
                operation_id: operation_id.to_string(),
                kind,
                metadata,
                status: OperationStatus::Running,
                percentage: 0.0,
                logs: Vec::new(),
                started_at: now,
                last_updated: now,
            },
        };
        self.write_record(&record);

        let mut index = self.load_index();
        if !index.iter().any(|id| id == operation_id) {
            index.push(operation_id.to_string());
            self.write_index(&index);
        }
    }

    /// Merges a progress event into the stored snapshot. An unknown id is a
    /// no-op rather than an error, to survive races with a concurrent
    /// `complete` on the same operation.
    pub fn apply(&self, event: &ProgressEvent) {
        let Some(mut record) = self.load_record(&event.operation_id) else {
            debug!(
                target = "sync::registry",
                operation_id = %event.operation_id,
                "progress for untracked operation ignored"
            );
            return;
        };
        record.status = event.status;
        record.percentage = event.percentage;
        record.logs.extend(event.logs.iter().cloned());
        if record.logs.len() > MAX_PERSISTED_LOG_LINES {
            let excess = record.logs.len() - MAX_PERSISTED_LOG_LINES;
            record.logs.drain(..excess);
        }
        record.last_updated = SystemTime::now();
        self.write_record(&record);
    }

    /// Removes the record and its index entry. Called on any terminal
    /// progress message or an explicit stop.
    pub fn complete(&self, operation_id: &str) {
        if let Err(err) = self.store.remove(&record_key(operation_id)) {
            warn!(
                target = "sync::registry",
                operation_id,
                error = %err,
                "failed to remove operation record"
            );
        }
        let mut index = self.load_index();
        let before = index.len();
        index.retain(|id| id != operation_id);
        if index.len() != before {
            self.write_index(&index);
        }
    }

    pub fn record(&self, operation_id: &str) -> Option<OperationRecord> {
        self.load_record(operation_id)
    }

    /// Every operation still in the index, for re-subscription on start-up.
    /// A corrupt or missing per-id record is skipped, not fatal.
    pub fn resume_all(&self) -> Vec<ResumableOperation> {
        self.load_index()
            .into_iter()
            .filter_map(|operation_id| match self.load_record(&operation_id) {
                Some(record) => Some(ResumableOperation {
                    operation_id: record.operation_id,
                    kind: record.kind,
                    metadata: record.metadata,
                }),
                None => {
                    warn!(
                        target = "sync::registry",
                        operation_id = %operation_id,
                        "skipping unreadable operation record during resume"
                    );
                    None
                }
            })
            .collect()
    }

    fn load_record(&self, operation_id: &str) -> Option<OperationRecord> {
        let raw = match self.store.get(&record_key(operation_id)) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(
                    target = "sync::registry",
                    operation_id,
                    error = %err,
                    "failed to read operation record"
                );
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(
                    target = "sync::registry",
                    operation_id,
                    error = %err,
                    "corrupt operation record"
                );
                None
            }
        }
    }

    fn write_record(&self, record: &OperationRecord) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    target = "sync::registry",
                    operation_id = %record.operation_id,
                    error = %err,
                    "failed to serialize operation record"
                );
                return;
            }
        };
        if let Err(err) = self.store.set(&record_key(&record.operation_id), &raw) {
            warn!(
                target = "sync::registry",
                operation_id = %record.operation_id,
                error = %err,
                "failed to persist operation record"
            );
        }
    }

    fn load_index(&self) -> Vec<String> {
        let raw = match self.store.get(ACTIVE_INDEX_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(
                    target = "sync::registry",
                    error = %err,
                    "failed to read active operation index"
                );
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(index) => index,
            Err(err) => {
                warn!(
                    target = "sync::registry",
                    error = %err,
                    "corrupt active operation index"
                );
                Vec::new()
            }
        }
    }

    fn write_index(&self, index: &[String]) {
        let raw = match serde_json::to_string(index) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    target = "sync::registry",
                    error = %err,
                    "failed to serialize active operation index"
                );
                return;
            }
        };
        if let Err(err) = self.store.set(ACTIVE_INDEX_KEY, &raw) {
            warn!(
                target = "sync::registry",
                error = %err,
                "failed to persist active operation index"
            );
        }
    }
}
