//! Wire types shared between the Tidepool backend and its clients.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for the web dashboard without pulling in the sync runtime.

use serde::{Deserialize, Serialize};

/// Kind of long-running server operation a client can track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Crawl,
    Upload,
}

/// Lifecycle status of an operation as reported by the backend.
///
/// The terminal set is exactly `completed | error | cancelled`; everything
/// else the server may add later must map onto `running` client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Error | OperationStatus::Cancelled
        )
    }
}

/// Kind-specific progress fields, tagged by operation kind on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressDetail {
    Crawl {
        pages_crawled: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pages_total: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_url: Option<String>,
    },
    Upload {
        bytes_sent: u64,
        bytes_total: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
}

impl ProgressDetail {
    pub fn kind(&self) -> OperationKind {
        match self {
            ProgressDetail::Crawl { .. } => OperationKind::Crawl,
            ProgressDetail::Upload { .. } => OperationKind::Upload,
        }
    }
}

/// One push-channel message: common envelope plus kind-specific fields
/// flattened alongside it, matching the backend's JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub operation_id: String,
    pub status: OperationStatus,
    pub percentage: f32,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(flatten)]
    pub detail: ProgressDetail,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Error.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn event_json_shape_is_flat() {
        let event = ProgressEvent {
            operation_id: "op-1".into(),
            status: OperationStatus::Running,
            percentage: 42.5,
            logs: vec!["fetched sitemap".into()],
            detail: ProgressDetail::Crawl {
                pages_crawled: 17,
                pages_total: Some(40),
                current_url: Some("https://example.com/docs".into()),
            },
        };

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["operation_id"], "op-1");
        assert_eq!(value["status"], "running");
        assert_eq!(value["kind"], "crawl");
        assert_eq!(value["pages_crawled"], 17);

        let back: ProgressEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
        assert_eq!(back.detail.kind(), OperationKind::Crawl);
    }

    #[test]
    fn upload_event_defaults_optional_fields() {
        let raw = serde_json::json!({
            "operation_id": "op-9",
            "status": "completed",
            "percentage": 100.0,
            "kind": "upload",
            "bytes_sent": 2048,
            "bytes_total": 2048,
        });
        let event: ProgressEvent = serde_json::from_value(raw).expect("deserialize");
        assert!(event.is_terminal());
        assert!(event.logs.is_empty());
        assert_eq!(event.detail.kind(), OperationKind::Upload);
    }
}
