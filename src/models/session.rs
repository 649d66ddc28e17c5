//! Recording session model
//!
//! One session per monitored tab, from start to stop.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::NetworkRequest;

/// Browser tab identifier
pub type TabId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Stopped,
}

/// Service worker observed while recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceWorkerRecord {
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_url: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destroyed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub id: String,
    pub tab_id: TabId,
    pub url: String,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub status: SessionStatus,
    /// First-observed order
    pub requests: Vec<NetworkRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_workers: Vec<ServiceWorkerRecord>,
}

/// Counts reported when a session stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub by_type: BTreeMap<&'static str, usize>,
}

impl RecordingSession {
    pub fn new(tab_id: TabId, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tab_id,
            url: url.into(),
            start_time: Utc::now().timestamp_millis(),
            end_time: None,
            status: SessionStatus::Recording,
            requests: Vec::new(),
            service_workers: Vec::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.status == SessionStatus::Recording
    }

    /// Mark the session stopped. Calling twice keeps the first end time.
    pub fn finalize(&mut self) {
        if self.status == SessionStatus::Stopped {
            return;
        }
        self.status = SessionStatus::Stopped;
        self.end_time = Some(Utc::now().timestamp_millis());
    }

    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary {
            total: self.requests.len(),
            ..Default::default()
        };
        for req in &self.requests {
            if req.has_status() {
                summary.completed += 1;
            } else if req.error.is_some() {
                summary.failed += 1;
            } else {
                summary.pending += 1;
            }
            *summary.by_type.entry(req.request_type.as_str()).or_default() += 1;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestType;

    #[test]
    fn finalize_is_idempotent() {
        let mut session = RecordingSession::new(7, "https://app.example.com");
        session.finalize();
        let end = session.end_time;
        session.finalize();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(session.end_time, end);
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut session = RecordingSession::new(1, "https://app.example.com");
        let mut ok = NetworkRequest::new("a", "https://app.example.com/api", "GET", RequestType::Fetch, 0);
        ok.status = Some(200);
        let mut failed =
            NetworkRequest::new("b", "https://app.example.com/api", "GET", RequestType::Xhr, 0);
        failed.error = Some("Canceled".into());
        let pending =
            NetworkRequest::new("c", "wss://app.example.com/ws", "WebSocket", RequestType::WebSocket, 0);
        session.requests = vec![ok, failed, pending];

        let summary = session.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.by_type.get("WebSocket"), Some(&1));
    }
}
