//! Debugger attachment lifecycle
//!
//! Acquires exclusive instrumentation access to a tab, enables network
//! visibility and releases the attachment on stop.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{AttachError, DebuggerBackend, DebuggerUsage, DebuggerUsageExt};
use crate::models::TabId;

/// URL prefixes the browser never lets extensions instrument
const RESTRICTED_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "chrome-search://",
    "chrome-untrusted://",
    "devtools://",
    "edge://",
    "brave://",
    "opera://",
    "vivaldi://",
    "about:",
    "view-source:",
    "moz-extension://",
    "https://chrome.google.com/webstore",
    "https://chromewebstore.google.com",
];

/// Attachment tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    pub max_attempts: u32,
    /// Tried in order on every attempt
    pub protocol_versions: Vec<String>,
    /// Delay before the second attempt; doubles afterwards
    pub backoff_base_ms: u64,
    /// Wait after detaching a conflicting attachment
    pub conflict_settle_ms: u64,
    /// Attach is refused when more debuggers than this are already live
    pub max_active_debuggers: usize,
    pub max_total_buffer_size: u64,
    pub max_resource_buffer_size: u64,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            protocol_versions: ["1.3", "1.2", "1.1", "1.0"]
                .into_iter()
                .map(String::from)
                .collect(),
            backoff_base_ms: 1000,
            conflict_settle_ms: 500,
            max_active_debuggers: 8,
            max_total_buffer_size: 50 * 1024 * 1024,
            max_resource_buffer_size: 10 * 1024 * 1024,
        }
    }
}

impl AttachConfig {
    /// Backoff applied after a failed attempt (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Per-tab attachment state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Idle,
    ConflictCheck,
    Attaching { attempt: u32 },
    Attached,
    EnablingDomains,
    Ready,
    Detaching,
    AttachFailed,
}

/// Whether instrumentation is forbidden for this URL
pub fn is_restricted_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    RESTRICTED_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

pub struct AttachmentManager {
    backend: Arc<dyn DebuggerBackend>,
    config: AttachConfig,
    states: DashMap<TabId, AttachState>,
}

impl AttachmentManager {
    pub fn new(backend: Arc<dyn DebuggerBackend>, config: AttachConfig) -> Self {
        Self {
            backend,
            config,
            states: DashMap::new(),
        }
    }

    pub fn state(&self, tab_id: TabId) -> AttachState {
        self.states
            .get(&tab_id)
            .map(|s| *s)
            .unwrap_or(AttachState::Idle)
    }

    fn set_state(&self, tab_id: TabId, state: AttachState) {
        if state == AttachState::Idle {
            self.states.remove(&tab_id);
        } else {
            self.states.insert(tab_id, state);
        }
    }

    /// Attach to `tab_id` and enable network visibility. On success the tab
    /// is `Ready` and exactly one attachment is live.
    pub async fn attach(&self, tab_id: TabId, url: &str) -> Result<(), AttachError> {
        if url.trim().is_empty() {
            return Err(AttachError::MissingUrl);
        }
        if is_restricted_url(url) {
            return Err(AttachError::RestrictedPage {
                url: url.to_string(),
            });
        }

        self.set_state(tab_id, AttachState::ConflictCheck);
        if let Err(err) = self.resolve_conflicts(tab_id).await {
            self.set_state(tab_id, AttachState::Idle);
            return Err(err);
        }

        let version = match self.attach_with_retry(tab_id).await {
            Ok(version) => version,
            Err(err) => {
                self.set_state(tab_id, AttachState::AttachFailed);
                return Err(err);
            }
        };
        self.set_state(tab_id, AttachState::Attached);
        tracing::info!(tab_id, %version, "debugger attached");

        self.set_state(tab_id, AttachState::EnablingDomains);
        if let Err(err) = self.enable_domains(tab_id).await {
            if let Err(detach_err) = self.backend.detach(tab_id).await {
                tracing::warn!(tab_id, ?detach_err, "detach after failed setup also failed");
            }
            self.set_state(tab_id, AttachState::Idle);
            return Err(err);
        }

        self.set_state(tab_id, AttachState::Ready);
        Ok(())
    }

    async fn resolve_conflicts(&self, tab_id: TabId) -> Result<(), AttachError> {
        let targets = match self.backend.targets().await {
            Ok(targets) => targets,
            Err(err) => {
                tracing::warn!(tab_id, ?err, "unable to enumerate debugger targets");
                return Ok(());
            }
        };

        let existing = targets
            .iter()
            .any(|t| t.attached && t.tab_id == Some(tab_id));
        if existing {
            tracing::info!(tab_id, "tab already has a debugger attached; detaching it");
            if let Err(err) = self.backend.detach(tab_id).await {
                tracing::warn!(tab_id, ?err, "failed to detach existing debugger");
            }
            tokio::time::sleep(Duration::from_millis(self.config.conflict_settle_ms)).await;
        }

        let others = targets
            .iter()
            .filter(|t| t.tab_id != Some(tab_id))
            .cloned()
            .collect::<Vec<_>>();
        let active = others.usage().active;
        if active > self.config.max_active_debuggers {
            return Err(AttachError::TooManyDebuggers {
                active,
                limit: self.config.max_active_debuggers,
            });
        }
        Ok(())
    }

    async fn attach_with_retry(&self, tab_id: TabId) -> Result<String, AttachError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::from("no protocol versions configured");

        for attempt in 1..=attempts {
            self.set_state(tab_id, AttachState::Attaching { attempt });
            for version in &self.config.protocol_versions {
                match self.backend.attach(tab_id, version).await {
                    Ok(()) => return Ok(version.clone()),
                    Err(err) => {
                        tracing::debug!(tab_id, attempt, %version, ?err, "attach rejected");
                        last_error = err.to_string();
                    }
                }
            }
            if attempt < attempts {
                let delay = self.config.backoff_after(attempt);
                tracing::warn!(tab_id, attempt, ?delay, "attach attempt failed; backing off");
                tokio::time::sleep(delay).await;
            }
        }

        Err(AttachError::AttachFailed {
            attempts,
            reason: last_error,
            usage: self.usage().await,
        })
    }

    async fn enable_domains(&self, tab_id: TabId) -> Result<(), AttachError> {
        let params = json!({
            "maxTotalBufferSize": self.config.max_total_buffer_size,
            "maxResourceBufferSize": self.config.max_resource_buffer_size,
        });
        self.backend
            .send_command(tab_id, "Network.enable", params)
            .await
            .map_err(|err| AttachError::DomainEnable {
                domain: "Network",
                reason: err.to_string(),
            })?;

        let optional = [
            ("ServiceWorker.enable", json!({})),
            (
                "BackgroundService.startObserving",
                json!({ "service": "backgroundFetch" }),
            ),
            (
                "BackgroundService.startObserving",
                json!({ "service": "backgroundSync" }),
            ),
        ];
        for (method, params) in optional {
            if let Err(err) = self.backend.send_command(tab_id, method, params).await {
                tracing::warn!(tab_id, method, ?err, "optional domain unavailable");
            }
        }
        Ok(())
    }

    /// Release the attachment. Failures are logged, never returned.
    pub async fn detach(&self, tab_id: TabId) {
        self.set_state(tab_id, AttachState::Detaching);
        match self.backend.detach(tab_id).await {
            Ok(()) => tracing::info!(tab_id, "debugger detached"),
            Err(err) => tracing::warn!(tab_id, ?err, "detach failed; ignoring"),
        }
        self.set_state(tab_id, AttachState::Idle);
    }

    /// Forget an attachment the browser already tore down.
    pub fn mark_detached(&self, tab_id: TabId) {
        self.set_state(tab_id, AttachState::Idle);
    }

    /// Live snapshot of debugger usage across all tabs
    pub async fn usage(&self) -> DebuggerUsage {
        match self.backend.targets().await {
            Ok(targets) => targets.usage(),
            Err(err) => {
                tracing::warn!(?err, "unable to collect debugger usage");
                DebuggerUsage::default()
            }
        }
    }
}
