//! Recorder API
//!
//! Entry points a host calls to record tabs: start, feed events, stop.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::capture::{
    CdpEvent, DrainReport, EventProcessor, PassthroughMasker, PendingBodyTracker, RequestMasker,
    DEFAULT_DRAIN_TIMEOUT,
};
use crate::debugger::{AttachConfig, AttachError, AttachState, AttachmentManager, DebuggerBackend};
use crate::models::{RecordingSession, TabId};
use crate::storage::{session_to_har, HarDocument, NullSessionStore, SessionStore};

/// Get the version of the recorder core library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup).
/// `log_dir` holds the rolling log files in release builds.
#[allow(unused_variables)]
pub fn init_core(log_dir: Option<String>) -> anyhow::Result<()> {
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        use anyhow::Context;

        let log_dir = log_dir
            .as_ref()
            .map(|p| std::path::PathBuf::from(p).join("logs"))
            .unwrap_or_else(|| std::path::PathBuf::from("logs"));
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "tabtrace_core");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // logging lasts until process exit
        std::mem::forget(guard);

        // a subscriber installed by the host is fine
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .with_ansi(false)
            .try_init();
    }

    tracing::info!("TabTrace core initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub attach: AttachConfig,
    /// Upper bound on the wait for outstanding body fetches at stop
    pub drain_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            attach: AttachConfig::default(),
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RecorderConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("tab {0} is already being recorded")]
    AlreadyRecording(TabId),
    #[error("tab {0} is not being recorded")]
    NotRecording(TabId),
    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Everything produced when a session ends
#[derive(Debug, Clone)]
pub struct RecordingOutcome {
    pub session: RecordingSession,
    pub har: HarDocument,
    pub drain: DrainReport,
}

/// Records API traffic for any number of tabs at once
pub struct Recorder {
    backend: Arc<dyn DebuggerBackend>,
    attachments: AttachmentManager,
    masker: Arc<dyn RequestMasker>,
    store: Arc<dyn SessionStore>,
    pending: PendingBodyTracker,
    sessions: DashMap<TabId, EventProcessor>,
    /// Tabs with a start in flight
    starting: DashSet<TabId>,
    config: RecorderConfig,
}

/// Releases a start claim on every exit path
struct StartClaim<'a> {
    starting: &'a DashSet<TabId>,
    tab_id: TabId,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.tab_id);
    }
}

impl Recorder {
    pub fn new(backend: Arc<dyn DebuggerBackend>, config: RecorderConfig) -> Self {
        Self {
            attachments: AttachmentManager::new(backend.clone(), config.attach.clone()),
            backend,
            masker: Arc::new(PassthroughMasker),
            store: Arc::new(NullSessionStore),
            pending: PendingBodyTracker::new(),
            sessions: DashMap::new(),
            starting: DashSet::new(),
            config,
        }
    }

    pub fn with_masker(mut self, masker: Arc<dyn RequestMasker>) -> Self {
        self.masker = masker;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn is_recording(&self, tab_id: TabId) -> bool {
        self.sessions.contains_key(&tab_id)
    }

    pub fn recording_tabs(&self) -> Vec<TabId> {
        let mut tabs = self.sessions.iter().map(|e| *e.key()).collect::<Vec<_>>();
        tabs.sort_unstable();
        tabs
    }

    pub fn attach_state(&self, tab_id: TabId) -> AttachState {
        self.attachments.state(tab_id)
    }

    /// Attach to the tab and open a new session. Returns the session id.
    pub async fn start_recording(&self, tab_id: TabId, url: &str) -> Result<String, RecorderError> {
        if self.is_recording(tab_id) || !self.starting.insert(tab_id) {
            return Err(RecorderError::AlreadyRecording(tab_id));
        }
        let _claim = StartClaim {
            starting: &self.starting,
            tab_id,
        };
        if self.is_recording(tab_id) {
            return Err(RecorderError::AlreadyRecording(tab_id));
        }

        self.attachments.attach(tab_id, url).await?;

        let session = RecordingSession::new(tab_id, url);
        let session_id = session.id.clone();
        let processor = EventProcessor::new(
            session,
            self.backend.clone(),
            self.masker.clone(),
            self.pending.clone(),
        );
        match self.sessions.entry(tab_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RecorderError::AlreadyRecording(tab_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(processor);
            }
        }

        tracing::info!(tab_id, %session_id, url, "recording started");
        Ok(session_id)
    }

    /// Route a decoded event to the tab's session. Events for tabs that are
    /// not recording are dropped.
    pub async fn handle_event(&self, tab_id: TabId, event: CdpEvent) {
        let processor = self.sessions.get(&tab_id).map(|p| p.value().clone());
        match processor {
            Some(processor) => processor.apply(event).await,
            None => {
                tracing::debug!(tab_id, method = event.method(), "no session for tab; dropping event");
            }
        }
    }

    /// Decode and route a raw protocol event
    pub async fn handle_raw_event(&self, tab_id: TabId, method: &str, params: Value) {
        match CdpEvent::from_message(method, params) {
            Ok(event) => self.handle_event(tab_id, event).await,
            Err(err) => {
                tracing::warn!(tab_id, method, %err, "unparsable event payload; dropping");
            }
        }
    }

    /// Stop recording: drain outstanding work, build the archive, detach and
    /// hand the result to the session store.
    pub async fn stop_recording(&self, tab_id: TabId) -> Result<RecordingOutcome, RecorderError> {
        let (_, processor) = self
            .sessions
            .remove(&tab_id)
            .ok_or(RecorderError::NotRecording(tab_id))?;

        let outcome = self.finish(processor).await;
        self.attachments.detach(tab_id).await;
        self.persist(&outcome).await;
        Ok(outcome)
    }

    /// The browser detached on its own (tab closed, user dismissed the
    /// debugging banner). Finalizes like a stop without a detach call.
    pub async fn handle_detached(&self, tab_id: TabId, reason: &str) -> Option<RecordingOutcome> {
        self.attachments.mark_detached(tab_id);
        let (_, processor) = self.sessions.remove(&tab_id)?;
        tracing::info!(tab_id, reason, "debugger detached externally");

        let outcome = self.finish(processor).await;
        self.persist(&outcome).await;
        Some(outcome)
    }

    async fn finish(&self, processor: EventProcessor) -> RecordingOutcome {
        let tab_id = processor.tab_id();
        let state = processor.state();
        state.lock().await.finalize();

        let drain = self.pending.drain(tab_id, self.config.drain_timeout()).await;
        let session = state.lock().await.seal();
        let har = session_to_har(&session);

        let summary = session.summary();
        tracing::info!(
            tab_id,
            session_id = %session.id,
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            pending = summary.pending,
            entries = har.entries.len(),
            settled = drain.settled,
            abandoned = drain.abandoned,
            "recording stopped"
        );

        RecordingOutcome {
            session,
            har,
            drain,
        }
    }

    async fn persist(&self, outcome: &RecordingOutcome) {
        if let Err(err) = self.store.persist(&outcome.session, &outcome.har).await {
            tracing::warn!(session_id = %outcome.session.id, ?err, "failed to persist session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::testing::ScriptedBackend;
    use crate::models::SessionStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RecorderConfig {
        RecorderConfig {
            attach: AttachConfig {
                backoff_base_ms: 1,
                conflict_settle_ms: 1,
                ..AttachConfig::default()
            },
            drain_timeout_ms: 200,
        }
    }

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn persist(&self, _: &RecordingSession, _: &HarDocument) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("disk full"))
        }
    }

    async fn feed_completed_request(recorder: &Recorder, tab_id: TabId, id: &str, url: &str) {
        recorder
            .handle_raw_event(
                tab_id,
                "Network.requestWillBeSent",
                json!({
                    "requestId": id,
                    "request": { "url": url, "method": "GET", "headers": {} },
                    "timestamp": 10.0,
                    "wallTime": 1_700_000_000.0,
                    "type": "Fetch"
                }),
            )
            .await;
        recorder
            .handle_raw_event(
                tab_id,
                "Network.responseReceived",
                json!({
                    "requestId": id,
                    "timestamp": 10.1,
                    "response": { "status": 200, "headers": { "Content-Type": "application/json" } }
                }),
            )
            .await;
    }

    #[test]
    fn config_defaults() {
        let config: RecorderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.drain_timeout(), Duration::from_secs(5));
        assert_eq!(config.attach.max_attempts, 3);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let recorder = Recorder::new(Arc::new(ScriptedBackend::default()), fast_config());
        recorder.start_recording(1, "https://app.example.com").await.unwrap();
        let err = recorder
            .start_recording(1, "https://app.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::AlreadyRecording(1)));
        assert_eq!(recorder.attach_state(1), AttachState::Ready);
    }

    #[tokio::test]
    async fn concurrent_starts_attach_once() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.attach_delay.lock().unwrap() = Some(Duration::from_millis(5));
        let recorder = Recorder::new(backend.clone(), fast_config());

        let (a, b) = tokio::join!(
            recorder.start_recording(1, "https://app.example.com"),
            recorder.start_recording(1, "https://app.example.com"),
        );
        let (ok, err) = if a.is_ok() { (a, b) } else { (b, a) };
        assert!(ok.is_ok());
        assert!(matches!(err, Err(RecorderError::AlreadyRecording(1))));
        assert_eq!(recorder.attach_state(1), AttachState::Ready);
        let attaches = backend
            .calls()
            .iter()
            .filter(|c| c.starts_with("attach:1"))
            .count();
        assert_eq!(attaches, 1);
        assert!(!backend.calls().iter().any(|c| c == "detach:1"));

        recorder.stop_recording(1).await.unwrap();
        recorder.start_recording(1, "https://app.example.com").await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_releases_the_tab() {
        let backend = Arc::new(ScriptedBackend::default());
        backend
            .failing_commands
            .lock()
            .unwrap()
            .insert("Network.enable".to_string());
        let recorder = Recorder::new(backend.clone(), fast_config());
        assert!(recorder.start_recording(2, "https://app.example.com").await.is_err());

        backend.failing_commands.lock().unwrap().clear();
        recorder.start_recording(2, "https://app.example.com").await.unwrap();
        assert!(recorder.is_recording(2));
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let recorder = Recorder::new(Arc::new(ScriptedBackend::default()), fast_config());
        let err = recorder.stop_recording(9).await.unwrap_err();
        assert!(matches!(err, RecorderError::NotRecording(9)));
    }

    #[tokio::test]
    async fn restricted_page_surfaces_attach_error() {
        let backend = Arc::new(ScriptedBackend::default());
        let recorder = Recorder::new(backend.clone(), fast_config());
        let err = recorder
            .start_recording(1, "chrome://settings")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RecorderError::Attach(AttachError::RestrictedPage { .. })
        ));
        assert!(!recorder.is_recording(1));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_detaches_and_returns_archive() {
        let backend = Arc::new(ScriptedBackend::default());
        let recorder = Recorder::new(backend.clone(), fast_config());
        recorder.start_recording(3, "https://app.example.com").await.unwrap();
        feed_completed_request(&recorder, 3, "1", "https://app.example.com/api/me").await;

        let outcome = recorder.stop_recording(3).await.unwrap();
        assert_eq!(outcome.session.status, SessionStatus::Stopped);
        assert_eq!(outcome.session.requests.len(), 1);
        assert_eq!(outcome.har.entries.len(), 1);
        assert!(backend.calls().contains(&"detach:3".to_string()));
        assert!(!recorder.is_recording(3));
        assert_eq!(recorder.attach_state(3), AttachState::Idle);
    }

    #[tokio::test]
    async fn external_detach_skips_detach_call() {
        let backend = Arc::new(ScriptedBackend::default());
        let recorder = Recorder::new(backend.clone(), fast_config());
        recorder.start_recording(4, "https://app.example.com").await.unwrap();
        feed_completed_request(&recorder, 4, "1", "https://app.example.com/api/me").await;

        let outcome = recorder.handle_detached(4, "target_closed").await.unwrap();
        assert_eq!(outcome.session.requests.len(), 1);
        assert!(!backend.calls().iter().any(|c| c == "detach:4"));
        assert!(recorder.handle_detached(4, "target_closed").await.is_none());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_stop() {
        let store = Arc::new(FailingStore {
            calls: AtomicUsize::new(0),
        });
        let recorder = Recorder::new(Arc::new(ScriptedBackend::default()), fast_config())
            .with_store(store.clone());
        recorder.start_recording(5, "https://app.example.com").await.unwrap();
        assert!(recorder.stop_recording(5).await.is_ok());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_for_other_tabs_are_ignored() {
        let recorder = Recorder::new(Arc::new(ScriptedBackend::default()), fast_config());
        recorder.start_recording(6, "https://app.example.com").await.unwrap();
        feed_completed_request(&recorder, 7, "1", "https://app.example.com/api/me").await;
        recorder
            .handle_raw_event(6, "Network.responseReceived", json!({ "requestId": 5 }))
            .await;
        let outcome = recorder.stop_recording(6).await.unwrap();
        assert!(outcome.session.requests.is_empty());
        assert_eq!(recorder.recording_tabs(), Vec::<TabId>::new());
    }
}
