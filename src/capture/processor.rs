//! Capture event processor
//!
//! Applies instrumentation events for one tab to its session state and
//! schedules the asynchronous follow-up work (masking, body fetches).

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::capture::events::CdpEvent;
use crate::capture::masking::RequestMasker;
use crate::capture::pending::PendingBodyTracker;
use crate::capture::state::SessionState;
use crate::debugger::{self, DebuggerBackend};
use crate::models::{FrameDirection, NetworkRequest, RecordingSession, TabId};

pub type SharedState = Arc<Mutex<SessionState>>;

#[derive(Clone)]
pub struct EventProcessor {
    tab_id: TabId,
    state: SharedState,
    backend: Arc<dyn DebuggerBackend>,
    masker: Arc<dyn RequestMasker>,
    pending: PendingBodyTracker,
}

impl EventProcessor {
    pub fn new(
        session: RecordingSession,
        backend: Arc<dyn DebuggerBackend>,
        masker: Arc<dyn RequestMasker>,
        pending: PendingBodyTracker,
    ) -> Self {
        Self {
            tab_id: session.tab_id,
            state: Arc::new(Mutex::new(SessionState::new(session))),
            backend,
            masker,
            pending,
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Apply one event. Events for unknown request ids are ignored, as are
    /// events that arrive once the session stopped.
    ///
    /// Follow-up jobs are registered while the state lock is held, so a stop
    /// that finalizes the session always sees them in the drain.
    pub async fn apply(&self, event: CdpEvent) {
        let mut state = self.state.lock().await;
        if state.is_sealed() || !state.session().is_recording() {
            tracing::debug!(tab_id = self.tab_id, method = event.method(), "session stopped; dropping event");
            return;
        }

        match event {
            CdpEvent::RequestWillBeSent(ev) => {
                if let Some(request) = state.on_request_will_be_sent(&ev) {
                    self.schedule_masking(request);
                }
            }
            CdpEvent::ResponseReceived(ev) => state.on_response_received(&ev),
            CdpEvent::LoadingFinished(ev) => {
                if state.on_loading_finished(&ev) {
                    self.schedule_body_fetch(ev.request_id);
                }
            }
            CdpEvent::LoadingFailed(ev) => state.on_loading_failed(&ev),
            CdpEvent::WebSocketCreated(ev) => {
                if let Some(request) = state.on_websocket_created(&ev) {
                    self.schedule_masking(request);
                }
            }
            CdpEvent::WebSocketFrameSent(ev) => state.on_websocket_frame(&ev, FrameDirection::Sent),
            CdpEvent::WebSocketFrameReceived(ev) => {
                state.on_websocket_frame(&ev, FrameDirection::Received)
            }
            CdpEvent::WebSocketWillSendHandshakeRequest(ev) => {
                state.on_websocket_handshake_request(&ev)
            }
            CdpEvent::WebSocketHandshakeResponseReceived(ev) => {
                state.on_websocket_handshake_response(&ev)
            }
            CdpEvent::EventSourceMessageReceived(ev) => state.on_event_source_message(&ev),
            CdpEvent::DataReceived(ev) => state.on_data_received(&ev),
            CdpEvent::ResourceChangedPriority(ev) => state.on_priority_changed(&ev),
            CdpEvent::WorkerCreated(ev) => {
                tracing::debug!(tab_id = self.tab_id, worker_id = %ev.worker_id, "service worker created");
                state.on_worker_created(&ev)
            }
            CdpEvent::WorkerDestroyed(ev) => state.on_worker_destroyed(&ev),
            CdpEvent::Unhandled(method) => {
                tracing::trace!(tab_id = self.tab_id, %method, "ignoring unhandled event");
            }
        }
    }

    fn schedule_masking(&self, request: NetworkRequest) {
        let masker = self.masker.clone();
        let state = self.state.clone();
        self.pending.register(self.tab_id, async move {
            let masked = masker.mask(request).await;
            state.lock().await.complete_masking(masked);
        });
    }

    fn schedule_body_fetch(&self, request_id: String) {
        let backend = self.backend.clone();
        let state = self.state.clone();
        let tab_id = self.tab_id;
        self.pending.register(tab_id, async move {
            match debugger::fetch_body(backend.as_ref(), tab_id, &request_id).await {
                Ok(Some(body)) => state.lock().await.complete_body(&request_id, body),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(tab_id, %request_id, ?err, "response body unavailable");
                }
            }
        });
    }
}
