//! In-memory request table for a live recording session
//!
//! Every transition here is synchronous; asynchronous follow-up work (body
//! fetches, masking) is scheduled by the processor once the lock is released.

use chrono::Utc;
use std::collections::HashMap;

use crate::capture::classifier::{self, RequestRecord};
use crate::capture::events::*;
use crate::debugger::FetchedBody;
use crate::models::{
    header_value, EventSourceMessage, FrameDirection, NetworkRequest, RecordingSession,
    RequestId, RequestType, ServiceWorkerRecord, WebSocketFrame, WebSocketOpcode,
};

/// Maps monotonic instrumentation seconds onto epoch milliseconds
#[derive(Debug, Clone, Copy)]
struct ClockAnchor {
    monotonic: f64,
    wall_ms: i64,
}

#[derive(Debug)]
pub struct SessionState {
    session: RecordingSession,
    index: HashMap<RequestId, usize>,
    clock: Option<ClockAnchor>,
    /// Set once the archive snapshot is taken; later completions are discarded
    sealed: bool,
}

impl SessionState {
    pub fn new(session: RecordingSession) -> Self {
        let index = session
            .requests
            .iter()
            .enumerate()
            .map(|(pos, req)| (req.id.clone(), pos))
            .collect();
        Self {
            session,
            index,
            clock: None,
            sealed: false,
        }
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn finalize(&mut self) {
        self.session.finalize();
    }

    /// Seal the state and hand out the final session snapshot.
    pub fn seal(&mut self) -> RecordingSession {
        self.sealed = true;
        self.session.clone()
    }

    pub fn request(&self, id: &str) -> Option<&NetworkRequest> {
        self.index.get(id).map(|pos| &self.session.requests[*pos])
    }

    fn request_mut(&mut self, id: &str) -> Option<&mut NetworkRequest> {
        let pos = *self.index.get(id)?;
        self.session.requests.get_mut(pos)
    }

    fn insert(&mut self, request: NetworkRequest) {
        self.index
            .insert(request.id.clone(), self.session.requests.len());
        self.session.requests.push(request);
    }

    fn epoch_ms(&self, monotonic: f64) -> i64 {
        match self.clock {
            Some(anchor) if monotonic > 0.0 => {
                anchor.wall_ms + ((monotonic - anchor.monotonic) * 1000.0).round() as i64
            }
            _ => Utc::now().timestamp_millis(),
        }
    }

    fn anchor_clock(&mut self, monotonic: f64, wall_time: Option<f64>) {
        if self.clock.is_some() || monotonic <= 0.0 {
            return;
        }
        if let Some(wall) = wall_time {
            self.clock = Some(ClockAnchor {
                monotonic,
                wall_ms: (wall * 1000.0).round() as i64,
            });
        }
    }

    /// Returns the new request when the classifier retained it.
    pub fn on_request_will_be_sent(&mut self, ev: &RequestWillBeSent) -> Option<NetworkRequest> {
        if let Some(existing) = self.request_mut(&ev.request_id) {
            if ev.redirect_response.is_some() {
                existing.metadata.redirects += 1;
            }
            return None;
        }
        self.anchor_clock(ev.timestamp, ev.wall_time);

        let record = RequestRecord {
            method: &ev.request.method,
            headers: &ev.request.headers,
            response_headers: None,
        };
        let decision = classifier::classify(
            &ev.request.url,
            ev.resource_type.as_deref(),
            &record,
            ev.initiator.as_ref(),
        );
        if !decision.is_retained() {
            tracing::debug!(url = %ev.request.url, ?decision, "request not retained");
            return None;
        }

        let timestamp = match ev.wall_time {
            Some(wall) => (wall * 1000.0).round() as i64,
            None => self.epoch_ms(ev.timestamp),
        };
        let mut request = NetworkRequest::new(
            ev.request_id.clone(),
            ev.request.url.clone(),
            ev.request.method.clone(),
            RequestType::infer(&ev.request.url, ev.resource_type.as_deref()),
            timestamp,
        );
        request.request_headers = Some(ev.request.headers.clone());
        request.request_body = ev.request.post_data.clone();
        if ev.timestamp > 0.0 {
            request.started_at = Some(ev.timestamp);
        }
        self.insert(request.clone());
        Some(request)
    }

    pub fn on_response_received(&mut self, ev: &ResponseReceived) {
        let Some(request) = self.request_mut(&ev.request_id) else {
            return;
        };
        let response = &ev.response;
        request.status = Some(response.status);
        request.response_headers = Some(response.headers.clone());
        request.duration = Some(elapsed_ms(request, ev.timestamp));
        if let Some(protocol) = &response.protocol {
            request.metadata.protocol = Some(protocol.clone());
        }

        let content_type = response
            .mime_type
            .clone()
            .or_else(|| header_value(&response.headers, "content-type").map(String::from))
            .unwrap_or_default()
            .to_ascii_lowercase();
        if content_type.contains("grpc") || content_type.contains("protobuf") {
            request.request_type = RequestType::Grpc;
        }
    }

    /// Returns true when a body fetch should be scheduled.
    pub fn on_loading_finished(&mut self, ev: &LoadingFinished) -> bool {
        let Some(request) = self.request_mut(&ev.request_id) else {
            return false;
        };
        request.response_size = Some(ev.encoded_data_length.max(0.0) as u64);
        request.request_type != RequestType::WebSocket
    }

    pub fn on_loading_failed(&mut self, ev: &LoadingFailed) {
        let Some(request) = self.request_mut(&ev.request_id) else {
            return;
        };
        let error = if ev.canceled == Some(true) {
            "Canceled".to_string()
        } else {
            ev.error_text.clone()
        };
        request.set_error(error);
    }

    /// WebSocket connections are always retained.
    pub fn on_websocket_created(&mut self, ev: &WebSocketCreated) -> Option<NetworkRequest> {
        if self.index.contains_key(&ev.request_id) {
            return None;
        }
        let request = NetworkRequest::new(
            ev.request_id.clone(),
            ev.url.clone(),
            "WebSocket",
            RequestType::WebSocket,
            Utc::now().timestamp_millis(),
        );
        self.insert(request.clone());
        Some(request)
    }

    pub fn on_websocket_frame(&mut self, ev: &WebSocketFrameEvent, direction: FrameDirection) {
        let timestamp = self.epoch_ms(ev.timestamp);
        let Some(request) = self.request_mut(&ev.request_id) else {
            return;
        };
        let opcode = WebSocketOpcode::from_u8(ev.response.opcode as u8);
        request.append_frame(
            WebSocketFrame::new(direction, ev.response.payload_data.clone(), timestamp)
                .with_opcode(opcode),
        );
    }

    pub fn on_websocket_handshake_request(&mut self, ev: &WebSocketHandshakeRequest) {
        self.anchor_clock(ev.timestamp, ev.wall_time);
        let Some(request) = self.request_mut(&ev.request_id) else {
            return;
        };
        request.fill_request_headers(ev.request.headers.clone());
        if request.started_at.is_none() && ev.timestamp > 0.0 {
            request.started_at = Some(ev.timestamp);
        }
    }

    pub fn on_websocket_handshake_response(&mut self, ev: &WebSocketHandshakeResponse) {
        let Some(request) = self.request_mut(&ev.request_id) else {
            return;
        };
        request.status = Some(ev.response.status);
        request.response_headers = Some(ev.response.headers.clone());
        request.duration = Some(elapsed_ms(request, ev.timestamp));
    }

    pub fn on_event_source_message(&mut self, ev: &EventSourceMessageReceived) {
        let timestamp = self.epoch_ms(ev.timestamp);
        if !self.index.contains_key(&ev.request_id) {
            let mut request = NetworkRequest::new(
                ev.request_id.clone(),
                String::new(),
                "GET",
                RequestType::Fetch,
                timestamp,
            );
            request.metadata.synthetic = true;
            self.insert(request);
        }
        if let Some(request) = self.request_mut(&ev.request_id) {
            request.append_event(EventSourceMessage {
                timestamp,
                event_name: ev.event_name.clone(),
                event_id: ev.event_id.clone(),
                data: ev.data.clone(),
            });
        }
    }

    pub fn on_data_received(&mut self, ev: &DataReceived) {
        let Some(request) = self.request_mut(&ev.request_id) else {
            return;
        };
        let chunk = ev.encoded_data_length.max(0.0) as u64;
        request.response_size = Some(request.response_size.unwrap_or(0) + chunk);
        request.metadata.is_streaming = true;
        request.metadata.chunks += 1;
    }

    pub fn on_priority_changed(&mut self, ev: &ResourceChangedPriority) {
        let changed_at = self.epoch_ms(ev.timestamp);
        let Some(request) = self.request_mut(&ev.request_id) else {
            return;
        };
        request.metadata.priority = Some(ev.new_priority.clone());
        request.metadata.priority_changed_at = Some(changed_at);
    }

    pub fn on_worker_created(&mut self, ev: &ServiceWorkerEvent) {
        let workers = &mut self.session.service_workers;
        if workers
            .iter()
            .any(|w| w.worker_id == ev.worker_id && w.destroyed_at.is_none())
        {
            return;
        }
        workers.push(ServiceWorkerRecord {
            worker_id: ev.worker_id.clone(),
            script_url: ev.script_url.clone(),
            created_at: Utc::now().timestamp_millis(),
            destroyed_at: None,
        });
    }

    pub fn on_worker_destroyed(&mut self, ev: &ServiceWorkerEvent) {
        if let Some(worker) = self
            .session
            .service_workers
            .iter_mut()
            .rev()
            .find(|w| w.worker_id == ev.worker_id && w.destroyed_at.is_none())
        {
            worker.destroyed_at = Some(Utc::now().timestamp_millis());
        }
    }

    /// Apply a fetched body. No-op once sealed.
    pub fn complete_body(&mut self, request_id: &str, body: FetchedBody) {
        if self.sealed {
            return;
        }
        if let Some(request) = self.request_mut(request_id) {
            if body.base64_encoded {
                request.metadata.base64_body = true;
            }
            request.set_body_text(body.body);
        }
    }

    /// Replace the maskable fields of a request. No-op once sealed.
    pub fn complete_masking(&mut self, masked: NetworkRequest) {
        if self.sealed {
            return;
        }
        if let Some(request) = self.request_mut(&masked.id) {
            request.apply_masked(masked);
        }
    }
}

fn elapsed_ms(request: &NetworkRequest, response_timestamp: f64) -> u64 {
    match request.started_at {
        Some(start) if response_timestamp > 0.0 => {
            ((response_timestamp - start) * 1000.0).max(0.0).round() as u64
        }
        _ => (Utc::now().timestamp_millis() - request.timestamp).max(0) as u64,
    }
}
