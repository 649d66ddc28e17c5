//! Inbound instrumentation events
//!
//! Wire method names are matched exactly; anything else decodes to
//! [`CdpEvent::Unhandled`] so new event classes never break capture.

use serde::Deserialize;
use serde_json::Value;

use crate::models::{Headers, RequestId, TabId};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub stack: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub post_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSent {
    pub request_id: RequestId,
    pub request: RequestPayload,
    /// Monotonic seconds
    #[serde(default)]
    pub timestamp: f64,
    /// Seconds since epoch
    #[serde(default)]
    pub wall_time: Option<f64>,
    #[serde(default)]
    pub initiator: Option<Initiator>,
    /// Resource type, e.g. `XHR`, `Fetch`, `Script`
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub redirect_response: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceived {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    pub response: ResponsePayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinished {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub encoded_data_length: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailed {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub canceled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketCreated {
    pub request_id: RequestId,
    pub url: String,
    #[serde(default)]
    pub initiator: Option<Initiator>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketFramePayload {
    #[serde(default)]
    pub opcode: f64,
    #[serde(default)]
    pub mask: bool,
    #[serde(default)]
    pub payload_data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketFrameEvent {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    pub response: WebSocketFramePayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequestPayload {
    #[serde(default)]
    pub headers: Headers,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketHandshakeRequest {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub wall_time: Option<f64>,
    #[serde(default)]
    pub request: HandshakeRequestPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketHandshakeResponse {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    pub response: ResponsePayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSourceMessageReceived {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReceived {
    pub request_id: RequestId,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub data_length: f64,
    #[serde(default)]
    pub encoded_data_length: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChangedPriority {
    pub request_id: RequestId,
    pub new_priority: String,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceWorkerEvent {
    #[serde(alias = "versionId", alias = "targetId", default)]
    pub worker_id: String,
    #[serde(alias = "scriptURL", default)]
    pub script_url: Option<String>,
}

/// Closed set of instrumentation events the capture pipeline understands
#[derive(Debug, Clone)]
pub enum CdpEvent {
    RequestWillBeSent(Box<RequestWillBeSent>),
    ResponseReceived(Box<ResponseReceived>),
    LoadingFinished(LoadingFinished),
    LoadingFailed(LoadingFailed),
    WebSocketCreated(WebSocketCreated),
    WebSocketFrameSent(WebSocketFrameEvent),
    WebSocketFrameReceived(WebSocketFrameEvent),
    WebSocketWillSendHandshakeRequest(WebSocketHandshakeRequest),
    WebSocketHandshakeResponseReceived(Box<WebSocketHandshakeResponse>),
    EventSourceMessageReceived(EventSourceMessageReceived),
    DataReceived(DataReceived),
    ResourceChangedPriority(ResourceChangedPriority),
    WorkerCreated(ServiceWorkerEvent),
    WorkerDestroyed(ServiceWorkerEvent),
    /// Any method this pipeline does not handle
    Unhandled(String),
}

impl CdpEvent {
    /// Decode a protocol event from its method name and params object.
    pub fn from_message(method: &str, params: Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;

        let event = match method {
            "Network.requestWillBeSent" => CdpEvent::RequestWillBeSent(from_value(params)?),
            "Network.responseReceived" => CdpEvent::ResponseReceived(from_value(params)?),
            "Network.loadingFinished" => CdpEvent::LoadingFinished(from_value(params)?),
            "Network.loadingFailed" => CdpEvent::LoadingFailed(from_value(params)?),
            "Network.webSocketCreated" => CdpEvent::WebSocketCreated(from_value(params)?),
            "Network.webSocketFrameSent" => CdpEvent::WebSocketFrameSent(from_value(params)?),
            "Network.webSocketFrameReceived" => {
                CdpEvent::WebSocketFrameReceived(from_value(params)?)
            }
            "Network.webSocketWillSendHandshakeRequest" => {
                CdpEvent::WebSocketWillSendHandshakeRequest(from_value(params)?)
            }
            "Network.webSocketHandshakeResponseReceived" => {
                CdpEvent::WebSocketHandshakeResponseReceived(from_value(params)?)
            }
            "Network.eventSourceMessageReceived" => {
                CdpEvent::EventSourceMessageReceived(from_value(params)?)
            }
            "Network.dataReceived" => CdpEvent::DataReceived(from_value(params)?),
            "Network.resourceChangedPriority" => {
                CdpEvent::ResourceChangedPriority(from_value(params)?)
            }
            "ServiceWorker.workerCreated" => CdpEvent::WorkerCreated(from_value(params)?),
            "ServiceWorker.workerDestroyed" => CdpEvent::WorkerDestroyed(from_value(params)?),
            other => CdpEvent::Unhandled(other.to_string()),
        };
        Ok(event)
    }

    pub fn method(&self) -> &str {
        match self {
            CdpEvent::RequestWillBeSent(_) => "Network.requestWillBeSent",
            CdpEvent::ResponseReceived(_) => "Network.responseReceived",
            CdpEvent::LoadingFinished(_) => "Network.loadingFinished",
            CdpEvent::LoadingFailed(_) => "Network.loadingFailed",
            CdpEvent::WebSocketCreated(_) => "Network.webSocketCreated",
            CdpEvent::WebSocketFrameSent(_) => "Network.webSocketFrameSent",
            CdpEvent::WebSocketFrameReceived(_) => "Network.webSocketFrameReceived",
            CdpEvent::WebSocketWillSendHandshakeRequest(_) => {
                "Network.webSocketWillSendHandshakeRequest"
            }
            CdpEvent::WebSocketHandshakeResponseReceived(_) => {
                "Network.webSocketHandshakeResponseReceived"
            }
            CdpEvent::EventSourceMessageReceived(_) => "Network.eventSourceMessageReceived",
            CdpEvent::DataReceived(_) => "Network.dataReceived",
            CdpEvent::ResourceChangedPriority(_) => "Network.resourceChangedPriority",
            CdpEvent::WorkerCreated(_) => "ServiceWorker.workerCreated",
            CdpEvent::WorkerDestroyed(_) => "ServiceWorker.workerDestroyed",
            CdpEvent::Unhandled(method) => method,
        }
    }
}

/// One line of a recorded event stream
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub tab_id: Option<TabId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_request_will_be_sent() {
        let event = CdpEvent::from_message(
            "Network.requestWillBeSent",
            json!({
                "requestId": "1000.1",
                "request": {
                    "url": "https://app.example.com/api/users",
                    "method": "POST",
                    "headers": { "Content-Type": "application/json" },
                    "postData": "{\"name\":\"a\"}"
                },
                "timestamp": 100.5,
                "wallTime": 1700000000.25,
                "initiator": { "type": "script" },
                "type": "Fetch"
            }),
        )
        .unwrap();
        match event {
            CdpEvent::RequestWillBeSent(ev) => {
                assert_eq!(ev.request_id, "1000.1");
                assert_eq!(ev.request.method, "POST");
                assert_eq!(ev.resource_type.as_deref(), Some("Fetch"));
                assert_eq!(ev.initiator.unwrap().kind, "script");
                assert_eq!(ev.request.headers.get("Content-Type").unwrap(), "application/json");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_method_is_unhandled() {
        let event = CdpEvent::from_message("Network.trustTokenOperationDone", json!({})).unwrap();
        assert!(matches!(event, CdpEvent::Unhandled(ref m) if m == "Network.trustTokenOperationDone"));
        assert_eq!(event.method(), "Network.trustTokenOperationDone");
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(CdpEvent::from_message("Network.loadingFinished", json!({ "foo": 1 })).is_err());
    }

    #[test]
    fn service_worker_accepts_version_id() {
        let event = CdpEvent::from_message(
            "ServiceWorker.workerCreated",
            json!({ "versionId": "7", "scriptURL": "https://x.test/sw.js" }),
        )
        .unwrap();
        match event {
            CdpEvent::WorkerCreated(ev) => assert_eq!(ev.worker_id, "7"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
