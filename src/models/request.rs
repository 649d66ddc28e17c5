//! Network request model
//!
//! Represents a single API call observed on the instrumentation feed and
//! retained by the endpoint classifier.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::models::{EventSourceMessage, WebSocketFrame};

/// Header map in wire order.
pub type Headers = IndexMap<String, String>;

/// Instrumentation-assigned request identifier.
pub type RequestId = String;

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Kind of API traffic a request represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    #[serde(rename = "XHR")]
    Xhr,
    Fetch,
    #[serde(rename = "GraphQL")]
    GraphQl,
    WebSocket,
    #[serde(rename = "gRPC")]
    Grpc,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Xhr => "XHR",
            RequestType::Fetch => "Fetch",
            RequestType::GraphQl => "GraphQL",
            RequestType::WebSocket => "WebSocket",
            RequestType::Grpc => "gRPC",
        }
    }

    /// Derive the type of a freshly initiated request from its URL and the
    /// resource type declared by the instrumentation layer.
    pub fn infer(url: &str, declared_type: Option<&str>) -> Self {
        if url.to_ascii_lowercase().contains("/graphql") {
            return RequestType::GraphQl;
        }
        match declared_type.map(|t| t.to_ascii_lowercase()).as_deref() {
            Some("xmlhttprequest") | Some("xhr") => RequestType::Xhr,
            _ => RequestType::Fetch,
        }
    }
}

/// Side-channel details filled in by secondary event types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_streaming: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub chunks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_changed_at: Option<i64>,
    /// Negotiated protocol reported with the response (e.g. `h2`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Response body was delivered base64 encoded
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub base64_body: bool,
    /// Redirect hops that re-used this request id
    #[serde(skip_serializing_if = "is_zero")]
    pub redirects: u32,
    /// Created from a secondary event rather than a request initiation
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl RequestMetadata {
    pub fn is_empty(&self) -> bool {
        *self == RequestMetadata::default()
    }
}

/// Response payload. Plain responses carry text, streaming transports carry
/// an append-only sequence of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Text(String),
    Frames(Vec<WebSocketFrame>),
    Events(Vec<EventSourceMessage>),
}

impl ResponseBody {
    /// Body rendered as text for archive output.
    pub fn to_text(&self) -> String {
        match self {
            ResponseBody::Text(text) => text.clone(),
            ResponseBody::Frames(frames) => serde_json::to_string(frames).unwrap_or_default(),
            ResponseBody::Events(events) => serde_json::to_string(events).unwrap_or_default(),
        }
    }
}

/// A retained API request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    /// Join key for every later lifecycle event
    pub id: RequestId,
    pub url: String,
    pub method: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    /// Milliseconds since epoch
    pub timestamp: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Headers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Headers>,
    /// Milliseconds between initiation and response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<ResponseBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "RequestMetadata::is_empty")]
    pub metadata: RequestMetadata,

    /// Monotonic instrumentation time (seconds) of the initiation event
    #[serde(skip)]
    pub(crate) started_at: Option<f64>,
}

impl NetworkRequest {
    pub fn new(
        id: impl Into<RequestId>,
        url: impl Into<String>,
        method: impl Into<String>,
        request_type: RequestType,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            method: method.into(),
            request_type,
            timestamp,
            request_headers: None,
            request_body: None,
            status: None,
            response_headers: None,
            duration: None,
            response_size: None,
            response_body: None,
            error: None,
            metadata: RequestMetadata::default(),
            started_at: None,
        }
    }

    /// Whether the request reached a final, non-empty status
    pub fn has_status(&self) -> bool {
        matches!(self.status, Some(code) if code != 0)
    }

    /// Record a failure. The first failure wins.
    pub fn set_error(&mut self, error: impl Into<String>) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    /// Record request headers unless they were already captured.
    pub fn fill_request_headers(&mut self, headers: Headers) {
        if self.request_headers.is_none() {
            self.request_headers = Some(headers);
        }
    }

    /// Set a fetched body. Streaming records already present are kept.
    pub fn set_body_text(&mut self, body: String) {
        if self.response_body.is_none() {
            self.response_body = Some(ResponseBody::Text(body));
        }
    }

    pub fn append_frame(&mut self, frame: WebSocketFrame) {
        match &mut self.response_body {
            Some(ResponseBody::Frames(frames)) => frames.push(frame),
            None => self.response_body = Some(ResponseBody::Frames(vec![frame])),
            Some(_) => {
                tracing::debug!(request_id = %self.id, "dropping frame for non-frame body");
            }
        }
    }

    pub fn append_event(&mut self, message: EventSourceMessage) {
        match &mut self.response_body {
            Some(ResponseBody::Events(events)) => events.push(message),
            None => self.response_body = Some(ResponseBody::Events(vec![message])),
            Some(_) => {
                tracing::debug!(request_id = %self.id, "dropping event for non-event body");
            }
        }
    }

    /// Adopt the fields a masking pass may rewrite, leaving identity and
    /// every response-side field untouched.
    pub fn apply_masked(&mut self, masked: NetworkRequest) {
        self.url = masked.url;
        self.request_headers = masked.request_headers;
        self.request_body = masked.request_body;
    }
}
