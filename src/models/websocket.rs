//! Streaming message models
//!
//! Records appended to a request's body by WebSocket and server-sent-event
//! traffic.

use serde::{Deserialize, Serialize};

/// Direction of a WebSocket frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    /// Page to server
    Sent,
    /// Server to page
    Received,
}

/// WebSocket frame opcode as reported by the instrumentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebSocketOpcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl WebSocketOpcode {
    /// Parse from raw opcode number
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode & 0x0F {
            0 => Some(WebSocketOpcode::Continuation),
            1 => Some(WebSocketOpcode::Text),
            2 => Some(WebSocketOpcode::Binary),
            8 => Some(WebSocketOpcode::Close),
            9 => Some(WebSocketOpcode::Ping),
            10 => Some(WebSocketOpcode::Pong),
            _ => None,
        }
    }
}

/// A single captured WebSocket frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketFrame {
    pub direction: FrameDirection,
    /// Text payload, or base64 for binary frames
    pub payload: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opcode: Option<WebSocketOpcode>,
}

impl WebSocketFrame {
    pub fn new(direction: FrameDirection, payload: impl Into<String>, timestamp: i64) -> Self {
        Self {
            direction,
            payload: payload.into(),
            timestamp,
            opcode: None,
        }
    }

    pub fn with_opcode(mut self, opcode: Option<WebSocketOpcode>) -> Self {
        self.opcode = opcode;
        self
    }
}

/// A single server-sent event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSourceMessage {
    pub timestamp: i64,
    pub event_name: String,
    pub event_id: String,
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_masks_high_bits() {
        assert_eq!(WebSocketOpcode::from_u8(0x81), Some(WebSocketOpcode::Text));
        assert_eq!(WebSocketOpcode::from_u8(2), Some(WebSocketOpcode::Binary));
        assert_eq!(WebSocketOpcode::from_u8(3), None);
    }

    #[test]
    fn frame_serializes_lowercase_direction() {
        let frame = WebSocketFrame::new(FrameDirection::Received, "hi", 10);
        let value = serde_json::to_value(frame).unwrap();
        assert_eq!(value["direction"], "received");
        assert!(value.get("opcode").is_none());
    }
}
