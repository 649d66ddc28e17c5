use anyhow::{anyhow, Context};
use base64::{engine::general_purpose, Engine as _};
use chrono::{SecondsFormat, TimeZone, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use url::Url;

use crate::models::{
    header_value, FrameDirection, Headers, NetworkRequest, RecordingSession, ResponseBody,
    WebSocketFrame, WebSocketOpcode,
};
use crate::storage::signature::endpoint_signature;

pub const HAR_VERSION: &str = "1.2";
const CREATOR_NAME: &str = "TabTrace";
const CREATOR_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_MIME: &str = "application/octet-stream";
const DEFAULT_HTTP_VERSION: &str = "HTTP/1.1";
const EPOCH_RFC3339: &str = "1970-01-01T00:00:00.000Z";

/// File envelope: `{"log": {...}}`
#[derive(Serialize)]
struct HarFile<'a> {
    log: &'a HarDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarDocument {
    pub version: String,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    pub time: i64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: Map<String, Value>,
    pub timings: HarTimings,
    #[serde(rename = "_resourceType")]
    pub resource_type: String,
    #[serde(rename = "_webSocketMessages", skip_serializing_if = "Option::is_none")]
    pub websocket_messages: Option<Vec<HarWebSocketMessage>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub query_string: Vec<HarHeader>,
    pub cookies: Vec<HarCookie>,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub cookies: Vec<HarCookie>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarCookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarTimings {
    pub send: i64,
    pub wait: i64,
    pub receive: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarWebSocketMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Seconds since epoch
    pub time: f64,
    pub opcode: u8,
    pub data: String,
}

impl HarDocument {
    fn new(entries: Vec<HarEntry>) -> Self {
        Self {
            version: HAR_VERSION.to_string(),
            creator: HarCreator {
                name: CREATOR_NAME.to_string(),
                version: CREATOR_VERSION.to_string(),
            },
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pretty JSON wrapped in the `log` envelope
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&HarFile { log: self })
    }
}

pub fn session_to_har(session: &RecordingSession) -> HarDocument {
    requests_to_har(&session.requests)
}

/// One entry per endpoint signature. The first-seen request represents the
/// signature and is emitted only when it reached a status.
pub fn requests_to_har(requests: &[NetworkRequest]) -> HarDocument {
    let mut representatives: IndexMap<String, &NetworkRequest> = IndexMap::new();
    for request in requests {
        representatives
            .entry(endpoint_signature(request))
            .or_insert(request);
    }
    let entries = representatives
        .into_values()
        .filter(|request| request.has_status())
        .map(HarEntry::from_request)
        .collect();
    HarDocument::new(entries)
}

impl HarEntry {
    fn from_request(req: &NetworkRequest) -> Self {
        let started_date_time = Utc
            .timestamp_millis_opt(req.timestamp)
            .single()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| EPOCH_RFC3339.to_string());
        let time = req.duration.map(|ms| ms as i64).unwrap_or(0);
        let http_version = http_version(req.metadata.protocol.as_deref());
        let websocket_messages = match &req.response_body {
            Some(ResponseBody::Frames(frames)) => {
                Some(frames.iter().map(HarWebSocketMessage::from_frame).collect())
            }
            _ => None,
        };
        Self {
            started_date_time,
            time,
            request: HarRequest::from_request(req, &http_version),
            response: HarResponse::from_request(req, &http_version),
            cache: Map::new(),
            timings: HarTimings {
                send: 0,
                wait: time,
                receive: 0,
            },
            resource_type: req.request_type.as_str().to_string(),
            websocket_messages,
        }
    }
}

impl HarRequest {
    fn from_request(req: &NetworkRequest, http_version: &str) -> Self {
        let headers = req.request_headers.as_ref();
        let cookies = headers
            .and_then(|h| header_value(h, "cookie"))
            .map(parse_cookie_header)
            .unwrap_or_default();
        let post_data = req.request_body.as_ref().map(|text| HarPostData {
            mime_type: headers
                .map(mime_type)
                .unwrap_or_else(|| DEFAULT_MIME.to_string()),
            text: text.clone(),
        });
        Self {
            method: req.method.clone(),
            url: req.url.clone(),
            http_version: http_version.to_string(),
            headers: headers.map(to_har_headers).unwrap_or_default(),
            query_string: query_pairs(&req.url),
            cookies,
            headers_size: -1,
            body_size: req.request_body.as_ref().map_or(0, |b| b.len() as i64),
            post_data,
        }
    }
}

impl HarResponse {
    fn from_request(req: &NetworkRequest, http_version: &str) -> Self {
        let status = req.status.unwrap_or(0);
        let headers = req.response_headers.as_ref();
        let content = HarContent::from_request(req);
        Self {
            status,
            status_text: status_text(status),
            http_version: http_version.to_string(),
            headers: headers.map(to_har_headers).unwrap_or_default(),
            cookies: headers.map(set_cookies).unwrap_or_default(),
            redirect_url: headers
                .and_then(|h| header_value(h, "location"))
                .unwrap_or_default()
                .to_string(),
            headers_size: -1,
            body_size: content.size,
            content,
        }
    }
}

impl HarContent {
    fn from_request(req: &NetworkRequest) -> Self {
        let mime_type = req
            .response_headers
            .as_ref()
            .map(mime_type)
            .unwrap_or_else(|| DEFAULT_MIME.to_string());
        let text = match &req.response_body {
            Some(ResponseBody::Frames(_)) | None => None,
            Some(body) => Some(body.to_text()),
        };
        let encoding = (req.metadata.base64_body && text.is_some()).then_some("base64");
        let size = match (req.response_size, &text) {
            (Some(size), _) => size as i64,
            (None, Some(text)) if encoding.is_some() => general_purpose::STANDARD
                .decode(text)
                .map(|bytes| bytes.len() as i64)
                .unwrap_or(text.len() as i64),
            (None, Some(text)) => text.len() as i64,
            (None, None) => 0,
        };
        Self {
            size,
            mime_type,
            text,
            encoding,
        }
    }
}

impl HarWebSocketMessage {
    fn from_frame(frame: &WebSocketFrame) -> Self {
        let opcode = match frame.opcode {
            Some(WebSocketOpcode::Continuation) => 0,
            Some(WebSocketOpcode::Binary) => 2,
            Some(WebSocketOpcode::Close) => 8,
            Some(WebSocketOpcode::Ping) => 9,
            Some(WebSocketOpcode::Pong) => 10,
            Some(WebSocketOpcode::Text) | None => 1,
        };
        Self {
            kind: match frame.direction {
                FrameDirection::Sent => "send",
                FrameDirection::Received => "receive",
            },
            time: frame.timestamp as f64 / 1000.0,
            opcode,
            data: frame.payload.clone(),
        }
    }
}

fn to_har_headers(headers: &Headers) -> Vec<HarHeader> {
    headers
        .iter()
        .map(|(name, value)| HarHeader {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn query_pairs(url: &str) -> Vec<HarHeader> {
    Url::parse(url)
        .map(|url| {
            url.query_pairs()
                .map(|(name, value)| HarHeader {
                    name: name.into_owned(),
                    value: value.into_owned(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Content-Type up to the first `;`
fn mime_type(headers: &Headers) -> String {
    header_value(headers, "content-type")
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}

fn http_version(protocol: Option<&str>) -> String {
    match protocol.map(|p| p.to_ascii_lowercase()).as_deref() {
        Some("h2") | Some("http/2") | Some("http/2.0") => "HTTP/2".to_string(),
        Some("h3") | Some("http/3") => "HTTP/3".to_string(),
        Some("http/1.0") => "HTTP/1.0".to_string(),
        Some("") | Some("http/1.1") | None => DEFAULT_HTTP_VERSION.to_string(),
        Some(other) => other.to_ascii_uppercase(),
    }
}

pub fn status_text(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

fn parse_cookie_header(header: &str) -> Vec<HarCookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| HarCookie {
                name: name.to_string(),
                value: value.trim().to_string(),
                ..HarCookie::default()
            })
        })
        .collect()
}

/// Every `Set-Cookie` header, with multi-cookie values separated by newlines
fn set_cookies(headers: &Headers) -> Vec<HarCookie> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
        .flat_map(|(_, value)| value.split('\n'))
        .filter_map(parse_set_cookie)
        .collect()
}

fn parse_set_cookie(line: &str) -> Option<HarCookie> {
    let mut parts = line.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut cookie = HarCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        ..HarCookie::default()
    };
    for attribute in parts {
        let (key, val) = match attribute.split_once('=') {
            Some((key, val)) => (key.trim(), Some(val.trim())),
            None => (attribute.trim(), None),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" => cookie.domain = val.map(String::from),
            "path" => cookie.path = val.map(String::from),
            "httponly" => cookie.http_only = Some(true),
            "secure" => cookie.secure = Some(true),
            _ => {}
        }
    }
    Some(cookie)
}

/// Write the archive as pretty JSON. An archive with no entries is rejected.
pub async fn export_har_to_path(
    har: &HarDocument,
    output_path: impl AsRef<Path>,
) -> anyhow::Result<usize> {
    if har.is_empty() {
        return Err(anyhow!("No entries to export"));
    }
    let json = har.to_json_pretty()?;
    tokio::fs::write(output_path, json)
        .await
        .context("writing HAR file")?;
    Ok(har.entries.len())
}
