//! Offline replay of recorded instrumentation events.
//!
//! Reads JSON lines of the form `{"tabId": 1, "method": "...", "params": {...}}`,
//! runs them through the capture pipeline and prints the resulting HAR.
//! Lines whose method is `Network.getResponseBody` supply response bodies.
//!
//! Usage:
//! ```
//! cargo run --bin tabtrace_replay -- events.jsonl --output session.har
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tabtrace_core::api::{Recorder, RecorderConfig};
use tabtrace_core::capture::InboundMessage;
use tabtrace_core::debugger::{AttachConfig, DebuggerBackend, TargetInfo};
use tabtrace_core::models::TabId;
use tabtrace_core::storage::{export_har_to_path, requests_to_har, HarDocument};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;

const BODY_METHOD: &str = "Network.getResponseBody";
const FALLBACK_URL: &str = "https://replay.invalid/";

#[derive(Debug, PartialEq, Eq)]
struct ReplayConfig {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    default_tab: TabId,
    url: Option<String>,
}

fn parse_args() -> Result<ReplayConfig> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_args_from<I>(mut args: I) -> Result<ReplayConfig>
where
    I: Iterator<Item = String>,
{
    let mut config = ReplayConfig {
        input: None,
        output: None,
        default_tab: 1,
        url: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--output" | "-o" => {
                let path = args.next().ok_or_else(|| anyhow!("--output needs a path"))?;
                config.output = Some(PathBuf::from(path));
            }
            "--tab" => {
                let tab = args.next().ok_or_else(|| anyhow!("--tab needs a value"))?;
                config.default_tab = tab
                    .parse()
                    .with_context(|| format!("invalid tab id {tab}"))?;
            }
            "--url" => {
                config.url = args.next();
            }
            "--help" | "-h" => {
                eprintln!("TabTrace offline replay");
                eprintln!();
                eprintln!("Usage: tabtrace_replay [INPUT] [OPTIONS]");
                eprintln!();
                eprintln!("Reads JSON-lines events from INPUT (default: stdin).");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --output, -o <PATH>  Write the HAR here instead of stdout");
                eprintln!("  --tab <ID>           Tab for lines without a tabId (default: 1)");
                eprintln!("  --url <URL>          Page URL recorded on each session");
                eprintln!("  --help, -h           Show this help");
                std::process::exit(0);
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown argument: {other}");
            }
            path => {
                config.input = Some(PathBuf::from(path));
            }
        }
    }
    Ok(config)
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(LevelFilter::INFO)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Skips blank lines; malformed lines are logged and skipped.
fn parse_lines(contents: &str) -> Vec<InboundMessage> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str(line) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::warn!(line = idx + 1, %err, "skipping malformed event line");
                None
            }
        })
        .collect()
}

/// Backend that is always attachable and serves bodies captured in the input
struct ReplayBackend {
    bodies: HashMap<(TabId, String), Value>,
}

impl ReplayBackend {
    fn from_messages(messages: &[InboundMessage], default_tab: TabId) -> Self {
        let bodies = messages
            .iter()
            .filter(|m| m.method == BODY_METHOD)
            .filter_map(|m| {
                let request_id = m.params.get("requestId")?.as_str()?.to_string();
                let tab = m.tab_id.unwrap_or(default_tab);
                Some(((tab, request_id), m.params.clone()))
            })
            .collect();
        Self { bodies }
    }
}

#[async_trait]
impl DebuggerBackend for ReplayBackend {
    async fn targets(&self) -> Result<Vec<TargetInfo>> {
        Ok(Vec::new())
    }

    async fn attach(&self, _tab_id: TabId, _protocol_version: &str) -> Result<()> {
        Ok(())
    }

    async fn detach(&self, _tab_id: TabId) -> Result<()> {
        Ok(())
    }

    async fn send_command(&self, tab_id: TabId, method: &str, params: Value) -> Result<Value> {
        if method != BODY_METHOD {
            return Ok(json!({}));
        }
        let request_id = params
            .get("requestId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.bodies
            .get(&(tab_id, request_id))
            .cloned()
            .ok_or_else(|| anyhow!("No resource with given identifier found"))
    }
}

fn page_url(message: &InboundMessage) -> Option<String> {
    message
        .params
        .get("documentURL")
        .or_else(|| message.params.get("request").and_then(|r| r.get("url")))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(String::from)
}

async fn replay(messages: Vec<InboundMessage>, config: &ReplayConfig) -> Result<HarDocument> {
    let backend = Arc::new(ReplayBackend::from_messages(&messages, config.default_tab));
    let recorder = Recorder::new(
        backend,
        RecorderConfig {
            attach: AttachConfig {
                backoff_base_ms: 0,
                conflict_settle_ms: 0,
                ..AttachConfig::default()
            },
            ..RecorderConfig::default()
        },
    );

    let mut tabs = Vec::new();
    for message in messages {
        if message.method == BODY_METHOD {
            continue;
        }
        let tab = message.tab_id.unwrap_or(config.default_tab);
        if !recorder.is_recording(tab) {
            let url = config
                .url
                .clone()
                .or_else(|| page_url(&message))
                .unwrap_or_else(|| FALLBACK_URL.to_string());
            recorder
                .start_recording(tab, &url)
                .await
                .with_context(|| format!("starting replay session for tab {tab}"))?;
            tabs.push(tab);
        }
        recorder
            .handle_raw_event(tab, &message.method, message.params)
            .await;
    }

    let mut requests = Vec::new();
    for tab in tabs {
        let outcome = recorder.stop_recording(tab).await?;
        requests.extend(outcome.session.requests);
    }
    Ok(requests_to_har(&requests))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = parse_args()?;

    let contents = match &config.input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("reading stdin")?;
            buf
        }
    };

    let har = replay(parse_lines(&contents), &config).await?;
    match &config.output {
        Some(path) => {
            let written = export_har_to_path(&har, path).await?;
            tracing::info!(entries = written, path = %path.display(), "HAR written");
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(har.to_json_pretty()?.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> std::vec::IntoIter<String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn defaults_read_stdin_for_tab_one() {
        let cfg = parse_args_from(args(&[])).unwrap();
        assert_eq!(cfg.input, None);
        assert_eq!(cfg.default_tab, 1);
    }

    #[test]
    fn parses_input_output_and_tab() {
        let cfg = parse_args_from(args(&["events.jsonl", "-o", "out.har", "--tab", "42"])).unwrap();
        assert_eq!(cfg.input, Some(PathBuf::from("events.jsonl")));
        assert_eq!(cfg.output, Some(PathBuf::from("out.har")));
        assert_eq!(cfg.default_tab, 42);
        assert!(parse_args_from(args(&["--tab", "x"])).is_err());
    }

    #[tokio::test]
    async fn replays_event_stream_into_har() {
        let input = [
            json!({"method": "Network.getResponseBody", "params": {"requestId": "1", "body": "{\"id\":7}", "base64Encoded": false}}),
            json!({"method": "Network.requestWillBeSent", "params": {"requestId": "1", "documentURL": "https://app.example.com/", "request": {"url": "https://app.example.com/api/users/7", "method": "GET", "headers": {}}, "timestamp": 5.0, "wallTime": 1_700_000_000.0, "type": "XHR"}}),
            json!({"method": "Network.requestWillBeSent", "params": {"requestId": "2", "request": {"url": "https://app.example.com/logo.png", "method": "GET", "headers": {}}, "timestamp": 5.1, "type": "Image"}}),
            json!({"method": "Network.responseReceived", "params": {"requestId": "1", "timestamp": 5.2, "response": {"status": 200, "headers": {"content-type": "application/json"}}}}),
            json!({"method": "Network.loadingFinished", "params": {"requestId": "1", "timestamp": 5.3, "encodedDataLength": 8}}),
        ]
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");

        let messages = parse_lines(&format!("{input}\nnot json\n\n"));
        assert_eq!(messages.len(), 5);

        let cfg = parse_args_from(args(&[])).unwrap();
        let har = replay(messages, &cfg).await.unwrap();
        assert_eq!(har.entries.len(), 1);
        let entry = &har.entries[0];
        assert_eq!(entry.request.url, "https://app.example.com/api/users/7");
        assert_eq!(entry.response.content.text.as_deref(), Some("{\"id\":7}"));
        assert_eq!(entry.time, 200);
    }
}
