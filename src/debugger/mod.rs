//! Instrumentation feed access
//!
//! The capture pipeline talks to the per-tab debugging protocol through the
//! [`DebuggerBackend`] trait so hosts can plug in a browser extension bridge,
//! a remote DevTools connection, or a test double.

pub mod attach;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::models::TabId;

pub use attach::{AttachConfig, AttachState, AttachmentManager};

/// An instrumentation target known to the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    /// Owning tab, absent for workers and extension pages
    pub tab_id: Option<TabId>,
    /// `page`, `worker`, `background_page`, ...
    #[serde(rename = "type")]
    pub target_type: String,
    pub attached: bool,
    #[serde(default)]
    pub url: String,
}

pub trait DebuggerUsageExt {
    fn usage(&self) -> DebuggerUsage;
}

impl DebuggerUsageExt for [TargetInfo] {
    fn usage(&self) -> DebuggerUsage {
        let mut usage = DebuggerUsage::default();
        for target in self.iter().filter(|t| t.attached) {
            usage.active += 1;
            *usage.by_type.entry(target.target_type.clone()).or_default() += 1;
        }
        usage
    }
}

/// Snapshot of live debugger attachments, embedded in attach failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerUsage {
    pub active: usize,
    pub by_type: BTreeMap<String, usize>,
}

impl fmt::Display for DebuggerUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} active debugger(s)", self.active)?;
        if !self.by_type.is_empty() {
            let parts = self
                .by_type
                .iter()
                .map(|(kind, count)| format!("{kind}: {count}"))
                .collect::<Vec<_>>();
            write!(f, " ({})", parts.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("cannot record this tab: it has no URL")]
    MissingUrl,
    #[error("cannot record restricted page {url}")]
    RestrictedPage { url: String },
    #[error(
        "too many active debuggers ({active} attached, limit {limit}); close DevTools or other debugging tools and retry"
    )]
    TooManyDebuggers { active: usize, limit: usize },
    #[error("failed to attach debugger after {attempts} attempts: {reason}; {usage}")]
    AttachFailed {
        attempts: u32,
        reason: String,
        usage: DebuggerUsage,
    },
    #[error("failed to enable {domain} domain: {reason}")]
    DomainEnable { domain: &'static str, reason: String },
}

/// Connection to the per-tab debugging protocol
#[async_trait]
pub trait DebuggerBackend: Send + Sync {
    /// Enumerate every instrumentation target
    async fn targets(&self) -> anyhow::Result<Vec<TargetInfo>>;

    /// Attach to a tab using the given protocol version
    async fn attach(&self, tab_id: TabId, protocol_version: &str) -> anyhow::Result<()>;

    async fn detach(&self, tab_id: TabId) -> anyhow::Result<()>;

    /// Issue a protocol command and return its result object
    async fn send_command(
        &self,
        tab_id: TabId,
        method: &str,
        params: Value,
    ) -> anyhow::Result<Value>;
}

/// Response body as returned by `Network.getResponseBody`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedBody {
    pub body: String,
    #[serde(default)]
    pub base64_encoded: bool,
}

/// Fetch the response body of a finished request. `Ok(None)` means the
/// backend had nothing to return.
pub async fn fetch_body(
    backend: &dyn DebuggerBackend,
    tab_id: TabId,
    request_id: &str,
) -> anyhow::Result<Option<FetchedBody>> {
    let result = backend
        .send_command(
            tab_id,
            "Network.getResponseBody",
            json!({ "requestId": request_id }),
        )
        .await?;
    if result.is_null() {
        return Ok(None);
    }
    let body: FetchedBody = serde_json::from_value(result)?;
    Ok(Some(body))
}
