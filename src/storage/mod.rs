//! Session archives and persistence

mod har;
mod signature;

pub use har::{
    export_har_to_path, requests_to_har, session_to_har, status_text, HarContent, HarCookie,
    HarCreator, HarDocument, HarEntry, HarHeader, HarPostData, HarRequest, HarResponse,
    HarTimings, HarWebSocketMessage, HAR_VERSION,
};
pub use signature::{endpoint_signature, hash8};

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::models::RecordingSession;

/// Destination for finished sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn persist(&self, session: &RecordingSession, har: &HarDocument) -> anyhow::Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSessionStore;

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn persist(&self, _session: &RecordingSession, _har: &HarDocument) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes `<session-id>.har` and `<session-id>.session.json` into one directory
#[derive(Debug, Clone)]
pub struct HarDirectoryStore {
    root: PathBuf,
}

impl HarDirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating session directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn har_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.har"))
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.session.json"))
    }
}

#[async_trait]
impl SessionStore for HarDirectoryStore {
    async fn persist(&self, session: &RecordingSession, har: &HarDocument) -> anyhow::Result<()> {
        let har_json = har.to_json_pretty()?;
        let har_path = self.har_path(&session.id);
        tokio::fs::write(&har_path, har_json)
            .await
            .with_context(|| format!("writing {}", har_path.display()))?;

        let session_json = serde_json::to_string_pretty(session)?;
        let session_path = self.session_path(&session.id);
        tokio::fs::write(&session_path, session_json)
            .await
            .with_context(|| format!("writing {}", session_path.display()))?;

        tracing::info!(
            session_id = %session.id,
            entries = har.entries.len(),
            path = %har_path.display(),
            "session archived"
        );
        Ok(())
    }
}
