//! Scripted backend used by unit tests.

use super::{DebuggerBackend, TargetInfo};
use crate::models::TabId;
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    pub targets: Mutex<Vec<TargetInfo>>,
    /// Number of upcoming attach calls that fail
    pub attach_failures: Mutex<u32>,
    pub rejected_versions: Mutex<HashSet<String>>,
    pub failing_commands: Mutex<HashSet<String>>,
    pub fail_detach: Mutex<bool>,
    pub bodies: Mutex<HashMap<String, Value>>,
    pub body_delay: Mutex<Option<Duration>>,
    pub attach_delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn add_target(&self, tab_id: Option<TabId>, kind: &str, attached: bool) {
        let mut targets = self.targets.lock().unwrap();
        let index = targets.len();
        targets.push(TargetInfo {
            id: format!("target-{index}"),
            tab_id,
            target_type: kind.to_string(),
            attached,
            url: String::new(),
        });
    }

    pub fn set_body(&self, request_id: &str, body: &str) {
        self.bodies.lock().unwrap().insert(
            request_id.to_string(),
            json!({ "body": body, "base64Encoded": false }),
        );
    }

    fn set_attached(&self, tab_id: TabId, attached: bool) {
        let mut targets = self.targets.lock().unwrap();
        match targets.iter_mut().find(|t| t.tab_id == Some(tab_id)) {
            Some(target) => target.attached = attached,
            None => targets.push(TargetInfo {
                id: format!("tab-{tab_id}"),
                tab_id: Some(tab_id),
                target_type: "page".into(),
                attached,
                url: String::new(),
            }),
        }
    }
}

#[async_trait]
impl DebuggerBackend for ScriptedBackend {
    async fn targets(&self) -> anyhow::Result<Vec<TargetInfo>> {
        Ok(self.targets.lock().unwrap().clone())
    }

    async fn attach(&self, tab_id: TabId, protocol_version: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("attach:{tab_id}:{protocol_version}"));
        let delay = *self.attach_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejected_versions.lock().unwrap().contains(protocol_version) {
            return Err(anyhow!("Requested protocol version is not supported"));
        }
        {
            let mut failures = self.attach_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("Cannot access contents of the page"));
            }
        }
        self.set_attached(tab_id, true);
        Ok(())
    }

    async fn detach(&self, tab_id: TabId) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("detach:{tab_id}"));
        if *self.fail_detach.lock().unwrap() {
            return Err(anyhow!("Debugger is not attached to the tab"));
        }
        self.set_attached(tab_id, false);
        Ok(())
    }

    async fn send_command(
        &self,
        tab_id: TabId,
        method: &str,
        params: Value,
    ) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(format!("{method}:{tab_id}"));
        if self.failing_commands.lock().unwrap().contains(method) {
            return Err(anyhow!("{method} failed"));
        }
        if method == "Network.getResponseBody" {
            let delay = *self.body_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let request_id = params["requestId"].as_str().unwrap_or_default().to_string();
            return self
                .bodies
                .lock()
                .unwrap()
                .get(&request_id)
                .cloned()
                .ok_or_else(|| anyhow!("No resource with given identifier found"));
        }
        Ok(json!({}))
    }
}
