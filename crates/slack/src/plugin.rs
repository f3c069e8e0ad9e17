use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {
    async_trait::async_trait,
    secrecy::ExposeSecret,
    tracing::{info, warn},
};

use skiff_channels::{
    ChannelHealthSnapshot, ChannelPlugin, ChannelStatus, Error as ChannelError, MessageSink,
    Result as ChannelResult,
};

use crate::{config::SlackWorkspaceConfig, workspace::SlackWorkspace};

/// Running workspaces keyed by account id.
pub type WorkspaceMap = Arc<RwLock<HashMap<String, Arc<SlackWorkspace>>>>;

/// Slack channel plugin.
pub struct SlackPlugin {
    workspaces: WorkspaceMap,
    sink: Arc<dyn MessageSink>,
}

impl SlackPlugin {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            workspaces: Arc::new(RwLock::new(HashMap::new())),
            sink,
        }
    }

    /// List all active workspace ids.
    pub fn account_ids(&self) -> Vec<String> {
        self.workspaces
            .read()
            .map(|ws| ws.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn workspace(&self, account_id: &str) -> Option<Arc<SlackWorkspace>> {
        self.workspaces
            .read()
            .ok()
            .and_then(|ws| ws.get(account_id).cloned())
    }
}

#[async_trait]
impl ChannelPlugin for SlackPlugin {
    fn id(&self) -> &str {
        "slack"
    }

    fn name(&self) -> &str {
        "Slack"
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> ChannelResult<()> {
        let config: SlackWorkspaceConfig = serde_json::from_value(config)?;
        if config.token.expose_secret().is_empty() {
            return Err(ChannelError::invalid_input("slack token is required"));
        }
        if let Some(previous) = self.workspace(account_id) {
            warn!(account_id, "workspace already running, restarting");
            previous.stop();
        }

        info!(account_id, "starting slack workspace");
        let workspace = SlackWorkspace::new(account_id, config, Arc::clone(&self.sink))
            .map_err(|e| ChannelError::external("starting workspace", e))?;
        let workspace = Arc::new(workspace);

        workspace.connect();
        let crawl = Arc::clone(&workspace);
        tokio::spawn(async move {
            let report = crawl.crawl_all().await;
            info!(
                workspace = crawl.name(),
                requests = report.requests,
                failures = report.failures,
                "initial sync done"
            );
        });

        self.workspaces
            .write()
            .map_err(|_| ChannelError::unavailable("workspace map lock poisoned"))?
            .insert(account_id.to_string(), workspace);
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> ChannelResult<()> {
        let removed = self
            .workspaces
            .write()
            .map_err(|_| ChannelError::unavailable("workspace map lock poisoned"))?
            .remove(account_id);
        match removed {
            Some(workspace) => {
                info!(account_id, "stopping slack workspace");
                workspace.stop();
            },
            None => warn!(account_id, "slack workspace not found"),
        }
        Ok(())
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for SlackPlugin {
    async fn probe(&self, account_id: &str) -> ChannelResult<ChannelHealthSnapshot> {
        let workspace = self
            .workspace(account_id)
            .ok_or_else(|| ChannelError::unknown_account(account_id))?;
        let state = workspace.state();
        let st = state
            .read()
            .map_err(|_| ChannelError::unavailable("workspace state lock poisoned"))?;
        let team = st
            .identity
            .as_ref()
            .and_then(|id| id.team_name.clone())
            .unwrap_or_else(|| account_id.to_string());
        Ok(ChannelHealthSnapshot {
            connected: st.is_connected(),
            account_id: account_id.to_string(),
            details: Some(format!(
                "{team}: {} channels, {} users",
                st.channels().len(),
                st.user_count()
            )),
        })
    }
}
