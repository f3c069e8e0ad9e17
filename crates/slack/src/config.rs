use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    skiff_channels::ConfigSource,
};

use crate::{api::DEFAULT_API_BASE, transport::ReconnectPolicy};

/// Configuration for a single Slack workspace.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackWorkspaceConfig {
    /// API token used for listing calls and `rtm.connect`.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// Base URL of the web API (no trailing slash).
    pub api_base: String,

    /// Fixed real-time endpoint. When unset the URL is obtained from
    /// `rtm.connect` on every connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// Page size sent as `limit` on listing calls.
    pub page_limit: u32,

    /// Deadline for one listing request, body included.
    pub request_timeout_secs: u64,

    /// First reconnect delay (ms); doubled on each consecutive failure.
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay (ms).
    pub reconnect_max_ms: u64,

    /// Consecutive failed attempts before giving up (0 = never give up).
    pub reconnect_max_attempts: u32,

    /// How long a typing marker lives without being refreshed.
    pub typing_timeout_secs: u64,

    /// Interval of the typing expiry sweep (ms).
    pub typing_sweep_ms: u64,
}

impl SlackWorkspaceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_secs(self.typing_timeout_secs)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_ms.max(10))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial_ms = self.reconnect_initial_ms.max(100);
        ReconnectPolicy {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms.max(initial_ms)),
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

impl ConfigSource for SlackWorkspaceConfig {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            "token" => Some(self.token.expose_secret().clone()),
            "api_base" => Some(self.api_base.trim_end_matches('/').to_string()),
            "ws_url" => self.ws_url.clone(),
            "page_limit" => Some(self.page_limit.to_string()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SlackWorkspaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackWorkspaceConfig")
            .field("token", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("ws_url", &self.ws_url)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for SlackWorkspaceConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            api_base: DEFAULT_API_BASE.into(),
            ws_url: None,
            page_limit: 20,
            request_timeout_secs: 30,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_max_attempts: 10,
            typing_timeout_secs: 4,
            typing_sweep_ms: 1_000,
        }
    }
}
