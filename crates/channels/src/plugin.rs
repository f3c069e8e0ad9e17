use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::Serialize,
};

use crate::Result;

// ── Rendering ───────────────────────────────────────────────────────────────

/// The conversation log a rendered line belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EmitTarget {
    pub workspace: String,
    pub channel_id: String,
    pub channel_name: String,
}

/// Sink for rendered conversation lines. The host provides the concrete
/// implementation (terminal buffer, log file, test recorder).
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Append one rendered line to the target's conversation log.
    ///
    /// `line` is `prefix\tbody`; splitting and colouring are up to the host.
    async fn emit(&self, target: &EmitTarget, timestamp: DateTime<Utc>, tags: &[&str], line: &str);

    /// The set of users typing in `target` changed. No-op by default.
    async fn typing_changed(&self, _target: &EmitTarget, _names: &[String]) {}
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Read-only access to static per-workspace settings (e.g. `token`).
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

// ── Lifecycle ───────────────────────────────────────────────────────────────

/// Core channel plugin trait. Each chat backend implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "slack").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start a workspace connection.
    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()>;

    /// Stop a workspace connection.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Probe workspace health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}
