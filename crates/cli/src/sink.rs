//! Terminal rendering of workspace events.

use std::io::Write;

use {
    async_trait::async_trait,
    chrono::{DateTime, Local, Utc},
    skiff_channels::{EmitTarget, MessageSink},
};

/// Writes one line per event to stdout: `[time] workspace/#channel prefix body`.
#[derive(Debug, Default)]
pub struct StdoutSink;

pub fn format_line(target: &EmitTarget, timestamp: DateTime<Utc>, line: &str) -> String {
    let (prefix, body) = line.split_once('\t').unwrap_or(("", line));
    format!(
        "[{}] {}/#{} {:>12} | {}",
        timestamp.with_timezone(&Local).format("%H:%M:%S"),
        target.workspace,
        target.channel_name,
        prefix,
        body
    )
}

#[async_trait]
impl MessageSink for StdoutSink {
    async fn emit(&self, target: &EmitTarget, timestamp: DateTime<Utc>, _tags: &[&str], line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", format_line(target, timestamp, line));
    }

    async fn typing_changed(&self, target: &EmitTarget, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = writeln!(
            out,
            "{}/#{} typing: {}",
            target.workspace,
            target.channel_name,
            names.join(", ")
        );
    }
}
