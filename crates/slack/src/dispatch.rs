//! Routes real-time events into state updates and rendered lines.
//!
//! Handlers run against the locked workspace state and produce a list of
//! [`Effect`]s; the effects are delivered to the [`MessageSink`] after the
//! lock is released.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    chrono::{DateTime, Utc},
    serde_json::Value,
    skiff_channels::{EmitTarget, MessageSink},
    tracing::{debug, error, info, warn},
};

use crate::{
    decode::TextDecoder,
    state::{ChannelKind, SharedState, WorkspaceState},
};

const TAGS_USER: &[&str] = &["slack_message", "slack_user_message"];
const TAGS_BOT: &[&str] = &["slack_message", "slack_bot_message"];
const TAGS_SLACKBOT: &[&str] = &["slack_message", "slack_slackbot_message"];
const TAGS_ME: &[&str] = &["slack_message", "slack_me_message"];
const TAGS_TOPIC: &[&str] = &["slack_message", "slack_channel_topic"];
const TAGS_PURPOSE: &[&str] = &["slack_message", "slack_channel_purpose"];

const PREFIX_ACTION: &str = " *";
const PREFIX_NETWORK: &str = "--";

/// Something to hand to the sink once the state lock is released.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit {
        target: EmitTarget,
        timestamp: DateTime<Utc>,
        tags: &'static [&'static str],
        line: String,
    },
    Typing {
        target: EmitTarget,
        names: Vec<String>,
    },
}

/// A required field was absent or had the wrong type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MissingField(&'static str);

type Handled = Result<Vec<Effect>, MissingField>;

fn required<'a>(obj: &'a Value, key: &'static str) -> Result<&'a str, MissingField> {
    obj.get(key).and_then(Value::as_str).ok_or(MissingField(key))
}

/// Parse a server timestamp (`"1503435956.000247"`) as seconds since epoch.
pub fn parse_ts(ts: &Value) -> Option<DateTime<Utc>> {
    let secs = match ts {
        Value::String(s) => s.parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}

fn required_ts(obj: &Value) -> Result<DateTime<Utc>, MissingField> {
    obj.get("ts").and_then(parse_ts).ok_or(MissingField("ts"))
}

pub struct EventDispatcher {
    state: SharedState,
    sink: Arc<dyn MessageSink>,
    decoder: TextDecoder,
    typing_timeout: Duration,
}

impl EventDispatcher {
    pub fn new(state: SharedState, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            state,
            sink,
            decoder: TextDecoder::new(),
            typing_timeout: Duration::from_secs(4),
        }
    }

    #[must_use]
    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }

    /// Handle one validated frame. Never fails: problems are logged and the
    /// frame is dropped.
    pub async fn dispatch(&self, frame: &Value) {
        let effects = {
            let Ok(mut st) = self.state.write() else {
                error!("workspace state lock poisoned, dropping frame");
                return;
            };
            self.route(&mut st, frame, Instant::now())
        };
        self.deliver(effects).await;
    }

    /// Expire stale typing markers and notify the sink for each channel
    /// whose set changed.
    pub async fn sweep_typing(&self, now: Instant) {
        let effects = {
            let Ok(mut st) = self.state.write() else {
                return;
            };
            st.sweep_expired_typing(now, self.typing_timeout)
                .into_iter()
                .filter_map(|id| typing_effect(&st, &id))
                .collect::<Vec<_>>()
        };
        self.deliver(effects).await;
    }

    async fn deliver(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit {
                    target,
                    timestamp,
                    tags,
                    line,
                } => self.sink.emit(&target, timestamp, tags, &line).await,
                Effect::Typing { target, names } => {
                    self.sink.typing_changed(&target, &names).await;
                },
            }
        }
    }

    /// Apply `frame` to the state and collect what should be rendered.
    pub fn route(&self, st: &mut WorkspaceState, frame: &Value, now: Instant) -> Vec<Effect> {
        let Some(kind) = frame.get("type").and_then(Value::as_str) else {
            return Vec::new();
        };
        let (label, handled) = match kind {
            "hello" => {
                info!(workspace = %st.name, "real-time stream ready");
                return Vec::new();
            },
            "message" => {
                let subtype = frame.get("subtype").and_then(Value::as_str);
                let handled = match subtype {
                    None => self.user_message(st, frame),
                    Some("bot_message") => self.bot_message(st, frame),
                    Some("me_message") => self.me_message(st, frame),
                    Some("slackbot_response") => self.slackbot_response(st, frame),
                    Some("channel_topic") => self.topic_change(st, frame, false),
                    Some("channel_purpose") => self.topic_change(st, frame, true),
                    Some(other) => {
                        debug!(subtype = other, "ignoring message subtype");
                        return Vec::new();
                    },
                };
                (subtype.unwrap_or("message"), handled)
            },
            "user_typing" => ("user_typing", user_typing(st, frame, now)),
            "channel_created" => ("channel_created", channel_created(st, frame)),
            "member_joined_channel" => ("member_joined_channel", member_joined(st, frame)),
            other => {
                debug!(event = other, "ignoring event");
                return Vec::new();
            },
        };
        handled.unwrap_or_else(|MissingField(field)| {
            warn!(
                workspace = %st.name,
                subtype = label,
                field,
                "error handling websocket message: unexpected response from server"
            );
            Vec::new()
        })
    }

    // ── Message handlers ────────────────────────────────────────────────────

    fn user_message(&self, st: &mut WorkspaceState, msg: &Value) -> Handled {
        let channel = required(msg, "channel")?;
        let user = required(msg, "user")?;
        let text = required(msg, "text")?;
        let ts = required_ts(msg)?;
        let Some(name) = st.find_user(user).map(|u| u.display_name().to_string()) else {
            debug!(user, "message from unknown user ignored");
            return Ok(Vec::new());
        };
        Ok(self.render(st, channel, &name, &name, text, ts, TAGS_USER))
    }

    fn bot_message(&self, st: &mut WorkspaceState, msg: &Value) -> Handled {
        let channel = required(msg, "channel")?;
        let username = required(msg, "username")?;
        let text = required(msg, "text")?;
        let ts = required_ts(msg)?;
        if username == "slackbot" {
            let user = required(msg, "user")?;
            let Some(name) = st.find_user(user).map(|u| u.display_name().to_string()) else {
                debug!(user, "slackbot user not loaded yet");
                return Ok(Vec::new());
            };
            return Ok(self.render(st, channel, &name, &name, text, ts, TAGS_SLACKBOT));
        }
        let bot_id = required(msg, "bot_id")?;
        let Some(name) = st
            .find_bot_user(bot_id)
            .map(|u| u.display_name().to_string())
        else {
            debug!(bot_id, "message from unknown bot ignored");
            return Ok(Vec::new());
        };
        Ok(self.render(st, channel, username, &name, text, ts, TAGS_BOT))
    }

    fn slackbot_response(&self, st: &mut WorkspaceState, msg: &Value) -> Handled {
        let channel = required(msg, "channel")?;
        let user = required(msg, "user")?;
        let text = required(msg, "text")?;
        let ts = required_ts(msg)?;
        let Some(name) = st.find_user(user).map(|u| u.display_name().to_string()) else {
            debug!(user, "slackbot user not loaded yet");
            return Ok(Vec::new());
        };
        Ok(self.render(st, channel, &name, &name, text, ts, TAGS_SLACKBOT))
    }

    fn me_message(&self, st: &mut WorkspaceState, msg: &Value) -> Handled {
        let channel = required(msg, "channel")?;
        let user = required(msg, "user")?;
        let text = required(msg, "text")?;
        let ts = required_ts(msg)?;
        let Some(name) = st.find_user(user).map(|u| u.display_name().to_string()) else {
            debug!(user, "message from unknown user ignored");
            return Ok(Vec::new());
        };
        let Some(channel) = st.find_channel(channel) else {
            debug!(channel, "message for unknown channel ignored");
            return Ok(Vec::new());
        };
        let target = st.emit_target(channel);
        let channel_id = channel.id.clone();
        let body = self.decoder.decode(text, &*st);
        let sep = if body.is_empty() { "" } else { " " };
        let mut effects = vec![Effect::Emit {
            target,
            timestamp: ts,
            tags: TAGS_ME,
            line: format!("{PREFIX_ACTION}\t{name}{sep}{body}"),
        }];
        effects.extend(clear_typing(st, &channel_id, &name));
        Ok(effects)
    }

    fn topic_change(&self, st: &mut WorkspaceState, msg: &Value, purpose: bool) -> Handled {
        let field = if purpose { "purpose" } else { "topic" };
        let channel = required(msg, "channel")?;
        let user = required(msg, "user")?;
        let value = required(msg, field)?;
        let ts = required_ts(msg)?;
        let name = st
            .find_user(user)
            .map_or_else(|| user.to_string(), |u| u.display_name().to_string());
        let Some(ch) = st.find_channel_mut(channel) else {
            debug!(channel, "topic change for unknown channel ignored");
            return Ok(Vec::new());
        };
        let last_set = Some(ts.timestamp());
        let applied = if purpose {
            ch.update_purpose(Some(value), Some(user), last_set)
        } else {
            ch.update_topic(Some(value), Some(user), last_set)
        };
        if !applied {
            debug!(channel, field, "channel kind has no {field}");
            return Ok(Vec::new());
        }
        let Some(target) = st.find_channel(channel).map(|ch| st.emit_target(ch)) else {
            return Ok(Vec::new());
        };
        let body = self.decoder.decode(value, &*st);
        Ok(vec![Effect::Emit {
            target,
            timestamp: ts,
            tags: if purpose { TAGS_PURPOSE } else { TAGS_TOPIC },
            line: format!("{PREFIX_NETWORK}\t{name} has changed the channel {field} to \"{body}\""),
        }])
    }

    /// Shared tail of the plain, bot and slackbot handlers. `prefix` is what
    /// the line is attributed to; `typing_name` is whose marker gets cleared.
    #[allow(clippy::too_many_arguments)]
    fn render(
        &self,
        st: &mut WorkspaceState,
        channel_id: &str,
        prefix: &str,
        typing_name: &str,
        text: &str,
        timestamp: DateTime<Utc>,
        tags: &'static [&'static str],
    ) -> Vec<Effect> {
        let Some(channel) = st.find_channel(channel_id) else {
            debug!(channel = channel_id, "message for unknown channel ignored");
            return Vec::new();
        };
        let target = st.emit_target(channel);
        let body = self.decoder.decode(text, &*st);
        let mut effects = vec![Effect::Emit {
            target,
            timestamp,
            tags,
            line: format!("{prefix}\t{body}"),
        }];
        effects.extend(clear_typing(st, channel_id, typing_name));
        effects
    }
}

// ── Non-message events ──────────────────────────────────────────────────────

fn user_typing(st: &mut WorkspaceState, event: &Value, now: Instant) -> Handled {
    let channel = required(event, "channel")?;
    let user = required(event, "user")?;
    match st.add_typing(channel, user, now) {
        Some(true) => Ok(typing_effect(st, channel).into_iter().collect()),
        Some(false) => Ok(Vec::new()),
        None => {
            debug!(channel, user, "typing in unknown channel or by unknown user");
            Ok(Vec::new())
        },
    }
}

fn channel_created(st: &mut WorkspaceState, event: &Value) -> Handled {
    let channel = event.get("channel").ok_or(MissingField("channel"))?;
    let id = required(channel, "id")?;
    let name = required(channel, "name")?;
    let created = st.upsert_channel(ChannelKind::Channel, id, name);
    if let Some(ts) = channel.get("created").and_then(Value::as_i64) {
        created.created = Some(ts);
    }
    if let Some(creator) = channel.get("creator").and_then(Value::as_str) {
        created.creator = Some(creator.to_string());
    }
    debug!(channel = id, name, "channel created");
    Ok(Vec::new())
}

fn member_joined(st: &mut WorkspaceState, event: &Value) -> Handled {
    let channel = required(event, "channel")?;
    let user = required(event, "user")?;
    if st.add_member(channel, user).is_none() {
        debug!(channel, user, "join for unknown channel ignored");
    }
    Ok(Vec::new())
}

fn typing_effect(st: &WorkspaceState, channel_id: &str) -> Option<Effect> {
    let channel = st.find_channel(channel_id)?;
    Some(Effect::Typing {
        target: st.emit_target(channel),
        names: channel.typing_names(),
    })
}

/// A message is proof its author stopped typing.
fn clear_typing(st: &mut WorkspaceState, channel_id: &str, name: &str) -> Option<Effect> {
    if st.remove_typing(channel_id, name) {
        typing_effect(st, channel_id)
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json, skiff_channels::message_log::MemoryMessageLog};

    fn fixture() -> (SharedState, Arc<MemoryMessageLog>, EventDispatcher) {
        let state = WorkspaceState::shared("acme");
        {
            let mut st = state.write().unwrap();
            st.upsert_channel(ChannelKind::Channel, "C1", "general");
            st.upsert_user("U1", "alice");
            st.upsert_user("U2", "bob");
            st.update_user_profile("U2", Some("Bobby"), None);
            st.upsert_user("USB", "slackbot");
            st.upsert_user("U9", "deploy");
            st.update_user_profile("U9", Some("Deploy"), Some("B1"));
        }
        let log = Arc::new(MemoryMessageLog::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&state), log.clone());
        (state, log, dispatcher)
    }

    #[test]
    fn parses_fractional_timestamps() {
        let ts = parse_ts(&json!("1503435956.000247")).unwrap();
        assert_eq!(ts.timestamp(), 1_503_435_956);
        assert_eq!(ts.timestamp_subsec_micros(), 247);
        assert_eq!(parse_ts(&json!(12)).unwrap().timestamp(), 12);
        assert!(parse_ts(&json!("soon")).is_none());
        assert!(parse_ts(&json!(null)).is_none());
    }

    #[tokio::test]
    async fn plain_message_is_rendered() {
        let (_state, log, d) = fixture();
        d.dispatch(&json!({
            "type": "message", "channel": "C1", "user": "U2",
            "text": "hi <@U1> in <#C1>", "ts": "100.5"
        }))
        .await;
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].line, "Bobby\thi alice in general");
        assert_eq!(entries[0].tags, vec!["slack_message", "slack_user_message"]);
        assert_eq!(entries[0].timestamp.timestamp(), 100);
        assert_eq!(entries[0].target.channel_name, "general");
    }

    #[tokio::test]
    async fn bot_message_resolves_by_bot_id() {
        let (_state, log, d) = fixture();
        d.dispatch(&json!({
            "type": "message", "subtype": "bot_message", "channel": "C1",
            "username": "deploybot", "bot_id": "B1", "text": "shipped", "ts": "1"
        }))
        .await;
        let entries = log.entries();
        assert_eq!(entries[0].line, "deploybot\tshipped");
        assert!(entries[0].has_tag("slack_bot_message"));
    }

    #[tokio::test]
    async fn slackbot_username_resolves_by_user() {
        let (_state, log, d) = fixture();
        d.dispatch(&json!({
            "type": "message", "subtype": "bot_message", "channel": "C1",
            "username": "slackbot", "user": "USB", "text": "reminder", "ts": "1"
        }))
        .await;
        let entries = log.entries();
        assert_eq!(entries[0].line, "slackbot\treminder");
        assert!(entries[0].has_tag("slack_slackbot_message"));
    }

    #[tokio::test]
    async fn me_message_is_an_action() {
        let (_state, log, d) = fixture();
        d.dispatch(&json!({
            "type": "message", "subtype": "me_message", "channel": "C1",
            "user": "U1", "text": "waves", "ts": "1"
        }))
        .await;
        d.dispatch(&json!({
            "type": "message", "subtype": "me_message", "channel": "C1",
            "user": "U1", "text": "", "ts": "2"
        }))
        .await;
        let entries = log.entries();
        assert_eq!(entries[0].line, " *\talice waves");
        assert_eq!(entries[1].line, " *\talice");
        assert!(entries[0].has_tag("slack_me_message"));
    }

    #[tokio::test]
    async fn unknown_channel_or_user_is_silently_ignored() {
        let (_state, log, d) = fixture();
        d.dispatch(&json!({
            "type": "message", "channel": "C404", "user": "U1", "text": "x", "ts": "1"
        }))
        .await;
        d.dispatch(&json!({
            "type": "message", "channel": "C1", "user": "U404", "text": "x", "ts": "1"
        }))
        .await;
        d.dispatch(&json!({
            "type": "message", "subtype": "bot_message", "channel": "C1",
            "username": "ci", "bot_id": "B404", "text": "x", "ts": "1"
        }))
        .await;
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn missing_field_aborts_only_that_message() {
        let (_state, log, d) = fixture();
        d.dispatch(&json!({"type": "message", "channel": "C1", "user": "U1", "ts": "1"}))
            .await;
        d.dispatch(&json!({
            "type": "message", "subtype": "bot_message", "channel": "C1",
            "username": "ci", "text": "x", "ts": "1"
        }))
        .await;
        d.dispatch(&json!({
            "type": "message", "channel": "C1", "user": "U1", "text": "ok", "ts": "1"
        }))
        .await;
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn message_clears_typing() {
        let (state, log, d) = fixture();
        d.dispatch(&json!({"type": "user_typing", "channel": "C1", "user": "U1"}))
            .await;
        d.dispatch(&json!({"type": "user_typing", "channel": "C1", "user": "U1"}))
            .await;
        assert_eq!(
            state.read().unwrap().find_channel("C1").unwrap().typing_names(),
            vec!["alice"]
        );

        d.dispatch(&json!({
            "type": "message", "channel": "C1", "user": "U1", "text": "done", "ts": "1"
        }))
        .await;
        assert!(state.read().unwrap().find_channel("C1").unwrap().typing.is_empty());

        let updates = log.typing_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1, vec!["alice".to_string()]);
        assert!(updates[1].1.is_empty());
    }

    #[tokio::test]
    async fn sweep_expires_typing() {
        let (state, log, d) = fixture();
        let d = d.with_typing_timeout(Duration::from_secs(4));
        d.dispatch(&json!({"type": "user_typing", "channel": "C1", "user": "U2"}))
            .await;
        d.sweep_typing(Instant::now() + Duration::from_secs(5)).await;
        assert!(state.read().unwrap().find_channel("C1").unwrap().typing.is_empty());
        assert_eq!(log.typing_updates().len(), 2);
    }

    #[tokio::test]
    async fn topic_and_purpose_updates() {
        let (state, log, d) = fixture();
        d.dispatch(&json!({
            "type": "message", "subtype": "channel_topic", "channel": "C1",
            "user": "U1", "topic": "launch day", "ts": "50"
        }))
        .await;
        d.dispatch(&json!({
            "type": "message", "subtype": "channel_purpose", "channel": "C1",
            "user": "U2", "purpose": "chatter", "ts": "60"
        }))
        .await;
        let st = state.read().unwrap();
        let ch = st.find_channel("C1").unwrap();
        assert_eq!(ch.topic.value.as_deref(), Some("launch day"));
        assert_eq!(ch.topic.creator.as_deref(), Some("U1"));
        assert_eq!(ch.topic.last_set, Some(50));
        assert_eq!(ch.purpose.value.as_deref(), Some("chatter"));
        let entries = log.entries();
        assert_eq!(
            entries[0].line,
            "--\talice has changed the channel topic to \"launch day\""
        );
        assert!(entries[1].has_tag("slack_channel_purpose"));
    }

    #[tokio::test]
    async fn channel_created_and_member_joined() {
        let (state, _log, d) = fixture();
        d.dispatch(&json!({
            "type": "channel_created",
            "channel": {"id": "C2", "name": "new", "created": 10, "creator": "U1"}
        }))
        .await;
        d.dispatch(&json!({"type": "member_joined_channel", "channel": "C2", "user": "U2"}))
            .await;
        d.dispatch(&json!({"type": "member_joined_channel", "channel": "C2", "user": "U2"}))
            .await;
        let st = state.read().unwrap();
        let ch = st.find_channel("C2").unwrap();
        assert_eq!(ch.creator.as_deref(), Some("U1"));
        assert_eq!(ch.members, vec!["U2"]);
    }

    #[tokio::test]
    async fn unknown_events_are_ignored() {
        let (_state, log, d) = fixture();
        d.dispatch(&json!({"type": "hello"})).await;
        d.dispatch(&json!({"type": "presence_change", "user": "U1"})).await;
        d.dispatch(&json!({"type": "message", "subtype": "file_share"})).await;
        assert!(log.is_empty());
    }
}
