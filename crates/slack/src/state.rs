//! In-memory model of one workspace: channels, users, typing markers and
//! connection bookkeeping.
//!
//! Pure data, no I/O. Shared between the crawler and the dispatcher as
//! [`SharedState`]; callers hold the lock only for synchronous sections.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use {
    serde::{Deserialize, Serialize},
    skiff_channels::EmitTarget,
    tokio::sync::mpsc,
};

use crate::{api::ListingResource, decode::EntityResolver};

/// Shared workspace state.
pub type SharedState = Arc<RwLock<WorkspaceState>>;

/// Conversation kind. Topic and purpose only exist on group-like kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Channel,
    Group,
    Mpim,
    Im,
}

impl ChannelKind {
    pub fn has_topic(self) -> bool {
        !matches!(self, Self::Im)
    }
}

/// Topic or purpose of a channel. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicInfo {
    pub value: Option<String>,
    pub creator: Option<String>,
    pub last_set: Option<i64>,
}

impl TopicInfo {
    /// Apply the fields that are present, keep the others.
    fn merge(&mut self, value: Option<&str>, creator: Option<&str>, last_set: Option<i64>) {
        if let Some(value) = value {
            self.value = Some(value.to_string());
        }
        if let Some(creator) = creator {
            self.creator = Some(creator.to_string());
        }
        if let Some(last_set) = last_set {
            self.last_set = Some(last_set);
        }
    }
}

/// A user currently composing in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTyping {
    pub user_id: String,
    pub name: String,
    pub started: Instant,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub kind: ChannelKind,
    pub id: String,
    pub name: String,
    pub created: Option<i64>,
    pub is_general: bool,
    pub name_normalized: Option<String>,
    pub is_shared: bool,
    pub is_org_shared: bool,
    pub is_member: bool,
    pub is_archived: bool,
    pub creator: Option<String>,
    pub topic: TopicInfo,
    pub purpose: TopicInfo,
    pub last_read: Option<f64>,
    pub unread_count: u64,
    pub unread_count_display: u64,
    /// Only meaningful for [`ChannelKind::Im`].
    pub is_user_deleted: Option<bool>,
    pub members: Vec<String>,
    pub typing: Vec<ChannelTyping>,
}

impl Channel {
    pub fn new(kind: ChannelKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
            created: None,
            is_general: false,
            name_normalized: None,
            is_shared: false,
            is_org_shared: false,
            is_member: false,
            is_archived: false,
            creator: None,
            topic: TopicInfo::default(),
            purpose: TopicInfo::default(),
            last_read: None,
            unread_count: 0,
            unread_count_display: 0,
            is_user_deleted: None,
            members: Vec::new(),
            typing: Vec::new(),
        }
    }

    /// Returns false when the channel kind has no topic.
    pub fn update_topic(
        &mut self,
        value: Option<&str>,
        creator: Option<&str>,
        last_set: Option<i64>,
    ) -> bool {
        if !self.kind.has_topic() {
            return false;
        }
        self.topic.merge(value, creator, last_set);
        true
    }

    /// Returns false when the channel kind has no purpose.
    pub fn update_purpose(
        &mut self,
        value: Option<&str>,
        creator: Option<&str>,
        last_set: Option<i64>,
    ) -> bool {
        if !self.kind.has_topic() {
            return false;
        }
        self.purpose.merge(value, creator, last_set);
        true
    }

    /// Idempotent append. Returns true if the member was new.
    pub fn add_member(&mut self, id: &str) -> bool {
        if self.members.iter().any(|m| m == id) {
            return false;
        }
        self.members.push(id.to_string());
        true
    }

    pub fn find_typing(&self, name: &str) -> Option<&ChannelTyping> {
        self.typing.iter().find(|t| t.name == name)
    }

    /// Record that `name` is typing. An existing marker is refreshed rather
    /// than duplicated. Returns true if the marker is new.
    pub fn add_typing(&mut self, user_id: &str, name: &str, now: Instant) -> bool {
        if let Some(existing) = self.typing.iter_mut().find(|t| t.name == name) {
            existing.started = now;
            return false;
        }
        self.typing.push(ChannelTyping {
            user_id: user_id.to_string(),
            name: name.to_string(),
            started: now,
        });
        true
    }

    /// Remove the marker for `name`. Absent markers are a no-op.
    pub fn remove_typing(&mut self, name: &str) -> bool {
        let before = self.typing.len();
        self.typing.retain(|t| t.name != name);
        self.typing.len() != before
    }

    /// Drop markers older than `timeout`. Returns true if any were removed.
    pub fn sweep_expired_typing(&mut self, now: Instant, timeout: Duration) -> bool {
        let before = self.typing.len();
        self.typing
            .retain(|t| now.saturating_duration_since(t.started) < timeout);
        self.typing.len() != before
    }

    pub fn typing_names(&self) -> Vec<String> {
        self.typing.iter().map(|t| t.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub bot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub profile: UserProfile,
}

impl User {
    /// Profile display name, falling back to the account name when unset.
    pub fn display_name(&self) -> &str {
        match self.profile.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }
}

/// Handle to the live real-time session. Replaced on every reconnect.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub generation: u64,
    /// Raw frames queued here are written to the socket as-is.
    pub outbound: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub disconnected: bool,
    pub session: Option<SessionHandle>,
}

/// Who we are, as reported by `rtm.connect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub self_id: Option<String>,
    pub self_name: Option<String>,
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    pub team_domain: Option<String>,
}

/// A listing page fetch that has been issued and not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightRequest {
    pub id: u64,
    pub resource: ListingResource,
    pub cursor: String,
}

#[derive(Debug, Default)]
pub struct WorkspaceState {
    pub name: String,
    channels: Vec<Channel>,
    channel_index: HashMap<String, usize>,
    users: HashMap<String, User>,
    bot_index: HashMap<String, String>,
    pub connection: ConnectionStatus,
    pub identity: Option<SessionIdentity>,
    requests: Vec<InFlightRequest>,
    next_request_id: u64,
}

impl WorkspaceState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn shared(name: impl Into<String>) -> SharedState {
        Arc::new(RwLock::new(Self::new(name)))
    }

    // ── Channels ────────────────────────────────────────────────────────────

    pub fn find_channel(&self, id: &str) -> Option<&Channel> {
        self.channel_index.get(id).map(|&i| &self.channels[i])
    }

    pub fn find_channel_mut(&mut self, id: &str) -> Option<&mut Channel> {
        self.channel_index.get(id).map(|&i| &mut self.channels[i])
    }

    /// Channels in the order they were first seen.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id.clone()).collect()
    }

    /// Create the channel or return the existing one. A non-empty `name`
    /// overwrites the stored one; `kind` only applies on creation.
    pub fn upsert_channel(&mut self, kind: ChannelKind, id: &str, name: &str) -> &mut Channel {
        let idx = match self.channel_index.get(id) {
            Some(&idx) => {
                let channel = &mut self.channels[idx];
                if !name.is_empty() {
                    channel.name = name.to_string();
                }
                idx
            },
            None => {
                self.channels.push(Channel::new(kind, id, name));
                let idx = self.channels.len() - 1;
                self.channel_index.insert(id.to_string(), idx);
                idx
            },
        };
        &mut self.channels[idx]
    }

    /// Idempotent member append. Returns `None` for an unknown channel.
    pub fn add_member(&mut self, channel_id: &str, user_id: &str) -> Option<bool> {
        Some(self.find_channel_mut(channel_id)?.add_member(user_id))
    }

    // ── Users ───────────────────────────────────────────────────────────────

    pub fn find_user(&self, id: &str) -> Option<&User> {
        self.users.get(id)
    }

    pub fn find_bot_user(&self, bot_id: &str) -> Option<&User> {
        self.bot_index.get(bot_id).and_then(|id| self.users.get(id))
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Create the user or return the existing one, refreshing a non-empty name.
    pub fn upsert_user(&mut self, id: &str, name: &str) -> &mut User {
        let user = self.users.entry(id.to_string()).or_insert_with(|| User {
            id: id.to_string(),
            name: String::new(),
            profile: UserProfile::default(),
        });
        if !name.is_empty() || user.name.is_empty() {
            user.name = name.to_string();
        }
        user
    }

    /// Partial profile update; absent fields are kept. Keeps the bot index
    /// in step with `bot_id`.
    pub fn update_user_profile(
        &mut self,
        id: &str,
        display_name: Option<&str>,
        bot_id: Option<&str>,
    ) -> bool {
        let Some(user) = self.users.get_mut(id) else {
            return false;
        };
        if let Some(display_name) = display_name {
            user.profile.display_name = Some(display_name.to_string());
        }
        if let Some(bot_id) = bot_id {
            if let Some(previous) = user.profile.bot_id.replace(bot_id.to_string())
                && previous != bot_id
            {
                self.bot_index.remove(&previous);
            }
            self.bot_index.insert(bot_id.to_string(), id.to_string());
        }
        true
    }

    // ── Typing ──────────────────────────────────────────────────────────────

    /// Mark `user_id` as typing in `channel_id`, keyed by display name.
    /// Returns `None` if either side is unknown, else whether the marker is new.
    pub fn add_typing(&mut self, channel_id: &str, user_id: &str, now: Instant) -> Option<bool> {
        let name = self.users.get(user_id)?.display_name().to_string();
        let idx = *self.channel_index.get(channel_id)?;
        Some(self.channels[idx].add_typing(user_id, &name, now))
    }

    pub fn remove_typing(&mut self, channel_id: &str, name: &str) -> bool {
        self.find_channel_mut(channel_id)
            .is_some_and(|channel| channel.remove_typing(name))
    }

    /// Sweep every channel; returns the ids of channels whose typing set changed.
    pub fn sweep_expired_typing(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        self.channels
            .iter_mut()
            .filter_map(|c| c.sweep_expired_typing(now, timeout).then(|| c.id.clone()))
            .collect()
    }

    // ── Connection ──────────────────────────────────────────────────────────

    pub fn mark_connected(&mut self, session: SessionHandle) {
        self.connection = ConnectionStatus {
            connected: true,
            disconnected: false,
            session: Some(session),
        };
    }

    /// Drop the session handle so nothing can write to a stale socket.
    pub fn mark_disconnected(&mut self) {
        self.connection = ConnectionStatus {
            connected: false,
            disconnected: true,
            session: None,
        };
    }

    pub fn is_connected(&self) -> bool {
        self.connection.connected
    }

    // ── Requests ────────────────────────────────────────────────────────────

    pub fn register_request(&mut self, resource: &ListingResource, cursor: &str) -> u64 {
        self.next_request_id += 1;
        let id = self.next_request_id;
        self.requests.push(InFlightRequest {
            id,
            resource: resource.clone(),
            cursor: cursor.to_string(),
        });
        id
    }

    pub fn complete_request(&mut self, id: u64) {
        self.requests.retain(|r| r.id != id);
    }

    pub fn in_flight_requests(&self) -> &[InFlightRequest] {
        &self.requests
    }

    // ── Rendering helpers ───────────────────────────────────────────────────

    pub fn emit_target(&self, channel: &Channel) -> EmitTarget {
        EmitTarget {
            workspace: self.name.clone(),
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
        }
    }
}

impl EntityResolver for WorkspaceState {
    fn channel_name(&self, id: &str) -> Option<&str> {
        self.find_channel(id).map(|c| c.name.as_str())
    }

    fn user_display_name(&self, id: &str) -> Option<&str> {
        self.find_user(id).map(User::display_name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn upsert_channel_is_idempotent() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Channel, "C1", "general");
        state.upsert_channel(ChannelKind::Channel, "C1", "general-renamed");
        assert_eq!(state.channels().len(), 1);
        assert_eq!(state.find_channel("C1").unwrap().name, "general-renamed");
    }

    #[test]
    fn upsert_channel_keeps_stored_kind() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Group, "G1", "secret");
        let channel = state.upsert_channel(ChannelKind::Channel, "G1", "secret");
        assert_eq!(channel.kind, ChannelKind::Group);
    }

    #[test]
    fn upsert_channel_keeps_name_when_absent() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Channel, "C1", "general").is_member = true;
        let channel = state.upsert_channel(ChannelKind::Channel, "C1", "");
        assert_eq!(channel.name, "general");
        assert!(channel.is_member);
    }

    #[test]
    fn channels_keep_insertion_order() {
        let mut state = WorkspaceState::new("acme");
        for id in ["C3", "C1", "C2", "C1"] {
            state.upsert_channel(ChannelKind::Channel, id, id);
        }
        assert_eq!(state.channel_ids(), vec!["C3", "C1", "C2"]);
    }

    #[test]
    fn upsert_user_is_idempotent() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_user("U1", "alice");
        state.update_user_profile("U1", Some("Alice"), None);
        state.upsert_user("U1", "alice2");
        assert_eq!(state.user_count(), 1);
        let user = state.find_user("U1").unwrap();
        assert_eq!(user.name, "alice2");
        assert_eq!(user.display_name(), "Alice");
    }

    #[test]
    fn display_name_falls_back_to_name() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_user("U1", "alice");
        assert_eq!(state.find_user("U1").unwrap().display_name(), "alice");
        state.update_user_profile("U1", Some(""), None);
        assert_eq!(state.find_user("U1").unwrap().display_name(), "alice");
    }

    #[test]
    fn bot_lookup_follows_profile() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_user("U9", "deploybot");
        assert!(state.update_user_profile("U9", None, Some("B1")));
        assert_eq!(state.find_bot_user("B1").unwrap().id, "U9");

        state.update_user_profile("U9", None, Some("B2"));
        assert!(state.find_bot_user("B1").is_none());
        assert_eq!(state.find_bot_user("B2").unwrap().id, "U9");
        assert!(!state.update_user_profile("U404", None, Some("B3")));
    }

    #[test]
    fn topic_partial_update_keeps_absent_fields() {
        let mut channel = Channel::new(ChannelKind::Channel, "C1", "general");
        channel.update_topic(Some("launch"), Some("U1"), Some(100));
        channel.update_topic(Some("relaunch"), None, None);
        assert_eq!(channel.topic, TopicInfo {
            value: Some("relaunch".into()),
            creator: Some("U1".into()),
            last_set: Some(100),
        });
        assert_eq!(channel.purpose, TopicInfo::default());
    }

    #[test]
    fn im_has_no_topic() {
        let mut channel = Channel::new(ChannelKind::Im, "D1", "alice");
        assert!(!channel.update_topic(Some("x"), None, None));
        assert!(!channel.update_purpose(Some("x"), None, None));
        assert_eq!(channel.topic.value, None);
    }

    #[test]
    fn add_member_is_idempotent() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Channel, "C1", "general");
        assert_eq!(state.add_member("C1", "U1"), Some(true));
        assert_eq!(state.add_member("C1", "U1"), Some(false));
        assert_eq!(state.add_member("C1", "U2"), Some(true));
        assert_eq!(state.add_member("C404", "U1"), None);
        assert_eq!(state.find_channel("C1").unwrap().members, vec!["U1", "U2"]);
    }

    #[test]
    fn typing_lifecycle() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Channel, "chan1", "chan1");
        state.upsert_user("U1", "alice");
        let now = Instant::now();

        assert_eq!(state.add_typing("chan1", "U1", now), Some(true));
        assert_eq!(state.add_typing("chan1", "U1", now), Some(false));
        assert_eq!(state.find_channel("chan1").unwrap().typing.len(), 1);

        assert!(state.remove_typing("chan1", "alice"));
        assert!(!state.remove_typing("chan1", "alice"));
        assert!(!state.remove_typing("nope", "alice"));
        assert!(state.find_channel("chan1").unwrap().find_typing("alice").is_none());
    }

    #[test]
    fn typing_requires_known_channel_and_user() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Channel, "C1", "general");
        assert_eq!(state.add_typing("C1", "U404", Instant::now()), None);
        state.upsert_user("U1", "alice");
        assert_eq!(state.add_typing("C404", "U1", Instant::now()), None);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Channel, "C1", "general");
        state.upsert_channel(ChannelKind::Channel, "C2", "random");
        state.upsert_user("U1", "alice");
        state.upsert_user("U2", "bob");
        let start = Instant::now();
        state.add_typing("C1", "U1", start);
        state.add_typing("C2", "U2", start + Duration::from_secs(3));

        let changed = state.sweep_expired_typing(start + Duration::from_secs(5), Duration::from_secs(4));
        assert_eq!(changed, vec!["C1".to_string()]);
        assert!(state.find_channel("C1").unwrap().typing.is_empty());
        assert_eq!(state.find_channel("C2").unwrap().typing_names(), vec!["bob"]);

        // Second sweep at the same instant is a no-op.
        assert!(state
            .sweep_expired_typing(start + Duration::from_secs(5), Duration::from_secs(4))
            .is_empty());
    }

    #[test]
    fn refreshing_typing_extends_lifetime() {
        let mut channel = Channel::new(ChannelKind::Channel, "C1", "general");
        let start = Instant::now();
        channel.add_typing("U1", "alice", start);
        channel.add_typing("U1", "alice", start + Duration::from_secs(3));
        assert!(!channel.sweep_expired_typing(start + Duration::from_secs(5), Duration::from_secs(4)));
        assert_eq!(channel.typing_names(), vec!["alice"]);
    }

    #[test]
    fn disconnect_clears_session() {
        let mut state = WorkspaceState::new("acme");
        let (tx, _rx) = mpsc::unbounded_channel();
        state.mark_connected(SessionHandle {
            generation: 1,
            outbound: tx,
        });
        assert!(state.is_connected());
        state.mark_disconnected();
        assert!(!state.is_connected());
        assert!(state.connection.disconnected);
        assert!(state.connection.session.is_none());
    }

    #[test]
    fn request_bookkeeping() {
        let mut state = WorkspaceState::new("acme");
        let a = state.register_request(&ListingResource::Channels, "");
        let b = state.register_request(&ListingResource::Users, "abc");
        assert_ne!(a, b);
        assert_eq!(state.in_flight_requests().len(), 2);
        state.complete_request(a);
        assert_eq!(state.in_flight_requests()[0].cursor, "abc");
        state.complete_request(a);
        assert_eq!(state.in_flight_requests().len(), 1);
    }

    #[test]
    fn resolver_uses_display_names() {
        let mut state = WorkspaceState::new("acme");
        state.upsert_channel(ChannelKind::Channel, "C1", "general");
        state.upsert_user("U1", "alice");
        state.update_user_profile("U1", Some("Alice A."), None);
        assert_eq!(state.channel_name("C1"), Some("general"));
        assert_eq!(state.user_display_name("U1"), Some("Alice A."));
        assert_eq!(state.user_display_name("U2"), None);
    }
}
