//! Paginated listing crawler.
//!
//! Each page is one GET whose body is streamed chunk by chunk, reassembled
//! in arrival order and parsed once the transfer is complete. Pages of the
//! same resource run strictly in sequence; when a resource is exhausted the
//! next one in the chain (channels, users, then per-channel membership)
//! starts at an empty cursor.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use {
    bytes::Bytes,
    futures::{StreamExt, future::join_all},
    serde_json::Value,
    skiff_channels::ConfigSource,
    tracing::{debug, error, info, warn},
};

use crate::{
    Error, Result,
    api::{DEFAULT_API_BASE, ListingResource},
    error::Context,
    state::{ChannelKind, SharedState, WorkspaceState},
};

// ── Request ─────────────────────────────────────────────────────────────────

/// One in-flight page fetch and the body chunks received so far.
pub struct ListingRequest {
    pub id: u64,
    pub resource: ListingResource,
    pub cursor: String,
    uri: String,
    chunks: Vec<Bytes>,
}

impl ListingRequest {
    pub fn new(id: u64, resource: ListingResource, cursor: &str, uri: String) -> Self {
        Self {
            id,
            resource,
            cursor: cursor.to_string(),
            uri,
            chunks: Vec::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn push_chunk(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    pub fn received(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Concatenate the chunks in receipt order, releasing them.
    pub fn into_body(self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.received());
        for chunk in self.chunks {
            body.extend_from_slice(&chunk);
        }
        body
    }
}

// The URI carries the token.
impl fmt::Debug for ListingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListingRequest")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("cursor", &self.cursor)
            .field("chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

// ── Outcomes ────────────────────────────────────────────────────────────────

/// How one successfully parsed page ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Fetch the next page of the same resource.
    Next(String),
    /// Empty cursor: the resource is complete.
    Exhausted,
    /// No `response_metadata.next_cursor`; stop without chaining.
    Unterminated,
}

/// Summary of one crawl chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Pages applied, keyed by API method.
    pub pages: BTreeMap<&'static str, usize>,
    pub requests: usize,
    pub failures: usize,
    pub membership_crawls: usize,
}

impl CrawlReport {
    fn absorb(&mut self, other: ResourceReport) {
        *self.pages.entry(other.method).or_default() += other.pages;
        self.requests += other.requests;
        self.failures += usize::from(other.failed);
    }

    pub fn pages_of(&self, method: &str) -> usize {
        self.pages.get(method).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct ResourceReport {
    method: &'static str,
    pages: usize,
    requests: usize,
    failed: bool,
    exhausted: bool,
}

// ── Crawler ─────────────────────────────────────────────────────────────────

/// Clears the in-flight entry when the fetch finishes, fails, times out or
/// is dropped mid-flight by a cancelled crawl.
struct InFlight<'a> {
    state: &'a SharedState,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut st) = self.state.write() {
            st.complete_request(self.id);
        }
    }
}

#[derive(Clone)]
pub struct Crawler {
    workspace: String,
    http: reqwest::Client,
    config: Arc<dyn ConfigSource>,
    state: SharedState,
    timeout: Duration,
    page_limit: u32,
}

impl Crawler {
    pub fn new(
        workspace: impl Into<String>,
        http: reqwest::Client,
        config: Arc<dyn ConfigSource>,
        state: SharedState,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            http,
            config,
            state,
            timeout: Duration::from_secs(30),
            page_limit: 20,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit;
        self
    }

    fn build_request(&self, resource: &ListingResource, cursor: &str) -> Result<ListingRequest> {
        let token = self
            .config
            .get("token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("token is not set".into()))?;
        let base = self
            .config
            .get("api_base")
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let uri = url::Url::parse_with_params(
            &format!("{}/{}", base.trim_end_matches('/'), resource.method()),
            resource.query(&token, cursor, self.page_limit),
        )
        .map_err(|e| Error::Config(format!("bad api base: {e}")))?;

        let id = self
            .state
            .write()
            .ok()
            .context("workspace state lock poisoned")?
            .register_request(resource, cursor);
        Ok(ListingRequest::new(id, resource.clone(), cursor, uri.into()))
    }

    /// Stream the body into the request's chunk list.
    async fn fetch(&self, request: &mut ListingRequest) -> Result<()> {
        let response = self
            .http
            .get(request.uri())
            .send()
            .await?
            .error_for_status()?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            debug!(
                workspace = %self.workspace,
                request = request.id,
                len = chunk.len(),
                "received chunk"
            );
            request.push_chunk(chunk);
        }
        Ok(())
    }

    /// Issue exactly one request for `resource` at `cursor` and apply the
    /// page to the workspace state.
    pub async fn crawl_page(&self, resource: &ListingResource, cursor: &str) -> Result<PageOutcome> {
        let mut request = self.build_request(resource, cursor)?;
        let id = request.id;
        debug!(workspace = %self.workspace, request = id, %resource, cursor, "requesting page");

        let fetched = {
            let _in_flight = InFlight {
                state: &self.state,
                id,
            };
            tokio::time::timeout(self.timeout, self.fetch(&mut request)).await
        };
        match fetched {
            Ok(res) => res?,
            Err(_) => return Err(Error::Timeout(self.timeout)),
        }

        let body = request.into_body();
        let page: Value = serde_json::from_slice(&body)?;
        let mut st = self
            .state
            .write()
            .ok()
            .context("workspace state lock poisoned")?;
        apply_page(&mut st, resource, &page)
    }

    /// Follow cursors for one resource until it ends or fails.
    async fn crawl_resource(&self, resource: &ListingResource) -> ResourceReport {
        let mut report = ResourceReport {
            method: resource.method(),
            pages: 0,
            requests: 0,
            failed: false,
            exhausted: false,
        };
        let mut cursor = String::new();
        loop {
            report.requests += 1;
            match self.crawl_page(resource, &cursor).await {
                Ok(PageOutcome::Next(next)) => {
                    report.pages += 1;
                    cursor = next;
                },
                Ok(PageOutcome::Exhausted) => {
                    report.pages += 1;
                    report.exhausted = true;
                    break;
                },
                Ok(PageOutcome::Unterminated) => {
                    report.pages += 1;
                    debug!(workspace = %self.workspace, %resource, "page has no cursor, stopping");
                    break;
                },
                Err(e) => {
                    error!(workspace = %self.workspace, %resource, error = %e, "listing failed");
                    report.failed = true;
                    break;
                },
            }
        }
        report
    }

    /// Crawl channels, then users, then the membership of every known
    /// channel. Each link only starts once the previous resource is
    /// exhausted.
    pub async fn crawl_all(&self) -> CrawlReport {
        let mut report = CrawlReport::default();

        let channels = self.crawl_resource(&ListingResource::Channels).await;
        report.absorb(channels);
        if !channels.exhausted {
            return report;
        }

        let users = self.crawl_resource(&ListingResource::Users).await;
        report.absorb(users);
        if !users.exhausted {
            return report;
        }

        let channel_ids = match self.state.read() {
            Ok(st) => st.channel_ids(),
            Err(_) => return report,
        };
        report.membership_crawls = channel_ids.len();
        let crawls = channel_ids.into_iter().map(|channel_id| async move {
            self.crawl_resource(&ListingResource::Members { channel_id })
                .await
        });
        for members in join_all(crawls).await {
            report.absorb(members);
        }

        info!(
            workspace = %self.workspace,
            requests = report.requests,
            failures = report.failures,
            "crawl finished"
        );
        report
    }
}

// ── Page application ────────────────────────────────────────────────────────

/// Apply one parsed page to the state and work out where pagination goes
/// next.
pub fn apply_page(
    state: &mut WorkspaceState,
    resource: &ListingResource,
    page: &Value,
) -> Result<PageOutcome> {
    let ok = page
        .get("ok")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::Protocol("response has no boolean ok".into()))?;
    if !ok {
        let reason = page
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::Api(reason.to_string()));
    }

    let entries = page
        .get(resource.collection())
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::Protocol(format!("response has no {} array", resource.collection()))
        })?;

    for entry in entries {
        match resource {
            ListingResource::Channels => apply_channel(state, entry),
            ListingResource::Users => apply_user(state, entry),
            ListingResource::Members { channel_id } => match entry.as_str() {
                Some(user_id) => {
                    state.add_member(channel_id, user_id);
                },
                None => debug!(channel = %channel_id, "skipping non-string member id"),
            },
        }
    }

    let next = page
        .get("response_metadata")
        .and_then(|m| m.get("next_cursor"))
        .and_then(Value::as_str);
    Ok(match next {
        Some("") => PageOutcome::Exhausted,
        Some(cursor) => PageOutcome::Next(cursor.to_string()),
        None => PageOutcome::Unterminated,
    })
}

fn str_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn bool_field(obj: &Value, key: &str) -> Option<bool> {
    obj.get(key).and_then(Value::as_bool)
}

fn topic_fields(obj: &Value) -> (Option<&str>, Option<&str>, Option<i64>) {
    (
        str_field(obj, "value"),
        str_field(obj, "creator"),
        obj.get("last_set").and_then(Value::as_i64),
    )
}

fn apply_channel(state: &mut WorkspaceState, entry: &Value) {
    let (Some(id), Some(name)) = (str_field(entry, "id"), str_field(entry, "name")) else {
        warn!("skipping channel entry without id or name");
        return;
    };
    let channel = state.upsert_channel(ChannelKind::Channel, id, name);

    if let Some(created) = entry.get("created").and_then(Value::as_i64) {
        channel.created = Some(created);
    }
    if let Some(v) = bool_field(entry, "is_general") {
        channel.is_general = v;
    }
    if let Some(v) = str_field(entry, "name_normalized") {
        channel.name_normalized = Some(v.to_string());
    }
    if let Some(v) = bool_field(entry, "is_shared") {
        channel.is_shared = v;
    }
    if let Some(v) = bool_field(entry, "is_org_shared") {
        channel.is_org_shared = v;
    }
    if let Some(v) = bool_field(entry, "is_member") {
        channel.is_member = v;
    }
    if let Some(topic) = entry.get("topic").filter(|t| t.is_object()) {
        let (value, creator, last_set) = topic_fields(topic);
        channel.update_topic(value, creator, last_set);
    }
    if let Some(purpose) = entry.get("purpose").filter(|p| p.is_object()) {
        let (value, creator, last_set) = topic_fields(purpose);
        channel.update_purpose(value, creator, last_set);
    }
    if let Some(v) = bool_field(entry, "is_archived") {
        channel.is_archived = v;
    }
    if let Some(v) = str_field(entry, "creator") {
        channel.creator = Some(v.to_string());
    }
}

fn apply_user(state: &mut WorkspaceState, entry: &Value) {
    let (Some(id), Some(name)) = (str_field(entry, "id"), str_field(entry, "name")) else {
        warn!("skipping user entry without id or name");
        return;
    };
    let Some(profile) = entry.get("profile").filter(|p| p.is_object()) else {
        warn!(user = id, "skipping user entry without profile");
        return;
    };
    state.upsert_user(id, name);
    state.update_user_profile(
        id,
        str_field(profile, "display_name"),
        str_field(profile, "bot_id"),
    );
}
