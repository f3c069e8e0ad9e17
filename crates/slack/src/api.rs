//! Web API surface: listing endpoints and `rtm.connect`.

use std::fmt;

use {
    serde::Deserialize,
    tracing::{debug, info},
};

use crate::{Error, Result, state::SessionIdentity};

pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// One of the paginated listing collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListingResource {
    Channels,
    Users,
    /// Member ids of one channel.
    Members { channel_id: String },
}

impl ListingResource {
    /// API method name appended to the base URL.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Channels => "channels.list",
            Self::Users => "users.list",
            Self::Members { .. } => "conversations.members",
        }
    }

    /// Key of the array holding the page's entries.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Channels => "channels",
            Self::Users | Self::Members { .. } => "members",
        }
    }

    /// Query parameters for one page, token included.
    pub fn query(&self, token: &str, cursor: &str, limit: u32) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("token", token.to_string()),
            ("cursor", cursor.to_string()),
            ("exclude_archived", "false".to_string()),
            ("exclude_members", "true".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Self::Members { channel_id } = self {
            query.push(("channel", channel_id.clone()));
        }
        query
    }
}

impl fmt::Display for ListingResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Members { channel_id } => write!(f, "{}({channel_id})", self.method()),
            _ => f.write_str(self.method()),
        }
    }
}

/// Result of `rtm.connect`.
#[derive(Debug, Clone)]
pub struct RtmSession {
    pub url: String,
    pub identity: SessionIdentity,
}

#[derive(Debug, Deserialize)]
struct RtmConnectResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "self")]
    self_info: Option<NamedRef>,
    #[serde(default)]
    team: Option<TeamRef>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TeamRef {
    id: Option<String>,
    name: Option<String>,
    domain: Option<String>,
}

/// Ask the API for a fresh real-time websocket URL.
pub async fn rtm_connect(
    http: &reqwest::Client,
    api_base: &str,
    token: &str,
) -> Result<RtmSession> {
    let url = format!("{}/rtm.connect", api_base.trim_end_matches('/'));
    debug!(api_base, "requesting real-time session");

    let resp: RtmConnectResponse = http
        .get(&url)
        .query(&[("token", token)])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if !resp.ok {
        return Err(Error::Api(
            resp.error.unwrap_or_else(|| "rtm.connect failed".into()),
        ));
    }
    let url = resp
        .url
        .ok_or_else(|| Error::Protocol("rtm.connect response has no url".into()))?;

    let (self_id, self_name) = resp
        .self_info
        .map(|s| (s.id, s.name))
        .unwrap_or_default();
    let (team_id, team_name, team_domain) = resp
        .team
        .map(|t| (t.id, t.name, t.domain))
        .unwrap_or_default();

    info!(
        self_name = self_name.as_deref().unwrap_or("?"),
        team = team_name.as_deref().unwrap_or("?"),
        "real-time session granted"
    );

    Ok(RtmSession {
        url,
        identity: SessionIdentity {
            self_id,
            self_name,
            team_id,
            team_name,
            team_domain,
        },
    })
}
