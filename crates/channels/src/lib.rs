//! Interfaces between chat backends and the host that embeds them.
//!
//! A backend (the Slack workspace client, for one) renders inbound events
//! through a [`MessageSink`], reads static settings through a
//! [`ConfigSource`], and is started and stopped through [`ChannelPlugin`].

pub mod error;
pub mod message_log;
pub mod plugin;

pub use {
    error::{Error, Result},
    plugin::{
        ChannelHealthSnapshot, ChannelPlugin, ChannelStatus, ConfigSource, EmitTarget,
        MessageSink,
    },
};
