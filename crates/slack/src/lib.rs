//! Slack workspace client for skiff.
//!
//! Keeps a local model of one workspace (channels, users, typing markers)
//! in sync from two feeds: the paginated listing crawler run at startup and
//! the real-time websocket stream. Inbound messages are decoded and rendered
//! through a [`skiff_channels::MessageSink`].

pub mod api;
pub mod config;
pub mod crawler;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod plugin;
pub mod state;
pub mod transport;
pub mod workspace;

pub use {
    config::SlackWorkspaceConfig,
    error::{Error, Result},
    plugin::SlackPlugin,
    workspace::SlackWorkspace,
};
