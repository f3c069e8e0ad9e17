//! Error context helpers shared by the skiff crates.

pub mod error;

pub use error::FromMessage;
