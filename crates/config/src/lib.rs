//! Configuration discovery and loading.
//!
//! Config files: `skiff.toml`, `skiff.yaml`, `skiff.yml` or `skiff.json`,
//! searched in `./` then `~/.config/skiff/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in the raw
//! file before parsing, so tokens can stay out of the file itself.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, load_config},
    schema::SkiffConfig,
};
