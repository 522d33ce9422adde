//! Configuration loading and schema.
//!
//! Config files: `tether.toml`, `tether.yaml`, or `tether.json`.
//! Searched in `./` then `~/.config/tether/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, discover_and_load, find_config_file, load_config,
        set_config_dir,
    },
    schema::{ChatConfig, ClientConfig, GatewayConfig, ProviderEntry, ProvidersConfig, TetherConfig},
};
