//! Configuration loading: file discovery, `${ENV}` substitution, env
//! overrides, and the typed schema.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{apply_env_overrides, config_dir, discover_and_load, load_config, set_config_dir},
    schema::{
        AuthConfig, AuthMode, DispatchConfig, ServerConfig, SwitchboardConfig, TokenConfig,
        TransportConfig,
    },
};
