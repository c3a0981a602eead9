//! # Configuration Module
//!
//! - **`config_bridge`**: layered settings (defaults → JSON file → env/CLI) and
//!   their validation into [`BridgeSettings`].
//! - **`credentials`**: loading and checking the broker's TLS PEM files.

pub mod config_bridge;
pub mod credentials;

pub use config_bridge::{
    load_config, load_config_from, BridgeMode, BridgeSettings, BrokerSettings, Config,
    ConfigError, GeneratorSettings, TlsPaths,
};
pub use credentials::{load_credentials, BrokerCredentials};
