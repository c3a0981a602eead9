//! # lib_bridge
//!
//! Relays telemetry from one MQTT topic to any number of WebSocket clients.
//!
//! - [`core`]: payload type, the broadcast hub, the broker connection state machine.
//! - [`ingestors`]: the broker subscriber and the synthetic generator.
//! - [`server`]: the axum router with `/ws` and the health check.
//! - [`configs`]: layered configuration and broker credentials.
//! - [`loggers`]: `fern` logging setup.
//! - [`bridge`]: process wiring and shutdown.

pub mod bridge;
pub mod configs;
pub mod core;
pub mod ingestors;
pub mod loggers;
pub mod server;

// Re-export the entry points the server binary needs.
pub use bridge::{run_bridge, run_bridge_on, UpstreamSource};
pub use configs::{load_config, BridgeMode, BridgeSettings, ConfigError};
pub use loggers::setup_logging;
