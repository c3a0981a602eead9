//! # Core Engine Module
//!
//! The pieces every other part of the bridge is built on:
//!
//! - **`payload`**: the immutable JSON text record relayed from upstream to clients.
//! - **`hub`**: the client registry and its fan-out `publish`.
//! - **`connection_state`**: the broker connection state machine and the reconnect
//!   backoff policy.

/// The relayed telemetry record.
pub mod payload;
/// Client registry and fan-out.
pub mod hub;
/// Broker connection lifecycle and reconnect backoff.
pub mod connection_state;

// --- Public API Re-exports ---
pub use payload::{PayloadError, TelemetryPayload};
pub use hub::{BroadcastHub, ClientHandle, ClientId, PublishReport};
pub use connection_state::{Backoff, ConnectionState, LinkSignal, MIN_RETRY_DELAY};
