//! # Data Ingestors Module
//!
//! The two interchangeable payload sources. Exactly one runs per process, chosen by
//! the configured mode; both feed the same `BroadcastHub`.
//!
//! ## Contained Modules:
//! - **`link`**: the broker client seam and its MQTT implementation.
//! - **`mqtt_subscriber`**: the resilient, state-aware broker subscriber.
//! - **`synthetic`**: the timer-driven placeholder data generator.

/// Broker client abstraction and the `rumqttc` implementation.
pub mod link;
/// Broker subscription loop with reconnect backoff.
pub mod mqtt_subscriber;
/// Random readings on a fixed interval.
pub mod synthetic;

// --- Public API Re-exports ---
pub use link::{BrokerLink, LinkError, LinkEvent, MqttLink};
pub use mqtt_subscriber::BrokerSubscriber;
pub use synthetic::{FieldRange, SyntheticGenerator};
