//! # Upstream Connection State
//!
//! The broker subscriber's lifecycle as an explicit state machine. The subscriber
//! loop feeds it [`LinkSignal`]s and publishes the resulting state on a `watch`
//! channel so the health endpoint can read it without touching the subscriber.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Lifecycle of the single upstream broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not started yet, or shut down.
    Disconnected,
    /// A connection attempt (or the subscription that follows it) is in progress.
    Connecting,
    /// Connected and the topic subscription is acknowledged. Payloads flow.
    Subscribed,
    /// The transport was lost; waiting out the backoff before reconnecting.
    Degraded,
}

/// Named events that drive [`ConnectionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Start,
    ConnAck,
    SubAck,
    SubscriptionRejected,
    TransportLost,
    RetryDue,
    Shutdown,
}

impl ConnectionState {
    /// Applies one signal. Signals that make no sense in the current state leave it
    /// unchanged.
    pub fn next(self, signal: LinkSignal) -> ConnectionState {
        use ConnectionState::*;
        use LinkSignal::*;

        match (self, signal) {
            (_, Shutdown) => Disconnected,
            (Disconnected, Start) => Connecting,
            (Disconnected, _) => Disconnected,
            (_, TransportLost) => Degraded,
            (Degraded, RetryDue) => Connecting,
            (Degraded, _) => Degraded,
            (Connecting, SubAck) => Subscribed,
            // A fresh ConnAck while subscribed means the link reconnected on its
            // own; the subscription has to be re-established.
            (Subscribed, ConnAck) => Connecting,
            (Subscribed, SubscriptionRejected) => Connecting,
            (state, _) => state,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bound on the delay between two connection attempts.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exponential reconnect backoff: `base`, `2 * base`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Both bounds are clamped to [`MIN_RETRY_DELAY`]; `max` never ends up below `base`.
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_RETRY_DELAY);
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to `base` after a successful subscription.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
