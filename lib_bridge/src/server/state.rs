use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::configs::BridgeMode;
use crate::core::connection_state::ConnectionState;
use crate::core::hub::BroadcastHub;

/// Shared state behind every route. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub mode: BridgeMode,
    /// Broker connection state; `None` in synthetic mode.
    pub upstream: Option<watch::Receiver<ConnectionState>>,
    /// Payloads buffered per client session.
    pub client_buffer_size: usize,
    pub shutdown: CancellationToken,
}

/// Body of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub mode: &'static str,
    pub active_client_count: usize,
    pub upstream: Option<ConnectionState>,
}

impl AppState {
    pub fn new(
        hub: Arc<BroadcastHub>,
        mode: BridgeMode,
        upstream: Option<watch::Receiver<ConnectionState>>,
        client_buffer_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            mode,
            upstream,
            client_buffer_size,
            shutdown,
        }
    }

    /// Liveness snapshot. The process answering at all is what makes it "ok";
    /// upstream outages show up in `upstream`.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            mode: self.mode.as_str(),
            active_client_count: self.hub.client_count(),
            upstream: self.upstream.as_ref().map(|rx| *rx.borrow()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_health_in_broker_mode_reports_upstream_state() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let state = AppState::new(
            Arc::new(BroadcastHub::new(Duration::from_secs(1))),
            BridgeMode::Broker,
            Some(rx),
            8,
            CancellationToken::new(),
        );
        tx.send_replace(ConnectionState::Degraded);

        let json = serde_json::to_value(state.health()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "ok",
                "mode": "broker",
                "active_client_count": 0,
                "upstream": "degraded"
            })
        );
    }

    #[test]
    fn test_health_in_synthetic_mode_has_no_upstream() {
        let state = AppState::new(
            Arc::new(BroadcastHub::new(Duration::from_secs(1))),
            BridgeMode::Synthetic,
            None,
            8,
            CancellationToken::new(),
        );
        let report = state.health();
        assert_eq!(report.mode, "synthetic");
        assert_eq!(report.upstream, None);
    }
}
