//! # Bridge Runtime
//!
//! Wires the pieces together for one process: a hub, exactly one upstream source
//! picked by mode, and the downstream server, all stopped by one cancellation
//! token.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::configs::{load_credentials, BridgeMode, BridgeSettings, ConfigError};
use crate::core::connection_state::{Backoff, ConnectionState};
use crate::core::hub::BroadcastHub;
use crate::ingestors::{BrokerSubscriber, MqttLink, SyntheticGenerator};
use crate::server::{self, AppState};

/// The payload source selected at startup. Never both.
pub enum UpstreamSource {
    Broker(BrokerSubscriber<MqttLink>),
    Synthetic(SyntheticGenerator),
}

impl UpstreamSource {
    /// Builds the source for `settings.mode`. In broker mode this loads the TLS
    /// credentials, so unusable credentials fail here, before anything runs.
    pub fn from_settings(
        settings: &BridgeSettings,
        hub: Arc<BroadcastHub>,
    ) -> Result<(Self, Option<watch::Receiver<ConnectionState>>), ConfigError> {
        match settings.mode {
            BridgeMode::Broker => {
                let broker = settings
                    .broker
                    .as_ref()
                    .ok_or(ConfigError::Missing("brokerHost"))?;
                let credentials = broker.tls.as_ref().map(load_credentials).transpose()?;
                let link = MqttLink::new(broker, credentials);
                let backoff = Backoff::new(broker.reconnect_base_delay, broker.reconnect_max_delay);
                let (subscriber, state) = BrokerSubscriber::new(link, &broker.topic, hub, backoff);
                log::info!(
                    "Broker mode: {}:{} topic '{}' ({})",
                    broker.host,
                    broker.port,
                    broker.topic,
                    if broker.tls.is_some() { "TLS" } else { "plain TCP" }
                );
                Ok((UpstreamSource::Broker(subscriber), Some(state)))
            }
            BridgeMode::Synthetic => {
                log::info!("Synthetic mode: no upstream broker configured");
                let generator = SyntheticGenerator::new(hub, &settings.generator);
                Ok((UpstreamSource::Synthetic(generator), None))
            }
        }
    }

    pub fn mode(&self) -> BridgeMode {
        match self {
            UpstreamSource::Broker(_) => BridgeMode::Broker,
            UpstreamSource::Synthetic(_) => BridgeMode::Synthetic,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        match self {
            UpstreamSource::Broker(subscriber) => subscriber.run(shutdown).await,
            UpstreamSource::Synthetic(generator) => generator.run(shutdown).await,
        }
    }
}

/// Binds the configured port and runs the bridge until `shutdown` fires.
pub async fn run_bridge(settings: BridgeSettings, shutdown: CancellationToken) -> Result<()> {
    let listener = server::bind(settings.port).await?;
    run_bridge_on(listener, settings, shutdown).await
}

/// Runs the bridge on an already bound listener.
///
/// Returns when `shutdown` fires (or the server dies), after giving every task up
/// to `settings.shutdown_grace` to wind down.
pub async fn run_bridge_on(
    listener: TcpListener,
    settings: BridgeSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    let hub = Arc::new(BroadcastHub::new(settings.send_timeout));
    let (source, upstream) = UpstreamSource::from_settings(&settings, hub.clone())?;

    let state = AppState::new(
        hub,
        settings.mode,
        upstream,
        settings.client_buffer_size,
        shutdown.clone(),
    );

    let source_handle = tokio::spawn(source.run(shutdown.clone()));
    let mut server_handle = tokio::spawn(server::serve(listener, state));

    let early_exit = tokio::select! {
        _ = shutdown.cancelled() => None,
        res = &mut server_handle => Some(res),
    };
    if early_exit.is_some() {
        log::error!("Downstream server stopped unexpectedly. Shutting down.");
    }
    shutdown.cancel();

    let drain = async move {
        let server = match early_exit {
            Some(res) => res,
            None => server_handle.await,
        };
        if let Err(e) = source_handle.await {
            log::error!("Upstream task failed: {}", e);
        }
        server
    };

    match tokio::time::timeout(settings.shutdown_grace, drain).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(anyhow!("downstream task failed: {}", join_error)),
        Err(_) => {
            log::warn!(
                "Tasks still running after {:?}; abandoning them.",
                settings.shutdown_grace
            );
            Ok(())
        }
    }
}
