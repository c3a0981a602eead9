//! # Broker Link
//!
//! The seam between the subscriber's state machine and an actual broker client.
//! The subscriber only needs to poll for the next event, ask for a subscription
//! and say goodbye; [`MqttLink`] provides that over `rumqttc`, tests provide it
//! with a scripted fake.

use std::future::Future;
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use thiserror::Error;

use crate::configs::{BrokerCredentials, BrokerSettings};

/// Something the broker connection reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The broker accepted the connection.
    Connected,
    /// The topic subscription was acknowledged.
    Subscribed,
    /// The broker refused the topic subscription.
    SubscriptionRejected,
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// Keep-alive traffic and other housekeeping.
    Other,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker request could not be queued: {0}")]
    Request(String),
}

pub trait BrokerLink: Send {
    /// Waits for the next event. After an error the next call starts a new
    /// connection attempt.
    fn poll(&mut self) -> impl Future<Output = Result<LinkEvent, LinkError>> + Send;

    /// Queues a subscription request for `topic`; the ack arrives through `poll`.
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;

    /// Best-effort clean disconnect.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

const REQUEST_CAPACITY: usize = 10;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// [`BrokerLink`] over an MQTT 3.1.1 client. Nothing touches the network until
/// the first `poll`.
pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttLink {
    pub fn new(settings: &BrokerSettings, credentials: Option<BrokerCredentials>) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);

        if let Some(credentials) = credentials {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: credentials.ca,
                alpn: None,
                client_auth: credentials.client_auth,
            }));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self { client, eventloop }
    }
}

impl BrokerLink for MqttLink {
    async fn poll(&mut self) -> Result<LinkEvent, LinkError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(LinkEvent::Connected),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Ok(LinkEvent::SubscriptionRejected)
                } else {
                    Ok(LinkEvent::Subscribed)
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(LinkEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(_) => Ok(LinkEvent::Other),
            Err(e) => Err(LinkError::Connection(e.to_string())),
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| LinkError::Request(e.to_string()))
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        // The request only leaves once the event loop is polled.
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
