//! # Broker Subscriber
//!
//! Keeps one subscription to the upstream broker alive for the whole life of the
//! process and forwards every message on it to the [`BroadcastHub`].
//!
//! Connection loss is never fatal: the subscriber drops to `Degraded`, waits out an
//! exponential backoff (never less than one second) and tries again, forever, until
//! shutdown. Each transition is published on a `watch` channel for the health
//! endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::connection_state::{Backoff, ConnectionState, LinkSignal};
use crate::core::hub::BroadcastHub;
use crate::core::payload::TelemetryPayload;
use crate::ingestors::link::{BrokerLink, LinkEvent};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BrokerSubscriber<L: BrokerLink> {
    link: L,
    topic: String,
    hub: Arc<BroadcastHub>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
}

impl<L: BrokerLink> BrokerSubscriber<L> {
    /// Creates the subscriber in `Disconnected` and returns the receiving side of
    /// its state channel.
    pub fn new(
        link: L,
        topic: impl Into<String>,
        hub: Arc<BroadcastHub>,
        backoff: Backoff,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let subscriber = Self {
            link,
            topic: topic.into(),
            hub,
            backoff,
            state,
        };
        (subscriber, state_rx)
    }

    /// Primary execution loop with reconnection logic. Returns only on shutdown.
    ///
    /// The link is polled the whole time the connection is up, including while a
    /// rejected subscription waits for its retry, so keep-alive traffic never
    /// stops on a healthy connection.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.apply(LinkSignal::Start);
        log::info!("Connecting to broker for topic '{}'", self.topic);

        let mut resubscribe_at: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resubscribe_due(resubscribe_at) => {
                    resubscribe_at = None;
                    log::info!("Retrying subscription to '{}'", self.topic);
                    self.request_subscription();
                    continue;
                }
                event = self.link.poll() => event,
            };

            match event {
                Ok(LinkEvent::Connected) => {
                    resubscribe_at = None;
                    self.apply(LinkSignal::ConnAck);
                    log::info!("Connected to broker. Subscribing to '{}'", self.topic);
                    self.request_subscription();
                }
                Ok(LinkEvent::Subscribed) => {
                    resubscribe_at = None;
                    self.apply(LinkSignal::SubAck);
                    self.backoff.reset();
                    log::info!("Subscribed to '{}'", self.topic);
                }
                Ok(LinkEvent::SubscriptionRejected) => {
                    self.apply(LinkSignal::SubscriptionRejected);
                    let delay = self.backoff.next_delay();
                    log::error!(
                        "Broker rejected the subscription to '{}'. Retrying in {:?}",
                        self.topic,
                        delay
                    );
                    resubscribe_at = Some(Instant::now() + delay);
                }
                Ok(LinkEvent::Message { topic, payload }) => {
                    forward(&self.hub, &topic, &payload).await;
                }
                Ok(LinkEvent::Other) => {}
                Err(e) => {
                    // A new connection subscribes on its own ConnAck.
                    resubscribe_at = None;
                    self.apply(LinkSignal::TransportLost);
                    log::warn!("{}", e);
                    if !self.wait_backoff(&shutdown).await {
                        break;
                    }
                    self.apply(LinkSignal::RetryDue);
                    log::info!("Reconnecting to broker");
                }
            }
        }

        self.apply(LinkSignal::Shutdown);
        if tokio::time::timeout(DISCONNECT_TIMEOUT, self.link.disconnect())
            .await
            .is_err()
        {
            log::warn!("Broker did not acknowledge the disconnect within {:?}", DISCONNECT_TIMEOUT);
        }
        log::info!("Broker subscriber stopped.");
    }

    fn apply(&mut self, signal: LinkSignal) {
        let current = *self.state.borrow();
        let next = current.next(signal);
        if next != current {
            log::debug!("Broker connection {} -> {} ({:?})", current, next, signal);
            self.state.send_replace(next);
        }
    }

    fn request_subscription(&mut self) {
        // A failed request surfaces again as a transport error on the next poll.
        if let Err(e) = self.link.subscribe(&self.topic) {
            log::error!("Failed to request subscription to '{}': {}", self.topic, e);
        }
    }

    /// Sleeps for the next backoff delay. Returns `false` if shutdown came first.
    async fn wait_backoff(&mut self, shutdown: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        log::info!("Retrying in {:?}", delay);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Resolves at `deadline`, or never when no retry is scheduled.
async fn resubscribe_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Validates one raw message and publishes it. Malformed payloads are dropped.
async fn forward(hub: &BroadcastHub, topic: &str, raw: &[u8]) {
    match TelemetryPayload::from_bytes(raw) {
        Ok(payload) => {
            log::trace!("Received {} bytes on '{}'", raw.len(), topic);
            let report = hub.publish(payload).await;
            if report.pruned > 0 {
                log::debug!("Pruned {} disconnected client(s)", report.pruned);
            }
        }
        Err(e) => {
            log::warn!("Dropping malformed payload on '{}': {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hub::ClientHandle;
    use crate::ingestors::link::LinkError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Spacing of the keep-alive traffic an idle link reports.
    const IDLE_TICK: Duration = Duration::from_millis(200);

    /// What the scripted link saw, shared with the test body.
    #[derive(Default)]
    struct LinkLog {
        polled_at: Mutex<Vec<Instant>>,
        subscribed_at: Mutex<Vec<Instant>>,
        topics: Mutex<Vec<String>>,
        disconnected: Mutex<bool>,
    }

    /// Plays back a fixed list of events, then reports keep-alive traffic every
    /// `IDLE_TICK`. Each subscribe call may queue a scripted broker reply.
    struct ScriptedLink {
        script: VecDeque<Result<LinkEvent, LinkError>>,
        subscribe_replies: VecDeque<LinkEvent>,
        log: Arc<LinkLog>,
    }

    impl ScriptedLink {
        fn new(script: Vec<Result<LinkEvent, LinkError>>) -> (Self, Arc<LinkLog>) {
            let log = Arc::new(LinkLog::default());
            let link = Self {
                script: script.into(),
                subscribe_replies: VecDeque::new(),
                log: log.clone(),
            };
            (link, log)
        }

        fn replying(mut self, replies: Vec<LinkEvent>) -> Self {
            self.subscribe_replies = replies.into();
            self
        }
    }

    impl BrokerLink for ScriptedLink {
        async fn poll(&mut self) -> Result<LinkEvent, LinkError> {
            self.log.polled_at.lock().unwrap().push(Instant::now());
            match self.script.pop_front() {
                Some(event) => event,
                None => {
                    tokio::time::sleep(IDLE_TICK).await;
                    Ok(LinkEvent::Other)
                }
            }
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
            self.log.topics.lock().unwrap().push(topic.to_string());
            self.log.subscribed_at.lock().unwrap().push(Instant::now());
            if let Some(reply) = self.subscribe_replies.pop_front() {
                self.script.push_back(Ok(reply));
            }
            Ok(())
        }

        async fn disconnect(&mut self) {
            *self.log.disconnected.lock().unwrap() = true;
        }
    }

    fn message(text: &[u8]) -> Result<LinkEvent, LinkError> {
        Ok(LinkEvent::Message {
            topic: "text/sensor/data".to_string(),
            payload: text.to_vec(),
        })
    }

    fn lost() -> Result<LinkEvent, LinkError> {
        Err(LinkError::Connection("connection reset".to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_broker_drop() {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        let (handle, mut rx) = ClientHandle::channel(hub.next_client_id(), "test", 16);
        hub.register(handle);

        let (link, log) = ScriptedLink::new(vec![
            Ok(LinkEvent::Connected),
            Ok(LinkEvent::Subscribed),
            message(br#"{"Moisture":1}"#),
            lost(),
            lost(),
            Ok(LinkEvent::Connected),
            Ok(LinkEvent::Subscribed),
            message(b"not json"),
            message(br#"{"Moisture":2}"#),
        ]);

        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let (subscriber, state) = BrokerSubscriber::new(link, "text/sensor/data", hub.clone(), backoff);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(subscriber.run(shutdown.clone()));

        assert_eq!(rx.recv().await.unwrap().as_str(), r#"{"Moisture":1}"#);
        // The malformed message is dropped; the next good one still arrives.
        assert_eq!(rx.recv().await.unwrap().as_str(), r#"{"Moisture":2}"#);
        assert_eq!(*state.borrow(), ConnectionState::Subscribed);

        // Polls 4 and 5 follow the two losses: 1s then 2s of backoff.
        {
            let polled = log.polled_at.lock().unwrap();
            assert!(polled[4] - polled[3] >= Duration::from_secs(1));
            assert!(polled[5] - polled[4] >= Duration::from_secs(2));
        }
        assert_eq!(
            *log.topics.lock().unwrap(),
            vec!["text/sensor/data".to_string(), "text/sensor/data".to_string()]
        );
        assert_eq!(hub.client_count(), 1);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert!(*log.disconnected.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_degraded_during_backoff() {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        let (link, _log) = ScriptedLink::new(vec![lost()]);
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(10));
        let (subscriber, mut state) = BrokerSubscriber::new(link, "t", hub, backoff);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(subscriber.run(shutdown.clone()));

        state
            .wait_for(|s| *s == ConnectionState::Degraded)
            .await
            .unwrap();

        // Shutdown interrupts the backoff sleep.
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscription_is_retried_while_link_keeps_polling() {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        let (link, log) = ScriptedLink::new(vec![Ok(LinkEvent::Connected)]);
        let link = link.replying(vec![LinkEvent::SubscriptionRejected, LinkEvent::Subscribed]);
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(2));
        let (subscriber, mut state) = BrokerSubscriber::new(link, "t", hub, backoff);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(subscriber.run(shutdown.clone()));

        state
            .wait_for(|s| *s == ConnectionState::Subscribed)
            .await
            .unwrap();

        let (first, second) = {
            let subscribed_at = log.subscribed_at.lock().unwrap();
            assert_eq!(subscribed_at.len(), 2);
            (subscribed_at[0], subscribed_at[1])
        };
        assert!(second - first >= Duration::from_secs(2));

        // Keep-alive polling went on during the whole retry wait.
        let polls_while_waiting = log
            .polled_at
            .lock()
            .unwrap()
            .iter()
            .filter(|at| **at > first && **at < second)
            .count();
        assert!(polls_while_waiting >= 5, "only {} polls", polls_while_waiting);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_a_pending_resubscribe() {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        // The rejection schedules a retry; the drop and reconnect make it moot.
        let (link, log) = ScriptedLink::new(vec![
            Ok(LinkEvent::Connected),
            Ok(LinkEvent::SubscriptionRejected),
            lost(),
            Ok(LinkEvent::Connected),
            Ok(LinkEvent::Subscribed),
        ]);
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(5));
        let (subscriber, mut state) = BrokerSubscriber::new(link, "t", hub, backoff);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(subscriber.run(shutdown.clone()));

        state
            .wait_for(|s| *s == ConnectionState::Subscribed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        // One request for the first connection, one for the reconnect, no stray retry.
        assert_eq!(log.topics.lock().unwrap().len(), 2);
        assert_eq!(*state.borrow(), ConnectionState::Subscribed);

        shutdown.cancel();
        task.await.unwrap();
    }
}
