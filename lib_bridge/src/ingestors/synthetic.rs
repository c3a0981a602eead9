//! # Synthetic Generator
//!
//! Placeholder data for when no broker is configured: every interval one reading
//! with a random integer per declared field, published through the same hub the
//! broker subscriber would use.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::configs::GeneratorSettings;
use crate::core::hub::BroadcastHub;
use crate::core::payload::TelemetryPayload;

/// One generated field and its inclusive value range.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldRange {
    pub name: String,
    pub min: i64,
    pub max: i64,
}

impl FieldRange {
    pub fn new(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    /// Moisture, Viscosity and AirBubble, as the sensors report them.
    pub fn defaults() -> Vec<FieldRange> {
        vec![
            FieldRange::new("Moisture", 30, 90),
            FieldRange::new("Viscosity", 150, 350),
            FieldRange::new("AirBubble", 0, 10),
        ]
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("generator field name must not be empty".to_string());
        }
        if self.min > self.max {
            return Err(format!(
                "generator field '{}' has min {} above max {}",
                self.name, self.min, self.max
            ));
        }
        Ok(())
    }
}

pub struct SyntheticGenerator {
    hub: Arc<BroadcastHub>,
    interval: Duration,
    fields: Vec<FieldRange>,
    rng: StdRng,
}

impl SyntheticGenerator {
    pub fn new(hub: Arc<BroadcastHub>, settings: &GeneratorSettings) -> Self {
        Self::with_rng(hub, settings, StdRng::from_os_rng())
    }

    /// Deterministic readings, for tests.
    pub fn with_seed(hub: Arc<BroadcastHub>, settings: &GeneratorSettings, seed: u64) -> Self {
        Self::with_rng(hub, settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(hub: Arc<BroadcastHub>, settings: &GeneratorSettings, rng: StdRng) -> Self {
        Self {
            hub,
            interval: settings.interval,
            fields: settings.fields.clone(),
            rng,
        }
    }

    /// Builds one reading.
    pub fn reading(&mut self) -> TelemetryPayload {
        let mut record = Map::new();
        for field in &self.fields {
            let value = self.rng.random_range(field.min..=field.max);
            record.insert(field.name.clone(), Value::from(value));
        }
        TelemetryPayload::from_json(&Value::Object(record))
    }

    /// Publishes a reading every interval until shutdown. The first one goes out
    /// immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!(
            "Synthetic generator started: {} field(s) every {:?}",
            self.fields.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let payload = self.reading();
                    log::debug!("Generated {}", payload);
                    self.hub.publish(payload).await;
                }
            }
        }
        log::info!("Synthetic generator stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hub::ClientHandle;

    fn settings(interval: Duration) -> GeneratorSettings {
        GeneratorSettings {
            interval,
            fields: FieldRange::defaults(),
        }
    }

    #[test]
    fn test_reading_stays_within_ranges() {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        let mut generator = SyntheticGenerator::with_seed(hub, &settings(Duration::from_secs(2)), 7);

        for _ in 0..200 {
            let reading: Value = serde_json::from_str(generator.reading().as_str()).unwrap();
            for field in FieldRange::defaults() {
                let value = reading[&field.name].as_i64().unwrap();
                assert!((field.min..=field.max).contains(&value), "{} = {}", field.name, value);
            }
        }
    }

    #[test]
    fn test_degenerate_range_yields_constant() {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        let settings = GeneratorSettings {
            interval: Duration::from_secs(1),
            fields: vec![FieldRange::new("Valve", 1, 1)],
        };
        let mut generator = SyntheticGenerator::with_seed(hub, &settings, 1);
        assert_eq!(generator.reading().as_str(), r#"{"Valve":1}"#);
    }

    #[test]
    fn test_validate_rejects_blank_name() {
        assert!(FieldRange::new(" ", 0, 1).validate().is_err());
        assert!(FieldRange::new("Moisture", 30, 90).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_connected_five_seconds_gets_two_or_three_readings() {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        let (handle, mut rx) = ClientHandle::channel(hub.next_client_id(), "test", 16);
        hub.register(handle);

        let shutdown = CancellationToken::new();
        let generator = SyntheticGenerator::with_seed(hub.clone(), &settings(Duration::from_secs(2)), 42);
        let task = tokio::spawn(generator.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        task.await.unwrap();

        let mut received = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            received.push(payload);
        }
        assert!((2..=3).contains(&received.len()), "got {}", received.len());
        for payload in received {
            let reading: Value = serde_json::from_str(payload.as_str()).unwrap();
            let moisture = reading["Moisture"].as_i64().unwrap();
            assert!((30..=90).contains(&moisture));
        }
    }
}
