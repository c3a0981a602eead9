use clap::{Parser, ValueEnum};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::ingestors::synthetic::FieldRange;

const DEFAULT_CONFIG_FILE: &str = "telemetry_bridge.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error("unusable credential {path}: {reason}")]
    Credential { path: PathBuf, reason: String },
}

/// Where payloads come from. Exactly one source runs per process.
///
/// Parsed case-insensitively everywhere: `MODE=IOT` and `"mode": "Test"` are
/// both accepted.
#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Subscribe to the upstream MQTT broker.
    #[value(alias = "iot")]
    Broker,
    /// No upstream: fabricate readings on a timer.
    #[default]
    #[value(alias = "test")]
    Synthetic,
}

impl BridgeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeMode::Broker => "broker",
            BridgeMode::Synthetic => "synthetic",
        }
    }
}

impl FromStr for BridgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "broker" | "iot" => Ok(BridgeMode::Broker),
            "synthetic" | "test" => Ok(BridgeMode::Synthetic),
            other => Err(format!(
                "unknown mode '{}', expected one of broker, iot, synthetic, test",
                other
            )),
        }
    }
}

impl<'de> Deserialize<'de> for BridgeMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[command(about = "MQTT to WebSocket telemetry bridge", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, value_enum, ignore_case = true, env = "MODE", help = "Payload source: broker (alias iot) or synthetic (alias test).")]
    pub mode: Option<BridgeMode>,

    #[arg(long, env = "PORT", help = "Port to listen on for WebSocket and health requests.")]
    pub port: Option<u16>,

    #[arg(long, env = "BRIDGE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "BRIDGE_LOG_DIR", help = "Directory for log files. Console only when unset.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "BRIDGE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "BROKER_HOST", help = "Upstream MQTT broker host name.")]
    pub broker_host: Option<String>,

    #[arg(long, env = "BROKER_PORT", help = "Upstream MQTT broker port.")]
    pub broker_port: Option<u16>,

    #[arg(long, env = "BROKER_TOPIC", help = "Topic carrying the telemetry readings.")]
    pub broker_topic: Option<String>,

    #[arg(long, env = "BROKER_CLIENT_ID", help = "MQTT client id used by the bridge.")]
    pub broker_client_id: Option<String>,

    #[arg(long, env = "BROKER_KEEP_ALIVE_SECONDS", help = "MQTT keep-alive interval in seconds.")]
    pub broker_keep_alive_seconds: Option<u64>,

    #[arg(long, env = "BROKER_CA_PATH", help = "Path to the broker CA certificate (PEM).")]
    pub ca_path: Option<PathBuf>,

    #[arg(long, env = "BROKER_CERT_PATH", help = "Path to the bridge's client certificate (PEM).")]
    pub cert_path: Option<PathBuf>,

    #[arg(long, env = "BROKER_KEY_PATH", help = "Path to the bridge's private key (PEM).")]
    pub key_path: Option<PathBuf>,

    #[arg(long, env = "BRIDGE_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[arg(long, env = "BRIDGE_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "GENERATOR_INTERVAL_MS", help = "Milliseconds between synthetic readings.")]
    pub generator_interval_ms: Option<u64>,

    #[arg(skip)]
    pub generator_fields: Option<Vec<FieldRange>>,

    #[arg(long, env = "BRIDGE_SEND_TIMEOUT_MS", help = "Milliseconds a single client may stall a broadcast.")]
    pub send_timeout_ms: Option<u64>,

    #[arg(long, env = "BRIDGE_CLIENT_BUFFER_SIZE", help = "Payloads buffered per client before sends start to wait.")]
    pub client_buffer_size: Option<usize>,

    #[arg(long, env = "BRIDGE_SHUTDOWN_GRACE_MS", help = "Milliseconds allowed for shutdown before tasks are abandoned.")]
    pub shutdown_grace_ms: Option<u64>,
}

impl Config {
    /// Built-in values, the bottom configuration layer.
    pub fn defaults() -> Config {
        Config {
            mode: Some(BridgeMode::Synthetic),
            port: Some(10000),
            log_level: Some("info".to_string()),
            broker_port: Some(8883),
            broker_topic: Some("text/sensor/data".to_string()),
            broker_client_id: Some("telemetry-bridge".to_string()),
            broker_keep_alive_seconds: Some(60),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            generator_interval_ms: Some(2000),
            generator_fields: Some(FieldRange::defaults()),
            send_timeout_ms: Some(1000),
            client_buffer_size: Some(64),
            shutdown_grace_ms: Some(5000),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            mode: other.mode.or(self.mode),
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            broker_host: other.broker_host.or(self.broker_host),
            broker_port: other.broker_port.or(self.broker_port),
            broker_topic: other.broker_topic.or(self.broker_topic),
            broker_client_id: other.broker_client_id.or(self.broker_client_id),
            broker_keep_alive_seconds: other.broker_keep_alive_seconds.or(self.broker_keep_alive_seconds),
            ca_path: other.ca_path.or(self.ca_path),
            cert_path: other.cert_path.or(self.cert_path),
            key_path: other.key_path.or(self.key_path),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            generator_interval_ms: other.generator_interval_ms.or(self.generator_interval_ms),
            generator_fields: other.generator_fields.or(self.generator_fields),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            client_buffer_size: other.client_buffer_size.or(self.client_buffer_size),
            shutdown_grace_ms: other.shutdown_grace_ms.or(self.shutdown_grace_ms),
        }
    }

    /// Validates the merged layers into settings the bridge can run with.
    pub fn resolve(self) -> Result<BridgeSettings, ConfigError> {
        let mode = self.mode.unwrap_or_default();

        let broker = match mode {
            BridgeMode::Broker => Some(BrokerSettings {
                host: self
                    .broker_host
                    .filter(|h| !h.trim().is_empty())
                    .ok_or(ConfigError::Missing("brokerHost"))?,
                port: self.broker_port.ok_or(ConfigError::Missing("brokerPort"))?,
                topic: self
                    .broker_topic
                    .filter(|t| !t.is_empty())
                    .ok_or(ConfigError::Missing("brokerTopic"))?,
                client_id: self
                    .broker_client_id
                    .filter(|c| !c.is_empty())
                    .ok_or(ConfigError::Missing("brokerClientId"))?,
                keep_alive: Duration::from_secs(keep_alive_seconds(self.broker_keep_alive_seconds)?),
                tls: TlsPaths::from_parts(self.ca_path, self.cert_path, self.key_path)?,
                reconnect_base_delay: Duration::from_millis(
                    self.reconnect_base_delay_ms.unwrap_or(1000),
                ),
                reconnect_max_delay: Duration::from_millis(
                    self.reconnect_max_delay_ms.unwrap_or(60000),
                ),
            }),
            BridgeMode::Synthetic => None,
        };

        let fields = self.generator_fields.unwrap_or_else(FieldRange::defaults);
        if fields.is_empty() {
            return Err(ConfigError::Invalid("generatorFields must not be empty".to_string()));
        }
        for field in &fields {
            field.validate().map_err(ConfigError::Invalid)?;
        }

        Ok(BridgeSettings {
            mode,
            port: self.port.ok_or(ConfigError::Missing("port"))?,
            log_dir: self.log_dir,
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            broker,
            generator: GeneratorSettings {
                interval: Duration::from_millis(non_zero(
                    self.generator_interval_ms,
                    "generatorIntervalMs",
                )?),
                fields,
            },
            send_timeout: Duration::from_millis(non_zero(self.send_timeout_ms, "sendTimeoutMs")?),
            client_buffer_size: non_zero(
                self.client_buffer_size.map(|n| n as u64),
                "clientBufferSize",
            )? as usize,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms.unwrap_or(5000)),
            config_source: None,
        })
    }
}

fn non_zero(value: Option<u64>, name: &'static str) -> Result<u64, ConfigError> {
    match value {
        None => Err(ConfigError::Missing(name)),
        Some(0) => Err(ConfigError::Invalid(format!("{} must be greater than zero", name))),
        Some(v) => Ok(v),
    }
}

/// MQTT 3.1.1 carries the keep-alive as a 16-bit number of seconds.
fn keep_alive_seconds(value: Option<u64>) -> Result<u64, ConfigError> {
    let seconds = non_zero(value, "brokerKeepAliveSeconds")?;
    if seconds > u64::from(u16::MAX) {
        return Err(ConfigError::Invalid(format!(
            "brokerKeepAliveSeconds must be at most {}, got {}",
            u16::MAX,
            seconds
        )));
    }
    Ok(seconds)
}

/// Fully validated runtime settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub mode: BridgeMode,
    pub port: u16,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    /// Present exactly when `mode` is [`BridgeMode::Broker`].
    pub broker: Option<BrokerSettings>,
    pub generator: GeneratorSettings,
    pub send_timeout: Duration,
    pub client_buffer_size: usize,
    pub shutdown_grace: Duration,
    /// The config file that was merged in, if any. Logged once logging is up.
    pub config_source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Plain TCP when `None`.
    pub tls: Option<TlsPaths>,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca: PathBuf,
    /// Client certificate and key, always set together.
    pub client_auth: Option<(PathBuf, PathBuf)>,
}

impl TlsPaths {
    fn from_parts(
        ca: Option<PathBuf>,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    ) -> Result<Option<TlsPaths>, ConfigError> {
        let client_auth = match (cert, key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("keyPath")),
            (None, Some(_)) => return Err(ConfigError::Missing("certPath")),
        };
        match (ca, client_auth) {
            (Some(ca), client_auth) => Ok(Some(TlsPaths { ca, client_auth })),
            (None, None) => Ok(None),
            (None, Some(_)) => Err(ConfigError::Missing("caPath")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub interval: Duration,
    pub fields: Vec<FieldRange>,
}

/// Loads defaults, then the config file, then environment and CLI flags.
pub fn load_config() -> Result<BridgeSettings, ConfigError> {
    load_config_from(Config::parse())
}

/// Same layering as [`load_config`] with an already parsed CLI/env layer.
pub fn load_config_from(cli: Config) -> Result<BridgeSettings, ConfigError> {
    let explicit_path = cli.config_path.is_some();
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    let mut config_source = None;

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path).map_err(|source| ConfigError::Read {
            path: config_file_path.clone(),
            source,
        })?;
        let file_config: Config =
            serde_json::from_str(&config_str).map_err(|source| ConfigError::Parse {
                path: config_file_path.clone(),
                source,
            })?;
        current_config = current_config.merge(file_config);
        config_source = Some(config_file_path);
    } else if explicit_path {
        return Err(ConfigError::Read {
            path: config_file_path,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
        });
    }

    let mut settings = current_config.merge(cli).resolve()?;
    settings.config_source = config_source;
    Ok(settings)
}
