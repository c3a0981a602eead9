//! # Telemetry Payload
//!
//! The value that flows from an ingestor through the hub to every client. The
//! bridge never looks inside it beyond checking that it is well-formed JSON text;
//! whatever arrives upstream is relayed to clients byte-for-byte.

use std::fmt;
use std::sync::Arc;

use serde::de::IgnoredAny;
use thiserror::Error;

/// Reasons an inbound broker message cannot become a [`TelemetryPayload`].
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload is not well-formed JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// An immutable, cheaply clonable telemetry record in its wire (JSON text) form.
#[derive(Clone, PartialEq, Eq)]
pub struct TelemetryPayload(Arc<str>);

impl TelemetryPayload {
    /// Decodes raw broker bytes. The text is validated, not rewritten.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(raw)?;
        Self::from_text(text)
    }

    /// Accepts text that is already decoded, as long as it parses as JSON.
    pub fn from_text(text: &str) -> Result<Self, PayloadError> {
        serde_json::from_str::<IgnoredAny>(text)?;
        Ok(Self(Arc::from(text)))
    }

    /// Serializes a locally built record (synthetic readings).
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self(Arc::from(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for TelemetryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TelemetryPayload").field(&self.as_str()).finish()
    }
}

impl fmt::Display for TelemetryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
