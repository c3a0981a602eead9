//! # Broker Credentials
//!
//! Reads the PEM files named in [`TlsPaths`] once at startup and checks that they
//! actually contain a certificate chain and a private key. Anything unreadable or
//! empty is a [`ConfigError::Credential`]: without it the bridge cannot form a
//! useful broker connection at all, so the caller treats it as fatal.

use std::fs;
use std::path::Path;

use crate::configs::config_bridge::{ConfigError, TlsPaths};

/// Raw PEM bytes handed to the MQTT transport.
#[derive(Clone)]
pub struct BrokerCredentials {
    pub ca: Vec<u8>,
    /// Client certificate chain and private key.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("ca_bytes", &self.ca.len())
            .field("client_auth", &self.client_auth.is_some())
            .finish()
    }
}

pub fn load_credentials(paths: &TlsPaths) -> Result<BrokerCredentials, ConfigError> {
    let ca = read_certificates(&paths.ca)?;
    let client_auth = match &paths.client_auth {
        Some((cert, key)) => Some((read_certificates(cert)?, read_private_key(key)?)),
        None => None,
    };
    log::info!(
        "Loaded broker credentials (CA: {}, client certificate: {})",
        paths.ca.display(),
        client_auth.is_some()
    );
    Ok(BrokerCredentials { ca, client_auth })
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|e| ConfigError::Credential {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn read_certificates(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let bytes = read_pem(path)?;
    let certs = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Credential {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ConfigError::Credential {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(bytes)
}

fn read_private_key(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let bytes = read_pem(path)?;
    match rustls_pemfile::private_key(&mut bytes.as_slice()) {
        Ok(Some(_)) => Ok(bytes),
        Ok(None) => Err(ConfigError::Credential {
            path: path.to_path_buf(),
            reason: "no private key found".to_string(),
        }),
        Err(e) => Err(ConfigError::Credential {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}
