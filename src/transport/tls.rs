//! TLS termination for listeners
//!
//! Builds a rustls server acceptor from a PEM certificate chain and private
//! key. Encrypted private keys are not supported; a configured password is
//! ignored with a warning.

use crate::config::TlsConfig;
use crate::error::ProxyError;
use anyhow::{Context, Result};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::ring::default_provider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open certificate file: {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates from: {:?}", path))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("No certificates found in {:?}", path)).into());
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open key file: {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key from: {:?}", path))?
        .ok_or_else(|| ProxyError::Tls(format!("No private key found in {:?}", path)).into())
}

/// Build a TLS acceptor from listener TLS settings
pub fn load_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| ProxyError::Tls("cert_path is not set".to_string()))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| ProxyError::Tls("key_path is not set".to_string()))?;

    if config.password.is_some() {
        warn!("TLS key password is ignored; provide an unencrypted PEM key");
    }

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let server_config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
