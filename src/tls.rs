//! TLS configuration for both sides of the intercepted tunnel.
//!
//! Client-facing: the proxy acts as a TLS server presenting a minted leaf
//! certificate. Upstream: the proxy acts as a TLS client with full
//! verification against webpki roots (plus any configured extra anchors).
//! Both sides are restricted to TLS 1.2 and 1.3.

use crate::error::{ProxyError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use std::sync::Once;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

static PROVIDER: Once = Once::new();

pub(crate) fn ensure_crypto_provider() {
    PROVIDER.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Build the server config presenting a minted leaf identity to the client.
pub fn client_facing_config(
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    ensure_crypto_provider();

    let mut config = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| ProxyError::TlsConfig(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Verified TLS client configuration for upstream connections.
pub struct UpstreamTls {
    config: Arc<ClientConfig>,
}

impl UpstreamTls {
    /// Build an upstream config trusting webpki roots plus `extra_roots`.
    pub fn new(extra_roots: &[CertificateDer<'static>]) -> Result<Self> {
        ensure_crypto_provider();

        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
        for root in extra_roots {
            root_store
                .add(root.clone())
                .map_err(|e| ProxyError::TlsConfig(format!("invalid extra trust anchor: {e}")))?;
        }

        let mut config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }

    /// Parse a hostname into the SNI server name.
    pub fn server_name(host: &str) -> Result<ServerName<'static>> {
        ServerName::try_from(host.to_owned())
            .map_err(|e| ProxyError::tls_handshake(host, format!("invalid server name: {e}")))
    }
}
