//! Proxy configuration.

use crate::ca::{CertCacheConfig, KeyAlgorithm};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for a [`crate::ProxyServer`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the proxy binds.
    pub listen_addr: SocketAddr,

    /// Root CA certificate PEM location.
    pub ca_cert_path: PathBuf,

    /// Root CA private key PEM location.
    pub ca_key_path: PathBuf,

    /// Drain deadline for graceful shutdown.
    pub shutdown_timeout: Duration,

    /// Toggle HTTPS interception; CONNECT answers `501` when off.
    pub enable_https: bool,

    /// Key flavor for the CA and its minted leaves.
    pub key_algorithm: KeyAlgorithm,

    /// Per-request deadline for plain-HTTP upstream requests.
    pub upstream_timeout: Duration,

    /// Read timeout on the outer HTTP layer, applied to request heads.
    pub read_timeout: Duration,

    /// Write deadline on the outer HTTP layer: writes must make progress
    /// within this bound.
    pub write_timeout: Duration,

    /// Idle deadline on the outer HTTP layer between requests. All three
    /// outer timeouts are lifted once a CONNECT transport is hijacked, so
    /// large MITM body transfers are not cut off.
    pub idle_timeout: Duration,

    /// Trust anchors appended to the webpki roots for upstream TLS
    /// verification.
    pub extra_upstream_roots: Vec<CertificateDer<'static>>,

    /// Leaf certificate cache tuning.
    pub cache: CertCacheConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ca_cert_path: default_ca_path("ca-cert.pem"),
            ca_key_path: default_ca_path("ca-key.pem"),
            shutdown_timeout: Duration::from_secs(30),
            enable_https: true,
            key_algorithm: KeyAlgorithm::Rsa2048,
            upstream_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            extra_upstream_roots: Vec::new(),
            cache: CertCacheConfig::default(),
        }
    }
}

/// Default location for CA files: `~/.gosniffer/<file>`, falling back to the
/// working directory when the home directory cannot be determined.
pub fn default_ca_path(file_name: &str) -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".gosniffer").join(file_name),
        None => PathBuf::from(file_name),
    }
}
