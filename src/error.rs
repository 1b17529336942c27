//! Error types for the proxy.

use std::io;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy-wide errors with the failing operation and target attached.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Unknown CA key algorithm requested
    #[error("unsupported key algorithm: {0} (must be \"rsa\" or \"ecdsa\")")]
    UnsupportedAlgorithm(String),

    /// Private key does not meet minimum strength requirements
    #[error("key strength validation failed: {0}")]
    KeyStrength(String),

    /// Private key bytes could not be decoded
    #[error("failed to decode private key: {0}")]
    KeyDecode(String),

    /// Root CA generation failed
    #[error("failed to generate CA: {0}")]
    CaGeneration(String),

    /// Root CA could not be read or parsed from disk
    #[error("failed to load CA from {path}: {reason}")]
    CaLoad { path: String, reason: String },

    /// Root CA could not be persisted
    #[error("failed to save CA to {path}: {source}")]
    CaSave { path: String, source: io::Error },

    /// Leaf certificate minting failed
    #[error("certificate generation failed for {hostname}: {reason}")]
    CertGeneration { hostname: String, reason: String },

    /// TLS handshake failed (either side of the tunnel)
    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshake { host: String, reason: String },

    /// Upstream TCP/TLS connection failed
    #[error("upstream connection failed for {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    /// Malformed inner HTTP request
    #[error("request parsing failed: {0}")]
    RequestParse(String),

    /// Malformed inner HTTP response
    #[error("response parsing failed: {0}")]
    ResponseParse(String),

    /// Upstream HTTP client could not be constructed
    #[error("upstream client setup failed: {0}")]
    ClientSetup(String),

    /// TLS configuration could not be built
    #[error("TLS configuration failed: {0}")]
    TlsConfig(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Connections survived the forced-close grace period
    #[error("{0} connection(s) still open after forced shutdown")]
    ShutdownTimeout(usize),
}

impl ProxyError {
    pub fn ca_generation(reason: impl Into<String>) -> Self {
        Self::CaGeneration(reason.into())
    }

    pub fn ca_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CaLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn cert_generation(hostname: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CertGeneration {
            hostname: hostname.into(),
            reason: reason.into(),
        }
    }

    pub fn tls_handshake(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TlsHandshake {
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub fn upstream_connect(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamConnect {
            host: host.into(),
            reason: reason.into(),
        }
    }
}
