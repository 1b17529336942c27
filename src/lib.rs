//! GoSniffer - forward HTTP/HTTPS proxy with TLS interception
//!
//! GoSniffer transparently intercepts client traffic, performing TLS
//! man-in-the-middle inspection on HTTPS with leaf certificates minted from
//! a locally managed root CA. Every proxied request is logged with its
//! target hostname and upstream status, and tagged with an
//! `X-Proxied-By: GoSniffer` header. Intended for local debugging, security
//! research, and authorized monitoring.
//!
//! ## Features
//!
//! - **HTTP forwarding**: origin-form requests relayed upstream with
//!   hop-by-hop headers stripped and redirects passed through verbatim
//! - **HTTPS interception**: CONNECT tunnels terminated with per-hostname
//!   certificates, upstream connections fully verified (TLS 1.2-1.3)
//! - **Certificate cache**: LRU + TTL cache with a background sweeper
//! - **WebSocket passthrough**: upgrades detected and tunneled opaquely
//! - **Graceful shutdown**: in-flight connections drain within a deadline
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gosniffer::{CertificateAuthority, KeyAlgorithm, ProxyConfig, ProxyServer, RequestLog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> gosniffer::Result<()> {
//!     let log = Arc::new(RequestLog::new());
//!     let ca = Arc::new(CertificateAuthority::generate(KeyAlgorithm::Rsa2048)?);
//!     let server = ProxyServer::bind(ProxyConfig::default(), Some(ca), log).await?;
//!     server.run().await
//! }
//! ```

pub mod ca;
pub mod config;
pub mod error;
pub mod logger;
pub mod proxy;
pub mod tls;

pub use ca::{CertCache, CertCacheConfig, CertificateAuthority, KeyAlgorithm, LeafCertificate};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use logger::{RequestLog, SharedRequestLog};
pub use proxy::{MitmEngine, ProxyServer, ShutdownCoordinator};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
