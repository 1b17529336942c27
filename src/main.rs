use anyhow::Context;
use clap::Parser;
use gosniffer::config::default_ca_path;
use gosniffer::{
    CertificateAuthority, KeyAlgorithm, ProxyConfig, ProxyServer, RequestLog, SharedRequestLog,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "gosniffer",
    version,
    about = "Forward HTTP/HTTPS proxy with TLS interception"
)]
struct Args {
    /// Listen address for the proxy server
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Path to the root CA certificate file (default: ~/.gosniffer/ca-cert.pem)
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to the root CA private key file (default: ~/.gosniffer/ca-key.pem)
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value_t = 30)]
    shutdown_timeout: u64,

    /// Enable HTTPS interception
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_https: bool,

    /// CA key algorithm: "rsa" or "ecdsa"
    #[arg(long, default_value = "rsa")]
    ca_key_type: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gosniffer: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let log: SharedRequestLog = Arc::new(RequestLog::new());

    log.info(&format!(
        "GoSniffer v{} - forward proxy with TLS interception",
        gosniffer::VERSION
    ));
    log.info(&format!("listen address: {}", args.addr));

    let algorithm: KeyAlgorithm = args.ca_key_type.parse()?;
    let cert_path = args.ca_cert.unwrap_or_else(|| default_ca_path("ca-cert.pem"));
    let key_path = args.ca_key.unwrap_or_else(|| default_ca_path("ca-key.pem"));

    let ca = if args.enable_https {
        let ca = initialize_ca(&cert_path, &key_path, algorithm, &log)
            .context("failed to initialize CA")?;
        log.info("HTTPS interception enabled");
        Some(Arc::new(ca))
    } else {
        log.info("HTTP-only mode (HTTPS interception disabled)");
        None
    };

    let shutdown_timeout = Duration::from_secs(args.shutdown_timeout);
    let config = ProxyConfig {
        listen_addr: args.addr,
        ca_cert_path: cert_path,
        ca_key_path: key_path,
        shutdown_timeout,
        enable_https: args.enable_https,
        key_algorithm: algorithm,
        ..ProxyConfig::default()
    };

    let server = Arc::new(
        ProxyServer::bind(config, ca, Arc::clone(&log))
            .await
            .context("failed to start proxy server")?,
    );
    let cache = server.cert_cache();

    let run_server = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { run_server.run().await });

    log.info("proxy ready, press Ctrl+C to stop");

    tokio::select! {
        signal = shutdown_signal() => {
            log.info(&format!("received {signal}, shutting down gracefully"));
            server
                .shutdown(shutdown_timeout)
                .await
                .context("shutdown failed")?;
        }
        result = &mut server_task => {
            result.context("proxy server task failed")??;
            anyhow::bail!("proxy server exited unexpectedly");
        }
    }

    if let Some(cache) = cache {
        cache.stop().await;
    }
    log.info("GoSniffer stopped");
    Ok(())
}

/// Load the CA from disk when both files exist, otherwise generate and save
/// a fresh one.
fn initialize_ca(
    cert_path: &Path,
    key_path: &Path,
    algorithm: KeyAlgorithm,
    log: &RequestLog,
) -> gosniffer::Result<CertificateAuthority> {
    if cert_path.exists() && key_path.exists() {
        log.info(&format!("loading existing CA from {}", cert_path.display()));
        let ca = CertificateAuthority::load(cert_path, key_path)?;
        log.info(&format!(
            "loaded root CA certificate (fingerprint: {})",
            ca.fingerprint()
        ));
        return Ok(ca);
    }

    log.info(&format!("generating new {algorithm} CA certificate"));
    let ca = CertificateAuthority::generate(algorithm)?;
    ca.save(cert_path, key_path)?;
    log.info(&format!(
        "CA certificate saved to {} (fingerprint: {})",
        cert_path.display(),
        ca.fingerprint()
    ));
    log.info("install the root CA certificate on client devices to avoid certificate warnings");
    Ok(ca)
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return "interrupt";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "interrupt",
            _ = term.recv() => "terminate signal",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}
