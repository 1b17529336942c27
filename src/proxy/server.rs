//! Accept loop and per-connection dispatch.
//!
//! Each accepted transport gets its own task and registers with the
//! shutdown coordinator. The outer HTTP layer is hyper's http1 connection;
//! CONNECT requests are answered with `200 Connection Established` and the
//! transport is hijacked via the upgrade mechanism into the MITM engine,
//! everything else is forwarded as plain HTTP. One broken connection never
//! stops the accept loop.

use crate::ca::{CertCache, CertificateAuthority};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logger::SharedRequestLog;
use crate::proxy::handler::{empty_body, error_response, HttpForwarder, ProxyBody};
use crate::proxy::io_timeout::TimedStream;
use crate::proxy::mitm::MitmEngine;
use crate::proxy::shutdown::ShutdownCoordinator;
use crate::tls::UpstreamTls;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Forward proxy server.
pub struct ProxyServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
}

struct ServerState {
    forwarder: HttpForwarder,
    engine: Option<Arc<MitmEngine>>,
    cache: Option<Arc<CertCache>>,
    coordinator: Arc<ShutdownCoordinator>,
    log: SharedRequestLog,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
}

impl ProxyServer {
    /// Bind the listener and assemble the handlers.
    ///
    /// A CA is required when HTTPS interception is enabled; without one the
    /// proxy answers CONNECT with `501`.
    pub async fn bind(
        config: ProxyConfig,
        ca: Option<Arc<CertificateAuthority>>,
        log: SharedRequestLog,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let forwarder = HttpForwarder::new(config.upstream_timeout, Arc::clone(&log))?;

        let (engine, cache) = match (config.enable_https, ca) {
            (true, Some(ca)) => {
                let cache = Arc::new(CertCache::new(config.cache.clone()));
                let upstream_tls = UpstreamTls::new(&config.extra_upstream_roots)?;
                let engine = Arc::new(MitmEngine::new(
                    ca,
                    Arc::clone(&cache),
                    upstream_tls,
                    Arc::clone(&log),
                ));
                (Some(engine), Some(cache))
            }
            _ => (None, None),
        };

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            state: Arc::new(ServerState {
                forwarder,
                engine,
                cache,
                coordinator: ShutdownCoordinator::new(),
                log,
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                idle_timeout: config.idle_timeout,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.state.coordinator)
    }

    pub fn cert_cache(&self) -> Option<Arc<CertCache>> {
        self.state.cache.clone()
    }

    /// Accept connections until shutdown begins.
    ///
    /// The listener is dropped on return, so new connections are refused
    /// once shutdown starts.
    pub async fn run(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("listener lock")
            .take()
            .ok_or_else(|| {
                ProxyError::Io(std::io::Error::other("proxy server is already running"))
            })?;

        let stop = self.state.coordinator.cancellation();
        self.state
            .log
            .info(&format!("proxy listening on {}", self.local_addr));

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(handle_connection(state, stream, peer));
                        }
                        Err(e) => {
                            self.state.log.error("accepting connection", &e);
                        }
                    }
                }
            }
        }
    }

    /// Gracefully drain connections, force-closing after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.state.coordinator.shutdown(timeout).await
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    let local = stream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let record = state.coordinator.track(peer, local);
    let force = record.force_close();
    let graceful = state.coordinator.cancellation();

    let _ = stream.set_nodelay(true);

    // Write and idle deadlines on the outer layer; both lift when the
    // transport is hijacked into a MITM tunnel.
    let hijacked = Arc::new(AtomicBool::new(false));
    let io = TokioIo::new(TimedStream::new(
        stream,
        state.write_timeout,
        state.idle_timeout,
        Arc::clone(&hijacked),
    ));

    let svc_state = Arc::clone(&state);
    let svc_hijacked = Arc::clone(&hijacked);
    let service = service_fn(move |req| {
        let state = Arc::clone(&svc_state);
        let hijacked = Arc::clone(&svc_hijacked);
        async move {
            Ok::<_, std::convert::Infallible>(dispatch(state, peer, local, hijacked, req).await)
        }
    });

    let mut builder = http1::Builder::new();
    builder
        .preserve_header_case(true)
        .title_case_headers(true)
        // Keep the CONNECT reply to the bare status line.
        .auto_date_header(false)
        .timer(TokioTimer::new())
        .header_read_timeout(state.read_timeout);

    let conn = builder.serve_connection(io, service).with_upgrades();
    let mut conn = pin!(conn);
    let mut draining = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "connection closed with error");
                }
                break;
            }
            _ = graceful.cancelled(), if !draining => {
                // Finish the in-flight exchange, then close.
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
            _ = force.cancelled() => break,
        }
    }

    drop(record);
}

async fn dispatch(
    state: Arc<ServerState>,
    peer: SocketAddr,
    local: SocketAddr,
    hijacked: Arc<AtomicBool>,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        connect(state, peer, local, hijacked, req).await
    } else {
        state.forwarder.forward(req).await
    }
}

/// Answer CONNECT, hijack the transport, and hand it to the MITM engine.
async fn connect(
    state: Arc<ServerState>,
    peer: SocketAddr,
    local: SocketAddr,
    hijacked: Arc<AtomicBool>,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        state
            .log
            .error("CONNECT request missing host", &"no authority in request target");
        return error_response(StatusCode::BAD_REQUEST, "Bad Request: missing host");
    };

    let Some(engine) = state.engine.clone() else {
        state
            .log
            .error("CONNECT method", &"HTTPS interception not configured");
        return error_response(StatusCode::NOT_IMPLEMENTED, "HTTPS MITM not configured");
    };

    if req.extensions().get::<OnUpgrade>().is_none() {
        state.log.error(
            &format!("hijacking connection for {authority}"),
            &"transport does not support hijacking",
        );
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    }

    let coordinator = Arc::clone(&state.coordinator);
    let log = Arc::clone(&state.log);
    let graceful = coordinator.cancellation();
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                hijacked.store(true, Ordering::Relaxed);
                let record = coordinator.track(peer, local);
                let force = record.force_close();
                tokio::select! {
                    _ = engine.intercept(TokioIo::new(upgraded), &authority, graceful) => {}
                    _ = force.cancelled() => {}
                }
                drop(record);
            }
            Err(e) => {
                log.error(&format!("hijacking connection for {authority}"), &e);
            }
        }
    });

    let mut response = Response::new(empty_body());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}
