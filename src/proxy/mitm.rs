//! TLS interception for CONNECT tunnels.
//!
//! After the outer layer hands over the raw transport, the engine mints (or
//! fetches) a leaf certificate for the target hostname, terminates the
//! client's TLS with it, dials the real upstream with full verification, and
//! relays the decrypted HTTP/1.1 exchange request by request: inject the
//! audit header, strip hop-by-hop headers, forward, log the status, write
//! the response back. WebSocket upgrades switch the tunnel to an opaque
//! bidirectional byte copy.

use crate::ca::{CertCache, CertificateAuthority, LeafCertificate};
use crate::error::{ProxyError, Result};
use crate::logger::SharedRequestLog;
use crate::proxy::http1::{
    self, is_websocket_upgrade, request_body_framing, response_body_framing,
    serialize_request_head, set_header, strip_hop_by_hop, MessageReader, RequestHead,
    PROXY_HEADER_NAME, PROXY_HEADER_VALUE,
};
use crate::proxy::split_host_port;
use crate::tls::UpstreamTls;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const KEEP_ALIVE_PROBE: Duration = Duration::from_secs(1);

/// Interception engine for hijacked CONNECT transports.
pub struct MitmEngine {
    ca: Arc<CertificateAuthority>,
    cache: Arc<CertCache>,
    upstream_tls: UpstreamTls,
    log: SharedRequestLog,
}

impl MitmEngine {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        cache: Arc<CertCache>,
        upstream_tls: UpstreamTls,
        log: SharedRequestLog,
    ) -> Self {
        Self {
            ca,
            cache,
            upstream_tls,
            log,
        }
    }

    /// Intercept a hijacked CONNECT transport.
    ///
    /// `authority` is the CONNECT target (`host[:port]`); the `200
    /// Connection Established` line has already been written, so failures
    /// here abort the tunnel rather than answer over HTTP. The graceful
    /// token stops the keep-alive loop at the next request boundary.
    pub async fn intercept<I>(&self, client: I, authority: &str, graceful: CancellationToken)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (host, port) = split_host_port(authority, 443);

        let leaf = match self.obtain_leaf(&host).await {
            Ok(leaf) => leaf,
            Err(e) => {
                // No plaintext fallback: the tunnel dies here.
                self.log
                    .error(&format!("certificate generation failed for {host}"), &e);
                return;
            }
        };

        let acceptor = TlsAcceptor::from(leaf.server_config());
        let mut client_tls = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(client)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if !is_client_disconnect(&e) {
                    self.log
                        .error(&format!("client TLS handshake failed for {host}"), &e);
                }
                return;
            }
            Err(_) => {
                self.log.error(
                    &format!("client TLS handshake failed for {host}"),
                    &"handshake timed out",
                );
                return;
            }
        };

        let upstream = match self.connect_upstream(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                self.log
                    .error(&format!("upstream TLS connection failed for {host}"), &e);
                let _ = client_tls
                    .write_all(&http1::simple_response(502, "Bad Gateway"))
                    .await;
                let _ = client_tls.shutdown().await;
                return;
            }
        };

        self.relay(client_tls, upstream, &host, graceful).await;
    }

    /// Fetch the leaf for a hostname from the cache, minting on a miss.
    async fn obtain_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        if let Some(leaf) = self.cache.get(host).await {
            debug!(%host, "certificate cache hit");
            return Ok(leaf);
        }
        let leaf = Arc::new(self.ca.mint(host, &self.log)?);
        self.cache.put(host.to_string(), Arc::clone(&leaf)).await;
        Ok(leaf)
    }

    async fn connect_upstream(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = match timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProxyError::upstream_connect(host, e.to_string())),
            Err(_) => return Err(ProxyError::upstream_connect(host, "connect timed out")),
        };
        let _ = tcp.set_nodelay(true);

        let server_name = UpstreamTls::server_name(host)?;
        self.upstream_tls
            .connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::tls_handshake(host, e.to_string()))
    }

    /// Serialized request/response loop over the two decrypted streams.
    async fn relay<C, U>(&self, client: C, upstream: U, host: &str, graceful: CancellationToken)
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let (client_read, mut client_write) = tokio::io::split(client);
        let (upstream_read, mut upstream_write) = tokio::io::split(upstream);
        let mut client_reader = MessageReader::new(client_read);
        let mut upstream_reader = MessageReader::new(upstream_read);

        let mut first = true;
        loop {
            if graceful.is_cancelled() {
                break;
            }

            let head = if first {
                match client_reader.read_request_head().await {
                    Ok(Some(head)) => head,
                    Ok(None) => break,
                    Err(e) => {
                        if !is_client_disconnect(&e) {
                            self.log.error(
                                &format!("failed to read request from client for {host}"),
                                &e,
                            );
                        }
                        break;
                    }
                }
            } else {
                match timeout(KEEP_ALIVE_PROBE, client_reader.read_request_head()).await {
                    Err(_) => break,
                    Ok(Ok(Some(head))) => head,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        if !is_client_disconnect(&e) {
                            self.log.error(
                                &format!("error reading keep-alive request for {host}"),
                                &e,
                            );
                        }
                        break;
                    }
                }
            };
            first = false;

            if is_websocket_upgrade(&head) {
                debug!(%host, "websocket upgrade detected");
                self.tunnel_websocket(
                    client_reader,
                    client_write,
                    upstream_reader,
                    upstream_write,
                    head,
                    host,
                )
                .await;
                return;
            }

            let framing = match request_body_framing(&head) {
                Ok(framing) => framing,
                Err(e) => {
                    self.log
                        .error(&format!("failed to parse request from client for {host}"), &e);
                    break;
                }
            };

            let mut head = head;
            strip_hop_by_hop(&mut head.headers);
            set_header(&mut head.headers, PROXY_HEADER_NAME, PROXY_HEADER_VALUE);

            // Headers first, then the body streamed as-is. No deadlines on
            // either side while the body is in flight.
            let wire = serialize_request_head(&head, framing);
            if let Err(e) = upstream_write.write_all(&wire).await {
                self.log
                    .error(&format!("failed to write request to upstream for {host}"), &e);
                break;
            }
            if let Err(e) = client_reader.copy_body(framing, &mut upstream_write).await {
                self.log
                    .error(&format!("failed to forward request body for {host}"), &e);
                break;
            }
            if upstream_write.flush().await.is_err() {
                break;
            }

            let response = match upstream_reader.read_response_head().await {
                Ok(response) => response,
                Err(e) => {
                    self.log.error(
                        &format!("failed to read response from upstream for {host}"),
                        &e,
                    );
                    break;
                }
            };

            self.log.request(host, response.status);

            let response_framing = response_body_framing(&head.method, &response);
            if let Err(e) = client_write.write_all(&response.raw).await {
                if !is_client_disconnect(&e) {
                    self.log
                        .error(&format!("failed to write response to client for {host}"), &e);
                }
                break;
            }
            if let Err(e) = upstream_reader
                .copy_body(response_framing, &mut client_write)
                .await
            {
                if !is_client_disconnect(&e) {
                    self.log
                        .error(&format!("failed to write response to client for {host}"), &e);
                }
                break;
            }
            let _ = client_write.flush().await;
        }

        let _ = client_write.shutdown().await;
        let _ = upstream_write.shutdown().await;
    }

    /// Forward the upgrade untouched, expect `101`, then copy bytes both
    /// ways until either side hits EOF.
    async fn tunnel_websocket<CR, CW, UR, UW>(
        &self,
        mut client_reader: MessageReader<CR>,
        mut client_write: CW,
        mut upstream_reader: MessageReader<UR>,
        mut upstream_write: UW,
        head: RequestHead,
        host: &str,
    ) where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
        UR: AsyncRead + Unpin,
        UW: AsyncWrite + Unpin,
    {
        if let Err(e) = upstream_write.write_all(&head.raw).await {
            self.log.error(
                &format!("failed to send WebSocket upgrade request to {host}"),
                &e,
            );
            return;
        }
        let _ = upstream_write.flush().await;

        let response = match upstream_reader.read_response_head().await {
            Ok(response) => response,
            Err(e) => {
                self.log.error(
                    &format!("failed to read WebSocket upgrade response from {host}"),
                    &e,
                );
                return;
            }
        };

        if response.status != 101 {
            self.log.error(
                &format!("WebSocket upgrade failed for {host}"),
                &format!("got status {}", response.status),
            );
            let framing = response_body_framing(&head.method, &response);
            let _ = client_write.write_all(&response.raw).await;
            let _ = upstream_reader.copy_body(framing, &mut client_write).await;
            let _ = client_write.flush().await;
            return;
        }

        if let Err(e) = client_write.write_all(&response.raw).await {
            if !is_client_disconnect(&e) {
                self.log.error(
                    &format!("failed to send WebSocket upgrade response to client for {host}"),
                    &e,
                );
            }
            return;
        }
        self.log.request(host, response.status);

        // Anything buffered past the parsed heads already belongs to the
        // tunnel and must be flushed before the raw copy starts.
        let buffered = client_reader.take_buffered();
        if !buffered.is_empty() && upstream_write.write_all(&buffered).await.is_err() {
            return;
        }
        let buffered = upstream_reader.take_buffered();
        if !buffered.is_empty() && client_write.write_all(&buffered).await.is_err() {
            return;
        }
        let _ = upstream_write.flush().await;
        let _ = client_write.flush().await;

        let mut client_read = client_reader.into_inner();
        let mut upstream_read = upstream_reader.into_inner();
        // Both directions share one exit: the first EOF or error wins and
        // tears the tunnel down.
        tokio::select! {
            _ = tokio::io::copy(&mut client_read, &mut upstream_write) => {}
            _ = tokio::io::copy(&mut upstream_read, &mut client_write) => {}
        }
        debug!(%host, "websocket tunnel closed");
    }
}

/// Errors produced by a client that simply went away; closed silently.
fn is_client_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
