//! Shared fixtures: an in-process proxy, plain and TLS echo servers, and a
//! capturing log sink.

#![allow(dead_code)]

use gosniffer::{CertificateAuthority, ProxyConfig, ProxyServer, RequestLog, SharedRequestLog};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Log sink that keeps everything in memory for assertions.
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn new() -> (SharedRequestLog, LogCapture) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::new(RequestLog::with_sink(Box::new(CaptureSink(Arc::clone(
            &buf,
        )))));
        (log, LogCapture { buf })
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }
}

/// Proxy config bound to an ephemeral localhost port.
pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..ProxyConfig::default()
    }
}

/// Bind and run a proxy; returns the server handle, its address, and the
/// accept-loop task.
pub async fn start_proxy(
    config: ProxyConfig,
    ca: Option<Arc<CertificateAuthority>>,
    log: SharedRequestLog,
) -> (
    Arc<ProxyServer>,
    SocketAddr,
    JoinHandle<gosniffer::Result<()>>,
) {
    let server = Arc::new(
        ProxyServer::bind(config, ca, log)
            .await
            .expect("bind proxy"),
    );
    let addr = server.local_addr();
    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, addr, task)
}

/// reqwest client routed through the proxy for both schemes.
pub fn proxy_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Like [`proxy_client`], additionally trusting the proxy's root CA.
pub fn proxy_client_trusting(proxy_addr: SocketAddr, ca: &CertificateAuthority) -> reqwest::Client {
    let root = reqwest::Certificate::from_pem(ca.cert_pem().as_bytes()).unwrap();
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .add_root_certificate(root)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let proxied_by = header_string(&req, "x-proxied-by");
    let proxy_authorization = header_string(&req, "proxy-authorization");
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let mut builder = Response::builder().header("echo-x-proxied-by", &proxied_by);
    if !proxy_authorization.is_empty() {
        builder = builder.header("echo-proxy-authorization", &proxy_authorization);
    }

    let response = match path.as_str() {
        "/delay" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            builder
                .status(200)
                .body(Full::new(Bytes::from_static(b"delayed response")))
        }
        "/redirect" => builder
            .status(302)
            .header("location", "http://example.com/elsewhere")
            .body(Full::new(Bytes::new())),
        _ if method == Method::POST => builder.status(201).body(Full::new(body)),
        _ => builder
            .status(200)
            .body(Full::new(Bytes::from_static(b"test response"))),
    };

    Ok(response.expect("build echo response"))
}

fn header_string(req: &Request<Incoming>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Plain-HTTP echo server on an ephemeral port.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });

    addr
}

/// TLS echo server presenting a `localhost` certificate minted by
/// `upstream_ca`.
pub async fn start_tls_echo_server(upstream_ca: &CertificateAuthority) -> SocketAddr {
    let quiet = RequestLog::with_sink(Box::new(std::io::sink()));
    let leaf = upstream_ca
        .mint("localhost", &quiet)
        .expect("mint upstream leaf");
    let acceptor = TlsAcceptor::from(leaf.server_config());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tls echo");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(echo))
                    .await;
            });
        }
    });

    addr
}
