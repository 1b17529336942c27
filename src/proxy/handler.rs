//! Plain-HTTP proxy requests: forward upstream and relay the response.
//!
//! Redirect following is disabled so 3xx responses pass through verbatim,
//! and the per-request upstream deadline maps to `504 Gateway Timeout`.

use crate::error::{ProxyError, Result};
use crate::logger::SharedRequestLog;
use crate::proxy::http1::{self, PROXY_HEADER_VALUE};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use std::time::Duration;
use tracing::debug;

/// Unified body type for every response the proxy writes.
pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

const PROXY_HEADER: HeaderName = HeaderName::from_static("x-proxied-by");

/// Upstream client for non-CONNECT proxy requests.
pub struct HttpForwarder {
    client: reqwest::Client,
    log: SharedRequestLog,
}

impl HttpForwarder {
    pub fn new(upstream_timeout: Duration, log: SharedRequestLog) -> Result<Self> {
        crate::tls::ensure_crypto_provider();
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(upstream_timeout)
            .build()
            .map_err(|e| ProxyError::ClientSetup(e.to_string()))?;
        Ok(Self { client, log })
    }

    /// Forward an absolute-form request upstream and stream back the
    /// response. Errors become `502`/`504`/`500` responses; they never
    /// propagate to the connection loop.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let hostname = request_hostname(&req);
        let url = req.uri().to_string();

        let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                self.log
                    .error(&format!("building upstream request for {hostname}"), &e);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create upstream request",
                );
            }
        };

        // Host, Content-Length and body framing are re-established by the
        // upstream client; copying them alongside a streamed body would
        // produce conflicting framing.
        let mut headers = http::HeaderMap::new();
        for (name, value) in req.headers() {
            let name_str = name.as_str();
            if http1::is_hop_by_hop(name_str)
                || name_str.eq_ignore_ascii_case("host")
                || name_str.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(PROXY_HEADER, HeaderValue::from_static(PROXY_HEADER_VALUE));

        let has_body = req
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .is_some_and(|len| len > 0)
            || req.headers().contains_key(http::header::TRANSFER_ENCODING);

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if has_body {
            builder =
                builder.body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()));
        }

        debug!(%hostname, %url, "forwarding plain HTTP request");
        match builder.send().await {
            Ok(upstream) => {
                let status = upstream.status();
                let mut builder = Response::builder().status(status);
                if let Some(out) = builder.headers_mut() {
                    for (name, value) in upstream.headers() {
                        out.append(name.clone(), value.clone());
                    }
                }

                self.log.request(&hostname, status.as_u16());

                let stream = upstream
                    .bytes_stream()
                    .map_ok(Frame::data)
                    .map_err(std::io::Error::other);
                builder
                    .body(StreamBody::new(stream).boxed())
                    .unwrap_or_else(|_| {
                        error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Failed to relay upstream response",
                        )
                    })
            }
            Err(e) if e.is_builder() => {
                self.log
                    .error(&format!("building upstream request for {hostname}"), &e);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create upstream request",
                )
            }
            Err(e) if e.is_timeout() => {
                self.log
                    .error(&format!("forwarding request to {hostname}"), &e);
                error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Gateway Timeout: upstream deadline exceeded",
                )
            }
            Err(e) => {
                self.log
                    .error(&format!("forwarding request to {hostname}"), &e);
                error_response(
                    StatusCode::BAD_GATEWAY,
                    "Bad Gateway: upstream server unreachable",
                )
            }
        }
    }
}

/// Target hostname of a proxy request, without the port.
///
/// Prefers the absolute-form URL's host, falling back to the `Host` header.
pub fn request_hostname<B>(req: &Request<B>) -> String {
    if let Some(host) = req.uri().host() {
        return host.to_string();
    }
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|authority| crate::proxy::split_host_port(authority, 80).0)
        .unwrap_or_default()
}

pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONNECTION, "close")
        .body(full_body(message.to_string()))
        .unwrap_or_else(|_| Response::new(full_body(String::new())))
}

pub fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(infallible).boxed()
}

pub fn full_body(message: String) -> ProxyBody {
    Full::new(Bytes::from(message)).map_err(infallible).boxed()
}

fn infallible(never: std::convert::Infallible) -> std::io::Error {
    match never {}
}
