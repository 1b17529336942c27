//! HTTP/1.1 codec for the decrypted relay.
//!
//! The MITM engine speaks HTTP/1.1 directly on the two TLS streams, so this
//! module provides incremental head reading (httparse), body framing
//! (Content-Length, chunked passthrough, read-to-EOF), request serialization
//! with header mutation, and WebSocket-upgrade detection. Chunked bodies are
//! forwarded verbatim, chunk framing included, so nothing is re-encoded.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Audit header injected into every forwarded request.
pub const PROXY_HEADER_NAME: &str = "X-Proxied-By";
pub const PROXY_HEADER_VALUE: &str = "GoSniffer";

/// Hop-by-hop headers removed before forwarding (RFC 7230 section 6.1).
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const MAX_HEAD_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

/// Parsed request head plus its exact wire bytes.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub raw: Bytes,
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

/// Parsed response head plus its exact wire bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub raw: Bytes,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// How the message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    UntilEof,
}

/// Buffered reader that parses HTTP/1.1 messages off a byte stream.
///
/// Bytes read past the current message stay buffered for the next one, which
/// is what keeps pipelined keep-alive requests and WebSocket tunneling
/// correct.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Drain bytes buffered past the last parsed message.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Give back the underlying stream. Buffered bytes must be drained first.
    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Read one request head. `None` means clean EOF before any bytes.
    pub async fn read_request_head(&mut self) -> io::Result<Option<RequestHead>> {
        match self.read_head_bytes().await? {
            Some(raw) => parse_request_head(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Read one response head; EOF here is always an error.
    pub async fn read_response_head(&mut self) -> io::Result<ResponseHead> {
        let raw = self.read_head_bytes().await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            )
        })?;
        parse_response_head(raw)
    }

    async fn read_head_bytes(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(end) = find_head_end(&self.buf) {
                return Ok(Some(self.buf.split_to(end).freeze()));
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(invalid_data("message head exceeds maximum size"));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-head",
                ));
            }
        }
    }

    /// Stream a message body to `writer` according to its framing.
    pub async fn copy_body<W: AsyncWrite + Unpin>(
        &mut self,
        framing: BodyFraming,
        writer: &mut W,
    ) -> io::Result<u64> {
        match framing {
            BodyFraming::None => Ok(0),
            BodyFraming::ContentLength(n) => self.copy_exact(n, writer).await,
            BodyFraming::Chunked => self.copy_chunked(writer).await,
            BodyFraming::UntilEof => self.copy_until_eof(writer).await,
        }
    }

    async fn copy_exact<W: AsyncWrite + Unpin>(
        &mut self,
        len: u64,
        writer: &mut W,
    ) -> io::Result<u64> {
        let mut remaining = len;
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                ));
            }
            let take = remaining.min(self.buf.len() as u64) as usize;
            let chunk = self.buf.split_to(take);
            writer.write_all(&chunk).await?;
            remaining -= take as u64;
        }
        Ok(len)
    }

    async fn copy_until_eof<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Ok(total);
            }
            let chunk = self.buf.split();
            writer.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
    }

    async fn copy_chunked<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let line = self.read_line().await?;
            let size = parse_chunk_size(&line)?;
            writer.write_all(&line).await?;
            total += line.len() as u64;
            if size == 0 {
                break;
            }
            // Chunk data plus its trailing CRLF.
            total += self.copy_exact(size + 2, writer).await?;
        }
        // Trailer section ends at an empty line.
        loop {
            let line = self.read_line().await?;
            writer.write_all(&line).await?;
            total += line.len() as u64;
            if line.as_ref() == b"\r\n" {
                break;
            }
        }
        Ok(total)
    }

    async fn read_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                return Ok(self.buf.split_to(pos + 2).freeze());
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(invalid_data("line exceeds maximum size"));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-line",
                ));
            }
        }
    }
}

fn parse_request_head(raw: Bytes) -> io::Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(invalid_data("incomplete request head")),
        Err(e) => return Err(invalid_data(format!("invalid request head: {e}"))),
    }

    let method = req
        .method
        .ok_or_else(|| invalid_data("request line missing method"))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| invalid_data("request line missing target"))?
        .to_string();
    let headers = collect_headers(req.headers)?;

    Ok(RequestHead {
        raw,
        method,
        target,
        headers,
    })
}

fn parse_response_head(raw: Bytes) -> io::Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(invalid_data("incomplete response head")),
        Err(e) => return Err(invalid_data(format!("invalid response head: {e}"))),
    }

    let status = resp
        .code
        .ok_or_else(|| invalid_data("status line missing code"))?;
    let headers = collect_headers(resp.headers)?;

    Ok(ResponseHead {
        raw,
        status,
        headers,
    })
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> io::Result<Vec<(String, String)>> {
    parsed
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| invalid_data(format!("non-UTF-8 value for header {}", h.name)))?;
            Ok((h.name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Determine request body framing from its headers.
pub fn request_body_framing(head: &RequestHead) -> io::Result<BodyFraming> {
    if let Some(te) = header_value(&head.headers, "transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(invalid_data(format!("unsupported transfer encoding: {te}")));
    }
    if let Some(cl) = header_value(&head.headers, "content-length") {
        let len = cl
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid_data(format!("invalid content length: {cl}")))?;
        return Ok(BodyFraming::ContentLength(len));
    }
    Ok(BodyFraming::None)
}

/// Determine response body framing given the request method it answers.
pub fn response_body_framing(request_method: &str, head: &ResponseHead) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&head.status)
        || head.status == 204
        || head.status == 304
    {
        return BodyFraming::None;
    }
    if let Some(te) = header_value(&head.headers, "transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return BodyFraming::Chunked;
        }
    }
    if let Some(cl) = header_value(&head.headers, "content-length") {
        if let Ok(len) = cl.trim().parse::<u64>() {
            return BodyFraming::ContentLength(len);
        }
    }
    BodyFraming::UntilEof
}

/// Serialize a (mutated) request head back to wire form.
///
/// The target is emitted in origin-form; chunked framing stripped with the
/// hop-by-hop headers is restored here so the body stays parseable.
pub fn serialize_request_head(head: &RequestHead, framing: BodyFraming) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.raw.len() + 64);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, head.target).as_bytes());
    for (name, value) in &head.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if framing == BodyFraming::Chunked {
        out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Minimal serialized response for signaling errors over a raw stream.
pub fn simple_response(status: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .into_bytes()
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Remove hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| !is_hop_by_hop(name));
}

/// First value of a header, compared case-insensitively.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Replace the first occurrence of a header, or append it.
pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(entry) = headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        entry.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}

/// `Upgrade: websocket` with a `Connection` header containing `upgrade`.
pub fn is_websocket_upgrade(head: &RequestHead) -> bool {
    let upgrade = header_value(&head.headers, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = header_value(&head.headers, "connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| invalid_data("non-UTF-8 chunk size line"))?
        .trim_end_matches("\r\n");
    let size_part = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_part, 16)
        .map_err(|_| invalid_data(format!("invalid chunk size: {text}")))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct VecWriter(Vec<u8>);

    impl AsyncWrite for VecWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn parses_request_head_and_headers() {
        let wire = b"GET /path?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        let head = reader.read_request_head().await.unwrap().unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/path?q=1");
        assert_eq!(header_value(&head.headers, "host"), Some("example.com"));
        assert_eq!(head.raw.as_ref(), &wire[..]);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut reader = MessageReader::new(&b""[..]);
        assert!(reader.read_request_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let mut reader = MessageReader::new(&b"GET / HTTP/1.1\r\nHost: e"[..]);
        let err = reader.read_request_head().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn pipelined_requests_parse_sequentially() {
        let wire = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        let a = reader.read_request_head().await.unwrap().unwrap();
        let b = reader.read_request_head().await.unwrap().unwrap();
        assert_eq!(a.target, "/a");
        assert_eq!(b.target, "/b");
    }

    #[tokio::test]
    async fn content_length_body_copies_exactly() {
        let wire = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let mut reader = MessageReader::new(&wire[..]);
        let head = reader.read_request_head().await.unwrap().unwrap();
        let framing = request_body_framing(&head).unwrap();
        assert_eq!(framing, BodyFraming::ContentLength(5));

        let mut out = VecWriter(Vec::new());
        let copied = reader.copy_body(framing, &mut out).await.unwrap();
        assert_eq!(copied, 5);
        assert_eq!(out.0, b"hello");
        assert_eq!(reader.take_buffered().as_ref(), b"EXTRA");
    }

    #[tokio::test]
    async fn chunked_body_passes_through_verbatim() {
        let body = b"5;ext=1\r\nhello\r\n3\r\nabc\r\n0\r\nX-Trailer: v\r\n\r\n";
        let mut wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        wire.extend_from_slice(body);

        let mut reader = MessageReader::new(&wire[..]);
        let head = reader.read_response_head().await.unwrap();
        assert_eq!(head.status, 200);
        let framing = response_body_framing("GET", &head);
        assert_eq!(framing, BodyFraming::Chunked);

        let mut out = VecWriter(Vec::new());
        reader.copy_body(framing, &mut out).await.unwrap();
        assert_eq!(out.0, body.to_vec());
    }

    #[tokio::test]
    async fn head_and_no_content_responses_have_no_body() {
        let wire = b"HTTP/1.1 204 No Content\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        let head = reader.read_response_head().await.unwrap();
        assert_eq!(response_body_framing("GET", &head), BodyFraming::None);

        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        let head = reader.read_response_head().await.unwrap();
        assert_eq!(response_body_framing("HEAD", &head), BodyFraming::None);
    }

    #[tokio::test]
    async fn response_without_framing_reads_to_eof() {
        let wire = b"HTTP/1.1 200 OK\r\n\r\nall the rest";
        let mut reader = MessageReader::new(&wire[..]);
        let head = reader.read_response_head().await.unwrap();
        let framing = response_body_framing("GET", &head);
        assert_eq!(framing, BodyFraming::UntilEof);

        let mut out = VecWriter(Vec::new());
        reader.copy_body(framing, &mut out).await.unwrap();
        assert_eq!(out.0, b"all the rest");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped_and_audit_header_injected() {
        let mut headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Keep-Alive".to_string(), "timeout=5".to_string()),
            ("Proxy-Authenticate".to_string(), "Basic".to_string()),
            ("Proxy-Authorization".to_string(), "Basic Zm9v".to_string()),
            ("TE".to_string(), "trailers".to_string()),
            ("Trailers".to_string(), "X-T".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Upgrade".to_string(), "h2c".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ];
        strip_hop_by_hop(&mut headers);
        set_header(&mut headers, PROXY_HEADER_NAME, PROXY_HEADER_VALUE);

        assert_eq!(headers.len(), 3);
        assert!(header_value(&headers, "connection").is_none());
        assert!(header_value(&headers, "transfer-encoding").is_none());
        assert_eq!(
            header_value(&headers, "x-proxied-by"),
            Some(PROXY_HEADER_VALUE)
        );
    }

    #[test]
    fn serialization_restores_chunked_framing() {
        let head = RequestHead {
            raw: Bytes::new(),
            method: "POST".into(),
            target: "/upload".into(),
            headers: vec![("Host".into(), "example.com".into())],
        };
        let wire = serialize_request_head(&head, BodyFraming::Chunked);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn websocket_upgrade_detection_is_case_insensitive() {
        let head = RequestHead {
            raw: Bytes::new(),
            method: "GET".into(),
            target: "/ws".into(),
            headers: vec![
                ("Upgrade".into(), "WebSocket".into()),
                ("Connection".into(), "keep-alive, Upgrade".into()),
            ],
        };
        assert!(is_websocket_upgrade(&head));

        let plain = RequestHead {
            raw: Bytes::new(),
            method: "GET".into(),
            target: "/".into(),
            headers: vec![("Connection".into(), "upgrade".into())],
        };
        assert!(!is_websocket_upgrade(&plain));
    }

    #[test]
    fn set_header_replaces_existing_value() {
        let mut headers = vec![("X-Proxied-By".to_string(), "SomethingElse".to_string())];
        set_header(&mut headers, PROXY_HEADER_NAME, PROXY_HEADER_VALUE);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].1, PROXY_HEADER_VALUE);
    }

    #[test]
    fn chunk_size_parsing_handles_extensions() {
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"5;name=value\r\n").unwrap(), 5);
        assert!(parse_chunk_size(b"zz\r\n").is_err());
    }
}
