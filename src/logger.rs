//! Request logging with hostname sanitization.
//!
//! Output is a single line per record on the configured sink (stdout by
//! default): `[RFC3339] hostname - status` for proxied requests, categorized
//! prefixes for everything else. Hostnames and free-text fields are sanitized
//! before emission so untrusted input cannot inject fake log entries. Logging
//! is best-effort and never fails the proxy.

use chrono::{SecondsFormat, Utc};
use std::fmt::Display;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// RFC 1035 maximum DNS name length; longer fields are truncated.
const MAX_FIELD_LEN: usize = 253;

pub type SharedRequestLog = Arc<RequestLog>;

/// Sanitizing logger for request, info, error and certificate records.
pub struct RequestLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl RequestLog {
    /// Create a logger writing to stdout.
    pub fn new() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    /// Create a logger writing to an arbitrary sink.
    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Log a proxied request with its upstream status code.
    pub fn request(&self, hostname: &str, status: u16) {
        self.write_line(&format_request_entry(hostname, status));
    }

    /// Log an informational message.
    pub fn info(&self, message: &str) {
        self.write_line(&format!("[INFO] {}", sanitize(message)));
    }

    /// Log an error with the operation that failed.
    pub fn error(&self, context: &str, err: &dyn Display) {
        self.write_line(&format!(
            "[ERROR] {}: {}",
            sanitize(context),
            sanitize(&err.to_string())
        ));
    }

    /// Log a certificate generation event with its SHA-256 fingerprint.
    pub fn cert(&self, hostname: &str, fingerprint: &str) {
        self.write_line(&format!(
            "[CERT] Generated leaf certificate for {} (fingerprint: {})",
            sanitize(hostname),
            sanitize(fingerprint)
        ));
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{line}");
            let _ = sink.flush();
        }
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a request record without emitting it.
pub fn format_request_entry(hostname: &str, status: u16) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format!("[{}] {} - {}", timestamp, sanitize(hostname), status)
}

/// Remove CR/LF/TAB and ASCII control characters, truncate to 253 bytes.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_FIELD_LEN));
    for ch in input.chars() {
        let mapped = match ch {
            '\t' => Some(' '),
            c if (c as u32) < 32 || c as u32 == 127 => None,
            c => Some(c),
        };
        let Some(c) = mapped else { continue };
        if out.len() + c.len_utf8() > MAX_FIELD_LEN {
            break;
        }
        out.push(c);
    }
    out
}
