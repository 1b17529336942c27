//! Proxy server: accept loop, plain-HTTP forwarding, and the MITM engine.

pub mod handler;
pub mod http1;
pub mod io_timeout;
pub mod mitm;
pub mod server;
pub mod shutdown;

pub use mitm::MitmEngine;
pub use server::ProxyServer;
pub use shutdown::ShutdownCoordinator;

/// Split `host[:port]`, falling back to `default_port`.
///
/// Handles bracketed IPv6 authorities; a bare IPv6 address is treated as
/// having no port.
pub(crate) fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once(']') {
            let port = port
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        _ => (authority.to_string(), default_port),
    }
}
