//! Default TCP connector for the glasses' link-local endpoints.
//!
//! The glasses appear as a USB network adapter with a fixed link-local
//! address, so candidate resolution filters accordingly: a 169.254.* host
//! only considers 169.254/16 candidates. Embedders with their own candidate
//! selection hand pre-connected sockets to the client instead.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_HOST, DEFAULT_STREAM_PORT};
use crate::{Error, Result};

const LINK_LOCAL_PREFIX: &str = "169.254.";

#[derive(Debug, Clone)]
pub struct NetOptions {
    pub host: String,
    pub control_port: u16,
    pub stream_port: u16,
    pub connect_timeout: Duration,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

fn is_link_local(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(v4) => v4.ip().is_link_local(),
        SocketAddr::V6(_) => false,
    }
}

/// Connect to one of the device's ports, trying candidates in order.
pub(crate) fn connect(options: &NetOptions, port: u16) -> Result<TcpStream> {
    let host = options.host.as_str();
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::NetworkUnavailable(format!("{host}: {e}")))?
        .filter(|addr| !host.starts_with(LINK_LOCAL_PREFIX) || is_link_local(addr))
        .collect();
    if candidates.is_empty() {
        return Err(Error::NetworkUnavailable(host.to_string()));
    }

    let mut last_error = None;
    for addr in &candidates {
        log::debug!("connecting to {addr}");
        match TcpStream::connect_timeout(addr, options.connect_timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(Error::ConnectionFailed(format!(
        "{host}:{port}: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}
