//! Server and client configuration.
//!
//! Defaults are overridden by environment variables, which the binary's CLI
//! flags override in turn.  Unparsable values are logged and ignored.
//!
//! | Variable                       | Field                               |
//! |--------------------------------|-------------------------------------|
//! | `HANDSHAKE_SERVER_ADDRESS`     | server bind / client target address |
//! | `HANDSHAKE_SERVER_PORT`        | server port                         |
//! | `HANDSHAKE_CLIENT_TIMEOUT_MS`  | client receive timeout              |
//! | `HANDSHAKE_INITIAL_SEQUENCE`   | client's first sequence number      |
//! | `HANDSHAKE_MAX_IN_FLIGHT`      | cap on concurrent packet tasks      |
//! | `HANDSHAKE_SESSION_IDLE_SECS`  | idle session expiry                 |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_SERVER_ADDRESS: &str = "HANDSHAKE_SERVER_ADDRESS";
pub const ENV_SERVER_PORT: &str = "HANDSHAKE_SERVER_PORT";
pub const ENV_CLIENT_TIMEOUT_MS: &str = "HANDSHAKE_CLIENT_TIMEOUT_MS";
pub const ENV_INITIAL_SEQUENCE: &str = "HANDSHAKE_INITIAL_SEQUENCE";
pub const ENV_MAX_IN_FLIGHT: &str = "HANDSHAKE_MAX_IN_FLIGHT";
pub const ENV_SESSION_IDLE_SECS: &str = "HANDSHAKE_SESSION_IDLE_SECS";

/// Default UDP port for the server.
pub const DEFAULT_PORT: u16 = 9000;

/// How long the client waits for any single reply.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Sequence number carried by the client's first SYN.
pub const DEFAULT_INITIAL_SEQUENCE: u32 = 1;

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Start with discard mode on.
    pub discard_mode: bool,
    /// Upper bound on concurrently running per-datagram tasks (`None` = unbounded).
    pub max_in_flight: Option<usize>,
    /// Expire sessions idle this long (`None` = keep forever).
    pub session_idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            discard_mode: false,
            max_in_flight: None,
            session_idle_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values produced by `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut c = Self::default();
        if let Some(addr) = parse_var(&lookup, ENV_SERVER_ADDRESS) {
            c.bind_addr = addr;
        }
        if let Some(port) = parse_var(&lookup, ENV_SERVER_PORT) {
            c.port = port;
        }
        if let Some(n) = parse_var::<usize>(&lookup, ENV_MAX_IN_FLIGHT) {
            c.max_in_flight = (n > 0).then_some(n);
        }
        if let Some(secs) = parse_var(&lookup, ENV_SESSION_IDLE_SECS) {
            c.session_idle_timeout = Some(Duration::from_secs(secs));
        }
        c
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_addr: IpAddr,
    pub server_port: u16,
    pub recv_timeout: Duration,
    pub initial_sequence: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: DEFAULT_PORT,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            initial_sequence: DEFAULT_INITIAL_SEQUENCE,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut c = Self::default();
        if let Some(addr) = parse_var(&lookup, ENV_SERVER_ADDRESS) {
            c.server_addr = addr;
        }
        if let Some(port) = parse_var(&lookup, ENV_SERVER_PORT) {
            c.server_port = port;
        }
        if let Some(ms) = parse_var(&lookup, ENV_CLIENT_TIMEOUT_MS) {
            c.recv_timeout = Duration::from_millis(ms);
        }
        if let Some(seq) = parse_var(&lookup, ENV_INITIAL_SEQUENCE) {
            c.initial_sequence = seq;
        }
        c
    }

    /// Address the client sends to.
    pub fn server(&self) -> SocketAddr {
        SocketAddr::new(self.server_addr, self.server_port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}
