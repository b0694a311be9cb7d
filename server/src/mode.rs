//! # Connection Mode
//!
//! The forwarder is always in exactly one [`Link`] mode. Each mode carries
//! only the data that is meaningful for it, so an idle forwarder cannot hold
//! a stale URL and a server-mode forwarder cannot lack one.
//!
//! This module also validates the arguments of `ConnectToServer` and
//! `AcceptClients` before any side effect happens.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use fwd_protocol::ConnectionType;
use url::Url;

use crate::error::{FwdError, FwdResult};

/// Path prefix owned by the control API. Inbound clients cannot be accepted
/// under it.
pub const API_PATH: &str = "/api";

// ─── Link ───────────────────────────────────────────────────────

/// Where the WebSocket side of the relay currently lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Link {
    /// No WebSocket side. Partner messages are dropped.
    #[default]
    None,

    /// We dialed out to `url` and hold (or are re-dialing) one outbound
    /// connection.
    ToWsServer { url: Url },

    /// We accept any number of inbound clients on `endpoint`.
    ToWsClient { endpoint: AcceptEndpoint },
}

impl Link {
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Link::None => ConnectionType::None,
            Link::ToWsServer { .. } => ConnectionType::ToWsServer,
            Link::ToWsClient { .. } => ConnectionType::ToWsClient,
        }
    }

    /// The `wsUrl` reported to observers.
    pub fn ws_url(&self) -> Option<String> {
        match self {
            Link::None => None,
            Link::ToWsServer { url } => Some(url.to_string()),
            Link::ToWsClient { endpoint } => Some(endpoint.to_string()),
        }
    }

    /// Whether an inbound upgrade for `path`, arriving on `surface`, belongs
    /// to this link.
    pub fn accepts(&self, surface: Surface, path: &str) -> bool {
        match self {
            Link::ToWsClient { endpoint } => endpoint.matches(surface, path),
            _ => false,
        }
    }
}

/// Validates a `ConnectToServer` argument.
pub fn parse_server_url(raw: &str) -> FwdResult<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FwdError::InvalidUrl("url is empty".into()));
    }
    let url = Url::parse(raw).map_err(|e| FwdError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(FwdError::InvalidUrl(format!(
            "{raw}: scheme must be ws or wss"
        )));
    }
    if url.host_str().is_none() {
        return Err(FwdError::InvalidUrl(format!("{raw}: missing host")));
    }
    Ok(url)
}

// ─── Accept Endpoint ────────────────────────────────────────────

/// Which HTTP listener an inbound upgrade arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// The listener that also serves the control API.
    Control,
    /// A dedicated listener bound by `AcceptClients`.
    Dedicated(SocketAddr),
}

/// Where inbound clients are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptEndpoint {
    /// A path on the control listener, e.g. `/ws`.
    Path(String),

    /// A dedicated listener, e.g. `127.0.0.1:10125/ws`.
    Listen { addr: SocketAddr, path: String },
}

impl AcceptEndpoint {
    /// Parses `/path` or `host:port[/path]`. Hosts must be IP literals or
    /// `localhost`.
    pub fn parse(raw: &str) -> FwdResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FwdError::InvalidEndpoint("endpoint is empty".into()));
        }

        if raw.starts_with('/') {
            validate_path(raw)?;
            return Ok(AcceptEndpoint::Path(raw.to_string()));
        }

        let (authority, path) = match raw.find('/') {
            Some(idx) => (&raw[..idx], &raw[idx..]),
            None => (raw, "/"),
        };
        validate_path(path)?;
        let addr = parse_authority(authority)
            .ok_or_else(|| FwdError::InvalidEndpoint(format!("{raw}: expected host:port")))?;
        if addr.port() == 0 {
            return Err(FwdError::InvalidEndpoint(format!("{raw}: port must be fixed")));
        }

        Ok(AcceptEndpoint::Listen {
            addr,
            path: path.to_string(),
        })
    }

    /// The dedicated address to bind, if any.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match self {
            AcceptEndpoint::Path(_) => None,
            AcceptEndpoint::Listen { addr, .. } => Some(*addr),
        }
    }

    /// Control-listener paths under `/api` are already taken.
    pub fn collides_with_api(&self) -> bool {
        match self {
            AcceptEndpoint::Path(path) => {
                path == API_PATH || path.starts_with(&format!("{API_PATH}/"))
            }
            AcceptEndpoint::Listen { .. } => false,
        }
    }

    fn matches(&self, surface: Surface, path: &str) -> bool {
        match (self, surface) {
            (AcceptEndpoint::Path(p), Surface::Control) => p == path,
            (AcceptEndpoint::Listen { addr, path: p }, Surface::Dedicated(on)) => {
                *addr == on && p == path
            }
            _ => false,
        }
    }
}

impl fmt::Display for AcceptEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptEndpoint::Path(path) => f.write_str(path),
            AcceptEndpoint::Listen { addr, path } if path == "/" => write!(f, "{addr}"),
            AcceptEndpoint::Listen { addr, path } => write!(f, "{addr}{path}"),
        }
    }
}

fn validate_path(path: &str) -> FwdResult<()> {
    if path.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
        return Err(FwdError::InvalidEndpoint(format!(
            "{path}: path may not contain whitespace, query or fragment"
        )));
    }
    Ok(())
}

fn parse_authority(authority: &str) -> Option<SocketAddr> {
    if let Ok(addr) = authority.parse::<SocketAddr>() {
        return Some(addr);
    }
    let (host, port) = authority.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.eq_ignore_ascii_case("localhost") {
        return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    None
}
