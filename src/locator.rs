//! Endpoint locator: turns a fixed port range into a bound endpoint.
//!
//! Both roles scan the range in ascending order and settle on the first port
//! that works: the server binds a listening socket, the client connects to a
//! waiting server. A failure on one port is reported to the presentation
//! layer and the scan moves on; only exhausting the range is fatal.

use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::{TcpListener, TcpStream};

use crate::events::{Event, Sink};

/// Lowest port tried when nothing else is configured.
pub const DEFAULT_PORT_LOW: u16 = 23525;

/// Highest port tried when nothing else is configured.
pub const DEFAULT_PORT_HIGH: u16 = 23529;

/// Pending connections the kernel may queue on the listening socket.
const LISTEN_BACKLOG: i32 = 1;

/// An inclusive range of TCP port numbers.
///
/// Written in configuration as `"23525-23529"`, or as a single port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortRange {
    /// First port in the range
    pub begin: u16,
    /// Last port in the range, inclusive
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            begin: DEFAULT_PORT_LOW,
            end: DEFAULT_PORT_HIGH,
        }
    }
}

impl PortRange {
    /// Ports in the order they are tried.
    pub fn ports(self) -> std::ops::RangeInclusive<u16> {
        self.begin..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.begin == self.end {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}-{}", self.begin, self.end)
        }
    }
}

/// Port range parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRangeError {
    /// Not a port number or an `a-b` pair
    Unparseable(String),
    /// `a-b` with a > b
    Decreasing(String),
    /// Port 0 means "any" and cannot be scanned
    Zero(String),
}

impl fmt::Display for PortRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRangeError::Unparseable(s) => {
                write!(f, "invalid port range `{}` (expected a port or `a-b`)", s)
            }
            PortRangeError::Decreasing(s) => {
                write!(f, "invalid port range `{}` (must be increasing)", s)
            }
            PortRangeError::Zero(s) => write!(f, "invalid port range `{}` (port 0 not allowed)", s),
        }
    }
}

impl std::error::Error for PortRangeError {}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (begin, end) = match trimmed.split_once('-') {
            Some((a, b)) => (a.trim().parse::<u16>(), b.trim().parse::<u16>()),
            None => (trimmed.parse::<u16>(), trimmed.parse::<u16>()),
        };
        let (begin, end) = match (begin, end) {
            (Ok(begin), Ok(end)) => (begin, end),
            _ => return Err(PortRangeError::Unparseable(s.to_string())),
        };
        if begin == 0 {
            return Err(PortRangeError::Zero(s.to_string()));
        }
        if begin > end {
            return Err(PortRangeError::Decreasing(s.to_string()));
        }
        Ok(PortRange { begin, end })
    }
}

impl TryFrom<String> for PortRange {
    type Error = PortRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which side of the connection is scanning.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Listen,
    Connect,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listen => write!(f, "listen"),
            Role::Connect => write!(f, "connect"),
        }
    }
}

/// Locator exhaustion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// The server could bind none of the ports
    AllPortsBusy(PortRange),
    /// The client could reach no server on any of the ports
    NoServerReachable(PortRange),
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocateError::AllPortsBusy(range) => {
                write!(f, "No available ports between {} and {}", range.begin, range.end)
            }
            LocateError::NoServerReachable(range) => write!(
                f,
                "Unable to connect to any server between ports {} and {}",
                range.begin, range.end
            ),
        }
    }
}

impl std::error::Error for LocateError {}

/// Bind a listening socket on the first free port of `range`.
///
/// Ports are tried in ascending order, each exactly once.
pub async fn locate_listen(
    host: &str,
    range: PortRange,
    sink: &Sink,
) -> Result<(TcpListener, u16), LocateError> {
    for port in range.ports() {
        match listen_on(host, port).await {
            Ok(listener) => {
                sink.post(Event::PortSelected {
                    role: Role::Listen,
                    port,
                });
                return Ok((listener, port));
            }
            Err(e) => sink.post(Event::PortUnavailable {
                role: Role::Listen,
                port,
                reason: e.to_string(),
            }),
        }
    }

    sink.post(Event::RangeExhausted {
        role: Role::Listen,
        range,
    });
    Err(LocateError::AllPortsBusy(range))
}

/// Connect to a server on the first port of `range` that accepts.
pub async fn locate_connect(
    host: &str,
    range: PortRange,
    sink: &Sink,
) -> Result<(TcpStream, u16), LocateError> {
    for port in range.ports() {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                sink.post(Event::PortSelected {
                    role: Role::Connect,
                    port,
                });
                return Ok((stream, port));
            }
            Err(e) => sink.post(Event::PortUnavailable {
                role: Role::Connect,
                port,
                reason: e.to_string(),
            }),
        }
    }

    sink.post(Event::RangeExhausted {
        role: Role::Connect,
        range,
    });
    Err(LocateError::NoServerReachable(range))
}

async fn listen_on(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to an address", host),
            )
        })?;
    TcpListener::from_std(bind_with_backlog(addr)?)
}

/// Create a TCP listener whose accept queue holds a single peer.
fn bind_with_backlog(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // Does not permit sharing a port that is already listening.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
