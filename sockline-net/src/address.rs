//! Peer address types and parsing logic.
//!
//! A peer is either an IPv4 endpoint or a Unix domain socket path. Two addresses identify the same
//! peer exactly when their canonical string forms are equal.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::AddressFamily;

/// Canonical identifier of a remote (or local) endpoint.
///
/// The [`Display`] form is the canonical form: `ip:port` for IPv4 and the plain path for Unix
/// sockets. Equality and hashing are defined on it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum PeerAddress {
    /// IPv4 address and port.
    Ipv4(SocketAddrV4),

    /// Unix domain socket path.
    Unix(Utf8PathBuf),
}

impl PeerAddress {
    /// Creates an IPv4 peer address.
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        Self::Ipv4(SocketAddrV4::new(ip, port))
    }

    /// Creates a Unix domain socket peer address.
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    /// Returns the address family this address belongs to.
    pub fn family(&self) -> AddressFamily {
        match self {
            Self::Ipv4(_) => AddressFamily::Ipv4,
            Self::Unix(_) => AddressFamily::Unix,
        }
    }

    /// Returns the canonical string form used to key peers.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Returns the IP endpoint, if this is an IPv4 address.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ipv4(address) => Some(SocketAddr::V4(*address)),
            Self::Unix(_) => None,
        }
    }

    /// Returns the socket path, if this is a Unix address.
    pub fn as_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Ipv4(_) => None,
            Self::Unix(path) => Some(path),
        }
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(address) => address.fmt(f),
            Self::Unix(path) => path.fmt(f),
        }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(address: SocketAddrV4) -> Self {
        Self::Ipv4(address)
    }
}

impl TryFrom<SocketAddr> for PeerAddress {
    type Error = PeerAddressParseError;

    fn try_from(address: SocketAddr) -> Result<Self, Self::Error> {
        match address {
            SocketAddr::V4(address) => Ok(Self::Ipv4(address)),
            SocketAddr::V6(address) => Err(PeerAddressParseError::UnsupportedIpv6(address)),
        }
    }
}

impl TryFrom<&std::os::unix::net::SocketAddr> for PeerAddress {
    type Error = PeerAddressParseError;

    fn try_from(address: &std::os::unix::net::SocketAddr) -> Result<Self, Self::Error> {
        let path = address
            .as_pathname()
            .ok_or(PeerAddressParseError::UnnamedUnixSocket)?;
        let path = <&Utf8Path>::try_from(path).map_err(|_| PeerAddressParseError::NonUtf8Path)?;
        Ok(Self::Unix(path.to_owned()))
    }
}

impl From<PeerAddress> for String {
    fn from(address: PeerAddress) -> Self {
        address.canonical()
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = PeerAddressParseError;

    fn try_from(string: String) -> Result<Self, Self::Error> {
        string.parse()
    }
}

/// Errors that can occur when parsing or converting peer addresses.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerAddressParseError {
    /// Missing ':' separator between IP and port.
    #[error("missing ':' separator")]
    MissingSeparator,

    /// Invalid port number format.
    #[error("invalid port number")]
    InvalidPortNumber(#[source] std::num::ParseIntError),

    /// The host part is not an IPv4 literal.
    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4(String),

    /// IPv6 endpoints are not a supported address family.
    #[error("IPv6 address {0} is not supported")]
    UnsupportedIpv6(std::net::SocketAddrV6),

    /// The Unix socket is unnamed and cannot be addressed.
    #[error("the unix socket is unnamed")]
    UnnamedUnixSocket,

    /// The Unix socket path is not valid UTF-8.
    #[error("the unix socket path is non-utf8")]
    NonUtf8Path,
}

impl FromStr for PeerAddress {
    type Err = PeerAddressParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        // Unix socket paths must be absolute or explicit relative paths.
        if string.starts_with('/') || string.starts_with("./") || string.starts_with("../") {
            return Ok(Self::Unix(string.into()));
        }

        let (host, port) = string
            .rsplit_once(':')
            .ok_or(PeerAddressParseError::MissingSeparator)?;

        let port = port
            .parse()
            .map_err(PeerAddressParseError::InvalidPortNumber)?;

        let ip = Ipv4Addr::from_str(host)
            .map_err(|_| PeerAddressParseError::InvalidIpv4(host.to_owned()))?;

        Ok(Self::ipv4(ip, port))
    }
}
