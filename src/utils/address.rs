//! Cell member address type and parsing helpers.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;

use crate::utils::PaxosError;

use serde::{Deserialize, Serialize};

/// Network address of a cell member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `:port` or a bare `port`. A missing host is
    /// filled in with this machine's non-loopback IPv4 address, or the
    /// loopback address if there is none.
    pub fn parse(s: &str) -> Result<Self, PaxosError> {
        let (host, port) = match s.rfind(':') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => ("", s),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = port.parse::<u16>()?;

        if host.is_empty() {
            let ip = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
            Ok(Address::new(ip.to_string(), port))
        } else {
            Ok(Address::new(host, port))
        }
    }

    /// Resolves into a socket address usable for connecting.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, PaxosError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                PaxosError::msg(format!("cannot resolve address {}", self))
            })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = PaxosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port())
    }
}

/// Finds the local non-loopback IPv4 address by asking the kernel which
/// source address it would route a public destination through. No packet
/// is sent.
pub(crate) fn local_ipv4() -> Result<Ipv4Addr, PaxosError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
            Ok(ip)
        }
        ip => Err(PaxosError::msg(format!(
            "no non-loopback IPv4 address found (got {})",
            ip
        ))),
    }
}
