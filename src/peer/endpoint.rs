use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::error::PeerError;

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn alternate(self) -> Self {
        match self {
            Protocol::Udp => Protocol::Tcp,
            Protocol::Tcp => Protocol::Udp,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

/// A transport address of a peer, written as `udp@1.2.3.4:5000` or
/// `tcp@[::1]:80`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

impl Endpoint {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Udp,
            addr,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Tcp,
            addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.protocol.as_str(), self.addr)
    }
}

impl FromStr for Endpoint {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, addr) = s
            .split_once('@')
            .ok_or_else(|| PeerError::InvalidEndpoint(s.to_string()))?;

        let protocol = match proto {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            _ => return Err(PeerError::InvalidEndpoint(s.to_string())),
        };

        let addr = addr
            .parse()
            .map_err(|_| PeerError::InvalidEndpoint(s.to_string()))?;

        Ok(Self { protocol, addr })
    }
}
