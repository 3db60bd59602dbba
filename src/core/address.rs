//! Network endpoint value types
//!
//! An [`Address`] identifies one side of a captured conversation: IP address,
//! port and the transport the bytes arrived on. Addresses are immutable after
//! creation and compare bitwise on all three fields.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport protocol an endpoint was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Udp
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "UDP"),
            Transport::Tcp => write!(f, "TCP"),
            Transport::Tls => write!(f, "TLS"),
            Transport::Ws => write!(f, "WS"),
        }
    }
}

/// A capture endpoint: IP address, port and transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
    pub transport: Transport,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16, transport: Transport) -> Self {
        Self { ip, port, transport }
    }

    /// UDP endpoint shorthand, the common case for SIP and RTP
    pub fn udp(ip: IpAddr, port: u16) -> Self {
        Self::new(ip, port, Transport::Udp)
    }

    pub fn unspecified() -> Self {
        Self::udp(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// Same IP and port, ignoring transport
    pub fn same_endpoint(&self, other: &Address) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    /// Parses `ip` or `ip:port` (UDP transport assumed)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((host, port)) = s.rsplit_once(':') {
            // IPv6 literals contain colons themselves, retry full parse below
            if let (Ok(ip), Ok(port)) = (host.parse::<IpAddr>(), port.parse::<u16>()) {
                return Ok(Address::udp(ip, port));
            }
        }
        let ip = s.parse::<IpAddr>()?;
        Ok(Address::udp(ip, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let addr = Address::udp("10.0.0.1".parse().unwrap(), 5060);
        assert_eq!(addr.to_string(), "10.0.0.1:5060");

        let no_port = Address::udp("10.0.0.1".parse().unwrap(), 0);
        assert_eq!(no_port.to_string(), "10.0.0.1");
    }

    #[test]
    fn test_address_parse() {
        let addr: Address = "192.168.1.1:5061".parse().unwrap();
        assert_eq!(addr.port, 5061);
        assert_eq!(addr.transport, Transport::Udp);

        let bare: Address = "::1".parse().unwrap();
        assert_eq!(bare.port, 0);
    }

    #[test]
    fn test_address_equality() {
        let a = Address::new("10.0.0.1".parse().unwrap(), 5060, Transport::Udp);
        let b = Address::new("10.0.0.1".parse().unwrap(), 5060, Transport::Tcp);
        assert_ne!(a, b);
        assert!(a.same_endpoint(&b));
    }
}
