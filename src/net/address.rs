//! Parsing of `[transport:][host:]port` addresses.

use std::{fmt, net::IpAddr, str::FromStr};

use crate::error::Error;

/// The host used when connecting to an address that doesn't name one.
pub const DEFAULT_CONNECT_HOST: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ssl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub protocol: Protocol,
    pub family: Family,

    /// The host, without brackets. Empty if the address only named a port.
    pub host: String,
    pub port: u16,
}

fn parse_transport(prefix: &str) -> Option<(Protocol, Family)> {
    match prefix.to_ascii_lowercase().as_str() {
        "tcp" => Some((Protocol::Tcp, Family::Any)),
        "tcp4" => Some((Protocol::Tcp, Family::V4)),
        "tcp6" | "tcp46" | "tcp64" => Some((Protocol::Tcp, Family::V6)),
        "ssl" => Some((Protocol::Ssl, Family::Any)),
        "ssl4" => Some((Protocol::Ssl, Family::V4)),
        "ssl6" | "ssl46" | "ssl64" => Some((Protocol::Ssl, Family::V6)),
        _ => None,
    }
}

impl PortSpec {
    pub fn is_ssl(&self) -> bool {
        self.protocol == Protocol::Ssl
    }

    /// The host to connect to.
    pub fn connect_host(&self) -> &str {
        match self.host.is_empty() {
            true => DEFAULT_CONNECT_HOST,
            false => &self.host,
        }
    }

    /// The host to bind to when listening, which is the unspecified address if none was given.
    pub fn listen_host(&self) -> &str {
        match (self.host.is_empty(), self.family) {
            (false, _) => &self.host,
            (true, Family::V6) => "::",
            (true, _) => "0.0.0.0",
        }
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::BadAddress(s.to_string());
        let trimmed = s.trim();

        let (protocol, family, rest) = match trimmed.split_once(':') {
            Some((prefix, rest)) => match parse_transport(prefix) {
                Some((protocol, family)) => (protocol, family, rest),
                None => (Protocol::Tcp, Family::Any, trimmed),
            },
            None => (Protocol::Tcp, Family::Any, trimmed),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(bad)?;
            let port = after.strip_prefix(':').ok_or_else(bad)?;
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => return Err(bad()),
                Some((host, port)) => (host, port),
                None => ("", rest),
            }
        };

        let port = port.parse::<u16>().map_err(|_| bad())?;
        Ok(Self {
            protocol,
            family,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = match (self.protocol, self.family) {
            (Protocol::Tcp, Family::Any) => "tcp",
            (Protocol::Tcp, Family::V4) => "tcp4",
            (Protocol::Tcp, Family::V6) => "tcp6",
            (Protocol::Ssl, Family::Any) => "ssl",
            (Protocol::Ssl, Family::V4) => "ssl4",
            (Protocol::Ssl, Family::V6) => "ssl6",
        };

        match (self.host.is_empty(), self.host.contains(':')) {
            (true, _) => write!(f, "{transport}:{}", self.port),
            (false, true) => write!(f, "{transport}:[{}]:{}", self.host, self.port),
            (false, false) => write!(f, "{transport}:{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Family, PortSpec, Protocol};
    use crate::error::Error;

    fn parse(s: &str) -> PortSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_port_only() {
        let spec = parse("1666");
        assert_eq!(spec.protocol, Protocol::Tcp);
        assert_eq!(spec.host, "");
        assert_eq!(spec.port, 1666);
        assert_eq!(spec.connect_host(), "localhost");
        assert_eq!(spec.listen_host(), "0.0.0.0");
    }

    #[test]
    fn test_transport_prefixes() {
        let spec = parse("ssl:perforce.example.com:1666");
        assert_eq!(spec.protocol, Protocol::Ssl);
        assert_eq!(spec.family, Family::Any);
        assert_eq!(spec.host, "perforce.example.com");

        let spec = parse("tcp6:1666");
        assert_eq!(spec.family, Family::V6);
        assert_eq!(spec.listen_host(), "::");

        let spec = parse("SSL4:10.0.0.1:1666");
        assert_eq!(spec.protocol, Protocol::Ssl);
        assert_eq!(spec.family, Family::V4);
    }

    #[test]
    fn test_host_without_transport() {
        let spec = parse("perforce:1666");
        assert_eq!(spec.protocol, Protocol::Tcp);
        assert_eq!(spec.host, "perforce");
    }

    #[test]
    fn test_bracketed_ipv6() {
        let spec = parse("ssl:[::1]:1666");
        assert_eq!(spec.host, "::1");
        assert_eq!(spec.port, 1666);
        assert_eq!(spec.to_string(), "ssl:[::1]:1666");
    }

    #[test]
    fn test_bad_addresses() {
        for bad in ["", "ssl:", "host:port", "::1:1666", "[::1]1666", "99999"] {
            assert!(matches!(bad.parse::<PortSpec>(), Err(Error::BadAddress(_))), "{bad}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(parse("1666").to_string(), "tcp:1666");
        assert_eq!(parse("ssl4:host:1").to_string(), "ssl4:host:1");
    }
}
