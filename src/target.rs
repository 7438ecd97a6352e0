//! Backend addresses the relay dials.
//!
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::Error;

/// A relay target: either a literal socket address or a `host:port` pair
/// resolved at dial time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Target {
    IpAddr(IpAddr, u16),
    Domain(String, u16),
}

impl Target {
    pub fn port(&self) -> u16 {
        match self {
            Target::IpAddr(_, port) => *port,
            Target::Domain(_, port) => *port,
        }
    }

    /// Resolve to every candidate socket address.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        self.to_socket_addrs().map(Iterator::collect)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Target::*;
        match self {
            IpAddr(addr, port) => write!(f, "{}", SocketAddr::new(*addr, *port)),
            Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target::IpAddr(addr.ip(), addr.port())
    }
}

impl FromStr for Target {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s.rsplit_once(':').ok_or_else(|| Error::invalid_target(s))?;
        let port = port.parse().map_err(|_| Error::invalid_target(s))?;
        // a bare ipv6 address needs brackets; anything with ':' left is not a host name
        if host.is_empty() || host.contains(':') || host.chars().any(char::is_whitespace) {
            return Err(Error::invalid_target(s));
        }
        Ok(Target::Domain(host.to_owned(), port))
    }
}

impl TryFrom<String> for Target {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl ToSocketAddrs for Target {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        use Target::*;
        match self {
            IpAddr(addr, port) => Ok(vec![SocketAddr::new(*addr, *port)].into_iter()),
            Domain(host, port) => Ok((host.as_str(), *port).to_socket_addrs()?),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_targets() {
        assert_eq!(
            "127.0.0.1:7000".parse::<Target>().unwrap(),
            Target::IpAddr("127.0.0.1".parse().unwrap(), 7000)
        );
        assert_eq!(
            "[::1]:7000".parse::<Target>().unwrap(),
            Target::IpAddr("::1".parse().unwrap(), 7000)
        );
        assert_eq!(
            "backend.local:8080".parse::<Target>().unwrap(),
            Target::Domain("backend.local".into(), 8080)
        );
    }

    #[test]
    fn reject_malformed_targets() {
        for s in &["", "localhost", ":80", "host:port", "::1:80", "host:70000", "a b:1"] {
            assert!(
                matches!(s.parse::<Target>(), Err(Error::InvalidTarget { .. })),
                "{:?}",
                s
            );
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        let target = Target::Domain("backend.local".into(), 8080);
        assert_eq!(target.to_string(), "backend.local:8080");
        assert_eq!(target.port(), 8080);
    }

    #[test]
    fn resolve_literal() {
        let target: Target = "127.0.0.1:7000".parse().unwrap();
        assert_eq!(
            target.resolve().unwrap(),
            vec!["127.0.0.1:7000".parse::<SocketAddr>().unwrap()]
        );
    }
}
