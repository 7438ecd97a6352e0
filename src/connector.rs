use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::*;

use crate::byte_stream::ByteStream;
use crate::error::Error;
use crate::link::{self, LinkId, LinkSet};
use crate::target::Target;

/// Opens the target side of a link.
pub trait Connector: Send + Sync {
    type B: ByteStream + 'static;
    fn connect_byte_stream(&self, target: &Target) -> Result<(Self::B, SocketAddr), Error>;
    /// Check a target once at startup. Unresolvable targets are fatal there.
    fn check(&self, _target: &Target) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(connect_timeout: Option<Duration>, nodelay: bool) -> Self {
        Self {
            connect_timeout,
            nodelay,
        }
    }

    fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
    }
}

impl Connector for TcpConnector {
    type B = TcpStream;
    fn connect_byte_stream(&self, target: &Target) -> Result<(Self::B, SocketAddr), Error> {
        let addrs = target
            .resolve()
            .map_err(|_| Error::TargetUnresolved {
                target: target.clone(),
            })?;
        let mut last_err = None;
        for addr in addrs {
            match self.connect_addr(addr) {
                Ok(strm) => {
                    strm.set_nodelay(self.nodelay)?;
                    let peer = strm.peer_addr()?;
                    return Ok((strm, peer));
                }
                Err(err) => {
                    debug!("connect {} ({}): {}", target, addr, err);
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(conn_error(err, target)),
            None => Err(Error::TargetUnresolved {
                target: target.clone(),
            }),
        }
    }

    fn check(&self, target: &Target) -> Result<(), Error> {
        match target.resolve() {
            Ok(addrs) if !addrs.is_empty() => Ok(()),
            _ => Err(Error::TargetUnresolved {
                target: target.clone(),
            }),
        }
    }
}

fn conn_error(io_err: io::Error, target: &Target) -> Error {
    match io_err.kind() {
        io::ErrorKind::ConnectionRefused => Error::ConnectionRefused {
            target: target.clone(),
        },
        _ => Error::Io(io_err),
    }
}

/// Pairs accepted client streams with a target connection.
#[derive(Debug)]
pub struct Dialer<C> {
    connector: C,
    /// candidates tried in order
    targets: Vec<Target>,
    links: Arc<LinkSet>,
    buffer_size: usize,
}

impl<C: Connector> Dialer<C> {
    pub fn new(connector: C, targets: Vec<Target>, links: Arc<LinkSet>, buffer_size: usize) -> Self {
        Self {
            connector,
            targets,
            links,
            buffer_size,
        }
    }

    /// Connect to the first reachable target. Once `stopping` is set the
    /// remaining targets are skipped.
    pub fn dial(&self, stopping: &AtomicBool) -> Result<(C::B, SocketAddr), Error> {
        for target in &self.targets {
            if stopping.load(Ordering::SeqCst) {
                return Err(Error::Unplugged);
            }
            match self.connector.connect_byte_stream(target) {
                Ok(conn) => return Ok(conn),
                Err(err) => warn!("connect failed: {}: {}", target, err),
            }
        }
        Err(Error::Unreachable {
            attempts: self.targets.len(),
        })
    }

    /// Dial a target for `client` and start relaying. When no target can be
    /// reached, `client` is dropped, which closes it.
    pub fn pair<S: ByteStream>(
        &self,
        client: S,
        client_addr: SocketAddr,
        stopping: &AtomicBool,
    ) -> Option<LinkId> {
        let (server, target_addr) = match self.dial(stopping) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("dropping client {}: {}", client_addr, err);
                return None;
            }
        };
        match link::establish(
            &self.links,
            client,
            client_addr,
            server,
            target_addr,
            self.buffer_size,
        ) {
            Ok(id) => Some(id),
            Err(err) => {
                error!("link error: {}: {}", client_addr, err);
                None
            }
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::collections::BTreeMap;
    use std::iter::FromIterator;
    use std::net::TcpListener;

    /// Simulated failure of a [`BufferConnector`] target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ConnectFailure {
        Refused,
        Unresolved,
    }

    #[derive(Debug, Clone)]
    pub struct BufferConnector<S> {
        pub strms: BTreeMap<Target, Result<S, ConnectFailure>>,
    }

    impl<S> FromIterator<(Target, Result<S, ConnectFailure>)> for BufferConnector<S> {
        fn from_iter<T>(iter: T) -> Self
        where
            T: IntoIterator<Item = (Target, Result<S, ConnectFailure>)>,
        {
            Self {
                strms: iter.into_iter().collect(),
            }
        }
    }

    impl<S> Connector for BufferConnector<S>
    where
        S: ByteStream + Clone + Sync + 'static,
    {
        type B = S;
        fn connect_byte_stream(&self, target: &Target) -> Result<(Self::B, SocketAddr), Error> {
            println!("connect_byte_stream: {}", target);
            match self.strms.get(target) {
                Some(Ok(strm)) => {
                    let peer = match target {
                        Target::IpAddr(addr, port) => SocketAddr::new(*addr, *port),
                        Target::Domain(_, port) => format!("192.168.1.1:{}", port).parse().unwrap(),
                    };
                    Ok((strm.clone(), peer))
                }
                Some(Err(ConnectFailure::Refused)) => Err(Error::ConnectionRefused {
                    target: target.clone(),
                }),
                Some(Err(ConnectFailure::Unresolved)) | None => Err(Error::TargetUnresolved {
                    target: target.clone(),
                }),
            }
        }

        fn check(&self, target: &Target) -> Result<(), Error> {
            match self.strms.get(target) {
                Some(Err(ConnectFailure::Unresolved)) | None => Err(Error::TargetUnresolved {
                    target: target.clone(),
                }),
                _ => Ok(()),
            }
        }
    }

    use crate::byte_stream::test::BufferStream;

    fn target(s: &str) -> Target {
        s.parse().unwrap()
    }

    #[test]
    fn fail_over_to_next_target() {
        let connector = BufferConnector::from_iter(vec![
            (target("10.0.0.1:7000"), Err(ConnectFailure::Refused)),
            (target("10.0.0.2:7000"), Ok(BufferStream::new())),
        ]);
        let dialer = Dialer::new(
            connector,
            vec![target("10.0.0.1:7000"), target("10.0.0.2:7000")],
            Arc::new(LinkSet::new()),
            1024,
        );
        let (_, peer) = dialer.dial(&AtomicBool::new(false)).unwrap();
        assert_eq!(peer, "10.0.0.2:7000".parse().unwrap());
    }

    #[test]
    fn first_target_wins() {
        let connector = BufferConnector::from_iter(vec![
            (target("10.0.0.1:7000"), Ok(BufferStream::new())),
            (target("10.0.0.2:7000"), Ok(BufferStream::new())),
        ]);
        let dialer = Dialer::new(
            connector,
            vec![target("10.0.0.1:7000"), target("10.0.0.2:7000")],
            Arc::new(LinkSet::new()),
            1024,
        );
        let (_, peer) = dialer.dial(&AtomicBool::new(false)).unwrap();
        assert_eq!(peer, "10.0.0.1:7000".parse().unwrap());
    }

    #[test]
    fn dial_gives_up_when_stopping() {
        let links = Arc::new(LinkSet::new());
        let connector = BufferConnector::from_iter(vec![(
            target("10.0.0.1:7000"),
            Ok(BufferStream::new()),
        )]);
        let dialer = Dialer::new(connector, vec![target("10.0.0.1:7000")], links.clone(), 1024);
        let stopping = AtomicBool::new(true);
        assert!(matches!(dialer.dial(&stopping), Err(Error::Unplugged)));
        assert!(dialer
            .pair(BufferStream::new(), "192.168.1.1:40000".parse().unwrap(), &stopping)
            .is_none());
        assert!(links.is_empty());
    }

    #[test]
    fn unreachable_client_is_dropped() {
        let links = Arc::new(LinkSet::new());
        let connector = BufferConnector::<BufferStream>::from_iter(vec![(
            target("10.0.0.1:7000"),
            Err(ConnectFailure::Refused),
        )]);
        let dialer = Dialer::new(connector, vec![target("10.0.0.1:7000")], links.clone(), 1024);
        assert!(matches!(
            dialer.dial(&AtomicBool::new(false)),
            Err(Error::Unreachable { attempts: 1 })
        ));
        assert!(dialer
            .pair(
                BufferStream::new(),
                "192.168.1.1:40000".parse().unwrap(),
                &AtomicBool::new(false),
            )
            .is_none());
        assert!(links.is_empty());
    }

    #[test]
    fn pair_registers_link() {
        let links = Arc::new(LinkSet::new());
        let server = BufferStream::with_buffer(b"from target".to_vec().into(), vec![].into());
        let connector =
            BufferConnector::from_iter(vec![(target("10.0.0.1:7000"), Ok(server.clone()))]);
        let dialer = Dialer::new(connector, vec![target("10.0.0.1:7000")], links.clone(), 1024);

        let client = BufferStream::with_buffer(b"from client".to_vec().into(), vec![].into());
        let id = dialer
            .pair(
                client.clone(),
                "192.168.1.1:40000".parse().unwrap(),
                &AtomicBool::new(false),
            )
            .unwrap();
        assert!(links.wait_drained(Some(Duration::from_secs(5))));
        assert!(links.get(id).is_none());
        assert_eq!(server.written(), b"from client".to_vec());
        assert_eq!(client.written(), b"from target".to_vec());
    }

    #[test]
    fn tcp_connection_refused() {
        // grab a free port, then close it again
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let connector = TcpConnector::new(Some(Duration::from_secs(1)), true);
        assert!(matches!(
            connector.connect_byte_stream(&addr.into()),
            Err(Error::ConnectionRefused { .. })
        ));
    }

    #[test]
    fn tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpConnector::new(None, true);
        let (strm, peer) = connector.connect_byte_stream(&addr.into()).unwrap();
        assert_eq!(peer, addr);
        assert!(strm.nodelay().unwrap());
        connector.check(&addr.into()).unwrap();
    }

    #[test]
    fn unresolvable_target() {
        let connector = TcpConnector::new(None, true);
        let target = Target::Domain("unresolvable.invalid".into(), 80);
        assert!(matches!(
            connector.check(&target),
            Err(Error::TargetUnresolved { .. })
        ));
    }
}
