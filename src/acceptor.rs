use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use log::*;

use crate::byte_stream::ByteStream;
use crate::error::Error;
use crate::tcp_listener_ext::*;

/// pause after an accept error so a persistent failure (e.g. `EMFILE`) does
/// not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpAcceptor {
    listener: TcpListener,
    /// receive termination message
    rx: Receiver<()>,
    /// timeout for accept
    accept_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpAcceptor {
    fn new(
        listener: TcpListener,
        rx: Receiver<()>,
        accept_timeout: Option<Duration>,
        nodelay: bool,
    ) -> Self {
        Self {
            listener,
            rx,
            accept_timeout,
            nodelay,
        }
    }

    fn accept_timeout(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener
            .accept_timeout(self.accept_timeout)
            .and_then(|(tcp, addr)| {
                tcp.set_nodelay(self.nodelay)?;
                Ok((tcp, addr))
            })
    }

    /// A stop message or a dropped sender both end the accept loop.
    fn stop_requested(&self) -> bool {
        match self.rx.try_recv() {
            Ok(()) => true,
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => true,
        }
    }
}

impl Iterator for TcpAcceptor {
    type Item = (TcpStream, SocketAddr);
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stop_requested() {
                debug!("acceptor is requested termination");
                return None;
            }
            match self.accept_timeout() {
                Ok(x) => return Some(x),
                Err(err)
                    if err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    if self.stop_requested() {
                        // the listener went away because we are unplugging
                        trace!("accept error while stopping: {}", err);
                        return None;
                    }
                    error!("accept error: {}", err);
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }
    }
}

/// Opens the listening side of the forwarder.
pub trait Binder: Send + Sync {
    type Stream: ByteStream + 'static;
    type Iter: Iterator<Item = (Self::Stream, SocketAddr)> + Send + 'static;
    /// Bind `addr` and return the accept loop with the address actually bound.
    /// The loop ends once `rx` receives a message or is disconnected.
    fn bind(&self, addr: SocketAddr, rx: Receiver<()>) -> Result<(Self::Iter, SocketAddr), Error>;
}

#[derive(Debug, Clone)]
pub struct TcpBinder {
    accept_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpBinder {
    pub fn new(accept_timeout: Option<Duration>, nodelay: bool) -> Self {
        Self {
            accept_timeout,
            nodelay,
        }
    }
}

impl Binder for TcpBinder {
    type Stream = TcpStream;
    type Iter = TcpAcceptor;
    fn bind(&self, addr: SocketAddr, rx: Receiver<()>) -> Result<(Self::Iter, SocketAddr), Error> {
        let tcp = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        tcp.set_reuse_address(true)
            .map_err(|err| addr_error(err, addr))?;
        tcp.bind(&addr.into())
            .map_err(|err| addr_error(err, addr))?;

        // `backlog` parameter to `listen()` is directly passed to `listen(2)` system call.
        // If it is too small, clients may not `connect(2)` to the forwarder.
        // Here, `backlog` is intended to be as large as `net.core.somaxconn` kernel parameter.
        tcp.listen(256)?;
        tcp.set_nonblocking(true)?;

        let listener: TcpListener = tcp.into();
        let local_addr = listener.local_addr()?;
        Ok((
            TcpAcceptor::new(listener, rx, self.accept_timeout, self.nodelay),
            local_addr,
        ))
    }
}

fn addr_error(io_err: io::Error, addr: SocketAddr) -> Error {
    match io_err.kind() {
        io::ErrorKind::AddrInUse => Error::AddressAlreadyInUse { addr },
        io::ErrorKind::AddrNotAvailable => Error::AddressNotAvailable { addr },
        _ => Error::Io(io_err),
    }
}
