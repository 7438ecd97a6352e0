use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::*;

use crate::acceptor::{Binder, TcpBinder};
use crate::byte_stream::ByteStream;
use crate::config::ForwarderConfig;
use crate::connector::{Connector, Dialer, TcpConnector};
use crate::error::Error;
use crate::link::{LinkInfo, LinkSet};
use crate::server_command::ForwarderCommand;
use crate::thread::spawn_thread;

/// A running accept loop
#[derive(Debug)]
struct AcceptorHandle {
    addr: SocketAddr,
    /// send termination message to the acceptor
    tx: Sender<()>,
    /// tells an in-flight dial to give up on the remaining targets
    stopping: Arc<AtomicBool>,
    th: JoinHandle<()>,
}

impl AcceptorHandle {
    /// `false` once the accept thread has ended on its own (e.g. a panic).
    fn is_running(&self) -> bool {
        !self.th.is_finished()
    }

    /// Stop accepting and wait until the listener is closed.
    fn stop(self) {
        trace!("stopping accept thread: {}", self.addr);
        self.stopping.store(true, Ordering::SeqCst);
        self.tx.send(()).ok();
        if let Err(err) = self.th.join() {
            error!("accept thread panic: {:?}", err);
        }
        trace!("accept thread is stopped: {}", self.addr);
    }
}

/// spawn a thread pairing every accepted stream with a target
fn spawn_acceptor<I, S, C>(
    acceptor: I,
    dialer: Arc<Dialer<C>>,
    stopping: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>>
where
    I: Iterator<Item = (S, SocketAddr)> + Send + 'static,
    S: ByteStream + 'static,
    C: Connector + 'static,
{
    spawn_thread("acceptor", move || {
        for (strm, addr) in acceptor {
            debug!("accepted: {}", addr);
            dialer.pair(strm, addr, &stopping);
        }
        debug!("accept loop finished");
    })
}

struct Inner<T, C>
where
    T: Binder,
    C: Connector + 'static,
{
    config: ForwarderConfig,
    /// bind listen address
    binder: T,
    /// make connection to the targets
    dialer: Arc<Dialer<C>>,
    links: Arc<LinkSet>,
    /// present while plugged
    acceptor: Mutex<Option<AcceptorHandle>>,
    /// address of the first successful bind; every replug reuses it
    bound: Mutex<Option<SocketAddr>>,
}

impl<T, C> Drop for Inner<T, C>
where
    T: Binder,
    C: Connector + 'static,
{
    fn drop(&mut self) {
        let acceptor = self
            .acceptor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(acceptor) = acceptor {
            acceptor.stop();
        }
        let cut = self.links.cut_all();
        debug!("forwarder dropped: {} link(s) cut", cut);
    }
}

/// The relay service: a listener, the set of active links and the
/// plug/unplug switch.
///
/// Handles are cheap to clone and share one forwarder. When the last handle
/// is dropped the listener is closed and every link is cut.
pub struct Forwarder<T = TcpBinder, C = TcpConnector>
where
    T: Binder,
    C: Connector + 'static,
{
    inner: Arc<Inner<T, C>>,
}

impl<T, C> Clone for Forwarder<T, C>
where
    T: Binder,
    C: Connector + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Forwarder<TcpBinder, TcpConnector> {
    pub fn new(config: ForwarderConfig) -> Result<Self, Error> {
        let binder = TcpBinder::new(config.accept_timeout, config.nodelay);
        let connector = TcpConnector::new(config.connect_timeout, config.nodelay);
        Forwarder::with_binder(config, binder, connector)
    }

    /// Create a forwarder and plug it. The accept loop is running when this
    /// returns.
    pub fn start(config: ForwarderConfig) -> Result<Self, Error> {
        let forwarder = Self::new(config)?;
        forwarder.plug()?;
        Ok(forwarder)
    }
}

impl<T, C> Forwarder<T, C>
where
    T: Binder,
    C: Connector + 'static,
{
    /// Validate `config` against `connector` and create an unplugged forwarder.
    pub fn with_binder(config: ForwarderConfig, binder: T, connector: C) -> Result<Self, Error> {
        config.validate()?;
        for target in &config.targets {
            connector.check(target)?;
        }
        let links = Arc::new(LinkSet::new());
        let dialer = Dialer::new(
            connector,
            config.targets.clone(),
            links.clone(),
            config.buffer_size,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                binder,
                dialer: Arc::new(dialer),
                links,
                acceptor: Mutex::new(None),
                bound: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.inner.config
    }

    /// Start accepting connections. No-op when already plugged.
    ///
    /// An accept thread that has died is reaped and the listener is bound
    /// again.
    pub fn plug(&self) -> Result<(), Error> {
        let mut acceptor = self.inner.acceptor.lock()?;
        match acceptor.take() {
            Some(handle) if handle.is_running() => {
                debug!("already plugged");
                *acceptor = Some(handle);
                return Ok(());
            }
            Some(handle) => {
                warn!("accept thread ended unexpectedly: {}", handle.addr);
                handle.stop();
            }
            None => {}
        }
        let mut bound = self.inner.bound.lock()?;
        let addr = match *bound {
            Some(addr) => addr,
            None => self.inner.config.listen_addr(),
        };

        let (tx, rx) = mpsc::channel();
        let (iter, local_addr) = self.inner.binder.bind(addr, rx)?;
        let stopping = Arc::new(AtomicBool::new(false));
        let th = spawn_acceptor(iter, self.inner.dialer.clone(), stopping.clone())?;
        *bound = Some(local_addr);
        *acceptor = Some(AcceptorHandle {
            addr: local_addr,
            tx,
            stopping,
            th,
        });
        info!("plugged: listening on {}", local_addr);
        Ok(())
    }

    /// Close the listener and cut every active link.
    ///
    /// Returns once the listener is closed; links drain in the background
    /// (see [`wait_drained`](Self::wait_drained)).
    pub fn unplug(&self) -> Result<(), Error> {
        let mut acceptor = self.inner.acceptor.lock()?;
        match acceptor.take() {
            Some(handle) => {
                let addr = handle.addr;
                handle.stop();
                info!("unplugged: {} closed", addr);
            }
            None => debug!("already unplugged"),
        }
        let cut = self.inner.links.cut_all();
        if cut > 0 {
            info!("unplug: {} link(s) cut", cut);
        }
        Ok(())
    }

    /// Whether the listener is open and its accept thread is alive.
    pub fn is_plugged(&self) -> bool {
        self.inner
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, AcceptorHandle::is_running)
    }

    /// The bound listen address, once plugged for the first time.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_links(&self) -> usize {
        self.inner.links.len()
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.inner.links.snapshot()
    }

    /// Wait until no link is active. `None` waits forever.
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        self.inner.links.wait_drained(timeout)
    }

    /// Unplug and wait up to the configured shutdown timeout for the links
    /// to drain. Returns whether they did.
    pub fn shutdown(&self) -> Result<bool, Error> {
        self.unplug()?;
        let drained = self.wait_drained(self.inner.config.shutdown_timeout);
        if !drained {
            warn!(
                "shutdown: {} link(s) still active after {:?}",
                self.active_links(),
                self.inner.config.shutdown_timeout
            );
        }
        Ok(drained)
    }

    /// Run until [`ForwarderCommand::Terminate`] is received or every sender
    /// of `rx` is dropped.
    pub fn serve(&self, rx: Receiver<ForwarderCommand>) -> Result<(), Error> {
        if self.inner.config.start_unplugged {
            info!("starting unplugged");
        } else {
            self.plug()?;
        }

        while let Ok(cmd) = rx.recv() {
            use ForwarderCommand::*;
            info!("cmd: {:?}", cmd);
            match cmd {
                Plug => {
                    if let Err(err) = self.plug() {
                        error!("plug error: {}", err);
                    }
                }
                Unplug => self.unplug()?,
                Terminate => break,
            }
        }
        self.shutdown()?;
        info!("forwarder shutdown");
        Ok(())
    }
}
