//! Relay sessions and the set of live ones.
//!
//! ```text
//!  client            forwarder             target
//!    |   upstream    |         |   upstream    |
//!    |-------------->| [Link]  |-------------->|
//!    |               |         |               |
//!    |<--------------|         |<--------------|
//!    |  downstream   |         |  downstream   |
//! ```
//!
//! A [`Link`] lives in a [`LinkSet`] keyed by [`LinkId`]. Relay threads only
//! hold a [`LinkHandle`] (the id and a weak reference to the set), so there
//! is no ownership cycle between the set, a link and its workers.
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use derive_more::{Display, From, Into};
use log::*;
use rand::prelude::*;

use crate::byte_stream::{ByteStream, Sever};
use crate::error::Error;
use crate::relay::{self, Termination};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[display(fmt = "LinkId({:016x})", _0)]
pub struct LinkId(pub u64);

/// Number of relay directions still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// both directions are running
    Active,
    /// one direction has finished
    HalfClosed,
    /// both directions have finished; the link has left its set
    Closed,
}

impl LinkState {
    /// State after one more direction has finished. Never moves backwards.
    pub fn finish_direction(self) -> Self {
        match self {
            LinkState::Active => LinkState::HalfClosed,
            LinkState::HalfClosed | LinkState::Closed => LinkState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    /// client -> target
    #[display(fmt = "upstream")]
    Upstream,
    /// client <- target
    #[display(fmt = "downstream")]
    Downstream,
}

/// Snapshot of a live link.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub id: LinkId,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub state: LinkState,
    pub cut: bool,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    pub age: Duration,
}

pub struct Link {
    id: LinkId,
    client_addr: SocketAddr,
    target_addr: SocketAddr,
    /// closes the client-facing socket
    client: Box<dyn Sever>,
    /// closes the target-facing socket
    server: Box<dyn Sever>,
    state: Mutex<LinkState>,
    cut: AtomicBool,
    upstream: Arc<AtomicU64>,
    downstream: Arc<AtomicU64>,
    established: Instant,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("target_addr", &self.target_addr)
            .field("state", &self.state())
            .field("cut", &self.is_cut())
            .finish()
    }
}

impl Link {
    fn new(
        id: LinkId,
        client_addr: SocketAddr,
        target_addr: SocketAddr,
        client: Box<dyn Sever>,
        server: Box<dyn Sever>,
    ) -> Self {
        Self {
            id,
            client_addr,
            target_addr,
            client,
            server,
            state: Mutex::new(LinkState::Active),
            cut: AtomicBool::new(false),
            upstream: Arc::new(AtomicU64::new(0)),
            downstream: Arc::new(AtomicU64::new(0)),
            established: Instant::now(),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    pub fn is_cut(&self) -> bool {
        self.cut.load(Ordering::SeqCst)
    }

    /// Close both sockets now. Any blocked relay wakes up and finishes.
    ///
    /// Only the first call closes anything. Close errors (a socket the peer
    /// already tore down) are logged and dropped.
    pub fn cut(&self) {
        if self.cut.swap(true, Ordering::SeqCst) {
            trace!("already cut: {}", self.id);
            return;
        }
        info!(
            "cut link: {}: {} => {}",
            self.id, self.client_addr, self.target_addr
        );
        for (side, sock) in [("client", &self.client), ("target", &self.server)] {
            if let Err(err) = sock.sever() {
                debug!("{}: close {} socket: {}", self.id, side, err);
            }
        }
    }

    /// Record one finished direction. Returns `true` exactly once, on the
    /// transition to [`LinkState::Closed`].
    fn finish_direction(&self) -> bool {
        let mut state = lock(&self.state);
        let prev = *state;
        *state = prev.finish_direction();
        prev == LinkState::HalfClosed
    }

    fn traffic(&self, direction: Direction) -> Arc<AtomicU64> {
        match direction {
            Direction::Upstream => self.upstream.clone(),
            Direction::Downstream => self.downstream.clone(),
        }
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            id: self.id,
            client_addr: self.client_addr,
            target_addr: self.target_addr,
            state: self.state(),
            cut: self.is_cut(),
            bytes_upstream: self.upstream.load(Ordering::Relaxed),
            bytes_downstream: self.downstream.load(Ordering::Relaxed),
            age: self.established.elapsed(),
        }
    }
}

/// The active links of one forwarder.
#[derive(Debug, Default)]
pub struct LinkSet {
    links: Mutex<HashMap<LinkId, Arc<Link>>>,
    /// notified whenever the set becomes empty
    drained: Condvar,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the link built by `build` under a fresh id.
    fn insert<F>(&self, build: F) -> Arc<Link>
    where
        F: FnOnce(LinkId) -> Link,
    {
        let mut links = lock(&self.links);
        let mut rng = thread_rng();
        let id = loop {
            let candidate = LinkId(rng.next_u64());
            if !links.contains_key(&candidate) {
                break candidate;
            }
        };
        let link = Arc::new(build(id));
        links.insert(id, link.clone());
        debug!("link registered: {} ({} active)", id, links.len());
        link
    }

    fn remove(&self, id: LinkId) -> Option<Arc<Link>> {
        let mut links = lock(&self.links);
        let link = links.remove(&id);
        if links.is_empty() {
            self.drained.notify_all();
        }
        link
    }

    pub fn get(&self, id: LinkId) -> Option<Arc<Link>> {
        lock(&self.links).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.links).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.links).is_empty()
    }

    pub fn snapshot(&self) -> Vec<LinkInfo> {
        let mut infos: Vec<_> = lock(&self.links).values().map(|link| link.info()).collect();
        infos.sort_by_key(|info| info.age);
        infos.reverse();
        infos
    }

    /// Cut every link currently in the set and return how many there were.
    /// Links leave the set as their relays finish; this does not wait.
    pub fn cut_all(&self) -> usize {
        let links: Vec<_> = lock(&self.links).values().cloned().collect();
        links.iter().for_each(|link| link.cut());
        links.len()
    }

    /// Block until the set is empty or `timeout` elapses. `None` waits forever.
    /// Returns whether the set is empty.
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let links = lock(&self.links);
        match timeout {
            Some(timeout) => {
                let (links, _) = self
                    .drained
                    .wait_timeout_while(links, timeout, |links| !links.is_empty())
                    .unwrap_or_else(PoisonError::into_inner);
                links.is_empty()
            }
            None => self
                .drained
                .wait_while(links, |links| !links.is_empty())
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty(),
        }
    }
}

/// Non-owning reference from a relay thread to its link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    links: Weak<LinkSet>,
}

impl LinkHandle {
    fn new(id: LinkId, links: Weak<LinkSet>) -> Self {
        Self { id, links }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Report that `direction` has stopped relaying.
    pub fn done(&self, direction: Direction, termination: Termination) {
        let links = match self.links.upgrade() {
            Some(links) => links,
            None => {
                debug!("{}: {}: link set is gone", self.id, direction);
                return;
            }
        };
        let link = match links.get(self.id) {
            Some(link) => link,
            None => {
                error!("link not found: {}", self.id);
                return;
            }
        };
        match termination {
            Termination::Eof => debug!("{}: {}: end of stream", self.id, direction),
            Termination::Failed(err) if link.is_cut() => {
                debug!("{}: {}: severed: {}", self.id, direction, err)
            }
            Termination::Failed(err) => {
                // a reset on one side ends the whole session
                debug!("{}: {}: aborted: {}", self.id, direction, err);
                link.cut();
            }
        }
        if link.finish_direction() {
            links.remove(self.id);
            let info = link.info();
            info!(
                "link closed: {}: {} => {}: {} bytes up, {} bytes down, {:?}",
                info.id,
                info.client_addr,
                info.target_addr,
                info.bytes_upstream,
                info.bytes_downstream,
                info.age
            );
        }
    }
}

/// Register a link for a paired client/target connection and start its two
/// relay threads.
///
/// * `client`
///    Connection between the client and this forwarder.
/// * `server`
///    Connection between this forwarder and the target.
/// * `buffer_size`
///    Bytes moved per read in each direction.
pub fn establish<C, S>(
    links: &Arc<LinkSet>,
    client: C,
    client_addr: SocketAddr,
    server: S,
    target_addr: SocketAddr,
    buffer_size: usize,
) -> Result<LinkId, Error>
where
    C: ByteStream,
    S: ByteStream,
{
    let (read_client, write_client) = client.split()?;
    let (read_server, write_server) = server.split()?;
    let (sever_client, sever_server) = (client.severer()?, server.severer()?);

    let link = links.insert(|id| Link::new(id, client_addr, target_addr, sever_client, sever_server));
    let id = link.id();
    info!("link opened: {}: {} => {}", id, client_addr, target_addr);

    let handle = LinkHandle::new(id, Arc::downgrade(links));
    let halves = [
        (Direction::Upstream, read_client, write_server),
        (Direction::Downstream, read_server, write_client),
    ];
    for (direction, src, dst) in halves {
        let spawned = relay::spawn_relay_half(
            direction,
            handle.clone(),
            src,
            dst,
            link.traffic(direction),
            buffer_size,
        );
        if let Err(err) = spawned {
            error!("{}: spawn {} relay: {}", id, direction, err);
            link.cut();
            handle.done(direction, Termination::Failed(err));
        }
    }
    Ok(id)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
