//! # In-Process Bus
//!
//! `LocalBus` is a complete capability bus living inside one process. It plays
//! the kernel's part: it allocates nodes, keeps per-connection handle tables
//! with reference counts, rewrites handle trailers on delivery, and produces
//! NODE_DESTROY and NODE_RELEASE notifications.
//!
//! ## Structure
//!
//! One lock per bus guards every table. Each connection owns one unbounded
//! crossbeam queue; deliveries from one sender to one receiver are therefore
//! FIFO. Buses are registered by path and connections by descriptor in
//! process-wide tables, so `Peer::new(path)` and `Peer::new_from_fd(fd)` find
//! them again.
//!
//! ## Invariants
//! - A connection has at most one handle id per node. Ids are unique per bus.
//! - `refs` counts deliveries not yet matched by `handle_release`. The owner's
//!   own entry never drops below one while the node exists.
//! - `holders` lists every non-owner connection with a handle to the node.
//! - A node is forgotten once it is not live and has no holders. If it was
//!   released, its owner then receives NODE_RELEASE.

use std::collections::HashMap;
use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::channel::TryRecvError;
use crossbeam::channel::unbounded;
use dashmap::DashMap;
use tracing::trace;

use crate::channel::Channel;
use crate::channel::ChannelError;
use crate::channel::Credentials;
use crate::channel::Delivery;
use crate::channel::Result;
use crate::lock;

/// Path used when a peer is opened without one.
pub const DEFAULT_BUS_PATH: &str = "/dev/bus1";

static BUSES: LazyLock<DashMap<String, LocalBus>> = LazyLock::new(DashMap::new);
static DESCRIPTORS: LazyLock<DashMap<u64, Weak<Link>>> = LazyLock::new(DashMap::new);
static NEXT_DESCRIPTOR: AtomicU64 = AtomicU64::new(3);

/// Limits applied by a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Largest frame a connection may send.
    pub max_frame_size: usize,
    /// Deliveries a connection may have queued before sends to it fail.
    pub queue_limit: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { max_frame_size: b1wire::MAX_FRAME_SIZE, queue_limit: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Life {
    Live,
    Released,
    Destroyed,
}

struct HandleRef {
    node: u64,
    refs: usize,
}

struct PeerEntry {
    tx: Sender<Delivery>,
    seed: Option<Delivery>,
    handles: HashMap<u64, HandleRef>,
    by_node: HashMap<u64, u64>,
}

struct NodeEntry {
    owner: u64,
    owner_handle: u64,
    life: Life,
    holders: HashSet<u64>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    peers: HashMap<u64, PeerEntry>,
    nodes: HashMap<u64, NodeEntry>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn peer(&self, conn: u64) -> Result<&PeerEntry> {
        self.peers.get(&conn).ok_or(ChannelError::Disconnected)
    }

    /// Node behind a handle `conn` holds.
    fn resolve(&self, conn: u64, handle: u64) -> Result<u64> {
        let peer = self.peer(conn)?;
        peer.handles.get(&handle).map(|h| h.node).ok_or(ChannelError::InvalidHandle(handle))
    }

    /// Node behind an owned handle, for release and destroy.
    fn owned(&self, conn: u64, handle: u64) -> Result<u64> {
        let node = self.resolve(conn, handle)?;
        match self.nodes.get(&node) {
            Some(entry) if entry.owner == conn => Ok(node),
            _ => Err(ChannelError::NotOwner(handle)),
        }
    }

    fn is_live(&self, node: u64) -> bool {
        self.nodes.get(&node).is_some_and(|n| n.life == Life::Live)
    }

    /// Adds one reference on `node` to `conn` and returns its handle id there.
    fn acquire(&mut self, conn: u64, node: u64) -> Option<u64> {
        if let Some(peer) = self.peers.get_mut(&conn) {
            if let Some(&id) = peer.by_node.get(&node) {
                if let Some(entry) = peer.handles.get_mut(&id) {
                    entry.refs += 1;
                }
                return Some(id);
            }
        }
        let id = self.next_id();
        let peer = self.peers.get_mut(&conn)?;
        peer.handles.insert(id, HandleRef { node, refs: 1 });
        peer.by_node.insert(node, id);
        if let Some(entry) = self.nodes.get_mut(&node) {
            if entry.owner != conn {
                entry.holders.insert(conn);
            }
        }
        Some(id)
    }

    fn notify_destroy(&self, node: u64) {
        let Some(entry) = self.nodes.get(&node) else { return };
        for holder in &entry.holders {
            let Some(peer) = self.peers.get(holder) else { continue };
            if let Some(&handle) = peer.by_node.get(&node) {
                let _ = peer.tx.send(Delivery::NodeDestroy { handle });
            }
        }
    }

    fn maybe_finish(&mut self, node: u64) {
        let done = self.nodes.get(&node).is_some_and(|n| n.life != Life::Live && n.holders.is_empty());
        if !done {
            return;
        }
        let Some(entry) = self.nodes.remove(&node) else { return };
        trace!(node, owner = entry.owner, "node finished");
        if let Some(owner) = self.peers.get_mut(&entry.owner) {
            owner.handles.remove(&entry.owner_handle);
            owner.by_node.remove(&node);
            if entry.life == Life::Released {
                let _ = owner.tx.send(Delivery::NodeRelease { handle: entry.owner_handle });
            }
        }
    }

    /// Marks a node destroyed. Holders are told only if it was still live.
    fn destroy(&mut self, node: u64) {
        let Some(entry) = self.nodes.get_mut(&node) else { return };
        let was_live = entry.life == Life::Live;
        entry.life = Life::Destroyed;
        if was_live {
            self.notify_destroy(node);
        }
    }
}

struct BusInner {
    path: String,
    config: BusConfig,
    state: Mutex<State>,
}

/// A capability bus shared by every connection opened on it.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// Returns the bus registered at `path`, creating it with default limits.
    pub fn open(path: &str) -> LocalBus {
        Self::open_with_config(path, BusConfig::default())
    }

    /// Returns the bus registered at `path`. `config` applies only if this
    /// call creates it.
    pub fn open_with_config(path: &str, config: BusConfig) -> LocalBus {
        BUSES.entry(path.to_string()).or_insert_with(|| LocalBus::new(path, config)).clone()
    }

    /// Creates a bus that is not registered under its path.
    pub fn new(path: &str, config: BusConfig) -> LocalBus {
        let inner = BusInner { path: path.to_string(), config, state: Mutex::new(State::default()) };
        LocalBus { inner: Arc::new(inner) }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Number of open connections.
    pub fn peer_count(&self) -> usize {
        lock(&self.inner.state).peers.len()
    }

    /// Number of nodes the bus still tracks, including released ones with holders.
    pub fn node_count(&self) -> usize {
        lock(&self.inner.state).nodes.len()
    }

    /// Opens a new connection.
    pub fn connect(&self) -> Connection {
        let id = NEXT_DESCRIPTOR.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        let entry = PeerEntry { tx, seed: None, handles: HashMap::new(), by_node: HashMap::new() };
        lock(&self.inner.state).peers.insert(id, entry);

        let link = Arc::new(Link { bus: self.clone(), id, rx });
        DESCRIPTORS.insert(id, Arc::downgrade(&link));
        trace!(bus = %self.inner.path, conn = id, "connected");
        Connection { link, closed: AtomicBool::new(false) }
    }

    fn node_new(&self, conn: u64) -> Result<u64> {
        let mut state = lock(&self.inner.state);
        state.peer(conn)?;
        let node = state.next_id();
        let handle = state.next_id();
        if let Some(peer) = state.peers.get_mut(&conn) {
            peer.handles.insert(handle, HandleRef { node, refs: 1 });
            peer.by_node.insert(node, handle);
        }
        let entry = NodeEntry { owner: conn, owner_handle: handle, life: Life::Live, holders: HashSet::new() };
        state.nodes.insert(node, entry);
        trace!(bus = %self.inner.path, conn, node, handle, "node created");
        Ok(handle)
    }

    fn node_release(&self, conn: u64, handle: u64) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let node = state.owned(conn, handle)?;
        if !state.is_live(node) {
            return Err(ChannelError::Unreachable(handle));
        }
        if let Some(entry) = state.nodes.get_mut(&node) {
            entry.life = Life::Released;
        }
        state.notify_destroy(node);
        state.maybe_finish(node);
        trace!(bus = %self.inner.path, conn, node, "node released");
        Ok(())
    }

    fn node_destroy(&self, conn: u64, handle: u64) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let node = state.owned(conn, handle)?;
        state.destroy(node);
        state.maybe_finish(node);
        trace!(bus = %self.inner.path, conn, node, "node destroyed");
        Ok(())
    }

    fn handle_release(&self, conn: u64, handle: u64) -> Result<()> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let node = state.resolve(conn, handle)?;
        let is_owner = state.nodes.get(&node).is_some_and(|n| n.owner == conn);

        let Some(peer) = state.peers.get_mut(&conn) else { return Err(ChannelError::Disconnected) };
        let Some(entry) = peer.handles.get_mut(&handle) else { return Err(ChannelError::InvalidHandle(handle)) };
        if is_owner {
            entry.refs = entry.refs.saturating_sub(1).max(1);
            return Ok(());
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }
        peer.handles.remove(&handle);
        peer.by_node.remove(&node);
        if let Some(entry) = state.nodes.get_mut(&node) {
            entry.holders.remove(&conn);
        }
        state.maybe_finish(node);
        trace!(bus = %self.inner.path, conn, handle, "handle dropped");
        Ok(())
    }

    fn check_size(&self, frame: &[u8]) -> Result<Vec<u64>> {
        let limit = self.inner.config.max_frame_size;
        if frame.len() > limit {
            return Err(ChannelError::FrameTooLarge { size: frame.len(), limit });
        }
        b1wire::handle_table(frame).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    fn send(&self, conn: u64, destinations: &[u64], frame: &[u8], fds: &[OwnedFd]) -> Result<()> {
        let attached = self.check_size(frame)?;
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;

        let mut nodes = Vec::with_capacity(attached.len());
        for &id in &attached {
            let node = state.resolve(conn, id)?;
            if !state.is_live(node) {
                return Err(ChannelError::Unreachable(id));
            }
            nodes.push(node);
        }

        let mut targets = Vec::with_capacity(destinations.len());
        for &id in destinations {
            let node = state.resolve(conn, id)?;
            match state.nodes.get(&node) {
                Some(entry) if entry.life == Life::Live => targets.push((entry.owner, entry.owner_handle)),
                _ => trace!(bus = %self.inner.path, conn, handle = id, "skipping unreachable destination"),
            }
        }

        if let Some(limit) = self.inner.config.queue_limit {
            for (owner, _) in &targets {
                let queued = state.peers.get(owner).map_or(0, |p| p.tx.len());
                if queued >= limit {
                    return Err(ChannelError::QuotaExceeded { queued, limit });
                }
            }
        }

        let mut fd_sets = Vec::with_capacity(targets.len());
        for _ in &targets {
            fd_sets.push(duplicate(fds)?);
        }

        let credentials = Credentials::current();
        for ((owner, destination), fds) in targets.into_iter().zip(fd_sets) {
            let ids: Vec<u64> = nodes.iter().filter_map(|&node| state.acquire(owner, node)).collect();
            let mut bytes = frame.to_vec();
            b1wire::rewrite_handle_table(&mut bytes, &ids).map_err(|e| ChannelError::Malformed(e.to_string()))?;
            if let Some(peer) = state.peers.get(&owner) {
                trace!(bus = %self.inner.path, from = conn, to = owner, destination, "delivering");
                let _ = peer.tx.send(Delivery::Data { destination, frame: bytes, fds, credentials });
            }
        }
        Ok(())
    }

    fn send_seed(&self, conn: u64, frame: &[u8], fds: &[OwnedFd]) -> Result<()> {
        let attached = self.check_size(frame)?;
        let mut state = lock(&self.inner.state);
        for &id in &attached {
            let node = state.owned(conn, id)?;
            if !state.is_live(node) {
                return Err(ChannelError::Unreachable(id));
            }
        }
        let fds = duplicate(fds)?;
        let seed = Delivery::Data { destination: 0, frame: frame.to_vec(), fds, credentials: Credentials::current() };
        let peer = state.peers.get_mut(&conn).ok_or(ChannelError::Disconnected)?;
        peer.seed = Some(seed);
        trace!(bus = %self.inner.path, conn, roots = attached.len(), "seed stored");
        Ok(())
    }

    fn recv_seed(&self, conn: u64) -> Result<Delivery> {
        let mut state = lock(&self.inner.state);
        let peer = state.peers.get_mut(&conn).ok_or(ChannelError::Disconnected)?;
        peer.seed.take().ok_or(ChannelError::NoSeed)
    }

    fn clone_peer(&self, conn: u64, handle: u64) -> Result<(Connection, u64)> {
        {
            let state = lock(&self.inner.state);
            let node = state.resolve(conn, handle)?;
            if !state.is_live(node) {
                return Err(ChannelError::Unreachable(handle));
            }
        }
        let child = self.connect();
        let mut state = lock(&self.inner.state);
        let node = state.resolve(conn, handle)?;
        if !state.is_live(node) {
            return Err(ChannelError::Unreachable(handle));
        }
        let id = state.acquire(child.link.id, node).ok_or(ChannelError::Disconnected)?;
        trace!(bus = %self.inner.path, parent = conn, child = child.link.id, node, "peer cloned");
        Ok((child, id))
    }

    fn disconnect(&self, conn: u64) {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let Some(entry) = state.peers.remove(&conn) else { return };

        let owned: Vec<u64> = state.nodes.iter().filter(|(_, n)| n.owner == conn).map(|(id, _)| *id).collect();
        for &node in &owned {
            state.destroy(node);
        }
        let mut touched = owned;
        for handle in entry.handles.into_values() {
            if let Some(node) = state.nodes.get_mut(&handle.node) {
                node.holders.remove(&conn);
                touched.push(handle.node);
            }
        }
        for node in touched {
            state.maybe_finish(node);
        }
        trace!(bus = %self.inner.path, conn, "disconnected");
    }
}

fn duplicate(fds: &[OwnedFd]) -> Result<Vec<OwnedFd>> {
    fds.iter().map(|fd| fd.try_clone().map_err(|e| ChannelError::Io(e.to_string()))).collect()
}

struct Link {
    bus: LocalBus,
    id: u64,
    rx: Receiver<Delivery>,
}

impl Drop for Link {
    fn drop(&mut self) {
        DESCRIPTORS.remove(&self.id);
        self.bus.disconnect(self.id);
    }
}

/// One connection to a `LocalBus`.
///
/// Several `Connection`s may share a link when a descriptor is imported with
/// `from_descriptor`; the bus forgets the link once the last of them is gone
/// or the last open one disconnects.
pub struct Connection {
    link: Arc<Link>,
    closed: AtomicBool,
}

impl Connection {
    /// Attaches to the live connection registered under `fd`.
    pub fn from_descriptor(fd: u64) -> Result<Connection> {
        let link = DESCRIPTORS.get(&fd).and_then(|w| w.upgrade()).ok_or(ChannelError::UnknownDescriptor(fd))?;
        Ok(Connection { link, closed: AtomicBool::new(false) })
    }

    pub fn bus(&self) -> &LocalBus {
        &self.link.bus
    }

    fn check(&self) -> Result<&LocalBus> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Disconnected);
        }
        Ok(&self.link.bus)
    }
}

impl Channel for Connection {
    fn descriptor(&self) -> u64 {
        self.link.id
    }

    fn node_new(&self) -> Result<u64> {
        self.check()?.node_new(self.link.id)
    }

    fn node_release(&self, handle: u64) -> Result<()> {
        self.check()?.node_release(self.link.id, handle)
    }

    fn node_destroy(&self, handle: u64) -> Result<()> {
        self.check()?.node_destroy(self.link.id, handle)
    }

    fn handle_release(&self, handle: u64) -> Result<()> {
        self.check()?.handle_release(self.link.id, handle)
    }

    fn send(&self, destinations: &[u64], frame: &[u8], fds: &[OwnedFd]) -> Result<()> {
        self.check()?.send(self.link.id, destinations, frame, fds)
    }

    fn send_seed(&self, frame: &[u8], fds: &[OwnedFd]) -> Result<()> {
        self.check()?.send_seed(self.link.id, frame, fds)
    }

    fn recv(&self) -> Result<Delivery> {
        self.check()?;
        self.link.rx.recv().map_err(|_| ChannelError::Disconnected)
    }

    fn try_recv(&self) -> Result<Option<Delivery>> {
        self.check()?;
        match self.link.rx.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    fn recv_seed(&self) -> Result<Delivery> {
        self.check()?.recv_seed(self.link.id)
    }

    fn is_readable(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.link.rx.is_empty()
    }

    fn clone_peer(&self, handle: u64) -> Result<(Box<dyn Channel>, u64)> {
        let (child, id) = self.check()?.clone_peer(self.link.id, handle)?;
        Ok((Box::new(child), id))
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if Arc::strong_count(&self.link) == 1 {
            self.link.bus.disconnect(self.link.id);
        }
    }
}
