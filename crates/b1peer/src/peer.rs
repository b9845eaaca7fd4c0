//! # Peer
//!
//! A `Peer` owns one channel connection and mirrors the channel's capability
//! state in user-facing objects: the nodes it hosts, the handles it holds,
//! and the calls it is waiting on.
//!
//! ## Dispatch
//!
//! `recv` turns the next delivery into a `Message`; `Message::dispatch` acts
//! on it inline:
//!
//! - **CALL**: check the payload, resolve node, interface, member and input
//!   signature, then run the member's handler. Each failed step is answered
//!   with the matching ERROR (see `names`). A handler that fails without
//!   answering gets a `Failed` ERROR sent on its behalf.
//! - **REPLY / ERROR**: complete the pending call with that id whose reply
//!   node received it, with `CallError::Malformed` if the payload is bad.
//!   Anything unmatched is dropped.
//! - **NODE_DESTROY**: mark the handle stale, fire its subscriptions, and fail
//!   calls waiting on that destination.
//! - **NODE_RELEASE**: a released node lost its last holder; finish it. Until
//!   then the peer keeps the node alive even if every `Node` is dropped.
//!
//! ## Teardown
//!
//! Closing or dropping the last `Peer` completes every pending call with
//! `ConnectionClosed`, destroys every node, and disconnects the channel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use b1pack::Value;
use b1wire::MessageType;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::builder::PeerBuilder;
use crate::bus::Connection;
use crate::channel::Channel;
use crate::channel::ChannelError;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::names;
use crate::handle::Handle;
use crate::handle::HandleShared;
use crate::interface::Interface;
use crate::lock;
use crate::message::Message;
use crate::node::DestroyReason;
use crate::node::Node;
use crate::node::NodeShared;
use crate::node::NodeState;
use crate::node::Userdata;
use crate::reply::CallError;
use crate::reply::Outcome;
use crate::reply::Pending;

pub(crate) struct PeerInner {
    pub(crate) name: String,
    pub(crate) channel: Box<dyn Channel>,
    closed: AtomicBool,
    pub(crate) nodes: DashMap<u64, Weak<NodeShared>>,
    /// Released nodes waiting for NODE_RELEASE.
    pub(crate) released: DashMap<u64, Arc<NodeShared>>,
    pub(crate) handles: DashMap<u64, Weak<HandleShared>>,
    pub(crate) pending: DashMap<u64, Pending>,
    /// Unclaimed root nodes from the seed, by name.
    roots: Mutex<BTreeMap<String, u64>>,
    seq_gen: AtomicU64,
}

impl PeerInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn next_call_id(&self) -> u64 {
        self.seq_gen.fetch_add(1, Ordering::Relaxed)
    }

    /// Wraps a handle id from a delivery. The delivery added one channel
    /// reference; if a live `Handle` already exists it keeps the reference
    /// it has and the new one is returned to the channel.
    pub(crate) fn acquire_handle(self: &Arc<Self>, id: u64) -> Handle {
        match self.handles.entry(id) {
            Entry::Occupied(mut entry) => {
                if let Some(shared) = entry.get().upgrade() {
                    drop(entry);
                    if let Err(e) = self.channel.handle_release(id) {
                        trace!(peer = %self.name, handle = id, error = %e, "extra reference not released");
                    }
                    return Handle { shared };
                }
                let handle = Handle::new(self, id, false);
                entry.insert(Arc::downgrade(&handle.shared));
                handle
            }
            Entry::Vacant(entry) => {
                let handle = Handle::new(self, id, false);
                entry.insert(Arc::downgrade(&handle.shared));
                handle
            }
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, message: &mut Message) -> Result<()> {
        match message.kind() {
            MessageType::Call => self.dispatch_call(message),
            MessageType::Reply | MessageType::Error => {
                self.dispatch_answer(message);
                Ok(())
            }
            MessageType::NodeDestroy => {
                self.dispatch_destroy(message.destination().unwrap_or_default());
                Ok(())
            }
            MessageType::NodeRelease => {
                self.dispatch_release(message.destination().unwrap_or_default());
                Ok(())
            }
            MessageType::Seed => Err(Error::WrongMessageType { expected: MessageType::Call, found: MessageType::Seed }),
        }
    }

    fn dispatch_call(self: &Arc<Self>, message: &mut Message) -> Result<()> {
        let interface = message.interface().unwrap_or_default().to_string();
        let member = message.member().unwrap_or_default().to_string();
        let id = message.destination().unwrap_or_default();

        if let Some(error) = message.payload_error() {
            let detail = format!("{:?}: {}", message.signature().as_str(), error);
            return self.refuse(message, names::INVALID_PAYLOAD, detail);
        }

        let node = self
            .nodes
            .get(&id)
            .and_then(|w| w.upgrade())
            .map(|shared| Node { shared })
            .filter(|node| matches!(node.state(), NodeState::Active | NodeState::Released));
        let Some(node) = node else {
            if lock(&self.roots).values().any(|&root| root == id) {
                return self.refuse(message, names::MISSING_ROOT_INTERFACE, interface);
            }
            return self.refuse(message, names::UNKNOWN_DESTINATION, format!("node {}", id));
        };

        let Some(iface) = node.interface().filter(|i| i.name() == interface).cloned() else {
            return self.refuse(message, names::UNKNOWN_INTERFACE, interface);
        };
        let Some(member) = iface.member(&member) else {
            return self.refuse(message, names::UNKNOWN_MEMBER, format!("{}.{}", interface, member));
        };
        if message.signature() != member.input() {
            let detail = format!("expected {:?}, found {:?}", member.input().as_str(), message.signature().as_str());
            return self.refuse(message, names::SIGNATURE_MISMATCH, detail);
        }

        message.expected_reply = Some(member.output().clone());
        debug!(peer = %self.name, node = id, interface = %interface, member = member.name(), call_id = message.call_id(), "dispatching call");
        match member.call(&node, message) {
            Ok(()) => Ok(()),
            Err(e) if !message.responded && message.reply_handle().is_some() => {
                self.refuse(message, names::FAILED, e.to_string())
            }
            Err(e) => Err(e),
        }
    }

    /// Answers a CALL with a named ERROR carrying `detail`.
    fn refuse(self: &Arc<Self>, message: &mut Message, name: &str, detail: String) -> Result<()> {
        warn!(peer = %self.name, call_id = message.call_id(), error = name, detail = %detail, "refusing call");
        if message.reply_handle().is_none() {
            return Ok(());
        }
        let peer = Peer::from_inner(self.clone());
        let mut error = Message::new_error(&peer, name, "s")?;
        error.write("s", &[detail.into()])?;
        if let Err(e) = message.reply(&mut error) {
            warn!(peer = %self.name, call_id = message.call_id(), error = %e, "error reply not sent");
        }
        Ok(())
    }

    fn dispatch_answer(&self, message: &mut Message) {
        let destination = message.destination();
        let matched = self.pending.remove_if(&message.call_id(), |_, p| Some(p.reply_node.id()) == destination);
        let Some((_, pending)) = matched else {
            trace!(peer = %self.name, call_id = message.call_id(), kind = ?message.kind(), "dropping unmatched answer");
            return;
        };

        let malformed = message.payload_error().map(ToString::to_string);
        let outcome = if let Some(detail) = malformed {
            Outcome::Failed(CallError::Malformed(detail))
        } else if message.kind() == MessageType::Error {
            Outcome::Error(message)
        } else if message.signature() != &pending.expected {
            let found = message.signature().clone();
            Outcome::Failed(CallError::SignatureMismatch { expected: pending.expected.clone(), found })
        } else {
            Outcome::Reply(message)
        };
        pending.resolve(self, outcome);
    }

    fn dispatch_destroy(&self, id: u64) {
        let handle = self.handles.get(&id).and_then(|w| w.upgrade()).map(|shared| Handle { shared });
        if let Some(handle) = handle {
            debug!(peer = %self.name, handle = id, "handle unreachable");
            handle.mark_stale();
        }
        let waiting: Vec<u64> =
            self.pending.iter().filter(|e| e.value().destination == Some(id)).map(|e| *e.key()).collect();
        for call_id in waiting {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                pending.resolve(self, Outcome::Failed(CallError::Unreachable));
            }
        }
    }

    fn dispatch_release(&self, id: u64) {
        let held = self.released.remove(&id).map(|(_, node)| node);
        let node = held.or_else(|| self.nodes.get(&id).and_then(|w| w.upgrade()));
        if let Some(node) = node {
            node.finish(Some(self), DestroyReason::Released);
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.name, pending = self.pending.len(), nodes = self.nodes.len(), "shutting down");

        let calls: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for call_id in calls {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                pending.resolve(self, Outcome::Failed(CallError::ConnectionClosed));
            }
        }

        let nodes: Vec<Arc<NodeShared>> = self.nodes.iter().filter_map(|e| e.value().upgrade()).collect();
        for node in &nodes {
            node.finish(Some(self), DestroyReason::PeerClosed);
        }
        drop(nodes);
        self.released.clear();

        let roots = std::mem::take(&mut *lock(&self.roots));
        for id in roots.into_values() {
            if let Err(e) = self.channel.node_destroy(id) {
                trace!(peer = %self.name, node = id, error = %e, "root destroy failed");
            }
        }
        self.channel.disconnect();
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One connection to a bus.
///
/// Clones share the connection. The peer shuts down when the last clone is
/// dropped or `close` is called.
#[derive(Clone)]
pub struct Peer {
    pub(crate) inner: Arc<PeerInner>,
}

impl Peer {
    pub(crate) fn from_inner(inner: Arc<PeerInner>) -> Peer {
        Peer { inner }
    }

    /// Connects to the bus at `path`, or at `DEFAULT_BUS_PATH`.
    pub fn new(path: Option<&str>) -> Result<Peer> {
        let mut builder = Peer::builder();
        if let Some(path) = path {
            builder = builder.bus_path(path);
        }
        builder.connect()
    }

    pub fn builder() -> PeerBuilder {
        PeerBuilder::new()
    }

    /// Wraps an already open channel.
    pub fn from_channel(name: impl Into<String>, channel: Box<dyn Channel>) -> Peer {
        let inner = PeerInner {
            name: name.into(),
            channel,
            closed: AtomicBool::new(false),
            nodes: DashMap::new(),
            released: DashMap::new(),
            handles: DashMap::new(),
            pending: DashMap::new(),
            roots: Mutex::new(BTreeMap::new()),
            seq_gen: AtomicU64::new(1),
        };
        debug!(peer = %inner.name, fd = inner.channel.descriptor(), "peer opened");
        Peer { inner: Arc::new(inner) }
    }

    /// Attaches to the connection registered under descriptor `fd`.
    ///
    /// The connection is shared with whoever exported it; that side should
    /// stop using it.
    pub fn new_from_fd(fd: u64) -> Result<Peer> {
        let connection = Connection::from_descriptor(fd)?;
        Ok(Peer::from_channel(format!("fd{}", fd), Box::new(connection)))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Descriptor naming the underlying connection.
    pub fn fd(&self) -> u64 {
        self.inner.channel.descriptor()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Shuts the peer down now. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Calls still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Names of seed roots not yet claimed by `implement`.
    pub fn root_names(&self) -> Vec<String> {
        lock(&self.inner.roots).keys().cloned().collect()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn channel_error(&self, e: ChannelError) -> Error {
        if e != ChannelError::Disconnected {
            return e.into();
        }
        warn!(peer = %self.inner.name, "connection lost");
        self.inner.shutdown();
        Error::ConnectionClosed
    }

    /// True when `try_recv` would return a message.
    pub fn is_readable(&self) -> bool {
        !self.inner.is_closed() && self.inner.channel.is_readable()
    }

    /// Blocks until the next message arrives.
    pub fn recv(&self) -> Result<Message> {
        self.check_open()?;
        let delivery = self.inner.channel.recv().map_err(|e| self.channel_error(e))?;
        Message::from_delivery(&self.inner, delivery)
    }

    /// Returns the next message if one is queued.
    pub fn try_recv(&self) -> Result<Option<Message>> {
        self.check_open()?;
        match self.inner.channel.try_recv().map_err(|e| self.channel_error(e))? {
            Some(delivery) => Ok(Some(Message::from_delivery(&self.inner, delivery)?)),
            None => Ok(None),
        }
    }

    /// Takes the seed stored on this connection and records its roots for
    /// `implement`.
    pub fn recv_seed(&self) -> Result<Message> {
        self.check_open()?;
        let delivery = self.inner.channel.recv_seed().map_err(|e| self.channel_error(e))?;
        let (message, roots) = Message::from_seed(&self.inner, delivery)?;
        let mut table = lock(&self.inner.roots);
        for (name, id) in roots {
            debug!(peer = %self.inner.name, root = %name, node = id, "seed root");
            table.insert(name, id);
        }
        Ok(message)
    }

    /// Receives and dispatches one message.
    pub fn dispatch_next(&self) -> Result<()> {
        self.recv()?.dispatch()
    }

    /// Dispatches one message if any is queued.
    pub fn try_dispatch(&self) -> Result<bool> {
        match self.try_recv()? {
            Some(mut message) => {
                message.dispatch()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Opens a new connection on the same bus holding a handle to the node
    /// behind `handle`.
    pub fn clone_peer(&self, handle: &Handle) -> Result<(Peer, Handle)> {
        self.check_open()?;
        if !handle.belongs_to(&self.inner) {
            return Err(Error::ForeignObject);
        }
        let (channel, id) = self.inner.channel.clone_peer(handle.id())?;
        let child = Peer::from_channel(format!("{}.{}", self.inner.name, channel.descriptor()), channel);
        let handle = child.inner.acquire_handle(id);
        debug!(peer = %self.inner.name, child = %child.inner.name, handle = id, "peer cloned");
        Ok((child, handle))
    }

    /// Claims the seed root named after `interface` and implements it.
    pub fn implement(&self, interface: &Interface, userdata: Option<Userdata>) -> Result<Node> {
        self.check_open()?;
        let name = interface.name();
        let id = lock(&self.inner.roots).remove(name).ok_or_else(|| Error::NoSuchRoot(name.to_string()))?;
        let node = Node::adopt(&self.inner, id, userdata, Some(name.to_string()));
        node.implement(interface)?;
        debug!(peer = %self.inner.name, root = %name, node = id, "root implemented");
        Ok(node)
    }

    /// Calls `interface.member` on `target` and dispatches incoming messages
    /// until the answer arrives.
    ///
    /// Other messages are dispatched while waiting, so handlers on this peer
    /// keep running.
    pub fn call_blocking(
        &self,
        target: &Handle,
        interface: &str,
        member: &str,
        input: &str,
        args: &[Value],
        output: &str,
    ) -> Result<Vec<Value>> {
        let result: Arc<Mutex<Option<Result<Vec<Value>>>>> = Arc::new(Mutex::new(None));
        let slot_result = result.clone();
        let output_sig = output.to_string();
        let (mut call, slot) = Message::new_call_with_reply(self, interface, member, input, output, move |outcome| {
            let answer = match outcome {
                Outcome::Reply(reply) => reply.read(&output_sig),
                Outcome::Error(error) => {
                    let name = error.error_name().unwrap_or_default().to_string();
                    let detail = match error.signature().as_str() {
                        "s" => error.read("s").ok().and_then(|v| v.first().and_then(|s| s.as_str().map(String::from))),
                        _ => None,
                    };
                    Err(Error::Remote { name, detail })
                }
                Outcome::Failed(e) => Err(Error::Call(e)),
            };
            *lock(&slot_result) = Some(answer);
        })?;

        if let Err(e) = call.write(input, args).and_then(|_| call.send(&[target])) {
            slot.cancel();
            return Err(e);
        }

        loop {
            if let Some(answer) = lock(&result).take() {
                return answer;
            }
            if let Err(e) = self.dispatch_next() {
                if let Some(answer) = lock(&result).take() {
                    return answer;
                }
                if e.kind() == ErrorKind::Connection {
                    return Err(e);
                }
                warn!(peer = %self.inner.name, error = %e, "dispatch failed while waiting for reply");
            }
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.inner.name)
            .field("fd", &self.fd())
            .field("closed", &self.is_closed())
            .field("nodes", &self.inner.nodes.len())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}
