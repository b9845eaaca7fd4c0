//! # Nodes
//!
//! A `Node` is an object hosted by a peer and reachable through handles. It
//! owns exactly one local handle, carries optional user data, and may
//! implement one `Interface`.
//!
//! ## Lifecycle
//!
//! ```text
//! Active --release()--> Released --last holder gone--> Destroyed
//!    \                       \
//!     +----destroy()----------+-------------------------> Destroyed
//! ```
//!
//! A released node no longer receives new calls, but calls already queued
//! are still dispatched. Destroying is immediate. Either path runs the
//! destroy callback exactly once. Dropping the last `Node` reference of a
//! node that is still active destroys it; a released node is kept by its
//! peer until the release completes. A node placed in a sent SEED is
//! `Transferred`: it now belongs to whoever receives the seed.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;

use tracing::debug;
use tracing::trace;

use crate::error::Error;
use crate::error::Result;
use crate::handle::Handle;
use crate::interface::Interface;
use crate::lock;
use crate::peer::Peer;
use crate::peer::PeerInner;

/// Opaque user context attached to a node.
pub type Userdata = Arc<dyn Any + Send + Sync>;

type DestroyFn = Box<dyn FnOnce(&Destroyed) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Active,
    Released,
    Destroyed,
    Transferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    /// `Node::destroy` was called.
    Destroyed,
    /// The node was released and its last holder let go.
    Released,
    /// The owning peer shut down.
    PeerClosed,
    /// The last `Node` reference was dropped.
    Dropped,
}

/// Passed to a node's destroy callback.
pub struct Destroyed {
    pub id: u64,
    pub userdata: Option<Userdata>,
    pub reason: DestroyReason,
}

pub(crate) struct NodeShared {
    peer: Weak<PeerInner>,
    id: u64,
    handle: Handle,
    userdata: Option<Userdata>,
    interface: OnceLock<Interface>,
    destroy_fn: Mutex<Option<DestroyFn>>,
    state: Mutex<NodeState>,
    name: Option<String>,
}

impl NodeShared {
    pub(crate) fn state(&self) -> NodeState {
        *lock(&self.state)
    }

    /// Moves the node to `Destroyed` and runs everything that entails, once.
    pub(crate) fn finish(&self, inner: Option<&PeerInner>, reason: DestroyReason) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, NodeState::Destroyed | NodeState::Transferred) {
                return;
            }
            *state = NodeState::Destroyed;
        }

        if let Some(inner) = inner {
            inner.nodes.remove_if(&self.id, |_, w| w.strong_count() == 0 || std::ptr::eq(w.as_ptr(), self));
            // Callers hold their own reference, so this is never the last one.
            let held = inner.released.remove(&self.id);
            drop(held);
            // After NODE_RELEASE the channel has already forgotten the node.
            if reason != DestroyReason::Released {
                if let Err(e) = inner.channel.node_destroy(self.id) {
                    trace!(peer = %inner.name, node = self.id, error = %e, "node destroy failed");
                }
            }
            debug!(peer = %inner.name, node = self.id, ?reason, "node destroyed");
        }

        self.handle.mark_stale();
        let destroy_fn = lock(&self.destroy_fn).take();
        if let Some(f) = destroy_fn {
            f(&Destroyed { id: self.id, userdata: self.userdata.clone(), reason });
        }
    }

    /// Hands the node over to the receiver of a seed.
    pub(crate) fn transfer(&self, inner: &PeerInner) {
        {
            let mut state = lock(&self.state);
            if *state != NodeState::Active {
                return;
            }
            *state = NodeState::Transferred;
        }
        inner.nodes.remove(&self.id);
        trace!(peer = %inner.name, node = self.id, "node transferred");
    }
}

impl Drop for NodeShared {
    fn drop(&mut self) {
        let inner = self.peer.upgrade();
        self.finish(inner.as_deref(), DestroyReason::Dropped);
    }
}

/// A locally hosted object.
///
/// Clones share the node. The node is destroyed when the last clone drops,
/// unless it was destroyed, released or transferred earlier.
#[derive(Clone)]
pub struct Node {
    pub(crate) shared: Arc<NodeShared>,
}

impl Node {
    /// Allocates a new node on `peer`.
    pub fn new(peer: &Peer, userdata: Option<Userdata>) -> Result<Node> {
        peer.check_open()?;
        let id = peer.inner.channel.node_new()?;
        Ok(Node::adopt(&peer.inner, id, userdata, None))
    }

    /// Wraps a node id the channel already allocated for this peer.
    pub(crate) fn adopt(inner: &Arc<PeerInner>, id: u64, userdata: Option<Userdata>, name: Option<String>) -> Node {
        let handle = Handle::new(inner, id, true);
        inner.handles.insert(id, Arc::downgrade(&handle.shared));
        let shared = NodeShared {
            peer: Arc::downgrade(inner),
            id,
            handle,
            userdata,
            interface: OnceLock::new(),
            destroy_fn: Mutex::new(None),
            state: Mutex::new(NodeState::Active),
            name,
        };
        let shared = Arc::new(shared);
        inner.nodes.insert(id, Arc::downgrade(&shared));
        trace!(peer = %inner.name, node = id, "node created");
        Node { shared }
    }

    pub fn id(&self) -> u64 { self.shared.id }

    pub fn state(&self) -> NodeState { self.shared.state() }

    /// Root name this node was claimed under, if any.
    pub fn name(&self) -> Option<&str> { self.shared.name.as_deref() }

    pub fn interface(&self) -> Option<&Interface> { self.shared.interface.get() }

    pub fn userdata(&self) -> Option<&Userdata> { self.shared.userdata.as_ref() }

    /// Borrows the user data as `T`, if it is one.
    pub fn userdata_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.shared.userdata.as_ref()?.downcast_ref::<T>()
    }

    /// The node's own handle. Always the same identity for the node's lifetime.
    pub fn handle(&self) -> Handle {
        self.shared.handle.clone()
    }

    pub fn peer(&self) -> Option<Peer> {
        self.shared.peer.upgrade().map(Peer::from_inner)
    }

    /// Sets the callback run when the node is destroyed, replacing any earlier one.
    pub fn set_destroy_fn(&self, f: impl FnOnce(&Destroyed) + Send + 'static) {
        *lock(&self.shared.destroy_fn) = Some(Box::new(f));
    }

    /// Binds `interface` to the node and freezes the interface.
    ///
    /// # Errors
    /// `AlreadyImplemented` on a second call, `NodeUnavailable` once the
    /// node is destroyed or transferred.
    pub fn implement(&self, interface: &Interface) -> Result<()> {
        let state = self.state();
        if matches!(state, NodeState::Destroyed | NodeState::Transferred) {
            return Err(Error::NodeUnavailable(state));
        }
        self.shared.interface.set(interface.clone()).map_err(|_| Error::AlreadyImplemented)?;
        interface.freeze();
        Ok(())
    }

    /// Stops new calls from reaching the node and tells every holder.
    ///
    /// The destroy callback runs once the last holder drops its handle. The
    /// peer keeps the node alive until then, so queued calls still reach it
    /// after every `Node` clone is gone. Releasing twice is a no-op.
    pub fn release(&self) -> Result<()> {
        let inner = self.shared.peer.upgrade().ok_or(Error::ConnectionClosed)?;
        {
            let mut state = lock(&self.shared.state);
            match *state {
                NodeState::Active => {}
                NodeState::Released => return Ok(()),
                other => return Err(Error::NodeUnavailable(other)),
            }
            // Must be held before the channel can deliver NODE_RELEASE.
            inner.released.insert(self.shared.id, self.shared.clone());
            if let Err(e) = inner.channel.node_release(self.shared.id) {
                inner.released.remove(&self.shared.id);
                return Err(e.into());
            }
            *state = NodeState::Released;
        }
        debug!(peer = %inner.name, node = self.shared.id, "node released");
        self.shared.handle.mark_stale();
        Ok(())
    }

    /// Invalidates the node immediately and runs its destroy callback.
    /// Idempotent.
    pub fn destroy(&self) {
        let inner = self.shared.peer.upgrade();
        self.shared.finish(inner.as_deref(), DestroyReason::Destroyed);
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("name", &self.shared.name)
            .field("interface", &self.interface().map(Interface::name))
            .finish()
    }
}
