//! # Handles
//!
//! A `Handle` is a peer's reference to a node. Local handles belong to nodes
//! the peer owns; remote handles were received in messages.
//!
//! A peer keeps at most one live `HandleShared` per handle id. Every clone of
//! a `Handle` shares it, so identity is the pair (peer, id) no matter how the
//! handle was obtained. The channel reference behind a remote handle is
//! dropped when the last clone goes away.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::lock;
use crate::peer::Peer;
use crate::peer::PeerInner;
use crate::subscription::Subscription;

type SubscriptionFn = Box<dyn FnOnce(&Handle) + Send>;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

pub(crate) struct HandleShared {
    pub(crate) peer: Weak<PeerInner>,
    pub(crate) id: u64,
    owned: bool,
    stale: AtomicBool,
    subscriptions: Mutex<Vec<(u64, SubscriptionFn)>>,
}

impl HandleShared {
    pub(crate) fn unsubscribe(&self, id: u64) {
        lock(&self.subscriptions).retain(|(sub, _)| *sub != id);
    }

    pub(crate) fn is_subscribed(&self, id: u64) -> bool {
        lock(&self.subscriptions).iter().any(|(sub, _)| *sub == id)
    }
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        let Some(inner) = self.peer.upgrade() else { return };
        inner.handles.remove_if(&self.id, |_, w| w.strong_count() == 0);
        if self.owned {
            return;
        }
        if let Err(e) = inner.channel.handle_release(self.id) {
            trace!(peer = %inner.name, handle = self.id, error = %e, "handle release failed");
        }
    }
}

/// A capability referring to a node.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<HandleShared>,
}

impl Handle {
    pub(crate) fn new(peer: &Arc<PeerInner>, id: u64, owned: bool) -> Handle {
        let shared = HandleShared {
            peer: Arc::downgrade(peer),
            id,
            owned,
            stale: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        };
        Handle { shared: Arc::new(shared) }
    }

    /// Id of this handle in its peer's id space.
    pub fn id(&self) -> u64 { self.shared.id }

    /// True if the handle belongs to a node this peer owns.
    pub fn is_local(&self) -> bool { self.shared.owned }

    /// True once the node behind the handle is known to be unreachable.
    pub fn is_stale(&self) -> bool { self.shared.stale.load(Ordering::Acquire) }

    /// The peer holding this handle, if it is still alive.
    pub fn peer(&self) -> Option<Peer> {
        self.shared.peer.upgrade().map(Peer::from_inner)
    }

    pub(crate) fn belongs_to(&self, peer: &Arc<PeerInner>) -> bool {
        std::ptr::eq(self.shared.peer.as_ptr(), Arc::as_ptr(peer))
    }

    /// Registers `f` to run once the node behind this handle becomes
    /// unreachable. On an already stale handle `f` runs immediately.
    ///
    /// Dropping the returned `Subscription` unregisters `f`.
    pub fn subscribe(&self, f: impl FnOnce(&Handle) + Send + 'static) -> Subscription {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscriptions = lock(&self.shared.subscriptions);
            if !self.is_stale() {
                subscriptions.push((id, Box::new(f)));
                return Subscription::new(Arc::downgrade(&self.shared), id);
            }
        }
        f(self);
        Subscription::inert()
    }

    /// Marks the handle stale and fires every subscription once.
    pub(crate) fn mark_stale(&self) {
        self.shared.stale.store(true, Ordering::Release);
        let fired = std::mem::take(&mut *lock(&self.shared.subscriptions));
        for (_, f) in fired {
            f(self);
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id && Weak::ptr_eq(&self.shared.peer, &other.shared.peer)
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.peer.as_ptr().hash(state);
        self.shared.id.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .field("local", &self.shared.owned)
            .field("stale", &self.is_stale())
            .finish()
    }
}
