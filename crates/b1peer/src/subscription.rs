//! # Subscriptions
//!
//! A registration on a `Handle` that fires once the handle's node becomes
//! unreachable. It refers to the handle weakly and unregisters on drop.

use std::fmt;
use std::sync::Weak;

use crate::handle::HandleShared;

pub struct Subscription {
    handle: Weak<HandleShared>,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(handle: Weak<HandleShared>, id: u64) -> Subscription {
        Subscription { handle, id }
    }

    /// A subscription that already fired.
    pub(crate) fn inert() -> Subscription {
        Subscription { handle: Weak::new(), id: 0 }
    }

    /// True while the callback is registered and has not fired.
    pub fn is_active(&self) -> bool {
        self.handle.upgrade().is_some_and(|h| h.is_subscribed(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.upgrade() {
            handle.unsubscribe(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).field("active", &self.is_active()).finish()
    }
}
