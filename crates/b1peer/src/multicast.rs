//! # Multicast Groups
//!
//! A set of handles that one message can be sent to at once. Members leave
//! automatically when their node becomes unreachable.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use tracing::trace;

use crate::error::Error;
use crate::error::Result;
use crate::handle::Handle;
use crate::lock;
use crate::message::Message;
use crate::peer::Peer;
use crate::peer::PeerInner;
use crate::subscription::Subscription;

type Members = Arc<Mutex<Vec<(Handle, Subscription)>>>;

pub struct MulticastGroup {
    peer: Weak<PeerInner>,
    members: Members,
}

impl MulticastGroup {
    pub fn new(peer: &Peer) -> MulticastGroup {
        MulticastGroup { peer: Arc::downgrade(&peer.inner), members: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Adds the caller of `call`, through its reply handle.
    pub fn join(&self, call: &Message) -> Result<bool> {
        let handle = call.reply_handle().ok_or(Error::NoReplyExpected)?;
        self.add(handle.clone())
    }

    /// Adds `handle`. Returns false if it is already a member or already stale.
    pub fn add(&self, handle: Handle) -> Result<bool> {
        if !Weak::ptr_eq(&handle.shared.peer, &self.peer) {
            return Err(Error::ForeignObject);
        }
        if handle.is_stale() || lock(&self.members).iter().any(|(h, _)| *h == handle) {
            return Ok(false);
        }

        let members = Arc::downgrade(&self.members);
        let subscription = handle.subscribe(move |gone| {
            if let Some(members) = members.upgrade() {
                lock(&members).retain(|(h, _)| h != gone);
                trace!(handle = gone.id(), "multicast member left");
            }
        });
        if handle.is_stale() {
            return Ok(false);
        }
        lock(&self.members).push((handle, subscription));
        Ok(true)
    }

    pub fn remove(&self, handle: &Handle) -> bool {
        let mut members = lock(&self.members);
        let before = members.len();
        members.retain(|(h, _)| h != handle);
        members.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.members).is_empty()
    }

    pub fn handles(&self) -> Vec<Handle> {
        lock(&self.members).iter().map(|(h, _)| h.clone()).collect()
    }

    /// Sends `message` once to every member of every group. A handle in
    /// several groups receives it once. Sending to empty groups is a no-op.
    pub fn send(groups: &[&MulticastGroup], message: &mut Message) -> Result<()> {
        let mut targets: Vec<Handle> = Vec::new();
        for group in groups {
            for handle in group.handles() {
                if !targets.contains(&handle) {
                    targets.push(handle);
                }
            }
        }
        if targets.is_empty() {
            return Ok(());
        }
        let refs: Vec<&Handle> = targets.iter().collect();
        message.send(&refs)
    }
}
