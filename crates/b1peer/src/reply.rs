//! # Reply Slots
//!
//! Bookkeeping for calls awaiting an answer. The peer keeps one `Pending`
//! entry per outstanding call, keyed by call id; the caller gets a
//! `ReplySlot` token naming it.
//!
//! A pending call is completed exactly once, by the first of: a REPLY or
//! ERROR arriving at its reply node (well-formed or not), its destination becoming unreachable,
//! `ReplySlot::cancel`, or peer teardown.

use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

use b1pack::Signature;
use tracing::trace;

use crate::message::Message;
use crate::node::DestroyReason;
use crate::node::Node;
use crate::peer::PeerInner;

pub(crate) type ReplyFn = Box<dyn FnOnce(Outcome<'_>) + Send>;

/// How a call ended, as seen by its reply callback.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// A REPLY whose payload matches the expected output signature.
    Reply(&'a mut Message),
    /// An ERROR message; `Message::error_name` says which.
    Error(&'a mut Message),
    /// The call ended without a usable answer.
    Failed(CallError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The REPLY payload does not match the expected output signature.
    SignatureMismatch { expected: Signature, found: Signature },
    /// The answer's payload does not validate against its signature.
    Malformed(String),
    /// The destination node went away before answering.
    Unreachable,
    /// The calling peer shut down.
    ConnectionClosed,
    /// `ReplySlot::cancel` was called.
    Cancelled,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignatureMismatch { expected, found } => {
                write!(f, "reply signature {:?} does not match {:?}", found.as_str(), expected.as_str())
            }
            Self::Malformed(detail) => write!(f, "malformed answer: {}", detail),
            Self::Unreachable => write!(f, "destination unreachable"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for CallError {}

pub(crate) struct Pending {
    pub(crate) expected: Signature,
    pub(crate) reply_node: Node,
    /// Handle the call was sent to, once sent.
    pub(crate) destination: Option<u64>,
    pub(crate) callback: Mutex<Option<ReplyFn>>,
}

impl Pending {
    /// Runs the callback and retires the reply node.
    pub(crate) fn resolve(self, inner: &PeerInner, outcome: Outcome<'_>) {
        let Pending { reply_node, callback, .. } = self;
        if let Some(callback) = callback.into_inner().unwrap_or_else(PoisonError::into_inner) {
            callback(outcome);
        }
        reply_node.shared.finish(Some(inner), DestroyReason::Destroyed);
    }
}

/// Token for one outstanding call.
///
/// Dropping the token does not cancel the call; the peer still completes it.
pub struct ReplySlot {
    pub(crate) peer: Weak<PeerInner>,
    pub(crate) call_id: u64,
}

impl ReplySlot {
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn is_pending(&self) -> bool {
        self.peer.upgrade().is_some_and(|inner| inner.pending.contains_key(&self.call_id))
    }

    /// Completes the call with `CallError::Cancelled`. A late answer is
    /// dropped as unmatched. No-op if the call already completed.
    pub fn cancel(self) {
        let Some(inner) = self.peer.upgrade() else { return };
        let Some((_, pending)) = inner.pending.remove(&self.call_id) else { return };
        trace!(peer = %inner.name, call_id = self.call_id, "call cancelled");
        pending.resolve(&inner, Outcome::Failed(CallError::Cancelled));
    }
}

impl fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySlot").field("call_id", &self.call_id).field("pending", &self.is_pending()).finish()
    }
}
