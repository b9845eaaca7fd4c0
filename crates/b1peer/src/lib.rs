//! # B1peer
//!
//! A capability-based IPC peer. A `Peer` is one connection to a bus; over it
//! the peer hosts `Node`s, holds `Handle`s to nodes hosted anywhere on the bus,
//! and exchanges typed `Message`s that may carry further handles.
//!
//! ## Philosophy
//!
//! - **Capabilities, not names**: the only way to reach a node is to hold a
//!   handle to it. Handles travel inside messages; the channel rewrites their
//!   ids into the receiver's id space.
//! - **Synchronous dispatch**: `Peer::recv` blocks, `Message::dispatch` runs
//!   the matching handler inline. There is no internal thread pool; a handler
//!   that blocks on a nested call stalls its peer until the reply arrives.
//!   Concurrency comes from running several peers on several threads, or from
//!   polling `Peer::is_readable` in an event loop.
//! - **Every call resolves once**: a pending `ReplySlot` is completed by its
//!   reply, its error, a protocol failure, cancellation, or peer teardown, and
//!   by exactly one of them.
//!
//! ## Invariants
//! - A peer holds at most one `Handle` per node; handles compare equal iff
//!   they name the same node through the same peer.
//! - A node's destroy callback runs at most once.
//! - A `Subscription` fires at most once and never keeps its handle alive.
//! - Protocol failures while servicing a CALL are answered with ERROR
//!   messages, never with a local failure of the receiving peer.

#[cfg(test)]
mod tests;

mod builder;
mod bus;
mod channel;
mod environment;
mod error;
mod handle;
mod interface;
mod message;
mod multicast;
mod node;
mod peer;
mod reply;
mod subscription;

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

pub use b1pack::Signature;
pub use b1pack::Type;
pub use b1pack::Value;
pub use b1wire::MessageType;

pub use builder::PeerBuilder;
pub use bus::BusConfig;
pub use bus::Connection;
pub use bus::DEFAULT_BUS_PATH;
pub use bus::LocalBus;
pub use channel::Channel;
pub use channel::ChannelError;
pub use channel::Credentials;
pub use channel::Delivery;
pub use environment::PEER_FD_ENV;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use error::names;
pub use handle::Handle;
pub use interface::Interface;
pub use interface::Member;
pub use message::Message;
pub use message::ReplyTarget;
pub use multicast::MulticastGroup;
pub use node::DestroyReason;
pub use node::Destroyed;
pub use node::Node;
pub use node::NodeState;
pub use node::Userdata;
pub use peer::Peer;
pub use reply::CallError;
pub use reply::Outcome;
pub use reply::ReplySlot;
pub use subscription::Subscription;

/// Locks `mutex`, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
