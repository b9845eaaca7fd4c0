//! # Channel Abstraction
//!
//! The kernel-facing side of a peer: a connection that moves framed bytes
//! between handle holders and keeps the capability bookkeeping.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: a channel reads only the frame header and handle
//!   trailer. Meta blocks and bodies are opaque to it.
//! - **Capabilities live here**: handle ids, reference counts, node
//!   lifetimes and release notifications are the channel's job. The peer
//!   only mirrors them in user-facing objects.
//! - **Blocking and polling**: `recv` blocks, `try_recv` and `is_readable`
//!   let callers drive a peer from their own event loop.

use std::fmt;
use std::os::fd::OwnedFd;

/// Errors raised by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The connection is gone; every further operation fails.
    Disconnected,
    /// The caller does not hold this handle id.
    InvalidHandle(u64),
    /// The node behind this handle was released or destroyed.
    Unreachable(u64),
    /// Only the owning connection may release or destroy a node.
    NotOwner(u64),
    /// The receiver's queue is full.
    QuotaExceeded { queued: usize, limit: usize },
    /// The frame is larger than the bus accepts.
    FrameTooLarge { size: usize, limit: usize },
    /// Header or trailer could not be parsed.
    Malformed(String),
    /// No seed message was stored for this connection.
    NoSeed,
    /// No live connection is registered under this descriptor.
    UnknownDescriptor(u64),
    /// Duplicating a descriptor failed.
    Io(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Connection closed"),
            Self::InvalidHandle(id) => write!(f, "Handle {} is not held by this connection", id),
            Self::Unreachable(id) => write!(f, "Node behind handle {} is no longer reachable", id),
            Self::NotOwner(id) => write!(f, "Handle {} does not refer to an owned node", id),
            Self::QuotaExceeded { queued, limit } => {
                write!(f, "Receiver queue full: {} queued, limit {}", queued, limit)
            }
            Self::FrameTooLarge { size, limit } => {
                write!(f, "Frame of {} bytes exceeds limit of {}", size, limit)
            }
            Self::Malformed(msg) => write!(f, "Malformed frame: {}", msg),
            Self::NoSeed => write!(f, "No seed available"),
            Self::UnknownDescriptor(fd) => write!(f, "Descriptor {} does not name a live connection", fd),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Identity of the thread that sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
}

impl Credentials {
    /// Credentials of the calling thread.
    pub fn current() -> Self {
        // SAFETY: getuid and getgid take no arguments and cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Credentials { uid, gid, pid: std::process::id(), tid: current_tid() }
    }
}

#[cfg(target_os = "linux")]
fn current_tid() -> u32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> u32 {
    std::process::id()
}

/// Something a channel hands to its connection.
#[derive(Debug)]
pub enum Delivery {
    /// A frame sent to a node this connection owns. Trailer ids are already
    /// in this connection's id space.
    Data { destination: u64, frame: Vec<u8>, fds: Vec<OwnedFd>, credentials: Credentials },
    /// The node behind a held handle is no longer reachable.
    NodeDestroy { handle: u64 },
    /// A released node owned by this connection lost its last holder.
    NodeRelease { handle: u64 },
}

/// A connection to a capability bus.
///
/// This trait is object-safe (`Box<dyn Channel>`).
///
/// # Invariants
/// - A connection holds at most one handle id per node; repeated transfers of
///   the same node reuse the id and add one reference each.
/// - Every reference added by a delivery is dropped by one `handle_release`.
/// - Per sender and receiver, deliveries arrive in send order.
pub trait Channel: Send + Sync + 'static {
    /// Process-wide number naming this connection.
    fn descriptor(&self) -> u64;

    /// Allocates a node owned by this connection and returns its handle id.
    fn node_new(&self) -> Result<u64>;

    /// Stops the node from being reached; the owner later gets `NodeRelease`.
    fn node_release(&self, handle: u64) -> Result<()>;

    /// Invalidates the node immediately; holders get `NodeDestroy`.
    fn node_destroy(&self, handle: u64) -> Result<()>;

    /// Drops one reference on a held handle.
    fn handle_release(&self, handle: u64) -> Result<()>;

    /// Delivers a copy of `frame` to the owner of every destination.
    ///
    /// Destinations whose node is gone are skipped. Descriptors are duplicated
    /// per receiver; the caller keeps its own.
    fn send(&self, destinations: &[u64], frame: &[u8], fds: &[OwnedFd]) -> Result<()>;

    /// Stores `frame` as this connection's seed, replacing any earlier one.
    fn send_seed(&self, frame: &[u8], fds: &[OwnedFd]) -> Result<()>;

    /// Blocks until a delivery is available.
    fn recv(&self) -> Result<Delivery>;

    /// Returns the next delivery if one is queued.
    fn try_recv(&self) -> Result<Option<Delivery>>;

    /// Takes the stored seed.
    fn recv_seed(&self) -> Result<Delivery>;

    /// True when `try_recv` would return a delivery.
    fn is_readable(&self) -> bool;

    /// Opens a new connection on the same bus that holds a handle to the
    /// node behind `handle`. Returns the connection and its handle id.
    fn clone_peer(&self, handle: u64) -> Result<(Box<dyn Channel>, u64)>;

    /// Tears the connection down. Idempotent.
    fn disconnect(&self);
}
