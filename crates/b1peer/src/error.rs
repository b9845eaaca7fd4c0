//! # Error Definitions
//!
//! One error type for everything a peer can report, classified by `kind()`:
//!
//! - **Argument**: caller mistakes. Always local, never transmitted.
//! - **Protocol**: a remote peer sent something unexpected, or answered with
//!   an ERROR message.
//! - **Resource**: duplicate registrations and exhausted limits. Nothing is
//!   mutated when these are returned, so the caller may retry or give up.
//! - **Connection**: terminal for the peer.

use b1pack::Error as PackError;
use b1pack::Signature;
use b1wire::Error as WireError;
use b1wire::MessageType;

use crate::channel::ChannelError;
use crate::node::NodeState;
use crate::reply::CallError;

/// Names of the ERROR messages a peer produces while servicing calls.
/// Each carries a single `s` describing the failure.
pub mod names {
    /// The destination node is gone.
    pub const UNKNOWN_DESTINATION: &str = "org.bus1.Error.UnknownDestination";
    /// The node implements a different interface.
    pub const UNKNOWN_INTERFACE: &str = "org.bus1.Error.UnknownInterface";
    /// The node is a root node no interface has claimed yet.
    pub const MISSING_ROOT_INTERFACE: &str = "org.bus1.Error.MissingRootInterface";
    /// The interface has no member by that name.
    pub const UNKNOWN_MEMBER: &str = "org.bus1.Error.UnknownMember";
    /// The payload does not match the member's input signature.
    pub const SIGNATURE_MISMATCH: &str = "org.bus1.Error.SignatureMismatch";
    /// The payload does not validate against its own signature.
    pub const INVALID_PAYLOAD: &str = "org.bus1.Error.InvalidPayload";
    /// The handler failed without sending a response.
    pub const FAILED: &str = "org.bus1.Error.Failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Argument,
    Protocol,
    Resource,
    Connection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Pack(PackError),
    Wire(WireError),
    Channel(ChannelError),
    InvalidArgument(String),
    IndexOutOfRange { index: usize, len: usize },
    /// The message is sealed; its payload and attachments are frozen.
    Sealed,
    /// Reading requires a sealed message.
    NotSealed,
    /// The object belongs to a different peer.
    ForeignObject,
    WrongMessageType { expected: MessageType, found: MessageType },
    NotTransmittable(MessageType),
    DuplicateDestination(u64),
    DuplicateMember(String),
    DuplicateName(String),
    /// Members cannot be added once a node implements the interface.
    InterfaceInUse,
    AlreadyImplemented,
    NodeUnavailable(NodeState),
    /// No unclaimed root node carries this name.
    NoSuchRoot(String),
    /// The call carries no reply handle.
    NoReplyExpected,
    AlreadyReplied,
    SignatureMismatch { expected: Signature, found: Signature },
    /// The remote side answered with an ERROR message.
    Remote { name: String, detail: Option<String> },
    Call(CallError),
    Handler(String),
    Environment(String),
    Io(String),
    ConnectionClosed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Pack(_)
            | Error::InvalidArgument(_)
            | Error::IndexOutOfRange { .. }
            | Error::Sealed
            | Error::NotSealed
            | Error::ForeignObject
            | Error::WrongMessageType { .. }
            | Error::NotTransmittable(_)
            | Error::DuplicateDestination(_)
            | Error::NoReplyExpected
            | Error::AlreadyReplied
            | Error::Environment(_) => ErrorKind::Argument,
            Error::Wire(_) | Error::SignatureMismatch { .. } | Error::Remote { .. } | Error::Handler(_) => {
                ErrorKind::Protocol
            }
            Error::DuplicateMember(_)
            | Error::DuplicateName(_)
            | Error::InterfaceInUse
            | Error::AlreadyImplemented
            | Error::NodeUnavailable(_)
            | Error::NoSuchRoot(_) => ErrorKind::Resource,
            Error::Channel(e) => match e {
                ChannelError::Disconnected | ChannelError::Io(_) => ErrorKind::Connection,
                ChannelError::QuotaExceeded { .. } | ChannelError::FrameTooLarge { .. } | ChannelError::NoSeed => {
                    ErrorKind::Resource
                }
                ChannelError::Unreachable(_) | ChannelError::Malformed(_) => ErrorKind::Protocol,
                ChannelError::InvalidHandle(_)
                | ChannelError::NotOwner(_)
                | ChannelError::UnknownDescriptor(_) => ErrorKind::Argument,
            },
            Error::Call(CallError::ConnectionClosed) => ErrorKind::Connection,
            Error::Call(CallError::Cancelled) => ErrorKind::Argument,
            Error::Call(_) => ErrorKind::Protocol,
            Error::Io(_) | Error::ConnectionClosed => ErrorKind::Connection,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pack(e) => write!(f, "Encoding error: {}", e),
            Self::Wire(e) => write!(f, "Malformed message: {}", e),
            Self::Channel(e) => write!(f, "Channel error: {}", e),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "Index {} out of range for {} entries", index, len)
            }
            Self::Sealed => write!(f, "Message is sealed"),
            Self::NotSealed => write!(f, "Message is not sealed"),
            Self::ForeignObject => write!(f, "Object belongs to a different peer"),
            Self::WrongMessageType { expected, found } => {
                write!(f, "Expected a {:?} message, got {:?}", expected, found)
            }
            Self::NotTransmittable(kind) => write!(f, "{:?} messages cannot be sent", kind),
            Self::DuplicateDestination(id) => write!(f, "Handle {} named twice as destination", id),
            Self::DuplicateMember(name) => write!(f, "Member {:?} already exists", name),
            Self::DuplicateName(name) => write!(f, "Name {:?} used twice", name),
            Self::InterfaceInUse => write!(f, "Interface is already implemented by a node"),
            Self::AlreadyImplemented => write!(f, "Node already implements an interface"),
            Self::NodeUnavailable(state) => write!(f, "Node is {:?}", state),
            Self::NoSuchRoot(name) => write!(f, "No unclaimed root node named {:?}", name),
            Self::NoReplyExpected => write!(f, "Call does not expect a reply"),
            Self::AlreadyReplied => write!(f, "Call was already answered"),
            Self::SignatureMismatch { expected, found } => {
                write!(f, "Signature mismatch: expected {:?}, found {:?}", expected.as_str(), found.as_str())
            }
            Self::Remote { name, detail: Some(detail) } => write!(f, "{}: {}", name, detail),
            Self::Remote { name, detail: None } => write!(f, "{}", name),
            Self::Call(e) => write!(f, "Call failed: {}", e),
            Self::Handler(msg) => write!(f, "Handler failed: {}", msg),
            Self::Environment(msg) => write!(f, "Environment error: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pack(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::Channel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self {
        Self::Pack(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

impl From<CallError> for Error {
    fn from(e: CallError) -> Self {
        Self::Call(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
