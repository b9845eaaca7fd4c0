//! # Error Definitions
//!
//! Everything that can go wrong turning a frame into bytes and back.

use b1pack::Error as PackError;

use crate::MessageType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The meta block or body failed to encode or validate.
    Pack(PackError),
    /// Fewer bytes than the header or its declared lengths require.
    Truncated { needed: usize, available: usize },
    /// Bytes left over after the handle trailer.
    TrailingBytes(usize),
    /// The type tag is not one of the framed message types.
    UnknownType(u8),
    /// Flags or reserved header bits were set.
    ReservedBits,
    /// The meta block carried a signature other than the one its type requires.
    MetaMismatch { expected: &'static str, found: String },
    /// The frame is over `MAX_FRAME_SIZE`.
    TooLarge(usize),
    /// Channel-generated notifications never travel as frames.
    NotTransmittable(MessageType),
    /// A meta block referenced a handle past the trailer.
    HandleIndex { index: u32, count: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Pack(e) => write!(f, "payload: {}", e),
            Error::Truncated { needed, available } => {
                write!(f, "frame truncated: need {} bytes, have {}", needed, available)
            }
            Error::MetaMismatch { expected, found } => {
                write!(f, "meta signature {:?} does not match {:?}", found, expected)
            }
            Error::HandleIndex { index, count } => {
                write!(f, "handle index {} out of range for {} handles", index, count)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Pack(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Pack(e) }
}

pub type Result<T> = std::result::Result<T, Error>;
