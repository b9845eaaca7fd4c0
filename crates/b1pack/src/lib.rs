//! # B1pack
//!
//! A signature-driven binary codec for capability messages.
//!
//! ## Philosophy
//!
//! - **Typed by signature**: every payload is described by a short textual
//!   signature (`"s"`, `"a(su)"`, `"mv"`). Writers and readers are checked
//!   against it step by step, so a payload can never drift from its type.
//! - **Explicit state**: the `Encoder` keeps a stack of open containers and
//!   back-patches length headers when a container closes. The `Decoder`
//!   mirrors that stack while reading.
//! - **Hostile input**: a `Decoder` validates the whole payload before
//!   handing out a single value. Lengths, counts, booleans, UTF-8 and nesting
//!   are all bounded.
//!
//! ## Format
//!
//! - **Scalars**: fixed width (`b c y n q i u x t d`), indices (`h f`) as u32.
//! - **Strings**: `[Len: 4b][UTF-8: Len]`
//! - **Arrays**: `[Len: 4b][Count: 4b][Body: Len]`
//! - **Tuples**: fields back to back, no header.
//! - **Maybe**: `[Flag: 1b][Value?]`
//! - **Variant**: `[SigLen: 1b][Sig: SigLen][Len: 4b][Body: Len]`
//!
//! All integers are Little-Endian.


mod decoder;
mod encoder;
mod signature;
mod value;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use signature::MAX_DEPTH;
pub use signature::MAX_SIGNATURE_LEN;
pub use signature::Signature;
pub use signature::Type;
pub use value::Value;

/// Upper bound on open containers while encoding or decoding, variants included.
pub const MAX_NESTING: usize = 64;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Signature text does not follow the grammar.
    InvalidSignature { signature: String, reason: &'static str },
    /// Signature text is longer than `MAX_SIGNATURE_LEN`.
    SignatureTooLong(usize),
    /// Signature nests containers deeper than `MAX_DEPTH`.
    SignatureTooDeep,
    /// The next value in the signature is not the one being written or read.
    TypeMismatch { expected: String, found: String },
    /// A run of values does not have as many entries as its signature.
    ArityMismatch { expected: usize, found: usize },
    /// Closing a scope that does not match the active scope stack.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the Root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// A scope was closed (or the payload finished) before all its types were written.
    Incomplete { expected: String },
    /// The current scope has no further value to write or read.
    TooManyItems(Scope),
    /// Runtime nesting exceeded `MAX_NESTING`.
    NestingTooDeep,
    /// `peek_count` or `enter_*` used on a scalar.
    NotAContainer(String),
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Payload continues after the last value of its signature.
    TrailingBytes(usize),
    /// Boolean byte was neither 0 nor 1.
    InvalidBool(u8),
    /// Maybe flag was neither 0 nor 1.
    InvalidMaybeFlag(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// A container's declared length disagrees with its contents.
    LengthMismatch { declared: usize, actual: usize },
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidSignature { signature, reason } => {
                write!(f, "Invalid signature {:?}: {}", signature, reason)
            }
            Error::SignatureTooLong(n) => {
                write!(f, "Signature is {} bytes; limit is {}", n, MAX_SIGNATURE_LEN)
            }
            Error::SignatureTooDeep => write!(f, "Signature nests deeper than {}", MAX_DEPTH),
            Error::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {:?}, found {:?}", expected, found)
            }
            Error::ArityMismatch { expected, found } => {
                write!(f, "Arity mismatch: signature has {} types, got {} values", expected, found)
            }
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "Scope Mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::Incomplete { expected } => write!(f, "Incomplete: {:?} still expected", expected),
            Error::TooManyItems(s) => write!(f, "No further items allowed in scope {:?}", s),
            Error::NotAContainer(t) => write!(f, "Type {:?} is not a container", t),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after payload", n),
            Error::LengthMismatch { declared, actual } => {
                write!(f, "Declared length {} but contents span {}", declared, actual)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for b1pack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of the innermost open container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The payload itself; holds the top-level types of the signature.
    Root,
    /// Homogeneous sequence; any number of elements.
    Array,
    /// Fixed list of fields; exactly one value per field.
    Tuple,
    /// Zero or one value.
    Maybe,
    /// Exactly one value of the embedded type.
    Variant,
}

fn read_u32_at(buf: &[u8], pos: usize) -> Result<u32> {
    let end = pos.checked_add(4).ok_or(Error::UnexpectedEnd)?;
    let bytes = buf.get(pos..end).ok_or(Error::UnexpectedEnd)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::BlobTooLarge(len))
}
