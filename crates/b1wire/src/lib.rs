//! # B1wire
//!
//! The on-the-wire layout of a bus1 message.
//!
//! ## Format
//!
//! ```text
//! header   [Type: 1b][Flags: 1b][Reserved: 2b][PayloadLen: 4b]
//!          [CallId: 8b][Handles: 4b][Fds: 4b]
//! payload  [MetaSigLen: 1b][MetaSig][MetaLen: 4b][Meta]
//!          [BodySigLen: 1b][BodySig][BodyLen: 4b][Body]
//! trailer  [HandleId: 8b] * Handles
//! ```
//!
//! The meta block is b1pack-encoded with a signature fixed by the message
//! type. The body is b1pack-encoded with whatever signature the sender chose.
//! Handle ids in the trailer belong to the sender's id space on the way in and
//! are rewritten by the channel into the receiver's id space on delivery.
//! File descriptors travel beside the frame; only their count is framed.
//!
//! All integers are Little-Endian.
//!
//! ## Invariants
//! - **Panic Safety**: decoding never indexes past the buffer; every length is checked.
//! - **Exactness**: a frame's length is exactly header + payload + trailer.


mod error;

pub use error::Error;
pub use error::Result;

use b1pack::Decoder;
use b1pack::Encoder;
use b1pack::Signature;
use b1pack::Value;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Largest frame accepted in either direction (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Meta signature of CALL: interface, member, optional reply-handle index.
pub const CALL_META: &str = "(ssmu)";
/// Meta signature of REPLY.
pub const REPLY_META: &str = "()";
/// Meta signature of ERROR: the error name.
pub const ERROR_META: &str = "s";
/// Meta signature of SEED: (name, handle index) pairs.
pub const SEED_META: &str = "a(su)";

/// The kind of a message.
///
/// `NodeDestroy` and `NodeRelease` are produced by the channel itself and are
/// never encoded as frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    NodeDestroy = 0,
    Call = 1,
    Reply = 2,
    Error = 3,
    Seed = 4,
    NodeRelease = 5,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageType::NodeDestroy),
            1 => Some(MessageType::Call),
            2 => Some(MessageType::Reply),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Seed),
            5 => Some(MessageType::NodeRelease),
            _ => None,
        }
    }

    /// True for the types a sender may put on the wire.
    pub fn is_framed(self) -> bool {
        matches!(self, MessageType::Call | MessageType::Reply | MessageType::Error | MessageType::Seed)
    }
}

/// The fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub payload_len: u32,
    pub call_id: u64,
    pub n_handles: u32,
    pub n_fds: u32,
}

impl Header {
    /// Parses and checks the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Truncated { needed: HEADER_LEN, available: bytes.len() });
        }
        let kind = MessageType::from_u8(bytes[0]).ok_or(Error::UnknownType(bytes[0]))?;
        if !kind.is_framed() {
            return Err(Error::NotTransmittable(kind));
        }
        if bytes[1] != 0 || bytes[2] != 0 || bytes[3] != 0 {
            return Err(Error::ReservedBits);
        }
        Ok(Header {
            kind,
            payload_len: le_u32(bytes, 4),
            call_id: le_u64(bytes, 8),
            n_handles: le_u32(bytes, 16),
            n_fds: le_u32(bytes, 20),
        })
    }

    /// Total frame length the header declares.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize + self.n_handles as usize * 8
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.extend_from_slice(&self.call_id.to_le_bytes());
        out.extend_from_slice(&self.n_handles.to_le_bytes());
        out.extend_from_slice(&self.n_fds.to_le_bytes());
    }
}

/// Type-specific routing data carried ahead of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meta {
    Call { interface: String, member: String, reply_handle: Option<u32> },
    Reply,
    Error { name: String },
    Seed { roots: Vec<(String, u32)> },
}

impl Meta {
    pub fn kind(&self) -> MessageType {
        match self {
            Meta::Call { .. } => MessageType::Call,
            Meta::Reply => MessageType::Reply,
            Meta::Error { .. } => MessageType::Error,
            Meta::Seed { .. } => MessageType::Seed,
        }
    }

    pub fn signature(kind: MessageType) -> Result<&'static str> {
        match kind {
            MessageType::Call => Ok(CALL_META),
            MessageType::Reply => Ok(REPLY_META),
            MessageType::Error => Ok(ERROR_META),
            MessageType::Seed => Ok(SEED_META),
            other => Err(Error::NotTransmittable(other)),
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_signature(Meta::signature(self.kind())?)?;
        match self {
            Meta::Call { interface, member, reply_handle } => {
                enc.begin_tuple()?;
                enc.str(interface)?;
                enc.str(member)?;
                enc.begin_maybe()?;
                if let Some(index) = reply_handle {
                    enc.u32(*index)?;
                }
                enc.end_maybe()?;
                enc.end_tuple()?;
            }
            Meta::Reply => {
                enc.begin_tuple()?;
                enc.end_tuple()?;
            }
            Meta::Error { name } => enc.str(name)?,
            Meta::Seed { roots } => {
                enc.begin_array()?;
                for (name, index) in roots {
                    enc.write("(su)", &[Value::Tuple(vec![name.as_str().into(), (*index).into()])])?;
                }
                enc.end_array()?;
            }
        }
        Ok(enc.finish()?)
    }

    fn decode(kind: MessageType, signature: Signature, bytes: &[u8]) -> Result<Meta> {
        let expected = Meta::signature(kind)?;
        if signature.as_str() != expected {
            return Err(Error::MetaMismatch { expected, found: signature.to_string() });
        }
        let mut dec = Decoder::new(signature, bytes.to_vec())?;
        let meta = match kind {
            MessageType::Call => {
                dec.enter_tuple()?;
                let interface = dec.str()?;
                let member = dec.str()?;
                let reply_handle = if dec.enter_maybe()? { Some(dec.u32()?) } else { None };
                dec.exit_maybe()?;
                dec.exit_tuple()?;
                Meta::Call { interface, member, reply_handle }
            }
            MessageType::Reply => Meta::Reply,
            MessageType::Error => Meta::Error { name: dec.str()? },
            _ => {
                let count = dec.enter_array()?;
                let mut roots = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    dec.enter_tuple()?;
                    roots.push((dec.str()?, dec.u32()?));
                    dec.exit_tuple()?;
                }
                dec.exit_array()?;
                Meta::Seed { roots }
            }
        };
        Ok(meta)
    }

    /// Handle-table indices this meta block refers to.
    fn handle_indices(&self) -> Vec<u32> {
        match self {
            Meta::Call { reply_handle: Some(index), .. } => vec![*index],
            Meta::Seed { roots } => roots.iter().map(|(_, index)| *index).collect(),
            _ => Vec::new(),
        }
    }
}

/// A decoded or to-be-encoded message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub call_id: u64,
    pub meta: Meta,
    /// Signature of `body`.
    pub signature: Signature,
    /// b1pack payload. Validated when a `Decoder` is built over it.
    pub body: Vec<u8>,
    pub handles: Vec<u64>,
    pub n_fds: u32,
}

impl Frame {
    pub fn kind(&self) -> MessageType {
        self.meta.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.check_indices()?;
        let meta = self.meta.encode()?;
        let meta_sig = Meta::signature(self.kind())?;

        let mut payload = Vec::with_capacity(meta.len() + self.body.len() + 16);
        write_section(&mut payload, meta_sig, &meta)?;
        write_section(&mut payload, self.signature.as_str(), &self.body)?;

        let header = Header {
            kind: self.kind(),
            payload_len: len_u32(payload.len())?,
            call_id: self.call_id,
            n_handles: len_u32(self.handles.len())?,
            n_fds: self.n_fds,
        };
        let total = header.frame_len();
        if total > MAX_FRAME_SIZE {
            return Err(Error::TooLarge(total));
        }

        let mut out = Vec::with_capacity(total);
        header.write(&mut out);
        out.extend_from_slice(&payload);
        for id in &self.handles {
            out.extend_from_slice(&id.to_le_bytes());
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let header = checked_header(bytes)?;
        let payload = &bytes[HEADER_LEN..HEADER_LEN + header.payload_len as usize];

        let mut pos = 0;
        let (meta_sig, meta_bytes) = read_section(payload, &mut pos)?;
        let (signature, body) = read_section(payload, &mut pos)?;
        if pos != payload.len() {
            return Err(Error::TrailingBytes(payload.len() - pos));
        }

        let frame = Frame {
            call_id: header.call_id,
            meta: Meta::decode(header.kind, meta_sig, meta_bytes)?,
            signature,
            body: body.to_vec(),
            handles: trailer(bytes, &header),
            n_fds: header.n_fds,
        };
        frame.check_indices()?;
        Ok(frame)
    }

    fn check_indices(&self) -> Result<()> {
        for index in self.meta.handle_indices() {
            if index as usize >= self.handles.len() {
                return Err(Error::HandleIndex { index, count: self.handles.len() });
            }
        }
        Ok(())
    }
}

/// Reads the handle trailer of a frame without decoding its payload.
pub fn handle_table(bytes: &[u8]) -> Result<Vec<u64>> {
    let header = checked_header(bytes)?;
    Ok(trailer(bytes, &header))
}

/// Overwrites the handle trailer in place. `ids` must match the framed count.
pub fn rewrite_handle_table(bytes: &mut [u8], ids: &[u64]) -> Result<()> {
    let header = checked_header(bytes)?;
    if ids.len() != header.n_handles as usize {
        return Err(Error::HandleIndex { index: ids.len() as u32, count: header.n_handles as usize });
    }
    let start = HEADER_LEN + header.payload_len as usize;
    for (slot, id) in bytes[start..].chunks_exact_mut(8).zip(ids) {
        slot.copy_from_slice(&id.to_le_bytes());
    }
    Ok(())
}

fn checked_header(bytes: &[u8]) -> Result<Header> {
    let header = Header::parse(bytes)?;
    let needed = header.frame_len();
    if needed > MAX_FRAME_SIZE {
        return Err(Error::TooLarge(needed));
    }
    if bytes.len() < needed {
        return Err(Error::Truncated { needed, available: bytes.len() });
    }
    if bytes.len() > needed {
        return Err(Error::TrailingBytes(bytes.len() - needed));
    }
    Ok(header)
}

fn trailer(bytes: &[u8], header: &Header) -> Vec<u64> {
    let start = HEADER_LEN + header.payload_len as usize;
    bytes[start..].chunks_exact(8).map(|chunk| le_u64(chunk, 0)).collect()
}

fn write_section(out: &mut Vec<u8>, signature: &str, bytes: &[u8]) -> Result<()> {
    // The length byte below relies on this bound.
    let sig = Signature::parse(signature)?;
    out.push(sig.as_str().len() as u8);
    out.extend_from_slice(sig.as_str().as_bytes());
    out.extend_from_slice(&len_u32(bytes.len())?.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_section<'a>(payload: &'a [u8], pos: &mut usize) -> Result<(Signature, &'a [u8])> {
    let sig_len = *payload.get(*pos).ok_or(truncated(payload, *pos + 1))? as usize;
    *pos += 1;
    let sig_bytes = payload.get(*pos..*pos + sig_len).ok_or(truncated(payload, *pos + sig_len))?;
    *pos += sig_len;
    let text = std::str::from_utf8(sig_bytes).map_err(|_| b1pack::Error::InvalidUtf8)?;
    let signature = Signature::parse(text)?;

    let len_bytes = payload.get(*pos..*pos + 4).ok_or(truncated(payload, *pos + 4))?;
    let len = le_u32(len_bytes, 0) as usize;
    *pos += 4;
    let body = payload.get(*pos..*pos + len).ok_or(truncated(payload, *pos + len))?;
    *pos += len;
    Ok((signature, body))
}

fn truncated(payload: &[u8], needed: usize) -> Error {
    Error::Truncated { needed, available: payload.len() }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::TooLarge(len))
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
