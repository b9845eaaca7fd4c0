//! # Signatures
//!
//! A signature is a sequence of complete types written one character per
//! primitive: `b c y n q i u x t d s h f v`, plus the containers `aT`, `mT`
//! and `(...)`. The empty signature describes an empty payload.
//!
//! ## Invariants
//!
//! - Container nesting never exceeds `MAX_DEPTH`.
//! - Signature text never exceeds `MAX_SIGNATURE_LEN` bytes.
//! - Array elements always encode to at least one byte.

use std::fmt;
use std::str::FromStr;

use crate::Error;
use crate::Result;

/// Deepest container nesting a signature may declare.
pub const MAX_DEPTH: usize = 32;

/// Longest signature text, in bytes. Also the variant header limit.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// One complete type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F64,
    Str,
    /// Index into the message's handle table.
    Handle,
    /// Index into the message's descriptor table.
    Fd,
    Array(Box<Type>),
    Tuple(Vec<Type>),
    Maybe(Box<Type>),
    /// A value carrying its own single-type signature.
    Variant,
}

impl Type {
    /// Parses text holding exactly one complete type.
    pub fn parse(text: &str) -> Result<Type> {
        let mut sig = Signature::parse(text)?;
        if sig.types.len() != 1 {
            return Err(Error::InvalidSignature {
                signature: text.to_string(),
                reason: "expected exactly one complete type",
            });
        }
        Ok(sig.types.remove(0))
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Type::Array(_) | Type::Tuple(_) | Type::Maybe(_) | Type::Variant)
    }

    /// Encoded width of fixed-size scalars.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Type::Bool | Type::I8 | Type::U8 => Some(1),
            Type::I16 | Type::U16 => Some(2),
            Type::I32 | Type::U32 | Type::Handle | Type::Fd => Some(4),
            Type::I64 | Type::U64 | Type::F64 => Some(8),
            _ => None,
        }
    }

    /// Smallest number of bytes any value of this type encodes to.
    pub fn min_size(&self) -> usize {
        match self {
            Type::Str => 4,
            Type::Array(_) => 8,
            Type::Tuple(fields) => fields.iter().map(Type::min_size).sum(),
            Type::Maybe(_) => 1,
            // sig len, one signature byte, body len
            Type::Variant => 6,
            scalar => scalar.fixed_size().unwrap_or(0),
        }
    }

    /// Deepest container nesting inside this type, counting itself.
    pub fn depth(&self) -> usize {
        match self {
            Type::Array(elem) | Type::Maybe(elem) => 1 + elem.depth(),
            Type::Tuple(fields) => 1 + fields.iter().map(Type::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    fn write_text(&self, out: &mut String) {
        match self {
            Type::Bool => out.push('b'),
            Type::I8 => out.push('c'),
            Type::U8 => out.push('y'),
            Type::I16 => out.push('n'),
            Type::U16 => out.push('q'),
            Type::I32 => out.push('i'),
            Type::U32 => out.push('u'),
            Type::I64 => out.push('x'),
            Type::U64 => out.push('t'),
            Type::F64 => out.push('d'),
            Type::Str => out.push('s'),
            Type::Handle => out.push('h'),
            Type::Fd => out.push('f'),
            Type::Variant => out.push('v'),
            Type::Array(elem) => {
                out.push('a');
                elem.write_text(out);
            }
            Type::Maybe(elem) => {
                out.push('m');
                elem.write_text(out);
            }
            Type::Tuple(fields) => {
                out.push('(');
                for field in fields {
                    field.write_text(out);
                }
                out.push(')');
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();
        self.write_text(&mut text);
        f.write_str(&text)
    }
}

impl FromStr for Type {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Type::parse(s)
    }
}

/// A validated sequence of complete types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature {
    text: String,
    types: Vec<Type>,
}

impl Signature {
    /// Parses and validates signature text.
    pub fn parse(text: &str) -> Result<Self> {
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(Error::SignatureTooLong(text.len()));
        }
        let mut parser = Parser { text, bytes: text.as_bytes(), pos: 0 };
        let mut types = Vec::new();
        while parser.pos < parser.bytes.len() {
            types.push(parser.parse_type(0)?);
        }
        Ok(Signature { text: text.to_string(), types })
    }

    /// Builds a signature from already constructed types, enforcing the same limits as `parse`.
    pub fn from_types(types: Vec<Type>) -> Result<Self> {
        let mut text = String::new();
        for ty in &types {
            ty.write_text(&mut text);
        }
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(Error::SignatureTooLong(text.len()));
        }
        // Reparse so hand-built types go through the same checks.
        Signature::parse(&text)
    }

    /// The empty signature.
    pub fn empty() -> Self {
        Signature::default()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Signature::parse(s)
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn invalid(&self, reason: &'static str) -> Error {
        Error::InvalidSignature { signature: self.text.to_string(), reason }
    }

    fn open(&self, depth: usize) -> Result<usize> {
        if depth >= MAX_DEPTH {
            return Err(Error::SignatureTooDeep);
        }
        Ok(depth + 1)
    }

    fn parse_type(&mut self, depth: usize) -> Result<Type> {
        let Some(&code) = self.bytes.get(self.pos) else {
            return Err(self.invalid("unexpected end of signature"));
        };
        self.pos += 1;

        let ty = match code {
            b'b' => Type::Bool,
            b'c' => Type::I8,
            b'y' => Type::U8,
            b'n' => Type::I16,
            b'q' => Type::U16,
            b'i' => Type::I32,
            b'u' => Type::U32,
            b'x' => Type::I64,
            b't' => Type::U64,
            b'd' => Type::F64,
            b's' => Type::Str,
            b'h' => Type::Handle,
            b'f' => Type::Fd,
            b'v' => Type::Variant,
            b'a' => {
                let inner = self.open(depth)?;
                let elem = self.parse_type(inner)?;
                if elem.min_size() == 0 {
                    return Err(self.invalid("array element type has zero size"));
                }
                Type::Array(Box::new(elem))
            }
            b'm' => {
                let inner = self.open(depth)?;
                Type::Maybe(Box::new(self.parse_type(inner)?))
            }
            b'(' => {
                let inner = self.open(depth)?;
                let mut fields = Vec::new();
                loop {
                    match self.bytes.get(self.pos) {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.parse_type(inner)?),
                        None => return Err(self.invalid("unterminated tuple")),
                    }
                }
                Type::Tuple(fields)
            }
            b')' => return Err(self.invalid("unbalanced ')'")),
            _ => return Err(self.invalid("unknown type code")),
        };
        Ok(ty)
    }
}
