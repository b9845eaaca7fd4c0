use crate::Error;
use crate::MAX_NESTING;
use crate::Result;
use crate::Scope;
use crate::Signature;
use crate::Type;
use crate::Value;
use crate::read_u32_at;

/// Checks that `bytes` holds exactly one well-formed value of type `ty`.
pub(crate) fn validate_one(ty: &Type, bytes: &[u8]) -> Result<()> {
    let mut pos = 0;
    skip_at(bytes, &mut pos, ty, 0)?;
    if pos != bytes.len() {
        return Err(Error::TrailingBytes(bytes.len() - pos));
    }
    Ok(())
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(n).ok_or(Error::UnexpectedEnd)?;
    let bytes = buf.get(*pos..end).ok_or(Error::UnexpectedEnd)?;
    *pos = end;
    Ok(bytes)
}

/// Steps over one value, validating everything it contains.
fn skip_at(buf: &[u8], pos: &mut usize, ty: &Type, nesting: usize) -> Result<()> {
    if nesting > MAX_NESTING {
        return Err(Error::NestingTooDeep);
    }
    match ty {
        Type::Bool => match take(buf, pos, 1)?[0] {
            0 | 1 => Ok(()),
            b => Err(Error::InvalidBool(b)),
        },
        Type::Str => {
            let len = read_u32_at(buf, *pos)? as usize;
            *pos += 4;
            let bytes = take(buf, pos, len)?;
            std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
            Ok(())
        }
        Type::Array(elem) => {
            let len = read_u32_at(buf, *pos)? as usize;
            let count = read_u32_at(buf, *pos + 4)? as usize;
            *pos += 8;
            let start = *pos;
            let end = start.checked_add(len).ok_or(Error::UnexpectedEnd)?;
            if end > buf.len() {
                return Err(Error::UnexpectedEnd);
            }
            if count.saturating_mul(elem.min_size()) > len {
                return Err(Error::LengthMismatch { declared: len, actual: count.saturating_mul(elem.min_size()) });
            }
            let body = &buf[..end];
            for _ in 0..count {
                skip_at(body, pos, elem, nesting + 1)?;
            }
            if *pos != end {
                return Err(Error::LengthMismatch { declared: len, actual: *pos - start });
            }
            Ok(())
        }
        Type::Tuple(fields) => {
            for field in fields {
                skip_at(buf, pos, field, nesting + 1)?;
            }
            Ok(())
        }
        Type::Maybe(inner) => match take(buf, pos, 1)?[0] {
            0 => Ok(()),
            1 => skip_at(buf, pos, inner, nesting + 1),
            b => Err(Error::InvalidMaybeFlag(b)),
        },
        Type::Variant => {
            let (inner, len) = variant_header(buf, pos)?;
            let start = *pos;
            let end = start.checked_add(len).ok_or(Error::UnexpectedEnd)?;
            if end > buf.len() {
                return Err(Error::UnexpectedEnd);
            }
            skip_at(&buf[..end], pos, &inner, nesting + 1)?;
            if *pos != end {
                return Err(Error::LengthMismatch { declared: len, actual: *pos - start });
            }
            Ok(())
        }
        scalar => {
            let width = scalar.fixed_size().ok_or_else(|| Error::NotAContainer(scalar.to_string()))?;
            take(buf, pos, width).map(|_| ())
        }
    }
}

/// Reads `[SigLen][Sig][Len]`, leaving `pos` at the start of the body.
fn variant_header(buf: &[u8], pos: &mut usize) -> Result<(Type, usize)> {
    let sig_len = take(buf, pos, 1)?[0] as usize;
    let sig = take(buf, pos, sig_len)?;
    let sig = std::str::from_utf8(sig).map_err(|_| Error::InvalidUtf8)?;
    let inner = Type::parse(sig)?;
    let len = read_u32_at(buf, *pos)? as usize;
    *pos += 4;
    Ok((inner, len))
}

#[derive(Debug, Clone)]
enum Frame {
    Root { types: Vec<Type>, next: usize },
    Array { elem: Type, end: usize, remaining: u32 },
    Tuple { fields: Vec<Type>, next: usize },
    Maybe { inner: Type, remaining: bool },
    Variant { inner: Type, end: usize, remaining: bool },
}

impl Frame {
    fn scope(&self) -> Scope {
        match self {
            Frame::Root { .. } => Scope::Root,
            Frame::Array { .. } => Scope::Array,
            Frame::Tuple { .. } => Scope::Tuple,
            Frame::Maybe { .. } => Scope::Maybe,
            Frame::Variant { .. } => Scope::Variant,
        }
    }

    fn expected(&self) -> Option<&Type> {
        match self {
            Frame::Root { types, next } => types.get(*next),
            Frame::Array { elem, remaining, .. } => (*remaining > 0).then_some(elem),
            Frame::Tuple { fields, next } => fields.get(*next),
            Frame::Maybe { inner, remaining } | Frame::Variant { inner, remaining, .. } => {
                remaining.then_some(inner)
            }
        }
    }

    fn advance(&mut self) {
        match self {
            Frame::Root { next, .. } | Frame::Tuple { next, .. } => *next += 1,
            Frame::Array { remaining, .. } => *remaining = remaining.saturating_sub(1),
            Frame::Maybe { remaining, .. } | Frame::Variant { remaining, .. } => *remaining = false,
        }
    }
}

/// A signature-checked reader over an owned, pre-validated payload.
///
/// Construction walks the whole payload once; afterwards reads only fail
/// when the caller asks for a type the signature does not have next.
/// `exit_*` skips whatever was left unread inside the container.
#[derive(Debug, Clone)]
pub struct Decoder {
    signature: Signature,
    buf: Vec<u8>,
    pos: usize,
    /// Bottom is always `Frame::Root`.
    stack: Vec<Frame>,
}

impl Decoder {
    /// Validates `buf` against `signature` and positions the cursor at the start.
    pub fn new(signature: Signature, buf: Vec<u8>) -> Result<Self> {
        let mut pos = 0;
        for ty in signature.types() {
            skip_at(&buf, &mut pos, ty, 0)?;
        }
        if pos != buf.len() {
            return Err(Error::TrailingBytes(buf.len() - pos));
        }
        let types = signature.types().to_vec();
        Ok(Self { signature, buf, pos: 0, stack: vec![Frame::Root { types, next: 0 }] })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Number of entered containers above the root.
    pub fn depth(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    /// True when every root value has been read and no container is open.
    pub fn is_at_end(&self) -> bool {
        self.stack.len() == 1 && self.peek_type().is_none()
    }

    /// Resets the cursor to the first value.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.stack.truncate(1);
        if let Some(Frame::Root { next, .. }) = self.stack.first_mut() {
            *next = 0;
        }
    }

    /// The type of the next value in the current container.
    pub fn peek_type(&self) -> Option<&Type> {
        self.stack.last().and_then(Frame::expected)
    }

    /// Element count of the container about to be entered.
    ///
    /// Arrays report their encoded count, tuples their field count, maybes 0 or 1
    /// and variants 1.
    pub fn peek_count(&self) -> Result<u32> {
        let ty = self.next_type()?;
        match ty {
            Type::Array(_) => read_u32_at(&self.buf, self.pos + 4),
            Type::Tuple(fields) => Ok(fields.len() as u32),
            Type::Maybe(_) => self.buf.get(self.pos).map(|b| *b as u32).ok_or(Error::UnexpectedEnd),
            Type::Variant => Ok(1),
            scalar => Err(Error::NotAContainer(scalar.to_string())),
        }
    }

    fn next_type(&self) -> Result<&Type> {
        let frame = self.stack.last().ok_or(Error::ScopeUnderflow)?;
        frame.expected().ok_or(Error::TooManyItems(frame.scope()))
    }

    fn expect(&self, found: &Type) -> Result<()> {
        let expected = self.next_type()?;
        if expected != found {
            return Err(Error::TypeMismatch { expected: expected.to_string(), found: found.to_string() });
        }
        Ok(())
    }

    fn top(&mut self) -> Result<&mut Frame> {
        self.stack.last_mut().ok_or(Error::ScopeUnderflow)
    }

    fn bytes<const N: usize>(&mut self, ty: Type) -> Result<[u8; N]> {
        self.expect(&ty)?;
        let mut pos = self.pos;
        let mut out = [0u8; N];
        out.copy_from_slice(take(&self.buf, &mut pos, N)?);
        self.pos = pos;
        self.top()?.advance();
        Ok(out)
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.bytes::<1>(Type::Bool)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::InvalidBool(b)),
        }
    }

    pub fn i8(&mut self) -> Result<i8> { Ok(i8::from_le_bytes(self.bytes(Type::I8)?)) }
    pub fn u8(&mut self) -> Result<u8> { Ok(u8::from_le_bytes(self.bytes(Type::U8)?)) }
    pub fn i16(&mut self) -> Result<i16> { Ok(i16::from_le_bytes(self.bytes(Type::I16)?)) }
    pub fn u16(&mut self) -> Result<u16> { Ok(u16::from_le_bytes(self.bytes(Type::U16)?)) }
    pub fn i32(&mut self) -> Result<i32> { Ok(i32::from_le_bytes(self.bytes(Type::I32)?)) }
    pub fn u32(&mut self) -> Result<u32> { Ok(u32::from_le_bytes(self.bytes(Type::U32)?)) }
    pub fn i64(&mut self) -> Result<i64> { Ok(i64::from_le_bytes(self.bytes(Type::I64)?)) }
    pub fn u64(&mut self) -> Result<u64> { Ok(u64::from_le_bytes(self.bytes(Type::U64)?)) }
    pub fn f64(&mut self) -> Result<f64> { Ok(f64::from_le_bytes(self.bytes(Type::F64)?)) }

    /// Decodes a handle-table index.
    pub fn handle(&mut self) -> Result<u32> { Ok(u32::from_le_bytes(self.bytes(Type::Handle)?)) }

    /// Decodes a descriptor-table index.
    pub fn fd(&mut self) -> Result<u32> { Ok(u32::from_le_bytes(self.bytes(Type::Fd)?)) }

    pub fn str(&mut self) -> Result<String> {
        self.expect(&Type::Str)?;
        let mut pos = self.pos;
        let len = read_u32_at(&self.buf, pos)? as usize;
        pos += 4;
        let bytes = take(&self.buf, &mut pos, len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?.to_string();
        self.pos = pos;
        self.top()?.advance();
        Ok(s)
    }

    fn push(&mut self, frame: Frame) -> Result<()> {
        if self.stack.len() >= MAX_NESTING {
            return Err(Error::NestingTooDeep);
        }
        self.stack.push(frame);
        Ok(())
    }

    /// Enters an array and returns its element count.
    pub fn enter_array(&mut self) -> Result<u32> {
        let Type::Array(elem) = self.next_type()?.clone() else {
            return Err(Error::TypeMismatch { expected: self.next_type()?.to_string(), found: "a".into() });
        };
        let len = read_u32_at(&self.buf, self.pos)? as usize;
        let count = read_u32_at(&self.buf, self.pos + 4)?;
        let end = self.pos + 8 + len;
        self.push(Frame::Array { elem: *elem, end, remaining: count })?;
        self.pos += 8;
        Ok(count)
    }

    /// Enters a tuple and returns its field count.
    pub fn enter_tuple(&mut self) -> Result<u32> {
        let Type::Tuple(fields) = self.next_type()?.clone() else {
            return Err(Error::TypeMismatch { expected: self.next_type()?.to_string(), found: "(".into() });
        };
        let n = fields.len() as u32;
        self.push(Frame::Tuple { fields, next: 0 })?;
        Ok(n)
    }

    /// Enters a maybe and reports whether a value is present.
    pub fn enter_maybe(&mut self) -> Result<bool> {
        let Type::Maybe(inner) = self.next_type()?.clone() else {
            return Err(Error::TypeMismatch { expected: self.next_type()?.to_string(), found: "m".into() });
        };
        let present = match self.buf.get(self.pos) {
            Some(0) => false,
            Some(1) => true,
            Some(b) => return Err(Error::InvalidMaybeFlag(*b)),
            None => return Err(Error::UnexpectedEnd),
        };
        self.push(Frame::Maybe { inner: *inner, remaining: present })?;
        self.pos += 1;
        Ok(present)
    }

    /// Enters a variant and returns the type it carries.
    pub fn enter_variant(&mut self) -> Result<Type> {
        self.expect(&Type::Variant)?;
        let mut pos = self.pos;
        let (inner, len) = variant_header(&self.buf, &mut pos)?;
        self.push(Frame::Variant { inner: inner.clone(), end: pos + len, remaining: true })?;
        self.pos = pos;
        Ok(inner)
    }

    fn exit_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }
        let actual = self.top()?.scope();
        if actual != expected {
            return Err(Error::ScopeMismatch { expected, actual });
        }
        let frame = self.stack.pop().ok_or(Error::ScopeUnderflow)?;
        match frame {
            Frame::Array { end, .. } | Frame::Variant { end, .. } => self.pos = end,
            Frame::Tuple { fields, next } => {
                for field in fields.iter().skip(next) {
                    skip_at(&self.buf, &mut self.pos, field, 0)?;
                }
            }
            Frame::Maybe { inner, remaining } => {
                if remaining {
                    skip_at(&self.buf, &mut self.pos, &inner, 0)?;
                }
            }
            Frame::Root { .. } => return Err(Error::ScopeUnderflow),
        }
        self.top()?.advance();
        Ok(())
    }

    pub fn exit_array(&mut self) -> Result<()> { self.exit_scope(Scope::Array) }
    pub fn exit_tuple(&mut self) -> Result<()> { self.exit_scope(Scope::Tuple) }
    pub fn exit_maybe(&mut self) -> Result<()> { self.exit_scope(Scope::Maybe) }
    pub fn exit_variant(&mut self) -> Result<()> { self.exit_scope(Scope::Variant) }

    /// Skips the next value, whatever its type.
    pub fn skip(&mut self) -> Result<()> {
        let ty = self.next_type()?.clone();
        skip_at(&self.buf, &mut self.pos, &ty, 0)?;
        self.top()?.advance();
        Ok(())
    }

    /// Reads a run of values described by `signature`.
    ///
    /// On error the cursor is restored to where it was before the call.
    pub fn read(&mut self, signature: &str) -> Result<Vec<Value>> {
        let sig = Signature::parse(signature)?;
        let pos = self.pos;
        let stack = self.stack.clone();
        let result = sig
            .types()
            .iter()
            .map(|ty| {
                self.expect(ty)?;
                self.get()
            })
            .collect::<Result<Vec<_>>>();
        if result.is_err() {
            self.pos = pos;
            self.stack = stack;
        }
        result
    }

    /// Reads the next value, whatever its type.
    pub fn read_value(&mut self) -> Result<Value> {
        let pos = self.pos;
        let stack = self.stack.clone();
        let result = self.get();
        if result.is_err() {
            self.pos = pos;
            self.stack = stack;
        }
        result
    }

    fn get(&mut self) -> Result<Value> {
        let ty = self.next_type()?.clone();
        let value = match ty {
            Type::Bool => Value::Bool(self.bool()?),
            Type::I8 => Value::I8(self.i8()?),
            Type::U8 => Value::U8(self.u8()?),
            Type::I16 => Value::I16(self.i16()?),
            Type::U16 => Value::U16(self.u16()?),
            Type::I32 => Value::I32(self.i32()?),
            Type::U32 => Value::U32(self.u32()?),
            Type::I64 => Value::I64(self.i64()?),
            Type::U64 => Value::U64(self.u64()?),
            Type::F64 => Value::F64(self.f64()?),
            Type::Str => Value::Str(self.str()?),
            Type::Handle => Value::Handle(self.handle()?),
            Type::Fd => Value::Fd(self.fd()?),
            Type::Array(_) => {
                let count = self.enter_array()?;
                let items = (0..count).map(|_| self.get()).collect::<Result<Vec<_>>>()?;
                self.exit_array()?;
                Value::Array(items)
            }
            Type::Tuple(_) => {
                let n = self.enter_tuple()?;
                let fields = (0..n).map(|_| self.get()).collect::<Result<Vec<_>>>()?;
                self.exit_tuple()?;
                Value::Tuple(fields)
            }
            Type::Maybe(_) => {
                let inner = if self.enter_maybe()? { Some(Box::new(self.get()?)) } else { None };
                self.exit_maybe()?;
                Value::Maybe(inner)
            }
            Type::Variant => {
                let inner_ty = self.enter_variant()?;
                let inner = self.get()?;
                self.exit_variant()?;
                Value::Variant(inner_ty, Box::new(inner))
            }
        };
        Ok(value)
    }
}
