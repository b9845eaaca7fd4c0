use crate::Error;
use crate::MAX_NESTING;
use crate::Result;
use crate::Scope;
use crate::Signature;
use crate::Type;
use crate::Value;
use crate::decoder;
use crate::len_u32;

/// An open container on the `Encoder` stack, with a cursor into its types.
#[derive(Debug, Clone)]
enum Frame {
    Root { types: Vec<Type>, next: usize },
    Array { elem: Type, start: usize, count: u32 },
    Tuple { fields: Vec<Type>, next: usize },
    Maybe { inner: Type, flag_pos: usize, written: bool },
    Variant { inner: Type, start: usize, written: bool },
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
            Frame::Array { elem, .. } => Some(elem),
            Frame::Tuple { fields, next } => fields.get(*next),
            Frame::Maybe { inner, written, .. } | Frame::Variant { inner, written, .. } => {
                (!written).then_some(inner)
            }
        }
    }

    fn advance(&mut self) {
        match self {
            Frame::Root { next, .. } | Frame::Tuple { next, .. } => *next += 1,
            Frame::Array { count, .. } => *count += 1,
            Frame::Maybe { written, .. } | Frame::Variant { written, .. } => *written = true,
        }
    }

    /// Types still owed before this frame may close.
    fn missing(&self) -> Option<String> {
        let rest: &[Type] = match self {
            Frame::Root { types, next } => &types[(*next).min(types.len())..],
            Frame::Tuple { fields, next } => &fields[(*next).min(fields.len())..],
            Frame::Variant { inner, written: false, .. } => std::slice::from_ref(inner),
            _ => &[],
        };
        if rest.is_empty() {
            return None;
        }
        Some(rest.iter().map(Type::to_string).collect())
    }
}

/// A signature-checked, back-patching encoder.
///
/// Every write is validated against the next type the signature expects in
/// the innermost open container. Lengths of arrays and variants are written
/// as placeholders and patched when the container closes.
///
/// # Structural Invariants
///
/// 1.  **Maybe Scopes**: zero or one value; the presence flag is patched on close.
/// 2.  **Variant Scopes**: exactly one value of the declared type.
/// 3.  **Tuple and Root Scopes**: exactly one value per declared type, in order.
/// 4.  **Finish**: only with the stack back at Root and every root type written.
#[derive(Debug, Clone)]
pub struct Encoder {
    signature: Signature,
    buf: Vec<u8>,
    /// Bottom is always `Frame::Root`.
    stack: Vec<Frame>,
}

impl Encoder {
    pub fn new(signature: Signature) -> Self {
        let types = signature.types().to_vec();
        Self {
            signature,
            buf: Vec::with_capacity(256),
            stack: vec![Frame::Root { types, next: 0 }],
        }
    }

    /// Parses `signature` and creates an encoder for it.
    pub fn with_signature(signature: &str) -> Result<Self> {
        Ok(Encoder::new(Signature::parse(signature)?))
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Number of open containers above the root.
    pub fn depth(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    /// True once the stack is closed and every root type has been written.
    pub fn is_complete(&self) -> bool {
        self.stack.len() == 1 && self.stack.first().is_some_and(|f| f.missing().is_none())
    }

    /// The next type the signature expects, if any.
    pub fn peek_type(&self) -> Option<&Type> {
        self.stack.last().and_then(Frame::expected)
    }

    /// Consumes the encoder and returns the payload bytes.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a container is open and
    /// `Error::Incomplete` if root types remain unwritten.
    pub fn finish(self) -> Result<Vec<u8>> {
        self.check_complete()?;
        Ok(self.buf)
    }

    /// Reports why `finish` would fail, without consuming the encoder.
    pub fn check_complete(&self) -> Result<()> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        if let Some(expected) = self.stack.first().and_then(Frame::missing) {
            return Err(Error::Incomplete { expected });
        }
        Ok(())
    }

    fn top(&mut self) -> Result<&mut Frame> {
        self.stack.last_mut().ok_or(Error::ScopeUnderflow)
    }

    fn expect(&self, found: &Type) -> Result<()> {
        let frame = self.stack.last().ok_or(Error::ScopeUnderflow)?;
        match frame.expected() {
            Some(expected) if expected == found => Ok(()),
            Some(expected) => Err(Error::TypeMismatch {
                expected: expected.to_string(),
                found: found.to_string(),
            }),
            None => Err(Error::TooManyItems(frame.scope())),
        }
    }

    /// Like `expect`, but for containers whose inner types are not known yet.
    fn expect_container(&self, scope: Scope) -> Result<Type> {
        let frame = self.stack.last().ok_or(Error::ScopeUnderflow)?;
        let Some(expected) = frame.expected() else {
            return Err(Error::TooManyItems(frame.scope()));
        };
        let matches = matches!(
            (scope, expected),
            (Scope::Array, Type::Array(_))
                | (Scope::Tuple, Type::Tuple(_))
                | (Scope::Maybe, Type::Maybe(_))
                | (Scope::Variant, Type::Variant)
        );
        if !matches {
            let found = match scope {
                Scope::Array => "a",
                Scope::Tuple => "(",
                Scope::Maybe => "m",
                Scope::Variant => "v",
                Scope::Root => "",
            };
            return Err(Error::TypeMismatch { expected: expected.to_string(), found: found.to_string() });
        }
        if self.stack.len() >= MAX_NESTING {
            return Err(Error::NestingTooDeep);
        }
        Ok(expected.clone())
    }

    fn scalar(&mut self, ty: Type, bytes: &[u8]) -> Result<()> {
        self.expect(&ty)?;
        self.buf.extend_from_slice(bytes);
        self.top()?.advance();
        Ok(())
    }

    /// Encodes a boolean as a single 0/1 byte.
    pub fn bool(&mut self, v: bool) -> Result<()> { self.scalar(Type::Bool, &[v as u8]) }
    pub fn i8(&mut self, v: i8) -> Result<()> { self.scalar(Type::I8, &v.to_le_bytes()) }
    pub fn u8(&mut self, v: u8) -> Result<()> { self.scalar(Type::U8, &[v]) }
    pub fn i16(&mut self, v: i16) -> Result<()> { self.scalar(Type::I16, &v.to_le_bytes()) }
    pub fn u16(&mut self, v: u16) -> Result<()> { self.scalar(Type::U16, &v.to_le_bytes()) }
    pub fn i32(&mut self, v: i32) -> Result<()> { self.scalar(Type::I32, &v.to_le_bytes()) }
    pub fn u32(&mut self, v: u32) -> Result<()> { self.scalar(Type::U32, &v.to_le_bytes()) }
    pub fn i64(&mut self, v: i64) -> Result<()> { self.scalar(Type::I64, &v.to_le_bytes()) }
    pub fn u64(&mut self, v: u64) -> Result<()> { self.scalar(Type::U64, &v.to_le_bytes()) }
    pub fn f64(&mut self, v: f64) -> Result<()> { self.scalar(Type::F64, &v.to_le_bytes()) }

    /// Encodes a handle-table index.
    pub fn handle(&mut self, index: u32) -> Result<()> { self.scalar(Type::Handle, &index.to_le_bytes()) }

    /// Encodes a descriptor-table index.
    pub fn fd(&mut self, index: u32) -> Result<()> { self.scalar(Type::Fd, &index.to_le_bytes()) }

    /// Encodes a length-prefixed UTF-8 string.
    pub fn str(&mut self, v: &str) -> Result<()> {
        let len = len_u32(v.len())?;
        self.expect(&Type::Str)?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(v.as_bytes());
        self.top()?.advance();
        Ok(())
    }

    /// Begins an array. Elements follow; close with `end_array`.
    pub fn begin_array(&mut self) -> Result<()> {
        let Type::Array(elem) = self.expect_container(Scope::Array)? else {
            return Err(Error::ScopeUnderflow);
        };
        // Length and count placeholders
        self.buf.extend_from_slice(&[0; 8]);
        let start = self.buf.len();
        self.stack.push(Frame::Array { elem: *elem, start, count: 0 });
        Ok(())
    }

    /// Begins a tuple. Every field must be written before `end_tuple`.
    pub fn begin_tuple(&mut self) -> Result<()> {
        let Type::Tuple(fields) = self.expect_container(Scope::Tuple)? else {
            return Err(Error::ScopeUnderflow);
        };
        self.stack.push(Frame::Tuple { fields, next: 0 });
        Ok(())
    }

    /// Begins a maybe. Write zero or one value, then `end_maybe`.
    pub fn begin_maybe(&mut self) -> Result<()> {
        let Type::Maybe(inner) = self.expect_container(Scope::Maybe)? else {
            return Err(Error::ScopeUnderflow);
        };
        let flag_pos = self.buf.len();
        self.buf.push(0);
        self.stack.push(Frame::Maybe { inner: *inner, flag_pos, written: false });
        Ok(())
    }

    /// Begins a variant holding one value of type `inner`.
    pub fn begin_variant(&mut self, inner: &Type) -> Result<()> {
        self.expect_container(Scope::Variant)?;
        let sig = Signature::from_types(vec![inner.clone()])?;
        let text = sig.as_str().as_bytes();
        self.buf.push(text.len() as u8);
        self.buf.extend_from_slice(text);
        self.buf.extend_from_slice(&[0; 4]);
        let start = self.buf.len();
        self.stack.push(Frame::Variant { inner: inner.clone(), start, written: false });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<Frame> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }
        let actual = self.top()?.scope();
        if actual != expected {
            return Err(Error::ScopeMismatch { expected, actual });
        }
        if let Some(missing) = self.top()?.missing() {
            return Err(Error::Incomplete { expected: missing });
        }
        let frame = self.stack.pop().ok_or(Error::ScopeUnderflow)?;
        self.top()?.advance();
        Ok(frame)
    }

    fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn end_array(&mut self) -> Result<()> {
        let Frame::Array { start, count, .. } = self.end_scope(Scope::Array)? else {
            return Err(Error::ScopeUnderflow);
        };
        let len = len_u32(self.buf.len() - start)?;
        self.patch_u32(start - 8, len);
        self.patch_u32(start - 4, count);
        Ok(())
    }

    pub fn end_tuple(&mut self) -> Result<()> {
        self.end_scope(Scope::Tuple).map(|_| ())
    }

    pub fn end_maybe(&mut self) -> Result<()> {
        let Frame::Maybe { flag_pos, written, .. } = self.end_scope(Scope::Maybe)? else {
            return Err(Error::ScopeUnderflow);
        };
        self.buf[flag_pos] = written as u8;
        Ok(())
    }

    pub fn end_variant(&mut self) -> Result<()> {
        let Frame::Variant { start, .. } = self.end_scope(Scope::Variant)? else {
            return Err(Error::ScopeUnderflow);
        };
        let len = len_u32(self.buf.len() - start)?;
        self.patch_u32(start - 4, len);
        Ok(())
    }

    /// Writes a run of values described by `signature`.
    ///
    /// The run must line up with what the open container expects next. On
    /// any error the encoder is left exactly as it was before the call.
    pub fn write(&mut self, signature: &str, values: &[Value]) -> Result<()> {
        let sig = Signature::parse(signature)?;
        if sig.types().len() != values.len() {
            return Err(Error::ArityMismatch { expected: sig.types().len(), found: values.len() });
        }
        self.atomically(|enc| {
            for (ty, value) in sig.types().iter().zip(values) {
                match enc.peek_type() {
                    Some(next) if next == ty => {}
                    Some(next) => {
                        return Err(Error::TypeMismatch { expected: next.to_string(), found: ty.to_string() });
                    }
                    None => return Err(Error::TooManyItems(enc.top()?.scope())),
                }
                enc.put(value)?;
            }
            Ok(())
        })
    }

    /// Writes one value for the next expected type. Atomic like `write`.
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        self.atomically(|enc| enc.put(value))
    }

    /// Appends a pre-encoded value of type `ty` after validating it.
    pub fn insert(&mut self, ty: &Type, bytes: &[u8]) -> Result<()> {
        self.expect(ty)?;
        decoder::validate_one(ty, bytes)?;
        self.buf.extend_from_slice(bytes);
        self.top()?.advance();
        Ok(())
    }

    fn atomically(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let len = self.buf.len();
        let stack = self.stack.clone();
        let result = f(self);
        if result.is_err() {
            self.buf.truncate(len);
            self.stack = stack;
        }
        result
    }

    fn put(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Bool(v) => self.bool(*v),
            Value::I8(v) => self.i8(*v),
            Value::U8(v) => self.u8(*v),
            Value::I16(v) => self.i16(*v),
            Value::U16(v) => self.u16(*v),
            Value::I32(v) => self.i32(*v),
            Value::U32(v) => self.u32(*v),
            Value::I64(v) => self.i64(*v),
            Value::U64(v) => self.u64(*v),
            Value::F64(v) => self.f64(*v),
            Value::Str(v) => self.str(v),
            Value::Handle(v) => self.handle(*v),
            Value::Fd(v) => self.fd(*v),
            Value::Array(items) => {
                self.begin_array()?;
                for item in items {
                    self.put(item)?;
                }
                self.end_array()
            }
            Value::Tuple(fields) => {
                self.begin_tuple()?;
                for field in fields {
                    self.put(field)?;
                }
                self.end_tuple()
            }
            Value::Maybe(inner) => {
                self.begin_maybe()?;
                if let Some(inner) = inner {
                    self.put(inner)?;
                }
                self.end_maybe()
            }
            Value::Variant(ty, inner) => {
                self.begin_variant(ty)?;
                self.put(inner)?;
                self.end_variant()
            }
        }
    }
}
