//! Typed value descriptors.
//!
//! `Value` is how callers hand a run of arguments to `Encoder::write` and get
//! them back from `Decoder::read` without a variadic interface. The shape of a
//! value is checked against the signature at write time, so containers do not
//! repeat their element types except where the bytes need them (variants).

use crate::Type;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    /// Index into the message's handle table.
    Handle(u32),
    /// Index into the message's descriptor table.
    Fd(u32),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    Maybe(Option<Box<Value>>),
    Variant(Type, Box<Value>),
}

impl Value {
    pub fn just(value: impl Into<Value>) -> Value {
        Value::Maybe(Some(Box::new(value.into())))
    }

    pub fn nothing() -> Value {
        Value::Maybe(None)
    }

    pub fn variant(ty: Type, value: impl Into<Value>) -> Value {
        Value::Variant(ty, Box::new(value.into()))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<u32> {
        match self {
            Value::Handle(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<u32> {
        match self {
            Value::Fd(v) => Some(*v),
            _ => None,
        }
    }

    /// Elements of an array or fields of a tuple.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// `Some(None)` for an empty maybe, `None` if this is not a maybe at all.
    pub fn as_maybe(&self) -> Option<Option<&Value>> {
        match self {
            Value::Maybe(inner) => Some(inner.as_deref()),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<(&Type, &Value)> {
        match self {
            Value::Variant(ty, inner) => Some((ty, inner)),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
    String => Str,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        Value::Maybe(v.map(|inner| Box::new(inner.into())))
    }
}
