//! Values that can travel in an event payload slot

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A single payload slot value
///
/// Primitive variants are blittable: their native representation is the
/// value's own bytes. `Opaque` holds an arbitrary shared object that only this
/// library can interpret; natively it is represented by a reference surrogate.
#[derive(Clone)]
pub enum PayloadValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(char),
    Bytes(Vec<u8>),
    Text(String),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl PayloadValue {
    /// Wrap an arbitrary object as an opaque value
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        PayloadValue::Opaque(Arc::new(value))
    }

    /// Borrow the object inside an `Opaque` value if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            PayloadValue::Opaque(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// True if the native representation is the value's own bytes
    pub fn is_blittable(&self) -> bool {
        !matches!(self, PayloadValue::Opaque(_))
    }

    /// Short type name, as used in `type:value` specs
    pub fn kind(&self) -> &'static str {
        match self {
            PayloadValue::Bool(_) => "bool",
            PayloadValue::I8(_) => "i8",
            PayloadValue::I16(_) => "i16",
            PayloadValue::I32(_) => "i32",
            PayloadValue::I64(_) => "i64",
            PayloadValue::U8(_) => "u8",
            PayloadValue::U16(_) => "u16",
            PayloadValue::U32(_) => "u32",
            PayloadValue::U64(_) => "u64",
            PayloadValue::F32(_) => "f32",
            PayloadValue::F64(_) => "f64",
            PayloadValue::Char(_) => "char",
            PayloadValue::Bytes(_) => "bytes",
            PayloadValue::Text(_) => "text",
            PayloadValue::Opaque(_) => "opaque",
        }
    }
}

// Floats compare by bit pattern so that a round trip through native memory is
// checked exactly; opaque values compare by identity.
impl PartialEq for PayloadValue {
    fn eq(&self, other: &Self) -> bool {
        use PayloadValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (F64(a), F64(b)) => a.to_bits() == b.to_bits(),
            (Char(a), Char(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Opaque(a), Opaque(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }
}

impl fmt::Debug for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::Opaque(obj) => write!(f, "Opaque({:p})", Arc::as_ptr(obj)),
            other => write!(f, "{}({})", other.kind(), other),
        }
    }
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::Bool(v) => write!(f, "{}", v),
            PayloadValue::I8(v) => write!(f, "{}", v),
            PayloadValue::I16(v) => write!(f, "{}", v),
            PayloadValue::I32(v) => write!(f, "{}", v),
            PayloadValue::I64(v) => write!(f, "{}", v),
            PayloadValue::U8(v) => write!(f, "{}", v),
            PayloadValue::U16(v) => write!(f, "{}", v),
            PayloadValue::U32(v) => write!(f, "{}", v),
            PayloadValue::U64(v) => write!(f, "{}", v),
            PayloadValue::F32(v) => write!(f, "{}", v),
            PayloadValue::F64(v) => write!(f, "{}", v),
            PayloadValue::Char(v) => write!(f, "{:?}", v),
            PayloadValue::Bytes(v) => {
                for byte in v {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            PayloadValue::Text(v) => write!(f, "{:?}", v),
            PayloadValue::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PayloadValue {
                fn from(value: $ty) -> Self {
                    PayloadValue::$variant(value)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    char => Char,
    Vec<u8> => Bytes,
    String => Text,
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_owned())
    }
}
