//! Payload serializer
//!
//! Converts a [`PayloadValue`] into a [`Token`] (the address of native
//! memory representing the value) and back.
//!
//! Every token points at a [`TokenHeader`]. The header records how the storage
//! behind the token was produced, so decoding never depends on metadata kept
//! outside the block:
//!
//! ```text
//! Copied:  [ magic | tag | 0        | len | reserved ][ len bytes of value ]
//! Pinned:  [ magic | tag | PINNED   | len | reserved ][ 8 bytes ][ owner ]
//! ```
//!
//! Copied blocks hold the value's native-endian bytes, or for opaque values
//! the address of a boxed reference surrogate, and come from the bridge's
//! [`NativeAllocator`].
//!
//! Pinned tokens keep the value itself in a heap cell that does not move
//! until the token is released, so nothing is copied through the native
//! allocator. The word after the header reads the same as in copied mode for
//! fixed-size values (their bytes) and opaque values (the surrogate address,
//! which here is the cell's own reference). Rust has no way to pin memory the
//! caller still owns, so the cell takes ownership of the value; byte and text
//! buffers are exposed where they already live instead of inline, marked by
//! the `INDIRECT` flag, with the word holding the buffer address and `len`
//! its length.

use byteorder::{ByteOrder, NativeEndian};
use serde::{Deserialize, Serialize};
use std::alloc::Layout;
use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

use super::value::PayloadValue;
use crate::alloc::NativeAllocator;
use crate::types::{BridgeError, Result};

/// How a value is made addressable for the native side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializeMode {
    /// Copy the value's bytes into a freshly allocated native block
    #[default]
    Copied,
    /// Keep the value in a pinned cell and hand out its address
    Pinned,
}

/// Address of one serialized payload slot; `Token::NULL` means "absent"
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token(usize);

impl Token {
    pub const NULL: Token = Token(0);

    pub fn from_addr(addr: usize) -> Self {
        Token(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

const TOKEN_MAGIC: u32 = 0x5053_5042;
const BLOCK_ALIGN: usize = 8;

mod tag {
    pub const BOOL: u16 = 1;
    pub const I8: u16 = 2;
    pub const I16: u16 = 3;
    pub const I32: u16 = 4;
    pub const I64: u16 = 5;
    pub const U8: u16 = 6;
    pub const U16: u16 = 7;
    pub const U32: u16 = 8;
    pub const U64: u16 = 9;
    pub const F32: u16 = 10;
    pub const F64: u16 = 11;
    pub const CHAR: u16 = 12;
    pub const BYTES: u16 = 13;
    pub const TEXT: u16 = 14;
    pub const OPAQUE: u16 = 15;
}

mod flag {
    pub const PINNED: u16 = 0x1;
    pub const INDIRECT: u16 = 0x2;
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TokenHeader {
    magic: u32,
    tag: u16,
    flags: u16,
    len: u32,
    reserved: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<TokenHeader>();

#[repr(C)]
struct PinnedCell {
    header: TokenHeader,
    data: [u8; 8],
    value: PayloadValue,
}

const _: () = assert!(std::mem::offset_of!(PinnedCell, data) == HEADER_SIZE);

type Surrogate = Arc<dyn Any + Send + Sync>;

/// Serializes payload values into native tokens
#[derive(Clone)]
pub struct PayloadSerializer {
    allocator: Arc<dyn NativeAllocator>,
}

impl PayloadSerializer {
    pub fn new(allocator: Arc<dyn NativeAllocator>) -> Self {
        Self { allocator }
    }

    /// Serialize one slot; `None` yields `Token::NULL` without allocating
    pub fn serialize(&self, value: Option<PayloadValue>, mode: SerializeMode) -> Result<Token> {
        let Some(value) = value else {
            return Ok(Token::NULL);
        };
        match mode {
            SerializeMode::Copied => self.serialize_copied(value),
            SerializeMode::Pinned => Self::serialize_pinned(value),
        }
    }

    fn serialize_copied(&self, value: PayloadValue) -> Result<Token> {
        let (tag, len) = wire_shape(&value);
        let layout = block_layout(len)?;
        let block = self.allocator.allocate(layout).ok_or_else(|| {
            log::warn!("Native allocation of {} bytes for a payload token failed", layout.size());
            BridgeError::AllocationFailure {
                size: layout.size(),
            }
        })?;

        let header = TokenHeader {
            magic: TOKEN_MAGIC,
            tag,
            flags: 0,
            len: len as u32,
            reserved: 0,
        };
        // SAFETY: block is a fresh allocation of HEADER_SIZE + len bytes,
        // aligned to BLOCK_ALIGN which satisfies TokenHeader.
        unsafe {
            block.cast::<TokenHeader>().as_ptr().write(header);
            let data = std::slice::from_raw_parts_mut(block.as_ptr().add(HEADER_SIZE), len);
            write_value(&value, data);
        }

        let token = Token(block.as_ptr() as usize);
        log::trace!("Serialized {} bytes into token 0x{:X}", len, token.addr());
        Ok(token)
    }

    fn serialize_pinned(value: PayloadValue) -> Result<Token> {
        let (tag, len) = wire_shape(&value);
        if len > u32::MAX as usize {
            return Err(BridgeError::AllocationFailure { size: len });
        }
        let mut cell = Box::new(PinnedCell {
            header: TokenHeader {
                magic: TOKEN_MAGIC,
                tag,
                flags: flag::PINNED,
                len: len as u32,
                reserved: 0,
            },
            data: [0; 8],
            value,
        });

        // The addresses taken here stay valid while the cell is alive: the
        // box never moves and the owned buffers are never touched again.
        let cell_ref = &mut *cell;
        let indirect = match &cell_ref.value {
            PayloadValue::Bytes(bytes) => Some(bytes.as_ptr() as usize),
            PayloadValue::Text(text) => Some(text.as_ptr() as usize),
            PayloadValue::Opaque(obj) => {
                let surrogate: *const Surrogate = obj;
                NativeEndian::write_u64(&mut cell_ref.data, surrogate as usize as u64);
                None
            }
            scalar => {
                write_value(scalar, &mut cell_ref.data[..len]);
                None
            }
        };
        if let Some(addr) = indirect {
            cell_ref.header.flags |= flag::INDIRECT;
            NativeEndian::write_u64(&mut cell_ref.data, addr as u64);
        }

        Ok(Token(Box::into_raw(cell) as usize))
    }

    /// Reconstruct the value behind a token; `Token::NULL` yields `None`
    ///
    /// # Safety
    /// A non-null `token` must point at readable memory that is either a token
    /// produced by [`serialize`](Self::serialize) and not yet released, or at
    /// least a [`TokenHeader`]'s worth of foreign memory (which is then
    /// rejected with `ForeignToken`).
    pub unsafe fn deserialize(&self, token: Token) -> Result<Option<PayloadValue>> {
        if token.is_null() {
            return Ok(None);
        }
        let header = read_header(token)?;
        if header.flags & flag::PINNED != 0 {
            let cell = &*(token.addr() as *const PinnedCell);
            return Ok(Some(cell.value.clone()));
        }

        let data = std::slice::from_raw_parts(
            (token.addr() as *const u8).add(HEADER_SIZE),
            header.len as usize,
        );
        read_value(header.tag, data)
            .map(Some)
            .ok_or(BridgeError::ForeignToken { addr: token.addr() })
    }

    /// Free the storage behind a token; no-op for `Token::NULL`
    ///
    /// # Safety
    /// `token` must be null or a live token produced by this serializer, and
    /// must not be used again after this call.
    pub unsafe fn release(&self, token: Token) {
        if token.is_null() {
            return;
        }
        let header = match read_header(token) {
            Ok(header) => header,
            Err(_) => {
                log::warn!("Refusing to release foreign token 0x{:X}", token.addr());
                return;
            }
        };

        if header.flags & flag::PINNED != 0 {
            drop(Box::from_raw(token.addr() as *mut PinnedCell));
            log::trace!("Released pinned token 0x{:X}", token.addr());
            return;
        }

        let base = token.addr() as *mut u8;
        if header.tag == tag::OPAQUE {
            let surrogate = NativeEndian::read_u64(std::slice::from_raw_parts(
                base.add(HEADER_SIZE),
                8,
            )) as usize;
            drop(Box::from_raw(surrogate as *mut Surrogate));
        }

        let len = header.len as usize;
        if let Ok(layout) = block_layout(len) {
            self.allocator.deallocate(NonNull::new_unchecked(base), layout);
        }
        log::trace!("Released token 0x{:X}", token.addr());
    }
}

impl std::fmt::Debug for PayloadSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSerializer").finish_non_exhaustive()
    }
}

fn block_layout(len: usize) -> Result<Layout> {
    if len > u32::MAX as usize {
        return Err(BridgeError::AllocationFailure { size: len });
    }
    Layout::from_size_align(HEADER_SIZE + len, BLOCK_ALIGN)
        .map_err(|_| BridgeError::AllocationFailure { size: len })
}

unsafe fn read_header(token: Token) -> Result<TokenHeader> {
    let header = (token.addr() as *const TokenHeader).read();
    if header.magic != TOKEN_MAGIC {
        return Err(BridgeError::ForeignToken { addr: token.addr() });
    }
    Ok(header)
}

/// Tag and encoded length of a value in copied mode
fn wire_shape(value: &PayloadValue) -> (u16, usize) {
    match value {
        PayloadValue::Bool(_) => (tag::BOOL, 1),
        PayloadValue::I8(_) => (tag::I8, 1),
        PayloadValue::I16(_) => (tag::I16, 2),
        PayloadValue::I32(_) => (tag::I32, 4),
        PayloadValue::I64(_) => (tag::I64, 8),
        PayloadValue::U8(_) => (tag::U8, 1),
        PayloadValue::U16(_) => (tag::U16, 2),
        PayloadValue::U32(_) => (tag::U32, 4),
        PayloadValue::U64(_) => (tag::U64, 8),
        PayloadValue::F32(_) => (tag::F32, 4),
        PayloadValue::F64(_) => (tag::F64, 8),
        PayloadValue::Char(_) => (tag::CHAR, 4),
        PayloadValue::Bytes(bytes) => (tag::BYTES, bytes.len()),
        PayloadValue::Text(text) => (tag::TEXT, text.len()),
        PayloadValue::Opaque(_) => (tag::OPAQUE, 8),
    }
}

/// Write a value's encoding into `data`, which is exactly `wire_shape` long
fn write_value(value: &PayloadValue, data: &mut [u8]) {
    match *value {
        PayloadValue::Bool(v) => data[0] = v as u8,
        PayloadValue::I8(v) => data[0] = v as u8,
        PayloadValue::I16(v) => NativeEndian::write_i16(data, v),
        PayloadValue::I32(v) => NativeEndian::write_i32(data, v),
        PayloadValue::I64(v) => NativeEndian::write_i64(data, v),
        PayloadValue::U8(v) => data[0] = v,
        PayloadValue::U16(v) => NativeEndian::write_u16(data, v),
        PayloadValue::U32(v) => NativeEndian::write_u32(data, v),
        PayloadValue::U64(v) => NativeEndian::write_u64(data, v),
        PayloadValue::F32(v) => NativeEndian::write_f32(data, v),
        PayloadValue::F64(v) => NativeEndian::write_f64(data, v),
        PayloadValue::Char(v) => NativeEndian::write_u32(data, v as u32),
        PayloadValue::Bytes(ref bytes) => data.copy_from_slice(bytes),
        PayloadValue::Text(ref text) => data.copy_from_slice(text.as_bytes()),
        PayloadValue::Opaque(ref obj) => {
            let surrogate: *mut Surrogate = Box::into_raw(Box::new(Arc::clone(obj)));
            NativeEndian::write_u64(data, surrogate as usize as u64);
        }
    }
}

fn read_value(tag: u16, data: &[u8]) -> Option<PayloadValue> {
    let value = match tag {
        tag::BOOL => PayloadValue::Bool(*data.first()? != 0),
        tag::I8 => PayloadValue::I8(*data.first()? as i8),
        tag::I16 => PayloadValue::I16(NativeEndian::read_i16(data.get(..2)?)),
        tag::I32 => PayloadValue::I32(NativeEndian::read_i32(data.get(..4)?)),
        tag::I64 => PayloadValue::I64(NativeEndian::read_i64(data.get(..8)?)),
        tag::U8 => PayloadValue::U8(*data.first()?),
        tag::U16 => PayloadValue::U16(NativeEndian::read_u16(data.get(..2)?)),
        tag::U32 => PayloadValue::U32(NativeEndian::read_u32(data.get(..4)?)),
        tag::U64 => PayloadValue::U64(NativeEndian::read_u64(data.get(..8)?)),
        tag::F32 => PayloadValue::F32(NativeEndian::read_f32(data.get(..4)?)),
        tag::F64 => PayloadValue::F64(NativeEndian::read_f64(data.get(..8)?)),
        tag::CHAR => PayloadValue::Char(char::from_u32(NativeEndian::read_u32(data.get(..4)?))?),
        tag::BYTES => PayloadValue::Bytes(data.to_vec()),
        tag::TEXT => PayloadValue::Text(String::from_utf8(data.to_vec()).ok()?),
        tag::OPAQUE => {
            let surrogate = NativeEndian::read_u64(data.get(..8)?) as usize as *const Surrogate;
            // SAFETY: the surrogate box lives until the token is released.
            PayloadValue::Opaque(unsafe { (*surrogate).clone() })
        }
        _ => return None,
    };
    Some(value)
}
