//! Endianness-aware primitive codecs.
//!
//! Every primitive that can live in an item's value field implements
//! [`Codec`]. The byte order is never ambient: callers pass the buffer's
//! configured [`Endianness`] into every encode and decode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ItembufError, Result};
use crate::types::ItemType;

/// Byte order of multi-byte values inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endianness {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl Endianness {
    /// Returns the byte order of the running machine.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// Returns true if values in this byte order need no swapping.
    pub fn is_native(&self) -> bool {
        *self == Self::native()
    }
}

impl std::fmt::Display for Endianness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endianness::Little => write!(f, "little"),
            Endianness::Big => write!(f, "big"),
        }
    }
}

/// Encode/decode contract for a primitive value.
///
/// `encode` writes exactly `byte_count()` bytes. A destination shorter than
/// that is a programming error and panics; it is never truncated.
pub trait Codec: Sized {
    /// Item type tag under which values of this type are stored.
    const ITEM_TYPE: ItemType;

    /// Exact encoded size of this value, excluding any reserved slack.
    fn byte_count(&self) -> usize;

    /// Writes the encoded value to the start of `dst`.
    fn encode(&self, dst: &mut [u8], endianness: Endianness);

    /// Reads a value from `src`; the inverse of `encode`.
    fn decode(src: &[u8], endianness: Endianness) -> Result<Self>;
}

#[inline(always)]
fn check_destination(dst: &[u8], needed: usize) {
    assert!(
        dst.len() >= needed,
        "codec destination too short: {} bytes, need {}",
        dst.len(),
        needed
    );
}

#[inline]
fn short_source(needed: usize, actual: usize) -> ItembufError {
    ItembufError::malformed(
        0,
        format!("codec source too short: {} bytes, need {}", actual, needed),
    )
}

macro_rules! impl_numeric_codec {
    ($($ty:ty => $item_type:expr),* $(,)?) => {
        $(
            impl Codec for $ty {
                const ITEM_TYPE: ItemType = $item_type;

                #[inline]
                fn byte_count(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }

                #[inline]
                fn encode(&self, dst: &mut [u8], endianness: Endianness) {
                    const N: usize = std::mem::size_of::<$ty>();
                    check_destination(dst, N);
                    let raw = match endianness {
                        Endianness::Little => self.to_le_bytes(),
                        Endianness::Big => self.to_be_bytes(),
                    };
                    dst[..N].copy_from_slice(&raw);
                }

                #[inline]
                fn decode(src: &[u8], endianness: Endianness) -> Result<Self> {
                    const N: usize = std::mem::size_of::<$ty>();
                    let raw: [u8; N] = src
                        .get(..N)
                        .and_then(|s| s.try_into().ok())
                        .ok_or_else(|| short_source(N, src.len()))?;
                    Ok(match endianness {
                        Endianness::Little => <$ty>::from_le_bytes(raw),
                        Endianness::Big => <$ty>::from_be_bytes(raw),
                    })
                }
            }
        )*
    };
}

impl_numeric_codec! {
    i8 => ItemType::Int8,
    i16 => ItemType::Int16,
    i32 => ItemType::Int32,
    i64 => ItemType::Int64,
    u8 => ItemType::UInt8,
    u16 => ItemType::UInt16,
    u32 => ItemType::UInt32,
    u64 => ItemType::UInt64,
    f32 => ItemType::Float32,
    f64 => ItemType::Float64,
}

impl Codec for bool {
    const ITEM_TYPE: ItemType = ItemType::Bool;

    #[inline]
    fn byte_count(&self) -> usize {
        1
    }

    #[inline]
    fn encode(&self, dst: &mut [u8], _endianness: Endianness) {
        check_destination(dst, 1);
        dst[0] = u8::from(*self);
    }

    #[inline]
    fn decode(src: &[u8], _endianness: Endianness) -> Result<Self> {
        let byte = src.first().ok_or_else(|| short_source(1, 0))?;
        Ok(*byte != 0)
    }
}

// UUIDs are an opaque 16-byte block; byte order does not apply.
impl Codec for Uuid {
    const ITEM_TYPE: ItemType = ItemType::Uuid;

    #[inline]
    fn byte_count(&self) -> usize {
        16
    }

    fn encode(&self, dst: &mut [u8], _endianness: Endianness) {
        check_destination(dst, 16);
        dst[..16].copy_from_slice(self.as_bytes());
    }

    fn decode(src: &[u8], _endianness: Endianness) -> Result<Self> {
        let raw: [u8; 16] = src
            .get(..16)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| short_source(16, src.len()))?;
        Ok(Uuid::from_bytes(raw))
    }
}

impl Codec for String {
    const ITEM_TYPE: ItemType = ItemType::String;

    #[inline]
    fn byte_count(&self) -> usize {
        self.len()
    }

    fn encode(&self, dst: &mut [u8], _endianness: Endianness) {
        check_destination(dst, self.len());
        dst[..self.len()].copy_from_slice(self.as_bytes());
    }

    fn decode(src: &[u8], _endianness: Endianness) -> Result<Self> {
        String::from_utf8(src.to_vec()).map_err(|_| ItembufError::InvalidUtf8 { offset: 0 })
    }
}

impl Codec for Vec<u8> {
    const ITEM_TYPE: ItemType = ItemType::Binary;

    #[inline]
    fn byte_count(&self) -> usize {
        self.len()
    }

    fn encode(&self, dst: &mut [u8], _endianness: Endianness) {
        check_destination(dst, self.len());
        dst[..self.len()].copy_from_slice(self);
    }

    fn decode(src: &[u8], _endianness: Endianness) -> Result<Self> {
        Ok(src.to_vec())
    }
}
