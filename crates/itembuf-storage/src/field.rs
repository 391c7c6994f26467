//! Value field layouts.
//!
//! Each value kind lays out the bytes after the header and name field
//! differently. Every layout distinguishes used bytes (what the value
//! needs now) from reserved bytes (item length minus header and name);
//! the difference is slack that later writes can grow into without
//! shifting the rest of the buffer.
//!
//! - Fixed scalars: the raw value at its natural width
//! - String, Binary: used byte count (u32) then the bytes
//! - Array: [`ArrayPrefix`] then raw fixed-size elements or full unnamed items
//! - Dictionary, Sequence: child items back to back

use itembuf_buffer::BufferManager;
use itembuf_common::{Codec, Endianness, ItemType, ItembufError, Result};

use crate::item::ItemHeader;
use crate::item::constants::{ARRAY_OFF_ELEMENT_SIZE, ARRAY_PREFIX_SIZE, BYTES_PREFIX_SIZE};

/// Array value-field prefix.
///
/// Layout (8 bytes):
/// - element type: 1 byte
/// - zero padding: 3 bytes
/// - element size: 4 bytes (fixed width, 0 for item elements)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayPrefix {
    /// Type shared by every element.
    pub element_type: ItemType,
    /// Width of each raw element, 0 when elements are full items.
    pub element_size: u32,
}

impl ArrayPrefix {
    /// Size of the prefix in bytes.
    pub const SIZE: usize = ARRAY_PREFIX_SIZE;

    /// Creates the prefix for an array of `element_type`.
    pub fn new(element_type: ItemType) -> Result<Self> {
        if !element_type.is_valid_element() {
            return Err(ItembufError::type_mismatch(
                "array element type",
                element_type,
            ));
        }
        Ok(Self {
            element_type,
            element_size: element_type.fixed_size().unwrap_or(0) as u32,
        })
    }

    /// Returns true if elements are stored raw rather than as items.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.element_size > 0
    }

    /// Serializes the prefix.
    pub fn to_bytes(&self, endianness: Endianness) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.element_type as u8;
        self.element_size
            .encode(&mut buf[ARRAY_OFF_ELEMENT_SIZE..], endianness);
        buf
    }

    /// Deserializes and checks a prefix.
    pub fn from_bytes(buf: &[u8], endianness: Endianness) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(ItembufError::malformed(0, "array prefix truncated"));
        }
        let element_type = ItemType::try_from(buf[0])?;
        let element_size = u32::decode(&buf[ARRAY_OFF_ELEMENT_SIZE..], endianness)?;
        let expected = Self::new(element_type)
            .map_err(|_| ItembufError::malformed(0, "NULL is not an array element type"))?;
        if expected.element_size != element_size {
            return Err(ItembufError::malformed(
                0,
                format!(
                    "element size {} does not match {} elements",
                    element_size, element_type
                ),
            ));
        }
        Ok(expected)
    }

    /// Reads the prefix of the array whose value field starts at `value_start`.
    pub fn read(mgr: &BufferManager, value_start: usize) -> Result<Self> {
        let buf = mgr.slice(value_start, Self::SIZE)?;
        Self::from_bytes(buf, mgr.endianness()).map_err(|e| crate::item::at_offset(e, value_start))
    }
}

/// Absolute offset of the value field of the item at `offset`.
#[inline]
pub fn value_start(offset: usize, header: &ItemHeader) -> usize {
    offset + header.value_offset()
}

/// Absolute end of the item at `offset`.
#[inline]
pub fn item_end(offset: usize, header: &ItemHeader) -> usize {
    offset + header.item_len as usize
}

/// Absolute offset of the first child or element of a composite.
#[inline]
pub fn children_start(offset: usize, header: &ItemHeader) -> usize {
    match header.item_type {
        ItemType::Array => value_start(offset, header) + ArrayPrefix::SIZE,
        _ => value_start(offset, header),
    }
}

/// Reads the used-byte count of a string or binary value field.
pub fn read_bytes_len(mgr: &BufferManager, value_start: usize) -> Result<usize> {
    Ok(mgr.read::<u32>(value_start)? as usize)
}

/// Returns the payload of a string or binary item.
pub fn read_bytes_payload<'a>(
    mgr: &'a BufferManager,
    offset: usize,
    header: &ItemHeader,
) -> Result<&'a [u8]> {
    let start = value_start(offset, header);
    let len = read_bytes_len(mgr, start)?;
    if BYTES_PREFIX_SIZE + len > header.reserved_len() {
        return Err(ItembufError::malformed(
            offset,
            format!(
                "payload of {} bytes exceeds reserved {}",
                len,
                header.reserved_len()
            ),
        ));
    }
    mgr.slice(start + BYTES_PREFIX_SIZE, len)
}

/// Offsets of the child items of a composite, in stored order.
///
/// Empty for scalars and for arrays of raw elements. Fails if a child
/// would extend past the parent's value field.
pub fn child_items(mgr: &BufferManager, offset: usize, header: &ItemHeader) -> Result<Vec<usize>> {
    match header.item_type {
        ItemType::Dictionary | ItemType::Sequence => {}
        ItemType::Array => {
            let prefix = ArrayPrefix::read(mgr, value_start(offset, header))?;
            if prefix.is_fixed() {
                return Ok(Vec::new());
            }
        }
        _ => return Ok(Vec::new()),
    }

    let end = item_end(offset, header);
    let mut children =
        Vec::with_capacity((header.count as usize).min(header.reserved_len() / ItemHeader::SIZE));
    let mut pos = children_start(offset, header);
    for _ in 0..header.count {
        if pos + ItemHeader::SIZE > end {
            return Err(ItembufError::malformed(
                pos,
                format!("child header extends past parent at {}", offset),
            ));
        }
        let len = ItemHeader::read_item_len(mgr, pos)? as usize;
        if len < ItemHeader::SIZE || pos + len > end {
            return Err(ItembufError::malformed(
                pos,
                format!("child length {} invalid inside parent at {}", len, offset),
            ));
        }
        children.push(pos);
        pos += len;
    }
    Ok(children)
}

/// Bytes of the value field currently in use.
pub fn used_len(mgr: &BufferManager, offset: usize, header: &ItemHeader) -> Result<usize> {
    let start = value_start(offset, header);
    match header.item_type {
        ItemType::String | ItemType::Binary => {
            Ok(BYTES_PREFIX_SIZE + read_bytes_len(mgr, start)?)
        }
        ItemType::Array => {
            let prefix = ArrayPrefix::read(mgr, start)?;
            if prefix.is_fixed() {
                Ok(ArrayPrefix::SIZE + header.count as usize * prefix.element_size as usize)
            } else {
                Ok(ArrayPrefix::SIZE + children_len(mgr, offset, header)?)
            }
        }
        ItemType::Dictionary | ItemType::Sequence => children_len(mgr, offset, header),
        fixed => Ok(fixed.fixed_size().unwrap_or(0)),
    }
}

fn children_len(mgr: &BufferManager, offset: usize, header: &ItemHeader) -> Result<usize> {
    let children = child_items(mgr, offset, header)?;
    match children.last() {
        Some(&last) => {
            let last_len = ItemHeader::read_item_len(mgr, last)? as usize;
            Ok(last + last_len - children_start(offset, header))
        }
        None => Ok(0),
    }
}

/// Absolute end of the used part of a composite's value field; the
/// position a new trailing child or element goes.
pub fn used_end(mgr: &BufferManager, offset: usize, header: &ItemHeader) -> Result<usize> {
    Ok(value_start(offset, header) + used_len(mgr, offset, header)?)
}
