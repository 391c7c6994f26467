//! Item header layout.
//!
//! ```text
//! +-----------------------+ 0
//! | type tag: u8          |
//! | options: u16          | 1
//! | name field len: u8    | 3
//! | item length: u32      | 4
//! | parent offset: u32    | 8
//! | value count: u32      | 12
//! +-----------------------+ 16 (HEADER_SIZE)
//! | name field (optional) |
//! +-----------------------+ 16 + name field len
//! | value field           |
//! +-----------------------+ item length
//! ```
//!
//! Multi-byte fields use the owning buffer's byte order.

use itembuf_buffer::BufferManager;
use itembuf_common::{Codec, Endianness, ItemType, ItembufError, Result};

use super::constants::{
    HEADER_SIZE, OFF_COUNT, OFF_ITEM_LEN, OFF_NAME_FIELD_LEN, OFF_OPTIONS, OFF_PARENT, OFF_TYPE,
};

/// Per-item option bits.
///
/// No bits are assigned yet. The word is carried through every edit,
/// compaction and import unchanged so callers can attach their own flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ItemOptions(pub u16);

impl ItemOptions {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Returns true if every bit in `mask` is set.
    pub fn contains(&self, mask: u16) -> bool {
        self.0 & mask == mask
    }

    /// Sets or clears the bits in `mask`.
    pub fn set(&mut self, mask: u16, on: bool) {
        if on {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

/// Decoded item header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    /// Value kind.
    pub item_type: ItemType,
    /// Option bits.
    pub options: ItemOptions,
    /// Bytes occupied by the name field, 0 if unnamed.
    pub name_field_len: u8,
    /// Header + name field + value field, including slack.
    pub item_len: u32,
    /// Offset of the parent item, NO_PARENT for the root.
    pub parent: u32,
    /// Child or element count for composites, 0 otherwise.
    pub count: u32,
}

impl ItemHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = HEADER_SIZE;

    /// Creates a header with empty options and a zero count.
    pub fn new(item_type: ItemType, name_field_len: u8, item_len: u32, parent: u32) -> Self {
        Self {
            item_type,
            options: ItemOptions::empty(),
            name_field_len,
            item_len,
            parent,
            count: 0,
        }
    }

    /// Offset of the value field relative to the item start.
    #[inline]
    pub fn value_offset(&self) -> usize {
        HEADER_SIZE + self.name_field_len as usize
    }

    /// Bytes allotted to the value field, slack included.
    #[inline]
    pub fn reserved_len(&self) -> usize {
        (self.item_len as usize).saturating_sub(self.value_offset())
    }

    /// Serializes the header.
    pub fn to_bytes(&self, endianness: Endianness) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[OFF_TYPE] = self.item_type as u8;
        self.options.0.encode(&mut buf[OFF_OPTIONS..], endianness);
        buf[OFF_NAME_FIELD_LEN] = self.name_field_len;
        self.item_len.encode(&mut buf[OFF_ITEM_LEN..], endianness);
        self.parent.encode(&mut buf[OFF_PARENT..], endianness);
        self.count.encode(&mut buf[OFF_COUNT..], endianness);
        buf
    }

    /// Deserializes a header; fails on an unknown type tag or short input.
    pub fn from_bytes(buf: &[u8], endianness: Endianness) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(ItembufError::malformed(
                0,
                format!("header needs {} bytes, got {}", Self::SIZE, buf.len()),
            ));
        }
        Ok(Self {
            item_type: ItemType::try_from(buf[OFF_TYPE])?,
            options: ItemOptions(u16::decode(&buf[OFF_OPTIONS..], endianness)?),
            name_field_len: buf[OFF_NAME_FIELD_LEN],
            item_len: u32::decode(&buf[OFF_ITEM_LEN..], endianness)?,
            parent: u32::decode(&buf[OFF_PARENT..], endianness)?,
            count: u32::decode(&buf[OFF_COUNT..], endianness)?,
        })
    }

    // =========================================================================
    // In-buffer access
    // =========================================================================

    /// Reads the header of the item at `offset`.
    pub fn read(mgr: &BufferManager, offset: usize) -> Result<Self> {
        let buf = mgr.slice(offset, Self::SIZE)?;
        Self::from_bytes(buf, mgr.endianness()).map_err(|e| at_offset(e, offset))
    }

    /// Writes this header to the item at `offset`.
    pub fn write(&self, mgr: &mut BufferManager, offset: usize) -> Result<()> {
        let bytes = self.to_bytes(mgr.endianness());
        mgr.slice_mut(offset, Self::SIZE)?.copy_from_slice(&bytes);
        Ok(())
    }

    /// Reads only the type tag.
    #[inline]
    pub fn read_item_type(mgr: &BufferManager, offset: usize) -> Result<ItemType> {
        let tag = mgr.slice(offset + OFF_TYPE, 1)?[0];
        ItemType::try_from(tag).map_err(|e| at_offset(e, offset))
    }

    /// Reads only the options word.
    #[inline]
    pub fn read_options(mgr: &BufferManager, offset: usize) -> Result<ItemOptions> {
        Ok(ItemOptions(mgr.read::<u16>(offset + OFF_OPTIONS)?))
    }

    /// Overwrites only the options word.
    #[inline]
    pub fn write_options(mgr: &mut BufferManager, offset: usize, options: ItemOptions) -> Result<()> {
        mgr.write(offset + OFF_OPTIONS, &options.0)
    }

    /// Reads only the name-field length.
    #[inline]
    pub fn read_name_field_len(mgr: &BufferManager, offset: usize) -> Result<u8> {
        Ok(mgr.slice(offset + OFF_NAME_FIELD_LEN, 1)?[0])
    }

    /// Reads only the item length.
    #[inline]
    pub fn read_item_len(mgr: &BufferManager, offset: usize) -> Result<u32> {
        mgr.read::<u32>(offset + OFF_ITEM_LEN)
    }

    /// Overwrites only the item length.
    #[inline]
    pub fn write_item_len(mgr: &mut BufferManager, offset: usize, item_len: u32) -> Result<()> {
        mgr.write(offset + OFF_ITEM_LEN, &item_len)
    }

    /// Reads only the parent offset.
    #[inline]
    pub fn read_parent(mgr: &BufferManager, offset: usize) -> Result<u32> {
        mgr.read::<u32>(offset + OFF_PARENT)
    }

    /// Overwrites only the parent offset.
    #[inline]
    pub fn write_parent(mgr: &mut BufferManager, offset: usize, parent: u32) -> Result<()> {
        mgr.write(offset + OFF_PARENT, &parent)
    }

    /// Reads only the value count.
    #[inline]
    pub fn read_count(mgr: &BufferManager, offset: usize) -> Result<u32> {
        mgr.read::<u32>(offset + OFF_COUNT)
    }

    /// Overwrites only the value count.
    #[inline]
    pub fn write_count(mgr: &mut BufferManager, offset: usize, count: u32) -> Result<()> {
        mgr.write(offset + OFF_COUNT, &count)
    }
}

/// Rebases a malformed-buffer error onto an absolute offset.
pub(crate) fn at_offset(err: ItembufError, offset: usize) -> ItembufError {
    match err {
        ItembufError::MalformedBuffer {
            offset: inner,
            reason,
        } => ItembufError::MalformedBuffer {
            offset: offset + inner,
            reason,
        },
        other => other,
    }
}
