//! Buffer manager.

use bytes::Bytes;
use itembuf_common::{Codec, Endianness, ItembufError, Result, StoreConfig};
use tracing::{debug, trace};

use crate::anchor::{Anchor, AnchorTable};
use crate::region::BufferRegion;

/// Buffer manager.
///
/// Owns the single region backing an item tree and is the only component
/// that turns an offset into bytes. It tracks:
/// - Used bytes versus capacity (the remainder is slack)
/// - A generation counter bumped by every structural edit
/// - The anchor table that portals validate against
///
/// Every read and write is bounds checked against the used portion.
pub struct BufferManager {
    /// Configuration, including the buffer's byte order.
    config: StoreConfig,
    /// Backing memory.
    region: BufferRegion,
    /// Bytes holding valid items, always a prefix of the region.
    used: usize,
    /// Incremented on every structural edit.
    generation: u64,
    /// Live portal anchors.
    anchors: AnchorTable,
}

impl BufferManager {
    /// Creates an empty buffer with the configured initial capacity.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let region = BufferRegion::allocate(config.initial_capacity)?;
        Ok(Self {
            config,
            region,
            used: 0,
            generation: 0,
            anchors: AnchorTable::new(),
        })
    }

    /// Creates a buffer whose used portion is a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8], config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if bytes.len() > config.max_capacity {
            return Err(ItembufError::CapacityExceeded {
                requested: bytes.len(),
                limit: config.max_capacity,
            });
        }
        let region = BufferRegion::from_bytes(bytes, config.initial_capacity)?;
        Ok(Self {
            config,
            region,
            used: bytes.len(),
            generation: 0,
            anchors: AnchorTable::new(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the byte order used for every codec call on this buffer.
    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.config.endianness
    }

    /// Returns the number of used bytes.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Returns the unused bytes at the end of the region.
    #[inline]
    pub fn slack(&self) -> usize {
        self.capacity() - self.used
    }

    /// Returns the current generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the used portion of the buffer.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.region.as_slice()[..self.used]
    }

    /// Returns a copy of the used portion, ready for storage or transmission.
    pub fn export(&self) -> Bytes {
        Bytes::copy_from_slice(self.bytes())
    }

    /// Returns `len` used bytes starting at `offset`.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&self.region.as_slice()[offset..end])
    }

    /// Returns `len` used bytes starting at `offset`, mutably.
    #[inline]
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&mut self.region.as_mut_slice()[offset..end])
    }

    /// Decodes a value starting at `offset`.
    #[inline]
    pub fn read<T: Codec>(&self, offset: usize) -> Result<T> {
        let tail = self.slice(offset, self.used.saturating_sub(offset))?;
        T::decode(tail, self.endianness()).map_err(|e| match e {
            ItembufError::MalformedBuffer { reason, .. } => {
                ItembufError::MalformedBuffer { offset, reason }
            }
            other => other,
        })
    }

    /// Encodes `value` at `offset`.
    #[inline]
    pub fn write<T: Codec>(&mut self, offset: usize, value: &T) -> Result<()> {
        let endianness = self.endianness();
        let dst = self.slice_mut(offset, value.byte_count())?;
        value.encode(dst, endianness);
        Ok(())
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.used => Ok(end),
            _ => Err(ItembufError::malformed(
                offset,
                format!(
                    "access of {} bytes exceeds used length {}",
                    len, self.used
                ),
            )),
        }
    }

    /// Grows the region so that `additional` more bytes fit after the used
    /// portion.
    ///
    /// Capacity grows by the configured factor (doubling by default) to
    /// amortize copies. Offsets stay valid because nothing outside this
    /// manager holds an address.
    pub fn ensure_capacity(&mut self, additional: usize) -> Result<()> {
        let required = self
            .used
            .checked_add(additional)
            .ok_or(ItembufError::CapacityExceeded {
                requested: usize::MAX,
                limit: self.config.max_capacity,
            })?;
        if required <= self.capacity() {
            return Ok(());
        }
        if required > self.config.max_capacity {
            return Err(ItembufError::CapacityExceeded {
                requested: required,
                limit: self.config.max_capacity,
            });
        }

        let old_capacity = self.capacity();
        let new_capacity = old_capacity
            .saturating_mul(self.config.growth_factor)
            .max(required)
            .min(self.config.max_capacity);

        self.region.grow(new_capacity, self.used)?;
        debug!(
            old_capacity,
            new_capacity,
            used = self.used,
            "buffer reallocated"
        );
        Ok(())
    }

    /// Claims `len` zeroed bytes at the end of the used portion and returns
    /// their offset.
    pub fn append(&mut self, len: usize) -> Result<usize> {
        self.ensure_capacity(len)?;
        let offset = self.used;
        self.region.zero(offset, len);
        self.used += len;
        Ok(offset)
    }

    /// Opens a zeroed gap of `len` bytes at `at`, shifting every used byte
    /// from `at` onward.
    ///
    /// Anchors in the shifted range are dropped.
    pub fn insert_gap(&mut self, at: usize, len: usize) -> Result<()> {
        if at > self.used {
            return Err(ItembufError::malformed(
                at,
                format!("gap position beyond used length {}", self.used),
            ));
        }
        if len == 0 {
            return Ok(());
        }
        self.ensure_capacity(len)?;

        let old_used = self.used;
        self.region.copy_within(at, at + len, old_used - at)?;
        self.region.zero(at, len);
        self.used += len;
        self.invalidate(at, old_used);

        trace!(at, len, used = self.used, "gap inserted");
        Ok(())
    }

    /// Removes `len` used bytes at `at`, shifting the tail down.
    ///
    /// Anchors in the removed and shifted ranges are dropped.
    pub fn remove_range(&mut self, at: usize, len: usize) -> Result<()> {
        let end = self.checked_end(at, len)?;
        if len == 0 {
            return Ok(());
        }
        let old_used = self.used;
        self.region.copy_within(end, at, old_used - end)?;
        self.region.zero(old_used - len, len);
        self.used -= len;
        self.invalidate(at, old_used);

        trace!(at, len, used = self.used, "range removed");
        Ok(())
    }

    /// Moves `len` bytes from `from` to `to` inside the used portion.
    ///
    /// Callers are responsible for invalidating anchors of whatever moved.
    pub fn move_bytes(&mut self, from: usize, to: usize, len: usize) -> Result<()> {
        self.checked_end(from, len)?;
        self.checked_end(to, len)?;
        self.region.copy_within(from, to, len)
    }

    /// Zeroes `len` used bytes at `offset`.
    pub fn zero(&mut self, offset: usize, len: usize) -> Result<()> {
        self.checked_end(offset, len)?;
        self.region.zero(offset, len);
        Ok(())
    }

    /// Replaces the used portion with `bytes`.
    ///
    /// Every anchor except the one at `keep` is dropped.
    pub fn replace_contents(&mut self, bytes: &[u8], keep: u32) -> Result<()> {
        let capacity = self.capacity().max(bytes.len());
        let region = BufferRegion::from_bytes(bytes, capacity)?;
        self.region = region;
        self.used = bytes.len();
        self.anchors.retain_only(keep);
        self.generation += 1;
        Ok(())
    }

    /// Returns the anchor for the item at `offset`.
    pub fn anchor(&self, offset: u32) -> Anchor {
        self.anchors.anchor(offset)
    }

    /// Fails with `StaleReference` if `anchor` has been invalidated.
    pub fn check_anchor(&self, anchor: Anchor) -> Result<()> {
        if self.anchors.is_live(anchor) {
            Ok(())
        } else {
            Err(ItembufError::StaleReference {
                offset: anchor.offset,
            })
        }
    }

    /// Drops the anchors of every item starting in `start..end` and bumps
    /// the generation.
    pub fn invalidate(&mut self, start: usize, end: usize) {
        let start = u32::try_from(start).unwrap_or(u32::MAX);
        let end = u32::try_from(end).unwrap_or(u32::MAX);
        let dropped = self.anchors.invalidate_range(start, end);
        self.generation += 1;
        if dropped > 0 {
            trace!(start, end, dropped, generation = self.generation, "anchors invalidated");
        }
    }

    /// Returns statistics about the buffer.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            used: self.used,
            capacity: self.capacity(),
            generation: self.generation,
            live_anchors: self.anchors.len(),
        }
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("endianness", &self.endianness())
            .field("used", &self.used)
            .field("capacity", &self.capacity())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Statistics about a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    /// Bytes holding valid items.
    pub used: usize,
    /// Total bytes allocated.
    pub capacity: usize,
    /// Structural edit counter.
    pub generation: u64,
    /// Anchors currently live.
    pub live_anchors: usize,
}
