//! Contiguous backing memory for one item tree.

use itembuf_common::{ItembufError, Result};

/// A single contiguous, zero-initialized byte region.
///
/// The region never hands out addresses; callers work with offsets and
/// slices, so replacing the allocation on growth cannot leave anything
/// dangling.
pub struct BufferRegion {
    /// Region bytes. Length is the capacity.
    data: Box<[u8]>,
}

impl BufferRegion {
    /// Allocates a zeroed region of `capacity` bytes.
    pub fn allocate(capacity: usize) -> Result<Self> {
        Ok(Self {
            data: zeroed(capacity, 0)?,
        })
    }

    /// Creates a region holding a copy of `bytes`, sized to at least `capacity`.
    pub fn from_bytes(bytes: &[u8], capacity: usize) -> Result<Self> {
        let mut data = zeroed(capacity.max(bytes.len()), 0)?;
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { data })
    }

    /// Returns the capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the whole region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the whole region mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replaces the allocation with a larger one, keeping the first
    /// `preserve` bytes.
    ///
    /// The new region is fully populated before the old one is released,
    /// so an allocation failure leaves this region untouched.
    pub fn grow(&mut self, new_capacity: usize, preserve: usize) -> Result<()> {
        debug_assert!(preserve <= self.data.len());
        if new_capacity <= self.data.len() {
            return Ok(());
        }
        let mut data = zeroed(new_capacity, self.data.len())?;
        data[..preserve].copy_from_slice(&self.data[..preserve]);
        self.data = data;
        Ok(())
    }

    /// Copies `len` bytes from `from` to `to`; the ranges may overlap.
    pub fn copy_within(&mut self, from: usize, to: usize, len: usize) -> Result<()> {
        let capacity = self.data.len();
        if from.checked_add(len).is_none_or(|end| end > capacity)
            || to.checked_add(len).is_none_or(|end| end > capacity)
        {
            return Err(ItembufError::CapacityExceeded {
                requested: from.max(to).saturating_add(len),
                limit: capacity,
            });
        }
        self.data.copy_within(from..from + len, to);
        Ok(())
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn zero(&mut self, offset: usize, len: usize) {
        self.data[offset..offset + len].fill(0);
    }
}

impl std::fmt::Debug for BufferRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegion")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Allocates `capacity` zero bytes, reporting allocation failure as an error.
fn zeroed(capacity: usize, current: usize) -> Result<Box<[u8]>> {
    let mut data = Vec::new();
    data.try_reserve_exact(capacity)
        .map_err(|_| ItembufError::CapacityExceeded {
            requested: capacity,
            limit: current,
        })?;
    data.resize(capacity, 0);
    Ok(data.into_boxed_slice())
}
