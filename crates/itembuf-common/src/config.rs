//! Configuration structures for itembuf.

use serde::{Deserialize, Serialize};

use crate::codec::Endianness;
use crate::error::{ItembufError, Result};

/// Largest buffer a store can address; offsets are stored as u32.
pub const MAX_BUFFER_SIZE: usize = u32::MAX as usize;

/// Configuration for one item store (one buffer, one tree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bytes allocated up front for the buffer.
    pub initial_capacity: usize,
    /// Byte order of every multi-byte value in the buffer.
    pub endianness: Endianness,
    /// Multiplier applied to the capacity when the buffer must grow.
    pub growth_factor: usize,
    /// Upper bound on the buffer capacity in bytes.
    pub max_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 4096,
            endianness: Endianness::Little,
            growth_factor: 2,
            max_capacity: MAX_BUFFER_SIZE,
        }
    }
}

impl StoreConfig {
    /// Returns a copy of this config with the given byte order.
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Returns a copy of this config with the given initial capacity.
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Returns a copy of this config with the given capacity limit.
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.growth_factor < 2 {
            return Err(ItembufError::Config(format!(
                "growth_factor must be at least 2, got {}",
                self.growth_factor
            )));
        }
        if self.max_capacity > MAX_BUFFER_SIZE {
            return Err(ItembufError::Config(format!(
                "max_capacity {} exceeds addressable limit {}",
                self.max_capacity, MAX_BUFFER_SIZE
            )));
        }
        if self.initial_capacity > self.max_capacity {
            return Err(ItembufError::Config(format!(
                "initial_capacity {} exceeds max_capacity {}",
                self.initial_capacity, self.max_capacity
            )));
        }
        Ok(())
    }
}
