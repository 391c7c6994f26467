//! Item store: one buffer, one tree.

use std::sync::Arc;

use bytes::Bytes;
use itembuf_buffer::{BufferManager, BufferStats};
use itembuf_common::{Endianness, Result, StoreConfig};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::portal::Portal;
use crate::tree::{self, Slot};
use crate::value::Value;

/// Owner of one shared buffer holding a single item tree.
///
/// The store and every portal into it share the buffer behind one
/// read-write lock: many readers or a single writer at a time. Cloning
/// the store clones the handle, not the bytes.
#[derive(Clone)]
pub struct ItemStore {
    shared: Arc<RwLock<BufferManager>>,
}

impl ItemStore {
    /// Creates a store whose root item holds `value`.
    pub fn create(config: StoreConfig, value: &Value) -> Result<Self> {
        let mut mgr = BufferManager::new(config)?;
        tree::write_root(&mut mgr, value)?;
        Ok(Self::from_shared(Arc::new(RwLock::new(mgr))))
    }

    /// Creates a store with a minimal root (a NULL item).
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::create(config, &Value::Null)
    }

    /// Copies `bytes` into a new store after validating every item.
    ///
    /// Nothing is exposed unless the whole tree is well formed.
    pub fn import_bytes(bytes: &[u8], config: StoreConfig) -> Result<Self> {
        let endianness = config.endianness;
        let mgr = BufferManager::from_bytes(bytes, config)?;
        if let Err(e) = tree::validate_tree(&mgr) {
            warn!(len = bytes.len(), %endianness, error = %e, "import rejected");
            return Err(e);
        }
        debug!(len = bytes.len(), %endianness, "buffer imported");
        Ok(Self::from_shared(Arc::new(RwLock::new(mgr))))
    }

    pub(crate) fn from_shared(shared: Arc<RwLock<BufferManager>>) -> Self {
        Self { shared }
    }

    /// Portal to the root item.
    pub fn root(&self) -> Result<Portal> {
        let mgr = self.shared.read();
        Portal::from_slot(&self.shared, &mgr, Slot::Item(0), None)
    }

    /// Copy of the used bytes, ready to store or send.
    pub fn export_bytes(&self) -> Bytes {
        self.shared.read().export()
    }

    /// Reads the whole tree into an owned value.
    pub fn to_value(&self) -> Result<Value> {
        tree::read_value(&self.shared.read(), 0)
    }

    /// Drops the slack of every item. Returns the bytes reclaimed.
    ///
    /// The root portal stays valid; every other portal becomes stale.
    pub fn compact(&self) -> Result<usize> {
        tree::compact(&mut self.shared.write())
    }

    /// Byte order of the buffer.
    pub fn endianness(&self) -> Endianness {
        self.shared.read().endianness()
    }

    /// Structural edit counter.
    pub fn generation(&self) -> u64 {
        self.shared.read().generation()
    }

    /// Returns statistics about the buffer.
    pub fn stats(&self) -> BufferStats {
        self.shared.read().stats()
    }
}

impl std::fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStore")
            .field("buffer", &*self.shared.read())
            .finish()
    }
}

/// Creates a buffer holding a minimal root item and returns its portal.
pub fn create_buffer(initial_capacity: usize, endianness: Endianness) -> Result<Portal> {
    let config = StoreConfig::default()
        .with_initial_capacity(initial_capacity)
        .with_endianness(endianness);
    ItemStore::new(config)?.root()
}

/// Validates `bytes` as a tree in the given byte order and returns a
/// portal to its root.
pub fn import_bytes(bytes: &[u8], endianness: Endianness) -> Result<Portal> {
    let config = StoreConfig::default().with_endianness(endianness);
    ItemStore::import_bytes(bytes, config)?.root()
}
