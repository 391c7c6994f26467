//! Item storage engine for itembuf.
//!
//! This crate provides:
//! - Item header and name field layout
//! - Value field layouts for every item type
//! - Owned values for building and reading subtrees
//! - Tree operations: lookup, insertion, removal, resizing, validation, compaction
//! - Portals: stable typed handles that survive buffer growth
//! - ItemStore for creating, importing and exporting buffers

mod field;
mod item;
mod portal;
mod store;
mod tree;
mod value;

pub use field::ArrayPrefix;
pub use item::constants::{HEADER_SIZE, MAX_NAME_LEN, NO_PARENT};
pub use item::{ItemHeader, ItemOptions, name_hash};
pub use itembuf_buffer::BufferStats;
pub use itembuf_common::{
    Codec, Endianness, ErrorKind, ItemType, ItembufError, Result, StoreConfig,
};
pub use portal::{PathSegment, Portal};
pub use store::{ItemStore, create_buffer, import_bytes};
pub use value::Value;
