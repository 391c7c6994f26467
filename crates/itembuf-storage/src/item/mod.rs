//! Item layout.
//!
//! This module provides the binary schema shared by every item:
//! - ItemHeader: Fixed 16-byte metadata prefix with per-field accessors
//! - ItemOptions: Per-item option word
//! - Name field encoding, hashing and matching

pub mod constants;
mod header;
mod name;

pub use header::{ItemHeader, ItemOptions};
pub(crate) use header::at_offset;
pub use name::{
    check_name, encode_name_field, name_field_len, name_hash, name_matches, read_name,
    read_name_raw,
};
