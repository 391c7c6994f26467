//! itembuf common types, errors, codecs and configuration.
//!
//! This crate provides shared definitions used across all itembuf components.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use codec::{Codec, Endianness};
pub use config::{MAX_BUFFER_SIZE, StoreConfig};
pub use error::{ErrorKind, ItembufError, Result};
pub use types::ItemType;
