//! Buffer management for itembuf.
//!
//! This crate provides the single growable region behind an item tree:
//! - Zeroed, contiguous backing memory with copy-then-swap growth
//! - Offset-only access with bounds checks on every read and write
//! - An anchor table that lets portals detect when their item moved
//! - A generation counter bumped by every structural edit

mod anchor;
mod manager;
mod region;

pub use anchor::{Anchor, AnchorTable};
pub use manager::{BufferManager, BufferStats};
pub use region::BufferRegion;
