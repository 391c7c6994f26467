//! Anchor table used to detect stale portals.
//!
//! A portal remembers the offset of its item together with a token handed
//! out by this table. Structural edits drop every anchor inside the byte
//! range they shift or remove, so a portal whose item moved or vanished
//! no longer finds its token and fails instead of reading whatever bytes
//! now occupy that offset.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Handle pairing an item offset with the token issued for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Anchor {
    /// Byte offset of the anchored item, relative to the buffer start.
    pub offset: u32,
    /// Token issued when the offset was first anchored.
    pub token: u64,
}

struct AnchorState {
    tokens: HashMap<u32, u64>,
    next_token: u64,
}

/// Offset to token mapping for every anchored item.
///
/// Interior mutability lets readers anchor new items while holding only
/// shared access to the buffer.
pub struct AnchorTable {
    state: Mutex<AnchorState>,
}

impl AnchorTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AnchorState {
                tokens: HashMap::new(),
                next_token: 1,
            }),
        }
    }

    /// Returns the anchor for `offset`, issuing a token if none exists.
    pub fn anchor(&self, offset: u32) -> Anchor {
        let mut state = self.state.lock();
        let next = state.next_token;
        let token = *state.tokens.entry(offset).or_insert(next);
        if token == next {
            state.next_token += 1;
        }
        Anchor { offset, token }
    }

    /// Returns true if `anchor` is still the live anchor for its offset.
    pub fn is_live(&self, anchor: Anchor) -> bool {
        self.state.lock().tokens.get(&anchor.offset) == Some(&anchor.token)
    }

    /// Drops every anchor with an offset in `start..end`.
    ///
    /// Returns the number of anchors dropped.
    pub fn invalidate_range(&self, start: u32, end: u32) -> usize {
        let mut state = self.state.lock();
        let before = state.tokens.len();
        state
            .tokens
            .retain(|&offset, _| offset < start || offset >= end);
        before - state.tokens.len()
    }

    /// Drops every anchor except the one at `keep`, if present.
    pub fn retain_only(&self, keep: u32) {
        self.state.lock().tokens.retain(|&offset, _| offset == keep);
    }

    /// Returns the number of live anchors.
    pub fn len(&self) -> usize {
        self.state.lock().tokens.len()
    }

    /// Returns true if no anchors are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AnchorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnchorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorTable")
            .field("live", &self.len())
            .finish()
    }
}
