//! Portals: re-resolvable typed handles to one item.
//!
//! A portal never holds an address. It keeps the shared buffer, the
//! anchor issued for its item's offset and the type tag seen when it was
//! created. Every access takes the buffer lock, checks the anchor and
//! re-derives the bytes from the offset, so a portal keeps working
//! across reallocations and fails with `StaleReference` once its item is
//! removed or shifted by a structural edit.

use std::sync::Arc;

use itembuf_buffer::{Anchor, BufferManager};
use itembuf_common::{Codec, ItemType, ItembufError, Result};
use parking_lot::RwLock;

use crate::field::used_len;
use crate::item::constants::NO_PARENT;
use crate::item::{ItemHeader, ItemOptions, read_name};
use crate::store::ItemStore;
use crate::tree::{self, Slot};
use crate::value::Value;

/// What a portal points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// A full item.
    Item,
    /// A raw element of the fixed-size array anchored by `array`.
    Element { array: Anchor },
}

/// One step of a path lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Dictionary child by name.
    Name(String),
    /// Child or element by position.
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(name: &str) -> Self {
        PathSegment::Name(name.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(name: String) -> Self {
        PathSegment::Name(name)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Name(name) => write!(f, "{:?}", name),
            PathSegment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

/// Typed handle to one item (or one raw array element) in a shared buffer.
///
/// Cloning a portal is cheap; clones share the buffer and the anchor.
#[derive(Clone)]
pub struct Portal {
    shared: Arc<RwLock<BufferManager>>,
    anchor: Anchor,
    item_type: ItemType,
    target: Target,
}

impl Portal {
    /// Creates a portal for `slot`, anchoring its offset.
    ///
    /// `container` is the anchor of the array that holds a raw element.
    pub(crate) fn from_slot(
        shared: &Arc<RwLock<BufferManager>>,
        mgr: &BufferManager,
        slot: Slot,
        container: Option<Anchor>,
    ) -> Result<Self> {
        let (offset, item_type, target) = match slot {
            Slot::Item(offset) => (
                offset,
                ItemHeader::read_item_type(mgr, offset)?,
                Target::Item,
            ),
            Slot::Element {
                offset,
                element_type,
            } => {
                let array = container.ok_or_else(|| {
                    ItembufError::malformed(offset, "array element without its array")
                })?;
                (offset, element_type, Target::Element { array })
            }
        };
        Ok(Self {
            shared: Arc::clone(shared),
            anchor: mgr.anchor(offset as u32),
            item_type,
            target,
        })
    }

    /// Checks the anchor (and the array's anchor for an element) and
    /// returns the current offset.
    fn resolve(&self, mgr: &BufferManager) -> Result<usize> {
        mgr.check_anchor(self.anchor)?;
        let offset = self.anchor.offset as usize;
        match self.target {
            Target::Item => {
                if ItemHeader::read_item_type(mgr, offset)? != self.item_type {
                    return Err(ItembufError::StaleReference {
                        offset: self.anchor.offset,
                    });
                }
            }
            Target::Element { array } => mgr.check_anchor(array)?,
        }
        Ok(offset)
    }

    /// Resolves a full item; raw elements have no header.
    fn resolve_item(&self, mgr: &BufferManager) -> Result<usize> {
        let offset = self.resolve(mgr)?;
        match self.target {
            Target::Item => Ok(offset),
            Target::Element { .. } => Err(ItembufError::type_mismatch(
                "item",
                format!("raw {} array element", self.item_type),
            )),
        }
    }

    fn portal_for(&self, mgr: &BufferManager, slot: Slot) -> Result<Portal> {
        Portal::from_slot(&self.shared, mgr, slot, Some(self.anchor))
    }

    /// Returns the store this portal's buffer belongs to.
    pub fn store(&self) -> ItemStore {
        ItemStore::from_shared(Arc::clone(&self.shared))
    }

    /// Type of the item, as seen when the portal was created.
    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// Byte offset of the item inside the buffer.
    pub fn offset(&self) -> u32 {
        self.anchor.offset
    }

    /// Returns true if the portal still resolves.
    pub fn is_valid(&self) -> bool {
        self.resolve(&self.shared.read()).is_ok()
    }

    /// Returns true if this portal still resolves to the root item.
    pub fn is_root(&self) -> bool {
        self.target == Target::Item && self.anchor.offset == 0 && self.is_valid()
    }

    /// Returns true if this portal addresses a raw array element.
    pub fn is_element(&self) -> bool {
        matches!(self.target, Target::Element { .. })
    }

    /// Name of the item, None if unnamed.
    pub fn name(&self) -> Result<Option<String>> {
        let mgr = self.shared.read();
        let offset = match self.target {
            Target::Item => self.resolve(&mgr)?,
            Target::Element { .. } => {
                self.resolve(&mgr)?;
                return Ok(None);
            }
        };
        let name_len = ItemHeader::read_name_field_len(&mgr, offset)?;
        read_name(&mgr, offset, name_len)
    }

    /// Number of children or elements, 0 for scalars.
    pub fn count(&self) -> Result<usize> {
        let mgr = self.shared.read();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => Ok(ItemHeader::read_count(&mgr, offset)? as usize),
            Target::Element { .. } => Ok(0),
        }
    }

    /// Total length of the item, header and slack included.
    pub fn len(&self) -> Result<usize> {
        let mgr = self.shared.read();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => Ok(ItemHeader::read_item_len(&mgr, offset)? as usize),
            Target::Element { .. } => Ok(self.item_type.fixed_size().unwrap_or(0)),
        }
    }

    /// Bytes allotted to the value field.
    pub fn reserved_bytes(&self) -> Result<usize> {
        let mgr = self.shared.read();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => Ok(ItemHeader::read(&mgr, offset)?.reserved_len()),
            Target::Element { .. } => Ok(self.item_type.fixed_size().unwrap_or(0)),
        }
    }

    /// Bytes of the value field in use.
    pub fn used_bytes(&self) -> Result<usize> {
        let mgr = self.shared.read();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => used_len(&mgr, offset, &ItemHeader::read(&mgr, offset)?),
            Target::Element { .. } => Ok(self.item_type.fixed_size().unwrap_or(0)),
        }
    }

    /// Option word of the item.
    pub fn options(&self) -> Result<ItemOptions> {
        let mgr = self.shared.read();
        let offset = self.resolve_item(&mgr)?;
        ItemHeader::read_options(&mgr, offset)
    }

    /// Overwrites the option word of the item.
    pub fn set_options(&self, options: ItemOptions) -> Result<()> {
        let mut mgr = self.shared.write();
        let offset = self.resolve_item(&mgr)?;
        ItemHeader::write_options(&mut mgr, offset, options)
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Reads the item (and its subtree) into an owned value.
    pub fn read_value(&self) -> Result<Value> {
        let mgr = self.shared.read();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => tree::read_value(&mgr, offset),
            Target::Element { .. } => {
                let width = self.item_type.fixed_size().unwrap_or(0);
                Value::decode_scalar(self.item_type, mgr.slice(offset, width)?, mgr.endianness())
            }
        }
    }

    /// Overwrites the value, which must have the item's type.
    ///
    /// Longer values grow the item; shorter ones leave slack. Children of
    /// a rewritten composite are dropped and their portals become stale.
    pub fn write_value(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut mgr = self.shared.write();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => tree::rewrite_value(&mut mgr, offset, &value),
            Target::Element { .. } => {
                tree::write_element(&mut mgr, offset, self.item_type, &value)
            }
        }
    }

    /// Decodes a primitive in place.
    pub fn get<T: Codec>(&self) -> Result<T> {
        let mgr = self.shared.read();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => tree::read_typed(&mgr, offset),
            Target::Element { .. } => tree::read_element(&mgr, offset, self.item_type),
        }
    }

    /// Encodes a primitive in place, resizing strings and binaries.
    pub fn set<T: Codec>(&self, value: T) -> Result<()> {
        let mut mgr = self.shared.write();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => tree::write_typed(&mut mgr, offset, &value),
            Target::Element { .. } => {
                if T::ITEM_TYPE != self.item_type {
                    return Err(ItembufError::type_mismatch(self.item_type, T::ITEM_TYPE));
                }
                mgr.write(offset, &value)
            }
        }
    }

    /// Replaces the item with one holding `value` of any type, keeping its
    /// name and position. Returns a portal to the new item; this portal
    /// and any portal into the old subtree become stale.
    pub fn replace(&self, value: impl Into<Value>) -> Result<Portal> {
        let value = value.into();
        let mut mgr = self.shared.write();
        let offset = self.resolve_item(&mgr)?;
        tree::replace_item(&mut mgr, offset, &value)?;
        Portal::from_slot(&self.shared, &mgr, Slot::Item(offset), None)
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Dictionary child named `name`.
    pub fn child(&self, name: &str) -> Result<Portal> {
        let mgr = self.shared.read();
        let offset = self.resolve_item(&mgr)?;
        let child = tree::find_by_name(&mgr, offset, name)?
            .ok_or_else(|| ItembufError::NotFound(format!("name {:?}", name)))?;
        self.portal_for(&mgr, Slot::Item(child))
    }

    /// Child or element at `index`.
    pub fn child_at(&self, index: usize) -> Result<Portal> {
        let mgr = self.shared.read();
        let offset = self.resolve_item(&mgr)?;
        let slot = tree::child_at(&mgr, offset, index)?;
        self.portal_for(&mgr, slot)
    }

    /// Every child or element, in stored order.
    pub fn children(&self) -> Result<Vec<Portal>> {
        let mgr = self.shared.read();
        let offset = self.resolve_item(&mgr)?;
        tree::slots(&mgr, offset)?
            .into_iter()
            .map(|slot| self.portal_for(&mgr, slot))
            .collect()
    }

    /// The item containing this one. Fails with `NotFound` on the root.
    pub fn parent(&self) -> Result<Portal> {
        let mgr = self.shared.read();
        let offset = self.resolve(&mgr)?;
        let parent = match self.target {
            Target::Item => ItemHeader::read_parent(&mgr, offset)?,
            Target::Element { array } => array.offset,
        };
        if parent == NO_PARENT {
            return Err(ItembufError::NotFound(
                "parent of the root item".to_string(),
            ));
        }
        Portal::from_slot(&self.shared, &mgr, Slot::Item(parent as usize), None)
    }

    /// Follows `path` from this item, one segment at a time.
    pub fn lookup(&self, path: &[PathSegment]) -> Result<Portal> {
        let mut current = self.clone();
        for segment in path {
            current = match segment {
                PathSegment::Name(name) => current.child(name),
                PathSegment::Index(index) => current.child_at(*index),
            }
            .map_err(|e| match e {
                ItembufError::NotFound(what) => {
                    ItembufError::NotFound(format!("{} at path segment {}", what, segment))
                }
                other => other,
            })?;
        }
        Ok(current)
    }

    // =========================================================================
    // Structural edits
    // =========================================================================

    /// Appends `value` to an array or sequence.
    pub fn append(&self, value: impl Into<Value>) -> Result<Portal> {
        let value = value.into();
        let mut mgr = self.shared.write();
        let offset = self.resolve_item(&mgr)?;
        let count = ItemHeader::read_count(&mgr, offset)? as usize;
        let slot = tree::insert_child(&mut mgr, offset, count, None, &value)?;
        self.portal_for(&mgr, slot)
    }

    /// Inserts `value` at `index` of an array or sequence.
    pub fn insert_at(&self, index: usize, value: impl Into<Value>) -> Result<Portal> {
        let value = value.into();
        let mut mgr = self.shared.write();
        let offset = self.resolve_item(&mgr)?;
        let slot = tree::insert_child(&mut mgr, offset, index, None, &value)?;
        self.portal_for(&mgr, slot)
    }

    /// Adds a dictionary child named `name`. Fails with `DuplicateName` if
    /// the name is taken.
    pub fn insert(&self, name: &str, value: impl Into<Value>) -> Result<Portal> {
        let value = value.into();
        let mut mgr = self.shared.write();
        let offset = self.resolve_item(&mgr)?;
        let count = ItemHeader::read_count(&mgr, offset)? as usize;
        let slot = tree::insert_child(&mut mgr, offset, count, Some(name), &value)?;
        self.portal_for(&mgr, slot)
    }

    /// Removes the child or element at `index`.
    pub fn remove_at(&self, index: usize) -> Result<()> {
        let mut mgr = self.shared.write();
        let offset = self.resolve_item(&mgr)?;
        tree::remove_child(&mut mgr, offset, index)
    }

    /// Removes the dictionary child named `name`.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut mgr = self.shared.write();
        let offset = self.resolve_item(&mgr)?;
        tree::remove_named(&mut mgr, offset, name)
    }

    /// Removes this item from its parent.
    pub fn remove_self(self) -> Result<()> {
        let mut mgr = self.shared.write();
        let offset = self.resolve(&mgr)?;
        match self.target {
            Target::Item => tree::remove_item(&mut mgr, offset),
            Target::Element { array } => {
                tree::remove_element(&mut mgr, array.offset as usize, offset, self.item_type)
            }
        }
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("offset", &self.anchor.offset)
            .field("item_type", &self.item_type)
            .field("element", &self.is_element())
            .finish()
    }
}
