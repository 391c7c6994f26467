//! Item tree operations.
//!
//! Everything here works on raw offsets inside one [`BufferManager`].
//! Child positions are never cached: they are recomputed by a linear scan
//! of the parent's value field. After any edit that shifts bytes, every
//! parent offset in the tree is rewritten from the root down so that the
//! stored parent links always point at the item that contains them.

use std::collections::HashSet;

use itembuf_buffer::BufferManager;
use itembuf_common::{Codec, ItemType, ItembufError, Result};
use tracing::{debug, trace};

use crate::field::{
    ArrayPrefix, child_items, children_start, item_end, read_bytes_payload, used_end, used_len,
    value_start,
};
use crate::item::constants::{BYTES_PREFIX_SIZE, HEADER_SIZE, MAX_IMPORT_DEPTH, NO_PARENT};
use crate::item::{
    ItemHeader, check_name, name_hash, name_matches, read_name, read_name_raw,
};
use crate::value::Value;

/// Location of one addressable value: a full item, or a raw element of
/// a fixed-size array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// A full item starting at the offset.
    Item(usize),
    /// A raw array element at the offset.
    Element { offset: usize, element_type: ItemType },
}

impl Slot {
    /// Offset of the item or element.
    pub fn offset(&self) -> usize {
        match *self {
            Slot::Item(offset) | Slot::Element { offset, .. } => offset,
        }
    }
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| ItembufError::CapacityExceeded {
        requested: n,
        limit: u32::MAX as usize,
    })
}

fn require_composite(header: &ItemHeader) -> Result<()> {
    if header.item_type.is_composite() {
        Ok(())
    } else {
        Err(ItembufError::type_mismatch(
            "ARRAY, DICTIONARY or SEQUENCE",
            header.item_type,
        ))
    }
}

// =============================================================================
// Creation and reads
// =============================================================================

/// Writes `value` as the root item of an empty buffer.
pub fn write_root(mgr: &mut BufferManager, value: &Value) -> Result<()> {
    if mgr.used() != 0 {
        return Err(ItembufError::malformed(0, "buffer already holds a root item"));
    }
    value.validate()?;
    let mut out = Vec::with_capacity(value.item_len(None));
    value.encode_item(None, NO_PARENT, 0, mgr.endianness(), &mut out)?;
    let offset = mgr.append(out.len())?;
    mgr.slice_mut(offset, out.len())?.copy_from_slice(&out);
    trace!(len = out.len(), item_type = %value.item_type(), "root written");
    Ok(())
}

/// Reads the whole subtree rooted at the item at `offset`.
pub fn read_value(mgr: &BufferManager, offset: usize) -> Result<Value> {
    let header = ItemHeader::read(mgr, offset)?;
    let start = value_start(offset, &header);
    match header.item_type {
        ItemType::String => {
            let payload = read_bytes_payload(mgr, offset, &header)?;
            let s = std::str::from_utf8(payload).map_err(|_| ItembufError::InvalidUtf8 {
                offset: offset as u32,
            })?;
            Ok(Value::String(s.to_string()))
        }
        ItemType::Binary => Ok(Value::Binary(
            read_bytes_payload(mgr, offset, &header)?.to_vec(),
        )),
        ItemType::Array => {
            let prefix = ArrayPrefix::read(mgr, start)?;
            let mut elements = Vec::with_capacity(header.count as usize);
            if prefix.is_fixed() {
                let size = prefix.element_size as usize;
                let first = children_start(offset, &header);
                for i in 0..header.count as usize {
                    let raw = mgr.slice(first + i * size, size)?;
                    elements.push(Value::decode_scalar(
                        prefix.element_type,
                        raw,
                        mgr.endianness(),
                    )?);
                }
            } else {
                for child in child_items(mgr, offset, &header)? {
                    elements.push(read_value(mgr, child)?);
                }
            }
            Ok(Value::Array {
                element_type: prefix.element_type,
                elements,
            })
        }
        ItemType::Dictionary => {
            let mut entries = Vec::with_capacity(header.count as usize);
            for child in child_items(mgr, offset, &header)? {
                let name_len = ItemHeader::read_name_field_len(mgr, child)?;
                let name = read_name(mgr, child, name_len)?
                    .ok_or_else(|| ItembufError::malformed(child, "unnamed dictionary child"))?;
                entries.push((name, read_value(mgr, child)?));
            }
            Ok(Value::Dictionary(entries))
        }
        ItemType::Sequence => {
            let mut elements = Vec::with_capacity(header.count as usize);
            for child in child_items(mgr, offset, &header)? {
                elements.push(read_value(mgr, child)?);
            }
            Ok(Value::Sequence(elements))
        }
        fixed => {
            let width = fixed.fixed_size().unwrap_or(0);
            Value::decode_scalar(fixed, mgr.slice(start, width)?, mgr.endianness())
        }
    }
}

/// Decodes a primitive directly from the item at `offset`.
pub fn read_typed<T: Codec>(mgr: &BufferManager, offset: usize) -> Result<T> {
    let header = ItemHeader::read(mgr, offset)?;
    if header.item_type != T::ITEM_TYPE {
        return Err(ItembufError::type_mismatch(T::ITEM_TYPE, header.item_type));
    }
    let raw = if header.item_type.is_length_prefixed() {
        read_bytes_payload(mgr, offset, &header)?
    } else {
        let width = header.item_type.fixed_size().unwrap_or(0);
        mgr.slice(value_start(offset, &header), width)?
    };
    T::decode(raw, mgr.endianness()).map_err(|e| match e {
        ItembufError::InvalidUtf8 { .. } => ItembufError::InvalidUtf8 {
            offset: offset as u32,
        },
        other => other,
    })
}

/// Decodes a raw array element.
pub fn read_element<T: Codec>(
    mgr: &BufferManager,
    offset: usize,
    element_type: ItemType,
) -> Result<T> {
    if element_type != T::ITEM_TYPE {
        return Err(ItembufError::type_mismatch(T::ITEM_TYPE, element_type));
    }
    let width = element_type.fixed_size().unwrap_or(0);
    T::decode(mgr.slice(offset, width)?, mgr.endianness())
}

/// Finds the dictionary child named `name`.
///
/// Children whose stored hash differs are skipped without touching their
/// name bytes; a hash hit is confirmed by comparing the bytes.
pub fn find_by_name(mgr: &BufferManager, offset: usize, name: &str) -> Result<Option<usize>> {
    let header = ItemHeader::read(mgr, offset)?;
    if header.item_type != ItemType::Dictionary {
        return Err(ItembufError::type_mismatch(
            ItemType::Dictionary,
            header.item_type,
        ));
    }
    let hash = name_hash(name.as_bytes());
    for child in child_items(mgr, offset, &header)? {
        let name_len = ItemHeader::read_name_field_len(mgr, child)?;
        if name_matches(mgr, child, name_len, name.as_bytes(), hash)? {
            return Ok(Some(child));
        }
    }
    Ok(None)
}

/// Locates the child or element at `index` of a composite.
pub fn child_at(mgr: &BufferManager, offset: usize, index: usize) -> Result<Slot> {
    let header = ItemHeader::read(mgr, offset)?;
    require_composite(&header)?;
    let count = header.count as usize;
    if index >= count {
        return Err(ItembufError::OutOfRange { index, count });
    }
    if header.item_type == ItemType::Array {
        let prefix = ArrayPrefix::read(mgr, value_start(offset, &header))?;
        if prefix.is_fixed() {
            return Ok(Slot::Element {
                offset: children_start(offset, &header) + index * prefix.element_size as usize,
                element_type: prefix.element_type,
            });
        }
    }
    let children = child_items(mgr, offset, &header)?;
    children
        .get(index)
        .map(|&child| Slot::Item(child))
        .ok_or(ItembufError::OutOfRange { index, count })
}

/// Every child or element of a composite, in stored order.
pub fn slots(mgr: &BufferManager, offset: usize) -> Result<Vec<Slot>> {
    let header = ItemHeader::read(mgr, offset)?;
    require_composite(&header)?;
    if header.item_type == ItemType::Array {
        let prefix = ArrayPrefix::read(mgr, value_start(offset, &header))?;
        if prefix.is_fixed() {
            let first = children_start(offset, &header);
            let size = prefix.element_size as usize;
            return Ok((0..header.count as usize)
                .map(|i| Slot::Element {
                    offset: first + i * size,
                    element_type: prefix.element_type,
                })
                .collect());
        }
    }
    Ok(child_items(mgr, offset, &header)?
        .into_iter()
        .map(Slot::Item)
        .collect())
}

// =============================================================================
// Structural edits
// =============================================================================

/// Grows the item at `offset` by `delta` bytes of slack at the end of its
/// value field.
///
/// The nearest ancestor with at least `delta` bytes of slack absorbs the
/// growth: the bytes between the item's end and that ancestor's used end
/// shift up into its slack, and only the levels below it get longer. With
/// no such ancestor a gap opens at the item's end and every ancestor grows.
/// Parent links are rewritten either way. On failure the buffer is left
/// unchanged.
pub fn grow_item(mgr: &mut BufferManager, offset: usize, delta: usize) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let header = ItemHeader::read(mgr, offset)?;
    let new_len = to_u32(header.item_len as usize + delta)?;
    let end = item_end(offset, &header);

    // Items whose length grows, innermost first.
    let mut lengthened = vec![(offset, new_len)];
    let mut absorbed_by = None;
    let mut ancestor = header.parent;
    while ancestor != NO_PARENT {
        let at = ancestor as usize;
        let ancestor_header = ItemHeader::read(mgr, at)?;
        let ancestor_used_end = used_end(mgr, at, &ancestor_header)?;
        if item_end(at, &ancestor_header) - ancestor_used_end >= delta {
            absorbed_by = Some(ancestor_used_end);
            break;
        }
        lengthened.push((at, to_u32(ancestor_header.item_len as usize + delta)?));
        ancestor = ancestor_header.parent;
    }

    match absorbed_by {
        Some(slack_start) => {
            mgr.move_bytes(end, end + delta, slack_start - end)?;
            mgr.zero(end, delta)?;
            mgr.invalidate(end, slack_start + delta);
        }
        None => mgr.insert_gap(end, delta)?,
    }
    for (at, len) in lengthened {
        ItemHeader::write_item_len(mgr, at, len)?;
    }
    relink(mgr)?;

    trace!(
        offset,
        delta,
        item_len = new_len,
        in_place = absorbed_by.is_some(),
        "item grown"
    );
    Ok(())
}

/// Makes sure the item at `offset` reserves at least `needed` value bytes,
/// growing it by exactly the shortfall. Returns the current header.
pub fn ensure_reserved(mgr: &mut BufferManager, offset: usize, needed: usize) -> Result<ItemHeader> {
    let header = ItemHeader::read(mgr, offset)?;
    let reserved = header.reserved_len();
    if reserved >= needed {
        return Ok(header);
    }
    grow_item(mgr, offset, needed - reserved)?;
    ItemHeader::read(mgr, offset)
}

/// Places `bytes` at `pos` inside the used part of the composite at
/// `parent`, shifting later children and growing the parent if its slack
/// is too small.
fn splice_in(mgr: &mut BufferManager, parent: usize, pos: usize, bytes: &[u8]) -> Result<()> {
    let header = ItemHeader::read(mgr, parent)?;
    let end = used_end(mgr, parent, &header)?;
    let slack = item_end(parent, &header) - end;
    if bytes.len() > slack {
        grow_item(mgr, parent, bytes.len() - slack)?;
    }
    let header = ItemHeader::read(mgr, parent)?;
    let count = header.count.checked_add(1).ok_or(ItembufError::CapacityExceeded {
        requested: header.count as usize + 1,
        limit: u32::MAX as usize,
    })?;

    mgr.move_bytes(pos, pos + bytes.len(), end - pos)?;
    mgr.slice_mut(pos, bytes.len())?.copy_from_slice(bytes);
    mgr.invalidate(pos, item_end(parent, &header));
    ItemHeader::write_count(mgr, parent, count)?;
    relink(mgr)
}

/// Removes `len` bytes at `pos` from the used part of the composite at
/// `parent`. The freed bytes become slack at the end of the parent.
fn splice_out(mgr: &mut BufferManager, parent: usize, pos: usize, len: usize) -> Result<()> {
    let header = ItemHeader::read(mgr, parent)?;
    let end = used_end(mgr, parent, &header)?;
    if pos < children_start(parent, &header) || pos + len > end {
        return Err(ItembufError::malformed(
            pos,
            format!("range of {} bytes is not inside parent at {}", len, parent),
        ));
    }

    mgr.move_bytes(pos + len, pos, end - pos - len)?;
    mgr.zero(end - len, len)?;
    mgr.invalidate(pos, end);
    ItemHeader::write_count(mgr, parent, header.count.saturating_sub(1))?;
    relink(mgr)
}

/// Inserts `value` as the child at `index` of the composite at `parent`.
///
/// Dictionary children need a unique name; array and sequence children
/// are unnamed. Array values must match the element type.
pub fn insert_child(
    mgr: &mut BufferManager,
    parent: usize,
    index: usize,
    name: Option<&str>,
    value: &Value,
) -> Result<Slot> {
    let header = ItemHeader::read(mgr, parent)?;
    require_composite(&header)?;
    let count = header.count as usize;
    if index > count {
        return Err(ItembufError::OutOfRange { index, count });
    }
    value.validate()?;

    match (header.item_type, name) {
        (ItemType::Dictionary, Some(name)) => {
            check_name(name)?;
            if find_by_name(mgr, parent, name)?.is_some() {
                return Err(ItembufError::DuplicateName(name.to_string()));
            }
        }
        (ItemType::Dictionary, None) => {
            return Err(ItembufError::InvalidName(
                "dictionary children must be named".to_string(),
            ));
        }
        (_, Some(name)) => {
            return Err(ItembufError::InvalidName(format!(
                "{} children are unnamed, got {:?}",
                header.item_type, name
            )));
        }
        (_, None) => {}
    }

    let mut fixed = None;
    if header.item_type == ItemType::Array {
        let prefix = ArrayPrefix::read(mgr, value_start(parent, &header))?;
        if value.item_type() != prefix.element_type {
            return Err(ItembufError::type_mismatch(
                prefix.element_type,
                value.item_type(),
            ));
        }
        if prefix.is_fixed() {
            fixed = Some(prefix);
        }
    }

    let endianness = mgr.endianness();
    let slot = match fixed {
        Some(prefix) => {
            let size = prefix.element_size as usize;
            let pos = children_start(parent, &header) + index * size;
            let mut raw = vec![0u8; size];
            value.encode_scalar(&mut raw, endianness)?;
            splice_in(mgr, parent, pos, &raw)?;
            Slot::Element {
                offset: pos,
                element_type: prefix.element_type,
            }
        }
        None => {
            let children = child_items(mgr, parent, &header)?;
            let pos = match children.get(index) {
                Some(&child) => child,
                None => used_end(mgr, parent, &header)?,
            };
            let mut out = Vec::with_capacity(value.item_len(name));
            value.encode_item(name, to_u32(parent)?, pos, endianness, &mut out)?;
            splice_in(mgr, parent, pos, &out)?;
            Slot::Item(pos)
        }
    };

    trace!(
        parent,
        index,
        offset = slot.offset(),
        item_type = %value.item_type(),
        "child inserted"
    );
    Ok(slot)
}

/// Removes the child or element at `index` of the composite at `parent`.
pub fn remove_child(mgr: &mut BufferManager, parent: usize, index: usize) -> Result<()> {
    match child_at(mgr, parent, index)? {
        Slot::Element { offset, element_type } => {
            let size = element_type.fixed_size().unwrap_or(0);
            splice_out(mgr, parent, offset, size)?;
        }
        Slot::Item(offset) => {
            let len = ItemHeader::read_item_len(mgr, offset)? as usize;
            splice_out(mgr, parent, offset, len)?;
        }
    }
    trace!(parent, index, "child removed");
    Ok(())
}

/// Removes the dictionary child named `name`.
pub fn remove_named(mgr: &mut BufferManager, parent: usize, name: &str) -> Result<()> {
    let child = find_by_name(mgr, parent, name)?
        .ok_or_else(|| ItembufError::NotFound(format!("name {:?}", name)))?;
    let len = ItemHeader::read_item_len(mgr, child)? as usize;
    splice_out(mgr, parent, child, len)?;
    trace!(parent, offset = child, name, "child removed");
    Ok(())
}

/// Removes the item at `offset` from its parent.
pub fn remove_item(mgr: &mut BufferManager, offset: usize) -> Result<()> {
    let header = ItemHeader::read(mgr, offset)?;
    if header.parent == NO_PARENT {
        return Err(ItembufError::NotFound(
            "parent of the root item".to_string(),
        ));
    }
    splice_out(mgr, header.parent as usize, offset, header.item_len as usize)?;
    trace!(offset, parent = header.parent, "item removed");
    Ok(())
}

/// Removes the raw element at `offset` from the array at `array`.
pub fn remove_element(
    mgr: &mut BufferManager,
    array: usize,
    offset: usize,
    element_type: ItemType,
) -> Result<()> {
    let size = element_type.fixed_size().unwrap_or(0);
    splice_out(mgr, array, offset, size)?;
    trace!(array, offset, "element removed");
    Ok(())
}

/// Rewrites the value field of the item at `offset` with a value of the
/// same type, growing the item only when the new value does not fit.
///
/// Any children of the old value are dropped.
pub fn rewrite_value(mgr: &mut BufferManager, offset: usize, value: &Value) -> Result<()> {
    let current = ItemHeader::read_item_type(mgr, offset)?;
    if value.item_type() != current {
        return Err(ItembufError::type_mismatch(current, value.item_type()));
    }
    value.validate()?;

    let header = ensure_reserved(mgr, offset, value.value_len())?;
    let start = value_start(offset, &header);
    let mut out = Vec::with_capacity(value.value_len());
    let count = value.encode_value_field(to_u32(offset)?, start, mgr.endianness(), &mut out)?;

    let reserved = header.reserved_len();
    mgr.slice_mut(start, out.len())?.copy_from_slice(&out);
    mgr.zero(start + out.len(), reserved - out.len())?;
    ItemHeader::write_count(mgr, offset, count)?;
    if current.is_composite() {
        mgr.invalidate(start, item_end(offset, &header));
    }

    trace!(offset, used = out.len(), reserved, "value rewritten");
    Ok(())
}

/// Writes a primitive into the item at `offset`, resizing string and
/// binary payloads as needed.
pub fn write_typed<T: Codec>(mgr: &mut BufferManager, offset: usize, value: &T) -> Result<()> {
    let current = ItemHeader::read_item_type(mgr, offset)?;
    if current != T::ITEM_TYPE {
        return Err(ItembufError::type_mismatch(current, T::ITEM_TYPE));
    }
    if !current.is_length_prefixed() {
        let header = ItemHeader::read(mgr, offset)?;
        return mgr.write(value_start(offset, &header), value);
    }

    let len = value.byte_count();
    let len_u32 = to_u32(len)?;
    let header = ensure_reserved(mgr, offset, BYTES_PREFIX_SIZE + len)?;
    let start = value_start(offset, &header);
    let endianness = mgr.endianness();
    mgr.write(start, &len_u32)?;
    value.encode(mgr.slice_mut(start + BYTES_PREFIX_SIZE, len)?, endianness);
    mgr.zero(
        start + BYTES_PREFIX_SIZE + len,
        header.reserved_len() - BYTES_PREFIX_SIZE - len,
    )?;

    trace!(offset, len, reserved = header.reserved_len(), "payload written");
    Ok(())
}

/// Writes a raw array element in place.
pub fn write_element(
    mgr: &mut BufferManager,
    offset: usize,
    element_type: ItemType,
    value: &Value,
) -> Result<()> {
    if value.item_type() != element_type {
        return Err(ItembufError::type_mismatch(element_type, value.item_type()));
    }
    let width = element_type.fixed_size().unwrap_or(0);
    let endianness = mgr.endianness();
    value.encode_scalar(mgr.slice_mut(offset, width)?, endianness)
}

/// Replaces the item at `offset` with a new item holding `value`, which
/// may be of any type. The name, parent and options are kept.
///
/// Portals to the old item and its descendants become stale.
pub fn replace_item(mgr: &mut BufferManager, offset: usize, value: &Value) -> Result<()> {
    value.validate()?;
    let header = ItemHeader::read(mgr, offset)?;
    let name = read_name(mgr, offset, header.name_field_len)?;

    let mut out = Vec::with_capacity(value.item_len(name.as_deref()));
    value.encode_item(
        name.as_deref(),
        header.parent,
        offset,
        mgr.endianness(),
        &mut out,
    )?;
    if out.len() > header.item_len as usize {
        grow_item(mgr, offset, out.len() - header.item_len as usize)?;
    }
    let old = ItemHeader::read(mgr, offset)?;

    let endianness = mgr.endianness();
    let mut new = ItemHeader::from_bytes(&out, endianness)?;
    new.item_len = old.item_len;
    new.options = old.options;
    out[..HEADER_SIZE].copy_from_slice(&new.to_bytes(endianness));

    let end = item_end(offset, &old);
    mgr.slice_mut(offset, out.len())?.copy_from_slice(&out);
    mgr.zero(offset + out.len(), end - offset - out.len())?;
    mgr.invalidate(offset, end);

    trace!(
        offset,
        from = %old.item_type,
        to = %new.item_type,
        item_len = new.item_len,
        "item replaced"
    );
    Ok(())
}

// =============================================================================
// Whole-tree passes
// =============================================================================

/// Rewrites the parent offset of every item, starting from the root.
pub fn relink(mgr: &mut BufferManager) -> Result<()> {
    if mgr.used() == 0 {
        return Ok(());
    }
    let mut stack = vec![(0usize, NO_PARENT)];
    while let Some((offset, parent)) = stack.pop() {
        ItemHeader::write_parent(mgr, offset, parent)?;
        let header = ItemHeader::read(mgr, offset)?;
        if header.item_type.is_composite() {
            let link = to_u32(offset)?;
            for child in child_items(mgr, offset, &header)? {
                stack.push((child, link));
            }
        }
    }
    Ok(())
}

/// Checks that the used bytes form one well-formed item tree.
///
/// Every item is visited: lengths, name fields, value fields, child
/// containment and parent links. Nesting beyond the import depth limit is
/// rejected.
pub fn validate_tree(mgr: &BufferManager) -> Result<()> {
    let used = mgr.used();
    if used < HEADER_SIZE {
        return Err(ItembufError::malformed(
            0,
            format!("buffer of {} bytes is shorter than an item header", used),
        ));
    }
    let root = ItemHeader::read(mgr, 0)?;
    if root.item_len as usize != used {
        return Err(ItembufError::malformed(
            0,
            format!(
                "root length {} does not match buffer length {}",
                root.item_len, used
            ),
        ));
    }
    if root.parent != NO_PARENT {
        return Err(ItembufError::malformed(
            0,
            format!("root parent offset {:#x} is not the root sentinel", root.parent),
        ));
    }

    let mut stack = vec![(0usize, 0usize)];
    let mut visited = 0usize;
    while let Some((offset, depth)) = stack.pop() {
        if depth > MAX_IMPORT_DEPTH {
            return Err(ItembufError::malformed(
                offset,
                format!("nesting deeper than {}", MAX_IMPORT_DEPTH),
            ));
        }
        let header = ItemHeader::read(mgr, offset)?;
        validate_item(mgr, offset, &header)?;
        visited += 1;

        if !header.item_type.is_composite() {
            continue;
        }
        let element_type = match header.item_type {
            ItemType::Array => Some(ArrayPrefix::read(mgr, value_start(offset, &header))?.element_type),
            _ => None,
        };
        let mut names = HashSet::new();
        for child in child_items(mgr, offset, &header)? {
            let child_header = ItemHeader::read(mgr, child)?;
            if child_header.parent as usize != offset {
                return Err(ItembufError::malformed(
                    child,
                    format!(
                        "parent offset {} should be {}",
                        child_header.parent, offset
                    ),
                ));
            }
            if let Some(element_type) = element_type {
                if child_header.item_type != element_type {
                    return Err(ItembufError::malformed(
                        child,
                        format!(
                            "{} element in {} array",
                            child_header.item_type, element_type
                        ),
                    ));
                }
            }
            let named = child_header.name_field_len > 0;
            match header.item_type {
                ItemType::Dictionary => {
                    let (_, name) = read_name_raw(mgr, child, child_header.name_field_len)?
                        .ok_or_else(|| ItembufError::malformed(child, "unnamed dictionary child"))?;
                    if !names.insert(name) {
                        return Err(ItembufError::malformed(child, "duplicate dictionary name"));
                    }
                }
                _ if named => {
                    return Err(ItembufError::malformed(
                        child,
                        format!("named child in {}", header.item_type),
                    ));
                }
                _ => {}
            }
            stack.push((child, depth + 1));
        }
    }

    debug!(used, items = visited, "tree validated");
    Ok(())
}

fn validate_item(mgr: &BufferManager, offset: usize, header: &ItemHeader) -> Result<()> {
    let len = header.item_len as usize;
    if len < HEADER_SIZE {
        return Err(ItembufError::malformed(
            offset,
            format!("item length {} shorter than header", len),
        ));
    }
    if offset + len > mgr.used() {
        return Err(ItembufError::malformed(
            offset,
            format!("item length {} runs past the buffer", len),
        ));
    }
    if header.value_offset() > len {
        return Err(ItembufError::malformed(offset, "name field overruns item"));
    }

    if let Some((hash, name)) = read_name_raw(mgr, offset, header.name_field_len)? {
        if name.is_empty() {
            return Err(ItembufError::malformed(offset, "empty name"));
        }
        if std::str::from_utf8(name).is_err() {
            return Err(ItembufError::malformed(offset, "name is not valid UTF-8"));
        }
        if name_hash(name) != hash {
            return Err(ItembufError::malformed(offset, "name hash mismatch"));
        }
    }

    let reserved = header.reserved_len();
    match header.item_type {
        ItemType::String | ItemType::Binary => {
            if reserved < BYTES_PREFIX_SIZE {
                return Err(ItembufError::malformed(offset, "value field too short"));
            }
            let payload = read_bytes_payload(mgr, offset, header)?;
            if header.item_type == ItemType::String && std::str::from_utf8(payload).is_err() {
                return Err(ItembufError::malformed(offset, "string is not valid UTF-8"));
            }
        }
        ItemType::Array => {
            if reserved < ArrayPrefix::SIZE {
                return Err(ItembufError::malformed(offset, "value field too short"));
            }
            let prefix = ArrayPrefix::read(mgr, value_start(offset, header))?;
            let body = (header.count as usize).checked_mul(prefix.element_size as usize);
            if prefix.is_fixed() && body.is_none_or(|b| ArrayPrefix::SIZE + b > reserved) {
                return Err(ItembufError::malformed(
                    offset,
                    format!("{} elements do not fit the value field", header.count),
                ));
            }
        }
        ItemType::Dictionary | ItemType::Sequence => {}
        fixed => {
            let width = fixed.fixed_size().unwrap_or(0);
            if reserved < width {
                return Err(ItembufError::malformed(
                    offset,
                    format!("{} value needs {} bytes, has {}", fixed, width, reserved),
                ));
            }
        }
    }
    if !header.item_type.is_composite() && header.count != 0 {
        return Err(ItembufError::malformed(
            offset,
            format!("scalar with value count {}", header.count),
        ));
    }
    Ok(())
}

/// Appends a slack-free copy of the subtree at `offset` to `out`.
///
/// Parent offsets in the copy are relative to `out[0]`.
fn compact_item(
    mgr: &BufferManager,
    offset: usize,
    parent: u32,
    out: &mut Vec<u8>,
) -> Result<()> {
    let header = ItemHeader::read(mgr, offset)?;
    let start = out.len();
    let new_offset = to_u32(start)?;
    out.resize(start + HEADER_SIZE, 0);
    out.extend_from_slice(mgr.slice(offset + HEADER_SIZE, header.name_field_len as usize)?);

    let value = value_start(offset, &header);
    match header.item_type {
        ItemType::Dictionary | ItemType::Sequence => {
            for child in child_items(mgr, offset, &header)? {
                compact_item(mgr, child, new_offset, out)?;
            }
        }
        ItemType::Array => {
            let prefix = ArrayPrefix::read(mgr, value)?;
            out.extend_from_slice(mgr.slice(value, ArrayPrefix::SIZE)?);
            if prefix.is_fixed() {
                let body = used_len(mgr, offset, &header)? - ArrayPrefix::SIZE;
                out.extend_from_slice(mgr.slice(value + ArrayPrefix::SIZE, body)?);
            } else {
                for child in child_items(mgr, offset, &header)? {
                    compact_item(mgr, child, new_offset, out)?;
                }
            }
        }
        _ => {
            let used = used_len(mgr, offset, &header)?;
            out.extend_from_slice(mgr.slice(value, used)?);
        }
    }

    let compacted = ItemHeader {
        item_len: to_u32(out.len() - start)?,
        parent,
        ..header
    };
    out[start..start + HEADER_SIZE].copy_from_slice(&compacted.to_bytes(mgr.endianness()));
    Ok(())
}

/// Removes the slack of every item. Returns the number of bytes reclaimed.
///
/// Only the root keeps its anchor; every other item may have moved.
pub fn compact(mgr: &mut BufferManager) -> Result<usize> {
    let before = mgr.used();
    if before == 0 {
        return Ok(0);
    }
    let mut out = Vec::with_capacity(before);
    compact_item(mgr, 0, NO_PARENT, &mut out)?;
    mgr.replace_contents(&out, 0)?;

    let reclaimed = before - out.len();
    debug!(before, after = out.len(), reclaimed, "buffer compacted");
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use itembuf_common::{Endianness, StoreConfig};

    fn manager_with(value: &Value) -> BufferManager {
        let mut mgr = BufferManager::new(StoreConfig::default()).unwrap();
        write_root(&mut mgr, value).unwrap();
        mgr
    }

    fn sample() -> Value {
        Value::dictionary([
            ("count", Value::Int64(42)),
            (
                "tags",
                Value::array(ItemType::String, ["x", "y", "z"].map(Value::from)),
            ),
            ("scores", Value::array(ItemType::Int32, [1i32, 2, 3].map(Value::from))),
        ])
    }

    #[test]
    fn test_write_and_read_root() {
        let value = sample();
        let mgr = manager_with(&value);
        assert_eq!(mgr.used(), value.item_len(None));
        assert_eq!(read_value(&mgr, 0).unwrap(), value);
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_write_root_twice_fails() {
        let mut mgr = manager_with(&Value::Null);
        assert!(write_root(&mut mgr, &Value::Null).is_err());
    }

    #[test]
    fn test_find_by_name_and_child_at() {
        let mgr = manager_with(&sample());
        let count = find_by_name(&mgr, 0, "count").unwrap().unwrap();
        assert_eq!(read_typed::<i64>(&mgr, count).unwrap(), 42);
        assert_eq!(find_by_name(&mgr, 0, "missing").unwrap(), None);

        let tags = find_by_name(&mgr, 0, "tags").unwrap().unwrap();
        let Slot::Item(y) = child_at(&mgr, tags, 1).unwrap() else {
            panic!("string elements are items");
        };
        assert_eq!(read_typed::<String>(&mgr, y).unwrap(), "y");
        assert!(matches!(
            child_at(&mgr, tags, 3),
            Err(ItembufError::OutOfRange { index: 3, count: 3 })
        ));

        let scores = find_by_name(&mgr, 0, "scores").unwrap().unwrap();
        let Slot::Element { offset, element_type } = child_at(&mgr, scores, 2).unwrap() else {
            panic!("int elements are raw");
        };
        assert_eq!(element_type, ItemType::Int32);
        assert_eq!(read_element::<i32>(&mgr, offset, element_type).unwrap(), 3);
        assert_eq!(slots(&mgr, scores).unwrap().len(), 3);
    }

    #[test]
    fn test_find_by_name_on_non_dictionary() {
        let mgr = manager_with(&Value::sequence([Value::Null]));
        assert!(matches!(
            find_by_name(&mgr, 0, "a"),
            Err(ItembufError::TypeMismatch { .. })
        ));
        assert!(child_at(&manager_with(&Value::Int8(1)), 0, 0).is_err());
    }

    #[test]
    fn test_typed_access_type_check() {
        let mgr = manager_with(&Value::Int32(5));
        assert_eq!(read_typed::<i32>(&mgr, 0).unwrap(), 5);
        assert!(matches!(
            read_typed::<i64>(&mgr, 0),
            Err(ItembufError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_grow_item_updates_ancestors_and_links() {
        let mut mgr = manager_with(&Value::sequence([
            Value::sequence([Value::from("a")]),
            Value::Int8(7),
        ]));
        let inner = match child_at(&mgr, 0, 0).unwrap() {
            Slot::Item(offset) => offset,
            other => panic!("unexpected slot {:?}", other),
        };
        let before_root = ItemHeader::read_item_len(&mgr, 0).unwrap();
        let before_inner = ItemHeader::read_item_len(&mgr, inner).unwrap();

        grow_item(&mut mgr, inner, 10).unwrap();
        assert_eq!(ItemHeader::read_item_len(&mgr, 0).unwrap(), before_root + 10);
        assert_eq!(ItemHeader::read_item_len(&mgr, inner).unwrap(), before_inner + 10);
        assert_eq!(mgr.used(), (before_root + 10) as usize);

        // The Int8 after the grown item shifted and still links to the root
        let Slot::Item(int8) = child_at(&mgr, 0, 1).unwrap() else {
            panic!("expected item");
        };
        assert_eq!(ItemHeader::read_parent(&mgr, int8).unwrap(), 0);
        assert_eq!(read_typed::<i8>(&mgr, int8).unwrap(), 7);
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_grow_item_uses_parent_slack() {
        let mut mgr = manager_with(&Value::dictionary([
            ("s", Value::from("abc")),
            ("t", Value::from("x".repeat(40))),
            ("n", Value::Int8(5)),
        ]));
        let used = mgr.used();
        let root_len = ItemHeader::read_item_len(&mgr, 0).unwrap();
        remove_named(&mut mgr, 0, "t").unwrap();

        let s = find_by_name(&mgr, 0, "s").unwrap().unwrap();
        let s_len = ItemHeader::read_item_len(&mgr, s).unwrap();
        write_typed(&mut mgr, s, &"abcdefghij".to_string()).unwrap();
        assert_eq!(mgr.used(), used);
        assert_eq!(ItemHeader::read_item_len(&mgr, 0).unwrap(), root_len);
        assert_eq!(ItemHeader::read_item_len(&mgr, s).unwrap(), s_len + 7);

        // The sibling after the grown item shifted into the slack
        let n = find_by_name(&mgr, 0, "n").unwrap().unwrap();
        assert_eq!(read_typed::<i8>(&mgr, n).unwrap(), 5);
        assert_eq!(ItemHeader::read_parent(&mgr, n).unwrap(), 0);

        for len in 11..=15 {
            write_typed(&mut mgr, s, &"y".repeat(len)).unwrap();
        }
        assert_eq!(mgr.used(), used);
        assert_eq!(read_typed::<String>(&mgr, s).unwrap(), "y".repeat(15));
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_grow_item_uses_grandparent_slack() {
        let mut mgr = manager_with(&Value::sequence([
            Value::sequence([Value::from("a")]),
            Value::Int8(7),
        ]));
        let used = mgr.used();
        remove_child(&mut mgr, 0, 1).unwrap();

        let Slot::Item(inner) = child_at(&mgr, 0, 0).unwrap() else {
            panic!("expected item");
        };
        let Slot::Item(leaf) = child_at(&mgr, inner, 0).unwrap() else {
            panic!("expected item");
        };
        let inner_len = ItemHeader::read_item_len(&mgr, inner).unwrap();

        write_typed(&mut mgr, leaf, &"abcdef".to_string()).unwrap();
        assert_eq!(mgr.used(), used);
        assert_eq!(ItemHeader::read_item_len(&mgr, 0).unwrap() as usize, used);
        assert_eq!(ItemHeader::read_item_len(&mgr, inner).unwrap(), inner_len + 5);
        assert_eq!(
            read_value(&mgr, 0).unwrap(),
            Value::sequence([Value::sequence([Value::from("abcdef")])])
        );
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_string_grows_by_exact_delta() {
        let mut mgr = manager_with(&Value::dictionary([
            ("s", Value::from("abc")),
            ("n", Value::UInt16(9)),
        ]));
        let s = find_by_name(&mgr, 0, "s").unwrap().unwrap();
        let before = ItemHeader::read_item_len(&mgr, s).unwrap();

        write_typed(&mut mgr, s, &"abcdefgh".to_string()).unwrap();
        assert_eq!(ItemHeader::read_item_len(&mgr, s).unwrap(), before + 5);
        assert_eq!(read_typed::<String>(&mgr, s).unwrap(), "abcdefgh");
        let n = find_by_name(&mgr, 0, "n").unwrap().unwrap();
        assert_eq!(read_typed::<u16>(&mgr, n).unwrap(), 9);

        // Shrinking keeps the reserved bytes as slack
        write_typed(&mut mgr, s, &"a".to_string()).unwrap();
        assert_eq!(ItemHeader::read_item_len(&mgr, s).unwrap(), before + 5);
        let header = ItemHeader::read(&mgr, s).unwrap();
        assert_eq!(used_len(&mgr, s, &header).unwrap(), 5);
        assert_eq!(read_typed::<String>(&mgr, s).unwrap(), "a");
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_insert_and_remove_children() {
        let mut mgr = manager_with(&Value::dictionary(Vec::<(String, Value)>::new()));
        insert_child(&mut mgr, 0, 0, Some("b"), &Value::Bool(true)).unwrap();
        insert_child(&mut mgr, 0, 0, Some("a"), &Value::from("first")).unwrap();
        insert_child(&mut mgr, 0, 2, Some("c"), &Value::sequence([Value::Null])).unwrap();

        assert_eq!(
            read_value(&mgr, 0).unwrap(),
            Value::dictionary([
                ("a", Value::from("first")),
                ("b", Value::Bool(true)),
                ("c", Value::sequence([Value::Null])),
            ])
        );

        assert!(matches!(
            insert_child(&mut mgr, 0, 0, Some("a"), &Value::Null),
            Err(ItembufError::DuplicateName(_))
        ));
        assert!(matches!(
            insert_child(&mut mgr, 0, 9, Some("z"), &Value::Null),
            Err(ItembufError::OutOfRange { index: 9, count: 3 })
        ));
        assert!(matches!(
            insert_child(&mut mgr, 0, 0, None, &Value::Null),
            Err(ItembufError::InvalidName(_))
        ));

        let len_before = ItemHeader::read_item_len(&mgr, 0).unwrap();
        remove_named(&mut mgr, 0, "a").unwrap();
        remove_child(&mut mgr, 0, 1).unwrap();
        assert_eq!(
            read_value(&mgr, 0).unwrap(),
            Value::dictionary([("b", Value::Bool(true))])
        );
        // Freed bytes stay with the parent as slack
        assert_eq!(ItemHeader::read_item_len(&mgr, 0).unwrap(), len_before);
        assert!(matches!(
            remove_named(&mut mgr, 0, "a"),
            Err(ItembufError::NotFound(_))
        ));
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_insert_uses_slack_before_growing() {
        let mut mgr = manager_with(&Value::sequence([Value::Int64(1), Value::Int64(2)]));
        let used = mgr.used();
        remove_child(&mut mgr, 0, 0).unwrap();
        assert_eq!(mgr.used(), used);

        insert_child(&mut mgr, 0, 0, None, &Value::Int64(3)).unwrap();
        assert_eq!(mgr.used(), used);
        assert_eq!(
            read_value(&mgr, 0).unwrap(),
            Value::sequence([Value::Int64(3), Value::Int64(2)])
        );
    }

    #[test]
    fn test_fixed_array_elements() {
        let mut mgr = manager_with(&Value::array(ItemType::UInt16, [Value::UInt16(1)]));
        insert_child(&mut mgr, 0, 1, None, &Value::UInt16(3)).unwrap();
        insert_child(&mut mgr, 0, 1, None, &Value::UInt16(2)).unwrap();
        assert!(matches!(
            insert_child(&mut mgr, 0, 0, None, &Value::UInt32(0)),
            Err(ItembufError::TypeMismatch { .. })
        ));

        let Slot::Element { offset, element_type } = child_at(&mgr, 0, 2).unwrap() else {
            panic!("expected element");
        };
        write_element(&mut mgr, offset, element_type, &Value::UInt16(30)).unwrap();
        remove_child(&mut mgr, 0, 0).unwrap();
        assert_eq!(
            read_value(&mgr, 0).unwrap(),
            Value::array(ItemType::UInt16, [Value::UInt16(2), Value::UInt16(30)])
        );
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_rewrite_value_and_replace() {
        let mut mgr = manager_with(&Value::dictionary([
            ("list", Value::sequence([Value::Int8(1)])),
            ("after", Value::from("tail")),
        ]));
        let list = find_by_name(&mgr, 0, "list").unwrap().unwrap();
        rewrite_value(
            &mut mgr,
            list,
            &Value::sequence([Value::from("longer"), Value::Int8(2)]),
        )
        .unwrap();
        assert!(matches!(
            rewrite_value(&mut mgr, list, &Value::Int8(1)),
            Err(ItembufError::TypeMismatch { .. })
        ));

        replace_item(&mut mgr, list, &Value::Float64(2.5)).unwrap();
        assert_eq!(
            read_value(&mgr, 0).unwrap(),
            Value::dictionary([
                ("list", Value::Float64(2.5)),
                ("after", Value::from("tail")),
            ])
        );
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_remove_root_fails() {
        let mut mgr = manager_with(&Value::Null);
        assert!(matches!(
            remove_item(&mut mgr, 0),
            Err(ItembufError::NotFound(_))
        ));
    }

    #[test]
    fn test_compact_removes_slack() {
        let value = Value::dictionary([
            ("a", Value::from("a long string value")),
            ("b", Value::sequence([Value::Int32(1), Value::Int32(2)])),
        ]);
        let mut mgr = manager_with(&value);
        let a = find_by_name(&mgr, 0, "a").unwrap().unwrap();
        write_typed(&mut mgr, a, &"s".to_string()).unwrap();
        let b = find_by_name(&mgr, 0, "b").unwrap().unwrap();
        remove_child(&mut mgr, b, 0).unwrap();

        let expected = read_value(&mgr, 0).unwrap();
        let reclaimed = compact(&mut mgr).unwrap();
        assert_eq!(reclaimed, 18 + 20);
        assert_eq!(mgr.used(), expected.item_len(None));
        assert_eq!(read_value(&mgr, 0).unwrap(), expected);
        validate_tree(&mgr).unwrap();
    }

    #[test]
    fn test_validate_rejects_corruption() {
        let value = sample();
        let good = manager_with(&value);

        let corrupt = |f: &dyn Fn(&mut [u8])| {
            let mut bytes = good.bytes().to_vec();
            f(&mut bytes);
            let mgr = BufferManager::from_bytes(&bytes, StoreConfig::default()).unwrap();
            validate_tree(&mgr).unwrap_err()
        };

        // Child item length below the header size
        let err = corrupt(&|b| b[16 + 4..16 + 8].copy_from_slice(&8u32.to_le_bytes()));
        assert!(matches!(err, ItembufError::MalformedBuffer { .. }));
        // Root length disagrees with the buffer
        let err = corrupt(&|b| b[4] = b[4].wrapping_add(1));
        assert!(matches!(err, ItembufError::MalformedBuffer { offset: 0, .. }));
        // Unknown type tag on a child
        let err = corrupt(&|b| b[16] = 0xEE);
        assert!(matches!(err, ItembufError::MalformedBuffer { .. }));
        // Broken name hash
        let err = corrupt(&|b| b[32] ^= 0xFF);
        assert!(matches!(err, ItembufError::MalformedBuffer { .. }));
        // Wrong parent link
        let err = corrupt(&|b| b[16 + 8] = 3);
        assert!(matches!(err, ItembufError::MalformedBuffer { .. }));
    }

    #[test]
    fn test_validate_rejects_short_buffer() {
        let mgr = BufferManager::from_bytes(&[0u8; 8], StoreConfig::default()).unwrap();
        assert!(matches!(
            validate_tree(&mgr),
            Err(ItembufError::MalformedBuffer { offset: 0, .. })
        ));
    }

    #[test]
    fn test_validate_depth_limit() {
        let mut value = Value::Null;
        for _ in 0..=MAX_IMPORT_DEPTH {
            value = Value::sequence([value]);
        }
        let mgr = manager_with(&value);
        assert!(validate_tree(&mgr).is_err());
    }

    #[test]
    fn test_big_endian_tree() {
        let config = StoreConfig::default().with_endianness(Endianness::Big);
        let mut mgr = BufferManager::new(config).unwrap();
        write_root(&mut mgr, &sample()).unwrap();
        assert_eq!(&mgr.bytes()[4..8], &(mgr.used() as u32).to_be_bytes());
        assert_eq!(read_value(&mgr, 0).unwrap(), sample());
        validate_tree(&mgr).unwrap();
    }
}
