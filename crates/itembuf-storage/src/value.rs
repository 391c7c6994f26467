//! Owned values and their encoded form.

use std::collections::HashSet;

use itembuf_common::{Codec, Endianness, ItemType, ItembufError, Result};
use uuid::Uuid;

use crate::field::ArrayPrefix;
use crate::item::constants::BYTES_PREFIX_SIZE;
use crate::item::{ItemHeader, ItemOptions, check_name, encode_name_field, name_field_len};

/// An owned value of any item type.
///
/// Used to build items, to rewrite them and to read a whole subtree out
/// of a buffer. Scalars are accessed more cheaply through
/// [`Portal::get`](crate::Portal::get) and [`Portal::set`](crate::Portal::set).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
    Uuid(Uuid),
    /// Elements all share `element_type`.
    Array {
        element_type: ItemType,
        elements: Vec<Value>,
    },
    /// Named children in stored order; names are unique.
    Dictionary(Vec<(String, Value)>),
    /// Unnamed children in stored order.
    Sequence(Vec<Value>),
}

impl Value {
    /// Creates an array value.
    pub fn array(element_type: ItemType, elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Array {
            element_type,
            elements: elements.into_iter().collect(),
        }
    }

    /// Creates a dictionary value.
    pub fn dictionary<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Dictionary(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Creates a sequence value.
    pub fn sequence(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Sequence(elements.into_iter().collect())
    }

    /// Returns the item type this value is stored as.
    pub fn item_type(&self) -> ItemType {
        match self {
            Value::Null => ItemType::Null,
            Value::Bool(_) => ItemType::Bool,
            Value::Int8(_) => ItemType::Int8,
            Value::Int16(_) => ItemType::Int16,
            Value::Int32(_) => ItemType::Int32,
            Value::Int64(_) => ItemType::Int64,
            Value::UInt8(_) => ItemType::UInt8,
            Value::UInt16(_) => ItemType::UInt16,
            Value::UInt32(_) => ItemType::UInt32,
            Value::UInt64(_) => ItemType::UInt64,
            Value::Float32(_) => ItemType::Float32,
            Value::Float64(_) => ItemType::Float64,
            Value::String(_) => ItemType::String,
            Value::Binary(_) => ItemType::Binary,
            Value::Uuid(_) => ItemType::Uuid,
            Value::Array { .. } => ItemType::Array,
            Value::Dictionary(_) => ItemType::Dictionary,
            Value::Sequence(_) => ItemType::Sequence,
        }
    }

    /// Number of children or elements, 0 for scalars.
    pub fn count(&self) -> usize {
        match self {
            Value::Array { elements, .. } => elements.len(),
            Value::Dictionary(entries) => entries.len(),
            Value::Sequence(elements) => elements.len(),
            _ => 0,
        }
    }

    /// Returns the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the binary payload, if this is binary.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a bool, if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns any integer that fits in an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int8(v) => Some(v as i64),
            Value::Int16(v) => Some(v as i64),
            Value::Int32(v) => Some(v as i64),
            Value::Int64(v) => Some(v),
            Value::UInt8(v) => Some(v as i64),
            Value::UInt16(v) => Some(v as i64),
            Value::UInt32(v) => Some(v as i64),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Returns either float type as an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(v as f64),
            Value::Float64(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the UUID, if this is a UUID.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    /// Looks up a dictionary entry by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Dictionary(entries) => entries.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Returns the child or element at `index` of any composite.
    pub fn at(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Array { elements, .. } | Value::Sequence(elements) => elements.get(index),
            Value::Dictionary(entries) => entries.get(index).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Checks that the value can be encoded: array elements match the
    /// element type, dictionary names are valid and unique, payloads fit
    /// a u32 length.
    pub fn validate(&self) -> Result<()> {
        match self {
            Value::String(s) => check_payload_len(s.len()),
            Value::Binary(b) => check_payload_len(b.len()),
            Value::Array {
                element_type,
                elements,
            } => {
                ArrayPrefix::new(*element_type)?;
                for element in elements {
                    if element.item_type() != *element_type {
                        return Err(ItembufError::type_mismatch(
                            element_type,
                            element.item_type(),
                        ));
                    }
                    element.validate()?;
                }
                Ok(())
            }
            Value::Dictionary(entries) => {
                let mut seen = HashSet::with_capacity(entries.len());
                for (name, value) in entries {
                    check_name(name)?;
                    if !seen.insert(name.as_str()) {
                        return Err(ItembufError::DuplicateName(name.clone()));
                    }
                    value.validate()?;
                }
                Ok(())
            }
            Value::Sequence(elements) => elements.iter().try_for_each(Value::validate),
            _ => Ok(()),
        }
    }

    /// Encoded size of the value field.
    pub fn value_len(&self) -> usize {
        match self {
            Value::String(s) => BYTES_PREFIX_SIZE + s.len(),
            Value::Binary(b) => BYTES_PREFIX_SIZE + b.len(),
            Value::Array {
                element_type,
                elements,
            } => {
                let body = match element_type.fixed_size() {
                    Some(size) => size * elements.len(),
                    None => elements.iter().map(|e| e.item_len(None)).sum(),
                };
                ArrayPrefix::SIZE + body
            }
            Value::Dictionary(entries) => entries
                .iter()
                .map(|(name, value)| value.item_len(Some(name)))
                .sum(),
            Value::Sequence(elements) => elements.iter().map(|e| e.item_len(None)).sum(),
            scalar => scalar.item_type().fixed_size().unwrap_or(0),
        }
    }

    /// Encoded size of a whole item holding this value.
    pub fn item_len(&self, name: Option<&str>) -> usize {
        ItemHeader::SIZE + name_field_len(name) + self.value_len()
    }

    /// Writes a fixed-size scalar into `dst`.
    pub fn encode_scalar(&self, dst: &mut [u8], endianness: Endianness) -> Result<()> {
        match self {
            Value::Null => {}
            Value::Bool(v) => v.encode(dst, endianness),
            Value::Int8(v) => v.encode(dst, endianness),
            Value::Int16(v) => v.encode(dst, endianness),
            Value::Int32(v) => v.encode(dst, endianness),
            Value::Int64(v) => v.encode(dst, endianness),
            Value::UInt8(v) => v.encode(dst, endianness),
            Value::UInt16(v) => v.encode(dst, endianness),
            Value::UInt32(v) => v.encode(dst, endianness),
            Value::UInt64(v) => v.encode(dst, endianness),
            Value::Float32(v) => v.encode(dst, endianness),
            Value::Float64(v) => v.encode(dst, endianness),
            Value::Uuid(v) => v.encode(dst, endianness),
            other => {
                return Err(ItembufError::type_mismatch(
                    "fixed-size scalar",
                    other.item_type(),
                ));
            }
        }
        Ok(())
    }

    /// Reads a fixed-size scalar of `item_type` from `src`.
    ///
    /// The stored type tag selects the codec.
    pub fn decode_scalar(item_type: ItemType, src: &[u8], endianness: Endianness) -> Result<Self> {
        Ok(match item_type {
            ItemType::Null => Value::Null,
            ItemType::Bool => Value::Bool(bool::decode(src, endianness)?),
            ItemType::Int8 => Value::Int8(i8::decode(src, endianness)?),
            ItemType::Int16 => Value::Int16(i16::decode(src, endianness)?),
            ItemType::Int32 => Value::Int32(i32::decode(src, endianness)?),
            ItemType::Int64 => Value::Int64(i64::decode(src, endianness)?),
            ItemType::UInt8 => Value::UInt8(u8::decode(src, endianness)?),
            ItemType::UInt16 => Value::UInt16(u16::decode(src, endianness)?),
            ItemType::UInt32 => Value::UInt32(u32::decode(src, endianness)?),
            ItemType::UInt64 => Value::UInt64(u64::decode(src, endianness)?),
            ItemType::Float32 => Value::Float32(f32::decode(src, endianness)?),
            ItemType::Float64 => Value::Float64(f64::decode(src, endianness)?),
            ItemType::Uuid => Value::Uuid(Uuid::decode(src, endianness)?),
            other => {
                return Err(ItembufError::type_mismatch("fixed-size scalar", other));
            }
        })
    }

    /// Appends the value field to `out`.
    ///
    /// `base` is the buffer offset `out[0]` will land at and `item_offset`
    /// the offset of the item that owns this field; both are needed to
    /// fill in the parent offsets of child items. Returns the value count.
    pub fn encode_value_field(
        &self,
        item_offset: u32,
        base: usize,
        endianness: Endianness,
        out: &mut Vec<u8>,
    ) -> Result<u32> {
        match self {
            Value::String(s) => encode_payload(s.as_bytes(), endianness, out),
            Value::Binary(b) => encode_payload(b, endianness, out),
            Value::Array {
                element_type,
                elements,
            } => {
                let prefix = ArrayPrefix::new(*element_type)?;
                out.extend_from_slice(&prefix.to_bytes(endianness));
                for element in elements {
                    if element.item_type() != *element_type {
                        return Err(ItembufError::type_mismatch(
                            element_type,
                            element.item_type(),
                        ));
                    }
                    if prefix.is_fixed() {
                        let start = out.len();
                        out.resize(start + prefix.element_size as usize, 0);
                        element.encode_scalar(&mut out[start..], endianness)?;
                    } else {
                        element.encode_item(None, item_offset, base, endianness, out)?;
                    }
                }
            }
            Value::Dictionary(entries) => {
                for (name, value) in entries {
                    value.encode_item(Some(name), item_offset, base, endianness, out)?;
                }
            }
            Value::Sequence(elements) => {
                for element in elements {
                    element.encode_item(None, item_offset, base, endianness, out)?;
                }
            }
            scalar => {
                let start = out.len();
                out.resize(start + scalar.value_len(), 0);
                scalar.encode_scalar(&mut out[start..], endianness)?;
            }
        }
        u32::try_from(self.count()).map_err(|_| ItembufError::CapacityExceeded {
            requested: self.count(),
            limit: u32::MAX as usize,
        })
    }

    /// Appends a complete item (header, name field, value field) to `out`.
    pub fn encode_item(
        &self,
        name: Option<&str>,
        parent: u32,
        base: usize,
        endianness: Endianness,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let start = out.len();
        let offset = to_u32(base + start)?;
        out.resize(start + ItemHeader::SIZE, 0);
        if let Some(name) = name {
            encode_name_field(name, endianness, out);
        }
        let count = self.encode_value_field(offset, base, endianness, out)?;

        let header = ItemHeader {
            item_type: self.item_type(),
            options: ItemOptions::empty(),
            name_field_len: name_field_len(name) as u8,
            item_len: to_u32(out.len() - start)?,
            parent,
            count,
        };
        out[start..start + ItemHeader::SIZE].copy_from_slice(&header.to_bytes(endianness));
        Ok(())
    }
}

fn encode_payload(bytes: &[u8], endianness: Endianness, out: &mut Vec<u8>) {
    let mut len = [0u8; BYTES_PREFIX_SIZE];
    (bytes.len() as u32).encode(&mut len, endianness);
    out.extend_from_slice(&len);
    out.extend_from_slice(bytes);
}

fn check_payload_len(len: usize) -> Result<()> {
    if len > u32::MAX as usize - BYTES_PREFIX_SIZE {
        return Err(ItembufError::CapacityExceeded {
            requested: len,
            limit: u32::MAX as usize - BYTES_PREFIX_SIZE,
        });
    }
    Ok(())
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| ItembufError::CapacityExceeded {
        requested: n,
        limit: u32::MAX as usize,
    })
}

macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_for_value! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    String => String,
    Vec<u8> => Binary,
    Uuid => Uuid,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::constants::NO_PARENT;

    fn sample() -> Value {
        Value::dictionary([
            ("count", Value::Int64(42)),
            (
                "tags",
                Value::array(ItemType::String, ["x", "y", "z"].map(Value::from)),
            ),
        ])
    }

    #[test]
    fn test_item_types() {
        assert_eq!(Value::Null.item_type(), ItemType::Null);
        assert_eq!(Value::from(1u16).item_type(), ItemType::UInt16);
        assert_eq!(Value::from("s").item_type(), ItemType::String);
        assert_eq!(Value::from(vec![1u8]).item_type(), ItemType::Binary);
        assert_eq!(sample().item_type(), ItemType::Dictionary);
        assert_eq!(Value::sequence(Vec::new()).item_type(), ItemType::Sequence);
    }

    #[test]
    fn test_value_len() {
        assert_eq!(Value::Null.value_len(), 0);
        assert_eq!(Value::Bool(true).value_len(), 1);
        assert_eq!(Value::Uuid(Uuid::nil()).value_len(), 16);
        assert_eq!(Value::from("hello").value_len(), 9);
        assert_eq!(
            Value::array(ItemType::Int32, [1i32, 2, 3].map(Value::from)).value_len(),
            8 + 12
        );
        // "x": 16 + 4 + 1 = 21
        assert_eq!(
            Value::array(ItemType::String, [Value::from("x")]).value_len(),
            8 + 21
        );
        // "count": 16 + 8 + 8
        assert_eq!(
            Value::dictionary([("count", Value::Int64(1))]).value_len(),
            32
        );
        assert_eq!(Value::from(1u8).item_len(Some("ab")), 16 + 5 + 1);
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mixed = Value::array(ItemType::Int32, [Value::Int32(1), Value::Int64(2)]);
        assert!(matches!(
            mixed.validate(),
            Err(ItembufError::TypeMismatch { .. })
        ));

        let nulls = Value::array(ItemType::Null, Vec::new());
        assert!(nulls.validate().is_err());

        let dup = Value::dictionary([("a", Value::Null), ("a", Value::Bool(true))]);
        assert!(matches!(dup.validate(), Err(ItembufError::DuplicateName(_))));

        let unnamed = Value::dictionary([("", Value::Null)]);
        assert!(matches!(
            unnamed.validate(),
            Err(ItembufError::InvalidName(_))
        ));

        let nested = Value::sequence([Value::dictionary([("", Value::Null)])]);
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_scalar_codec_dispatch() {
        for endianness in [Endianness::Little, Endianness::Big] {
            for value in [
                Value::Bool(true),
                Value::Int8(-8),
                Value::Int16(-1600),
                Value::Int32(i32::MIN),
                Value::Int64(i64::MAX),
                Value::UInt8(u8::MAX),
                Value::UInt16(0xABCD),
                Value::UInt32(7),
                Value::UInt64(u64::MAX),
                Value::Float32(1.5),
                Value::Float64(-0.25),
                Value::Uuid(Uuid::new_v4()),
                Value::Null,
            ] {
                let mut buf = vec![0u8; value.value_len()];
                value.encode_scalar(&mut buf, endianness).unwrap();
                let decoded = Value::decode_scalar(value.item_type(), &buf, endianness).unwrap();
                assert_eq!(decoded, value);
            }
        }
    }

    #[test]
    fn test_scalar_codec_rejects_variable_types() {
        let mut buf = [0u8; 8];
        assert!(Value::from("s").encode_scalar(&mut buf, Endianness::Little).is_err());
        assert!(Value::decode_scalar(ItemType::String, &buf, Endianness::Little).is_err());
    }

    #[test]
    fn test_encode_item_layout() {
        let mut out = Vec::new();
        Value::from("hi")
            .encode_item(Some("k"), NO_PARENT, 0, Endianness::Little, &mut out)
            .unwrap();

        assert_eq!(out.len(), 16 + 4 + 6);
        let header = ItemHeader::from_bytes(&out, Endianness::Little).unwrap();
        assert_eq!(header.item_type, ItemType::String);
        assert_eq!(header.name_field_len, 4);
        assert_eq!(header.item_len, 26);
        assert_eq!(header.parent, NO_PARENT);
        assert_eq!(header.count, 0);
        assert_eq!(out[18], 1);
        assert_eq!(out[19], b'k');
        assert_eq!(&out[20..24], &2u32.to_le_bytes());
        assert_eq!(&out[24..], b"hi");
    }

    #[test]
    fn test_encode_nested_parent_offsets() {
        let value = sample();
        let mut out = vec![0xAA; 100];
        value
            .encode_item(None, NO_PARENT, 1000, Endianness::Big, &mut out)
            .unwrap();

        let root = ItemHeader::from_bytes(&out[100..], Endianness::Big).unwrap();
        assert_eq!(root.item_len as usize, value.item_len(None));
        assert_eq!(root.count, 2);

        // "count" is the first child; its parent is the root at 1000 + 100
        let count = ItemHeader::from_bytes(&out[116..], Endianness::Big).unwrap();
        assert_eq!(count.parent, 1100);
        assert_eq!(count.item_type, ItemType::Int64);

        // "tags" follows; its elements point back at it
        let tags_at = 116 + count.item_len as usize;
        let tags = ItemHeader::from_bytes(&out[tags_at..], Endianness::Big).unwrap();
        assert_eq!(tags.item_type, ItemType::Array);
        assert_eq!(tags.count, 3);
        let first = tags_at + tags.value_offset() + ArrayPrefix::SIZE;
        let element = ItemHeader::from_bytes(&out[first..], Endianness::Big).unwrap();
        assert_eq!(element.parent as usize, 1000 + tags_at);
        assert_eq!(element.name_field_len, 0);
    }

    #[test]
    fn test_accessors() {
        let value = sample();
        assert_eq!(value.get("count").and_then(Value::as_i64), Some(42));
        assert_eq!(
            value.get("tags").and_then(|t| t.at(1)).and_then(Value::as_str),
            Some("y")
        );
        assert_eq!(value.at(0), value.get("count"));
        assert!(value.get("missing").is_none());
        assert_eq!(Value::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(Value::Float32(0.5).as_f64(), Some(0.5));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::from(vec![1, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert_eq!(Value::Uuid(Uuid::nil()).as_uuid(), Some(Uuid::nil()));
    }
}
