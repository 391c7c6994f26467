//! Type tags for itembuf items.

use serde::{Deserialize, Serialize};

use crate::error::{ItembufError, Result};

/// Identifier for every value kind an item can hold.
///
/// The tag is stored in the first byte of every item header and
/// selects the codec used for the item's value field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ItemType {
    // Null type
    Null = 0,

    // Boolean
    Bool = 1,

    // Integer types
    Int8 = 10,
    Int16 = 11,
    Int32 = 12,
    Int64 = 13,

    // Unsigned integer types
    UInt8 = 20,
    UInt16 = 21,
    UInt32 = 22,
    UInt64 = 23,

    // Floating point types
    Float32 = 30,
    Float64 = 31,

    // Length-prefixed types
    String = 50,
    Binary = 60,

    // UUID
    Uuid = 80,

    // Composite types
    Array = 100,
    Dictionary = 110,
    Sequence = 120,
}

impl ItemType {
    /// Returns the fixed value-field width for this type, or None for
    /// variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ItemType::Null => Some(0),
            ItemType::Bool => Some(1),

            ItemType::Int8 | ItemType::UInt8 => Some(1),
            ItemType::Int16 | ItemType::UInt16 => Some(2),
            ItemType::Int32 | ItemType::UInt32 | ItemType::Float32 => Some(4),
            ItemType::Int64 | ItemType::UInt64 | ItemType::Float64 => Some(8),

            ItemType::Uuid => Some(16),

            // Variable-length types
            ItemType::String
            | ItemType::Binary
            | ItemType::Array
            | ItemType::Dictionary
            | ItemType::Sequence => None,
        }
    }

    /// Returns true if this type has a fixed byte size.
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size().is_some()
    }

    /// Returns true if this type holds child items.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            ItemType::Array | ItemType::Dictionary | ItemType::Sequence
        )
    }

    /// Returns true if the value field starts with a 4-byte used-byte count.
    pub fn is_length_prefixed(&self) -> bool {
        matches!(self, ItemType::String | ItemType::Binary)
    }

    /// Returns true if this type is an integer type (signed or unsigned).
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ItemType::Int8
                | ItemType::Int16
                | ItemType::Int32
                | ItemType::Int64
                | ItemType::UInt8
                | ItemType::UInt16
                | ItemType::UInt32
                | ItemType::UInt64
        )
    }

    /// Returns true if this type is a floating-point type.
    pub fn is_floating_point(&self) -> bool {
        matches!(self, ItemType::Float32 | ItemType::Float64)
    }

    /// Returns true if values of this type may be stored as array elements.
    pub fn is_valid_element(&self) -> bool {
        !matches!(self, ItemType::Null)
    }
}

impl TryFrom<u8> for ItemType {
    type Error = ItembufError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ItemType::Null),
            1 => Ok(ItemType::Bool),
            10 => Ok(ItemType::Int8),
            11 => Ok(ItemType::Int16),
            12 => Ok(ItemType::Int32),
            13 => Ok(ItemType::Int64),
            20 => Ok(ItemType::UInt8),
            21 => Ok(ItemType::UInt16),
            22 => Ok(ItemType::UInt32),
            23 => Ok(ItemType::UInt64),
            30 => Ok(ItemType::Float32),
            31 => Ok(ItemType::Float64),
            50 => Ok(ItemType::String),
            60 => Ok(ItemType::Binary),
            80 => Ok(ItemType::Uuid),
            100 => Ok(ItemType::Array),
            110 => Ok(ItemType::Dictionary),
            120 => Ok(ItemType::Sequence),
            _ => Err(ItembufError::malformed(0, format!("unknown type tag: {}", value))),
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemType::Null => "NULL",
            ItemType::Bool => "BOOL",
            ItemType::Int8 => "INT8",
            ItemType::Int16 => "INT16",
            ItemType::Int32 => "INT32",
            ItemType::Int64 => "INT64",
            ItemType::UInt8 => "UINT8",
            ItemType::UInt16 => "UINT16",
            ItemType::UInt32 => "UINT32",
            ItemType::UInt64 => "UINT64",
            ItemType::Float32 => "FLOAT32",
            ItemType::Float64 => "FLOAT64",
            ItemType::String => "STRING",
            ItemType::Binary => "BINARY",
            ItemType::Uuid => "UUID",
            ItemType::Array => "ARRAY",
            ItemType::Dictionary => "DICTIONARY",
            ItemType::Sequence => "SEQUENCE",
        };
        write!(f, "{}", name)
    }
}
