//! Item layout constants.

// Header

/// Size of the fixed item header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Offset of the type tag (u8).
pub const OFF_TYPE: usize = 0;

/// Offset of the options word (u16).
pub const OFF_OPTIONS: usize = 1;

/// Offset of the name-field length (u8).
pub const OFF_NAME_FIELD_LEN: usize = 3;

/// Offset of the item length (u32).
pub const OFF_ITEM_LEN: usize = 4;

/// Offset of the parent offset (u32).
pub const OFF_PARENT: usize = 8;

/// Offset of the value count (u32).
pub const OFF_COUNT: usize = 12;

/// Parent offset stored in the root item.
pub const NO_PARENT: u32 = u32::MAX;

// Name field

/// Hash (u16) plus byte count (u8).
pub const NAME_PREFIX_SIZE: usize = 3;

/// Longest name that fits a one-byte name-field length.
pub const MAX_NAME_LEN: usize = u8::MAX as usize - NAME_PREFIX_SIZE;

// Value fields

/// Used-byte count in front of string and binary payloads.
pub const BYTES_PREFIX_SIZE: usize = 4;

/// Array prefix: element type (u8), 3 zero bytes, element size (u32).
pub const ARRAY_PREFIX_SIZE: usize = 8;

/// Offset of the element size inside the array prefix.
pub const ARRAY_OFF_ELEMENT_SIZE: usize = 4;

/// Deepest nesting accepted when validating imported bytes.
pub const MAX_IMPORT_DEPTH: usize = 512;
