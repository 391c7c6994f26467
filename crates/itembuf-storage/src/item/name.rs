//! Optional name sub-field: hash (u16), byte count (u8), UTF-8 bytes.

use itembuf_buffer::BufferManager;
use itembuf_common::{Codec, Endianness, ItembufError, Result};

use super::constants::{HEADER_SIZE, MAX_NAME_LEN, NAME_PREFIX_SIZE};

/// Hashes a name for the stored 16-bit name hash.
///
/// CRC-32 folded to 16 bits. Stable across runs and platforms.
#[inline]
pub fn name_hash(name: &[u8]) -> u16 {
    let h = crc32fast::hash(name);
    ((h >> 16) ^ (h & 0xFFFF)) as u16
}

/// Rejects empty names and names too long for the name field.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ItembufError::InvalidName("empty name".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ItembufError::InvalidName(format!(
            "name is {} bytes, limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Bytes occupied by the name field for `name`.
#[inline]
pub fn name_field_len(name: Option<&str>) -> usize {
    name.map_or(0, |n| NAME_PREFIX_SIZE + n.len())
}

/// Appends the name field for `name` to `out`.
///
/// The caller must have checked the name with [`check_name`].
pub fn encode_name_field(name: &str, endianness: Endianness, out: &mut Vec<u8>) {
    let mut hash = [0u8; 2];
    name_hash(name.as_bytes()).encode(&mut hash, endianness);
    out.extend_from_slice(&hash);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

/// Raw name bytes and stored hash of the item at `offset`, or None if
/// the item is unnamed.
pub fn read_name_raw(
    mgr: &BufferManager,
    offset: usize,
    name_field_len: u8,
) -> Result<Option<(u16, &[u8])>> {
    let field_len = name_field_len as usize;
    if field_len == 0 {
        return Ok(None);
    }
    if field_len < NAME_PREFIX_SIZE {
        return Err(ItembufError::malformed(
            offset,
            format!("name field of {} bytes is shorter than its prefix", field_len),
        ));
    }
    let field = mgr.slice(offset + HEADER_SIZE, field_len)?;
    let hash = u16::decode(field, mgr.endianness())?;
    let len = field[2] as usize;
    if len > field_len - NAME_PREFIX_SIZE {
        return Err(ItembufError::malformed(
            offset,
            format!(
                "name of {} bytes overflows name field of {} bytes",
                len, field_len
            ),
        ));
    }
    Ok(Some((hash, &field[NAME_PREFIX_SIZE..NAME_PREFIX_SIZE + len])))
}

/// Decoded name of the item at `offset`.
pub fn read_name(mgr: &BufferManager, offset: usize, name_field_len: u8) -> Result<Option<String>> {
    match read_name_raw(mgr, offset, name_field_len)? {
        None => Ok(None),
        Some((_, bytes)) => std::str::from_utf8(bytes)
            .map(|s| Some(s.to_string()))
            .map_err(|_| ItembufError::InvalidUtf8 {
                offset: offset as u32,
            }),
    }
}

/// Returns true if the item at `offset` is named `name`.
///
/// Compares the stored hash first and only reads the bytes on a hash hit.
pub fn name_matches(
    mgr: &BufferManager,
    offset: usize,
    name_field_len: u8,
    name: &[u8],
    hash: u16,
) -> Result<bool> {
    match read_name_raw(mgr, offset, name_field_len)? {
        Some((stored, bytes)) => Ok(stored == hash && bytes == name),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itembuf_common::StoreConfig;

    fn manager_with_name(name: &str, endianness: Endianness) -> (BufferManager, u8) {
        let mut field = Vec::new();
        encode_name_field(name, endianness, &mut field);
        let config = StoreConfig::default().with_endianness(endianness);
        let mut mgr = BufferManager::new(config).unwrap();
        mgr.append(HEADER_SIZE + field.len()).unwrap();
        mgr.slice_mut(HEADER_SIZE, field.len())
            .unwrap()
            .copy_from_slice(&field);
        (mgr, field.len() as u8)
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = name_hash(b"count");
        let b = name_hash(b"count");
        assert_eq!(a, b);
        // Fixed value; a change here breaks every stored buffer
        let h = crc32fast::hash(b"count");
        assert_eq!(a, ((h >> 16) ^ (h & 0xFFFF)) as u16);
        assert_ne!(name_hash(b"count"), name_hash(b"tags"));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("a").is_ok());
        assert!(check_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(
            check_name(""),
            Err(ItembufError::InvalidName(_))
        ));
        assert!(matches!(
            check_name(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(ItembufError::InvalidName(_))
        ));
    }

    #[test]
    fn test_name_field_len() {
        assert_eq!(name_field_len(None), 0);
        assert_eq!(name_field_len(Some("tags")), 7);
    }

    #[test]
    fn test_encode_and_read_name() {
        for endianness in [Endianness::Little, Endianness::Big] {
            let (mgr, field_len) = manager_with_name("größe", endianness);
            assert_eq!(field_len as usize, 3 + "größe".len());
            assert_eq!(
                read_name(&mgr, 0, field_len).unwrap().as_deref(),
                Some("größe")
            );

            let (hash, bytes) = read_name_raw(&mgr, 0, field_len).unwrap().unwrap();
            assert_eq!(hash, name_hash("größe".as_bytes()));
            assert_eq!(bytes, "größe".as_bytes());
        }
    }

    #[test]
    fn test_unnamed_item() {
        let (mgr, _) = manager_with_name("x", Endianness::Little);
        assert_eq!(read_name(&mgr, 0, 0).unwrap(), None);
        assert!(!name_matches(&mgr, 0, 0, b"x", name_hash(b"x")).unwrap());
    }

    #[test]
    fn test_name_matches_requires_hash_and_bytes() {
        let (mgr, field_len) = manager_with_name("count", Endianness::Little);
        let hash = name_hash(b"count");
        assert!(name_matches(&mgr, 0, field_len, b"count", hash).unwrap());
        // Same hash, different bytes
        assert!(!name_matches(&mgr, 0, field_len, b"cound", hash).unwrap());
        // Same bytes, different hash
        assert!(!name_matches(&mgr, 0, field_len, b"count", hash ^ 1).unwrap());
    }

    #[test]
    fn test_name_len_overflowing_field_is_malformed() {
        let (mut mgr, field_len) = manager_with_name("abc", Endianness::Little);
        mgr.slice_mut(HEADER_SIZE + 2, 1).unwrap()[0] = 200;
        let err = read_name(&mgr, 0, field_len).unwrap_err();
        assert!(matches!(err, ItembufError::MalformedBuffer { .. }));
    }

    #[test]
    fn test_short_name_field_is_malformed() {
        let (mgr, _) = manager_with_name("abc", Endianness::Little);
        assert!(read_name(&mgr, 0, 2).is_err());
    }

    #[test]
    fn test_invalid_utf8_name() {
        let (mut mgr, field_len) = manager_with_name("ab", Endianness::Little);
        mgr.slice_mut(HEADER_SIZE + 3, 1).unwrap()[0] = 0xFF;
        assert!(matches!(
            read_name(&mgr, 0, field_len),
            Err(ItembufError::InvalidUtf8 { offset: 0 })
        ));
    }
}
