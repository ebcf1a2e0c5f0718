use crate::error::{Error, Result};
use crate::shm::codec::pad_key;
use crate::shm::layout::MAX_KEY_LEN;

/// A sanitized cache key.
///
/// Keys are short byte strings. Anything longer than `MAX_KEY_LEN` is
/// truncated to the stored width; empty keys and keys containing spaces or
/// control bytes are rejected, since the on-segment key field is space
/// padded and compared on trimmed content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    bytes: Vec<u8>,
}

impl CacheKey {
    pub fn new(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::BadKey);
        }
        let bytes = &raw[..raw.len().min(MAX_KEY_LEN)];
        if bytes.iter().any(|&b| b <= b' ' || b == 0x7f) {
            return Err(Error::BadKey);
        }
        Ok(CacheKey {
            bytes: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The key as stored on the segment: space padded to fixed width.
    pub fn padded(&self) -> [u8; MAX_KEY_LEN] {
        pad_key(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_keys() {
        let key = CacheKey::new(b"user:42:profile").unwrap();
        assert_eq!(key.as_bytes(), b"user:42:profile");
    }

    #[test]
    fn rejects_empty_spaces_and_control_bytes() {
        assert!(CacheKey::new(b"").is_err());
        assert!(CacheKey::new(b"has space").is_err());
        assert!(CacheKey::new(b"tab\there").is_err());
        assert!(CacheKey::new(b"nul\0byte").is_err());
        assert!(CacheKey::new(b"del\x7fbyte").is_err());
    }

    #[test]
    fn truncates_to_stored_width() {
        let long = vec![b'x'; MAX_KEY_LEN + 100];
        let key = CacheKey::new(&long).unwrap();
        assert_eq!(key.as_bytes().len(), MAX_KEY_LEN);
    }

    #[test]
    fn padded_fills_with_spaces() {
        let key = CacheKey::new(b"abc").unwrap();
        let padded = key.padded();
        assert_eq!(&padded[..3], b"abc");
        assert!(padded[3..].iter().all(|&b| b == b' '));
    }
}
