//! Stable digests for disk cache keys
//!
//! Disk cache entries are content addressed: every key feeds its identifying
//! fields into a SHA-256 digest and the hex encoded digest becomes the file name.
//! Fields are length prefixed so that adjacent fields can never alias.

use sha2::{Digest, Sha256};
use std::fmt;

/// A key that can address an entry in a disk cache.
pub trait DiskKey: fmt::Debug + Send + Sync {
    /// Feed every identifying field of this key into `digest`.
    fn update_digest(&self, digest: &mut Sha256);

    /// Hex encoded SHA-256 of the key, safe to use as a file name.
    fn safe_key(&self) -> String {
        let mut digest = Sha256::new();
        self.update_digest(&mut digest);
        hex::encode(digest.finalize())
    }
}

/// Write a length-prefixed string into a digest.
pub fn digest_str(digest: &mut Sha256, value: &str) {
    digest_bytes(digest, value.as_bytes());
}

/// Write length-prefixed bytes into a digest.
pub fn digest_bytes(digest: &mut Sha256, value: &[u8]) {
    digest.update((value.len() as u64).to_le_bytes());
    digest.update(value);
}

/// A key identified by a single opaque string, such as a URL or a version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Create a key from any string-like identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The empty signature, used when a load carries no version information.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// The identity string of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl DiskKey for ObjectKey {
    fn update_digest(&self, digest: &mut Sha256) {
        digest_str(digest, &self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Pair(&'static str, &'static str);

    impl DiskKey for Pair {
        fn update_digest(&self, digest: &mut Sha256) {
            digest_str(digest, self.0);
            digest_str(digest, self.1);
        }
    }

    #[test]
    fn test_safe_key_is_stable_hex() {
        let key = ObjectKey::new("https://example.com/a.png");
        let first = key.safe_key();
        assert_eq!(first, key.safe_key());
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinct_keys_have_distinct_digests() {
        assert_ne!(ObjectKey::new("a").safe_key(), ObjectKey::new("b").safe_key());
    }

    #[test]
    fn test_length_prefix_prevents_aliasing() {
        assert_ne!(Pair("ab", "c").safe_key(), Pair("a", "bc").safe_key());
    }

    #[test]
    fn test_empty_signature() {
        assert_eq!(ObjectKey::empty().as_str(), "");
        assert_eq!(ObjectKey::empty(), ObjectKey::new(""));
    }
}
