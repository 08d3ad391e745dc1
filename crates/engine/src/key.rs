//! Fingerprints
//!
//! [`EngineKey`] identifies a requested artifact in memory: it is the join key
//! of the memory cache, the active registry and the job table. The disk tiers
//! use narrower keys: [`DataCacheKey`] addresses raw source data and
//! [`ResourceCacheKey`] a transformed resource.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use pixelflow_cache::{digest_str, DiskKey, ObjectKey, Sha256};

/// Name of a decoded resource type, e.g. `"bytes"` or `"image"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceType(&'static str);

impl ResourceType {
    /// Raw bytes, decoded by [`crate::BytesDecoder`].
    pub const BYTES: ResourceType = ResourceType("bytes");
    /// A file on disk; loads of this type only warm the data cache.
    pub const FILE: ResourceType = ResourceType("file");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Decoder options. Part of every key, so differing options never share a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style [`Options::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn update_digest(&self, digest: &mut Sha256) {
        for (name, value) in &self.0 {
            digest_str(digest, name);
            digest_str(digest, value);
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct EngineKeyInner {
    model: ObjectKey,
    signature: ObjectKey,
    width: u32,
    height: u32,
    transformations: BTreeMap<ResourceType, String>,
    resource_type: ResourceType,
    options: Options,
}

/// In-memory fingerprint of a load.
///
/// Cloning is cheap; equality and hashing are structural.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EngineKey(Arc<EngineKeyInner>);

impl EngineKey {
    pub fn new(
        model: ObjectKey,
        signature: ObjectKey,
        width: u32,
        height: u32,
        transformations: BTreeMap<ResourceType, String>,
        resource_type: ResourceType,
        options: Options,
    ) -> Self {
        Self(Arc::new(EngineKeyInner {
            model,
            signature,
            width,
            height,
            transformations,
            resource_type,
            options,
        }))
    }

    pub fn model(&self) -> &ObjectKey {
        &self.0.model
    }

    pub fn resource_type(&self) -> ResourceType {
        self.0.resource_type
    }
}

impl fmt::Debug for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineKey")
            .field("model", &self.0.model.as_str())
            .field("signature", &self.0.signature.as_str())
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("transformations", &self.0.transformations)
            .field("resource_type", &self.0.resource_type.name())
            .field("options", &self.0.options)
            .finish()
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}x{}:{}",
            self.0.model, self.0.width, self.0.height, self.0.resource_type
        )
    }
}

/// Disk key of unmodified source data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataCacheKey {
    source_key: ObjectKey,
    signature: ObjectKey,
}

impl DataCacheKey {
    pub fn new(source_key: ObjectKey, signature: ObjectKey) -> Self {
        Self {
            source_key,
            signature,
        }
    }

    pub fn source_key(&self) -> &ObjectKey {
        &self.source_key
    }
}

impl DiskKey for DataCacheKey {
    fn update_digest(&self, digest: &mut Sha256) {
        digest_str(digest, self.source_key.as_str());
        digest_str(digest, self.signature.as_str());
    }
}

/// Disk key of a decoded and transformed resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceCacheKey {
    source_key: ObjectKey,
    signature: ObjectKey,
    width: u32,
    height: u32,
    transformation: String,
    resource_type: ResourceType,
    options: Options,
}

impl ResourceCacheKey {
    pub fn new(
        source_key: ObjectKey,
        signature: ObjectKey,
        width: u32,
        height: u32,
        transformation: impl Into<String>,
        resource_type: ResourceType,
        options: Options,
    ) -> Self {
        Self {
            source_key,
            signature,
            width,
            height,
            transformation: transformation.into(),
            resource_type,
            options,
        }
    }
}

impl DiskKey for ResourceCacheKey {
    fn update_digest(&self, digest: &mut Sha256) {
        digest_str(digest, self.source_key.as_str());
        digest_str(digest, self.signature.as_str());
        digest_str(digest, &self.width.to_string());
        digest_str(digest, &self.height.to_string());
        digest_str(digest, &self.transformation);
        digest_str(digest, self.resource_type.name());
        self.options.update_digest(digest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(model: &str, width: u32) -> EngineKey {
        EngineKey::new(
            ObjectKey::new(model),
            ObjectKey::empty(),
            width,
            100,
            BTreeMap::new(),
            ResourceType::BYTES,
            Options::new(),
        )
    }

    #[test]
    fn test_engine_key_structural_equality() {
        assert_eq!(key("a", 100), key("a", 100));
        assert_ne!(key("a", 100), key("a", 200));
        assert_ne!(key("a", 100), key("b", 100));

        let set: HashSet<EngineKey> = [key("a", 100), key("a", 100), key("b", 100)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_engine_key_display() {
        assert_eq!(key("cat.png", 64).to_string(), "cat.png@64x100:bytes");
    }

    #[test]
    fn test_data_cache_key_includes_signature() {
        let a = DataCacheKey::new(ObjectKey::new("url"), ObjectKey::new("v1"));
        let b = DataCacheKey::new(ObjectKey::new("url"), ObjectKey::new("v2"));
        assert_ne!(a.safe_key(), b.safe_key());
        assert_eq!(
            a.safe_key(),
            DataCacheKey::new(ObjectKey::new("url"), ObjectKey::new("v1")).safe_key()
        );
    }

    #[test]
    fn test_resource_cache_key_distinguishes_every_field() {
        let base = || {
            ResourceCacheKey::new(
                ObjectKey::new("url"),
                ObjectKey::empty(),
                10,
                20,
                "blur",
                ResourceType::BYTES,
                Options::new(),
            )
        };
        let digests: HashSet<String> = [
            base(),
            ResourceCacheKey { width: 11, ..base() },
            ResourceCacheKey { height: 21, ..base() },
            ResourceCacheKey {
                transformation: "crop".into(),
                ..base()
            },
            ResourceCacheKey {
                resource_type: ResourceType::new("image"),
                ..base()
            },
            ResourceCacheKey {
                options: Options::new().with("format", "rgb"),
                ..base()
            },
        ]
        .iter()
        .map(|key| key.safe_key())
        .collect();
        assert_eq!(digests.len(), 6);
    }

    #[test]
    fn test_data_and_resource_keys_differ() {
        let data = DataCacheKey::new(ObjectKey::new("url"), ObjectKey::empty());
        let resource = ResourceCacheKey::new(
            ObjectKey::new("url"),
            ObjectKey::empty(),
            0,
            0,
            "",
            ResourceType::BYTES,
            Options::new(),
        );
        assert_ne!(data.safe_key(), resource.safe_key());
    }
}
