//! Disk cache strategies
//!
//! A strategy decides, for every candidate piece of data flowing through the
//! decode pipeline, whether the raw bytes and/or the transformed resource are
//! worth persisting, and whether the pipeline should look in each disk cache
//! tier before going to the original source. All decisions are pure and cheap.

use serde::{Deserialize, Serialize};

/// Where a piece of data or a resource was obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Data on the device, e.g. a local file or a bundled asset.
    Local,
    /// Data fetched from somewhere other than the device.
    Remote,
    /// Unmodified data read back from the raw data disk cache.
    DataDiskCache,
    /// Transformed data read back from the resource disk cache.
    ResourceDiskCache,
    /// Resource served from the in-memory cache.
    MemoryCache,
}

/// How an encoder persists a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeStrategy {
    /// Writes the original unmodified data.
    Source,
    /// Writes the decoded, transformed resource.
    Transformed,
    /// Nothing is written.
    None,
}

/// Caching policy applied to a single load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskCacheStrategy {
    /// Cache remote data as raw bytes and as transformed resources; local data as resources only.
    All,
    /// Persist nothing.
    None,
    /// Persist raw data only.
    Data,
    /// Persist transformed resources only.
    Resource,
    /// Cache raw data for remote origins and transformed resources for local data.
    #[default]
    Automatic,
}

impl DiskCacheStrategy {
    /// All policies, in declaration order.
    pub const ALL_STRATEGIES: [DiskCacheStrategy; 5] = [
        DiskCacheStrategy::All,
        DiskCacheStrategy::None,
        DiskCacheStrategy::Data,
        DiskCacheStrategy::Resource,
        DiskCacheStrategy::Automatic,
    ];

    /// Returns true if unmodified data from `source` should be written to the data cache.
    pub fn is_data_cacheable(&self, source: DataSource) -> bool {
        match self {
            DiskCacheStrategy::All | DiskCacheStrategy::Automatic => source == DataSource::Remote,
            DiskCacheStrategy::None | DiskCacheStrategy::Resource => false,
            DiskCacheStrategy::Data => {
                source != DataSource::DataDiskCache && source != DataSource::MemoryCache
            }
        }
    }

    /// Returns true if a transformed resource should be written to the resource cache.
    ///
    /// # Arguments
    ///
    /// * `is_from_alternate_key` - The data was found under one of the alternate source keys
    /// * `source` - Where the data the resource was decoded from came from
    /// * `encode_strategy` - How the encoder for the resource would persist it
    pub fn is_resource_cacheable(
        &self,
        is_from_alternate_key: bool,
        source: DataSource,
        encode_strategy: EncodeStrategy,
    ) -> bool {
        match self {
            DiskCacheStrategy::All | DiskCacheStrategy::Resource => {
                source != DataSource::ResourceDiskCache && source != DataSource::MemoryCache
            }
            DiskCacheStrategy::None | DiskCacheStrategy::Data => false,
            DiskCacheStrategy::Automatic => {
                ((is_from_alternate_key && source == DataSource::DataDiskCache)
                    || source == DataSource::Local)
                    && encode_strategy == EncodeStrategy::Transformed
            }
        }
    }

    /// Returns true if the pipeline should try the resource disk cache.
    pub fn decode_cached_resource(&self) -> bool {
        matches!(
            self,
            DiskCacheStrategy::All | DiskCacheStrategy::Resource | DiskCacheStrategy::Automatic
        )
    }

    /// Returns true if the pipeline should try the data disk cache.
    pub fn decode_cached_data(&self) -> bool {
        matches!(
            self,
            DiskCacheStrategy::All | DiskCacheStrategy::Data | DiskCacheStrategy::Automatic
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use DataSource::*;

    const SOURCES: [DataSource; 5] = [Local, Remote, DataDiskCache, ResourceDiskCache, MemoryCache];

    #[rstest]
    #[case(DiskCacheStrategy::All, [false, true, false, false, false])]
    #[case(DiskCacheStrategy::None, [false, false, false, false, false])]
    #[case(DiskCacheStrategy::Data, [true, true, false, true, false])]
    #[case(DiskCacheStrategy::Resource, [false, false, false, false, false])]
    #[case(DiskCacheStrategy::Automatic, [false, true, false, false, false])]
    fn test_is_data_cacheable(#[case] strategy: DiskCacheStrategy, #[case] expected: [bool; 5]) {
        for (source, expected) in SOURCES.iter().zip(expected) {
            assert_eq!(
                strategy.is_data_cacheable(*source),
                expected,
                "{:?} / {:?}",
                strategy,
                source
            );
        }
    }

    // Independent of the alternate key flag and encode strategy.
    #[rstest]
    #[case(DiskCacheStrategy::All, [true, true, true, false, false])]
    #[case(DiskCacheStrategy::None, [false, false, false, false, false])]
    #[case(DiskCacheStrategy::Data, [false, false, false, false, false])]
    #[case(DiskCacheStrategy::Resource, [true, true, true, false, false])]
    fn test_is_resource_cacheable_fixed_policies(
        #[case] strategy: DiskCacheStrategy,
        #[case] expected: [bool; 5],
    ) {
        for alternate in [false, true] {
            for encode in [EncodeStrategy::Source, EncodeStrategy::Transformed, EncodeStrategy::None] {
                for (source, expected) in SOURCES.iter().zip(expected) {
                    assert_eq!(
                        strategy.is_resource_cacheable(alternate, *source, encode),
                        expected,
                        "{:?} / {:?} / {:?} / alternate={}",
                        strategy,
                        source,
                        encode,
                        alternate
                    );
                }
            }
        }
    }

    #[rstest]
    #[case(false, Local, EncodeStrategy::Transformed, true)]
    #[case(true, Local, EncodeStrategy::Transformed, true)]
    #[case(false, Local, EncodeStrategy::Source, false)]
    #[case(false, Local, EncodeStrategy::None, false)]
    #[case(false, Remote, EncodeStrategy::Transformed, false)]
    #[case(true, Remote, EncodeStrategy::Transformed, false)]
    #[case(true, DataDiskCache, EncodeStrategy::Transformed, true)]
    #[case(false, DataDiskCache, EncodeStrategy::Transformed, false)]
    #[case(true, DataDiskCache, EncodeStrategy::Source, false)]
    #[case(true, ResourceDiskCache, EncodeStrategy::Transformed, false)]
    #[case(true, MemoryCache, EncodeStrategy::Transformed, false)]
    fn test_automatic_is_resource_cacheable(
        #[case] alternate: bool,
        #[case] source: DataSource,
        #[case] encode: EncodeStrategy,
        #[case] expected: bool,
    ) {
        assert_eq!(
            DiskCacheStrategy::Automatic.is_resource_cacheable(alternate, source, encode),
            expected
        );
    }

    #[rstest]
    #[case(DiskCacheStrategy::All, true, true)]
    #[case(DiskCacheStrategy::None, false, false)]
    #[case(DiskCacheStrategy::Data, false, true)]
    #[case(DiskCacheStrategy::Resource, true, false)]
    #[case(DiskCacheStrategy::Automatic, true, true)]
    fn test_decode_cached_tiers(
        #[case] strategy: DiskCacheStrategy,
        #[case] resource: bool,
        #[case] data: bool,
    ) {
        assert_eq!(strategy.decode_cached_resource(), resource);
        assert_eq!(strategy.decode_cached_data(), data);
    }

    #[test]
    fn test_default_is_automatic() {
        assert_eq!(DiskCacheStrategy::default(), DiskCacheStrategy::Automatic);
    }

    #[test]
    fn test_strategy_names_round_trip_through_toml() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            strategy: DiskCacheStrategy,
        }

        let parsed: Holder = toml::from_str("strategy = \"resource\"").unwrap();
        assert_eq!(parsed.strategy, DiskCacheStrategy::Resource);
    }
}
