//! Component registry
//!
//! A lookup table from models, data types and resource types to the loaders,
//! decoders and encoders that handle them. The engine only queries it; the
//! application fills it in before building the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use pixelflow_cache::EncodeStrategy;
use tracing::trace;

use crate::error::{FetchError, LoadError};
use crate::fetcher::{Data, DataType, FileLoader, Model, ModelLoader};
use crate::key::{Options, ResourceType};
use crate::resource::{BytesResource, Resource};

/// Decodes data of one type into resources of one type.
pub trait ResourceDecoder: Send + Sync {
    /// Returns false to decline `data` at runtime, e.g. after sniffing a header.
    fn handles(&self, data: &Data, options: &Options) -> bool;

    /// Decode `data`. `Ok(None)` means the decoder gave up without an error.
    fn decode(
        &self,
        data: &Data,
        width: u32,
        height: u32,
        options: &Options,
    ) -> Result<Option<Arc<dyn Resource>>, FetchError>;
}

/// Persists decoded resources to the disk cache.
pub trait ResourceEncoder: Send + Sync {
    fn encode_strategy(&self, options: &Options) -> EncodeStrategy;

    /// Write `resource` into `file`. Returning `Ok(false)` discards the entry.
    fn encode(&self, resource: &dyn Resource, file: &Path, options: &Options) -> io::Result<bool>;
}

/// Persists raw fetched data to the disk cache.
pub trait SourceEncoder: Send + Sync {
    fn encode(&self, data: &Data, file: &Path, options: &Options) -> io::Result<bool>;
}

/// A transformation applied to freshly decoded resources.
pub trait Transformation: Send + Sync {
    /// Stable id; part of the resource disk cache key.
    fn id(&self) -> &str;

    /// Transform `resource`. Returning the same `Arc` means nothing changed.
    fn transform(
        &self,
        resource: Arc<dyn Resource>,
        width: u32,
        height: u32,
    ) -> Result<Arc<dyn Resource>, FetchError>;
}

/// Transformations of a request, keyed by the resource type they apply to.
#[derive(Clone, Default)]
pub struct Transformations(BTreeMap<ResourceType, Arc<dyn Transformation>>);

impl Transformations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        resource_type: ResourceType,
        transformation: Arc<dyn Transformation>,
    ) -> Self {
        self.0.insert(resource_type, transformation);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<&Arc<dyn Transformation>> {
        self.0.get(&resource_type)
    }

    /// Transformation ids, the part of the transformations that keys depend on.
    pub fn ids(&self) -> BTreeMap<ResourceType, String> {
        self.0
            .iter()
            .map(|(resource_type, transformation)| {
                (*resource_type, transformation.id().to_string())
            })
            .collect()
    }
}

impl fmt::Debug for Transformations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.ids()).finish()
    }
}

struct DecoderEntry {
    data_type: DataType,
    resource_type: ResourceType,
    decoder: Arc<dyn ResourceDecoder>,
}

/// Every decoder that can turn one data type into one resource type.
pub struct LoadPath {
    data_type: DataType,
    resource_type: ResourceType,
    decoders: Vec<Arc<dyn ResourceDecoder>>,
}

impl LoadPath {
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Try each decoder that accepts `data`, in registration order.
    ///
    /// Fails with an aggregate of every decoder failure if none produced a resource.
    pub fn load(
        &self,
        data: &Data,
        width: u32,
        height: u32,
        options: &Options,
    ) -> Result<Arc<dyn Resource>, FetchError> {
        let mut causes = Vec::new();
        for decoder in &self.decoders {
            if !decoder.handles(data, options) {
                continue;
            }
            match decoder.decode(data, width, height, options) {
                Ok(Some(resource)) => return Ok(resource),
                Ok(None) => {}
                Err(e) => {
                    trace!(error = %e, "Decoder failed");
                    causes.push(e);
                }
            }
        }
        Err(LoadError::new(
            format!(
                "Failed LoadPath{{{}->{}}}",
                self.data_type, self.resource_type
            ),
            causes,
        )
        .into())
    }
}

/// Lookup table of loaders, decoders and encoders.
pub struct Registry {
    model_loaders: Vec<Arc<dyn ModelLoader>>,
    decoders: Vec<DecoderEntry>,
    encoders: Vec<(ResourceType, Arc<dyn ResourceEncoder>)>,
    source_encoders: Vec<(DataType, Arc<dyn SourceEncoder>)>,
}

impl Registry {
    /// A registry with only the built-in components: the file loader, the
    /// bytes decoder and encoder, and raw data encoders.
    pub fn new() -> Self {
        let data_encoder: Arc<dyn SourceEncoder> = Arc::new(DataEncoder);
        Self::empty()
            .append_model_loader(Arc::new(FileLoader))
            .append_decoder(DataType::Bytes, ResourceType::BYTES, Arc::new(BytesDecoder))
            .append_decoder(DataType::File, ResourceType::BYTES, Arc::new(BytesDecoder))
            .register_encoder(ResourceType::BYTES, Arc::new(BytesEncoder))
            .register_source_encoder(DataType::Bytes, data_encoder.clone())
            .register_source_encoder(DataType::File, data_encoder)
    }

    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            model_loaders: Vec::new(),
            decoders: Vec::new(),
            encoders: Vec::new(),
            source_encoders: Vec::new(),
        }
    }

    pub fn append_model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.model_loaders.push(loader);
        self
    }

    /// Add a model loader ahead of every loader registered so far.
    pub fn prepend_model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.model_loaders.insert(0, loader);
        self
    }

    pub fn append_decoder(
        mut self,
        data_type: DataType,
        resource_type: ResourceType,
        decoder: Arc<dyn ResourceDecoder>,
    ) -> Self {
        self.decoders.push(DecoderEntry {
            data_type,
            resource_type,
            decoder,
        });
        self
    }

    /// Add a decoder that is tried before the ones registered so far.
    pub fn prepend_decoder(
        mut self,
        data_type: DataType,
        resource_type: ResourceType,
        decoder: Arc<dyn ResourceDecoder>,
    ) -> Self {
        self.decoders.insert(
            0,
            DecoderEntry {
                data_type,
                resource_type,
                decoder,
            },
        );
        self
    }

    /// Set the encoder for a resource type, replacing any previous one.
    pub fn register_encoder(
        mut self,
        resource_type: ResourceType,
        encoder: Arc<dyn ResourceEncoder>,
    ) -> Self {
        self.encoders.retain(|(registered, _)| *registered != resource_type);
        self.encoders.push((resource_type, encoder));
        self
    }

    /// Set the raw data encoder for a data type, replacing any previous one.
    pub fn register_source_encoder(
        mut self,
        data_type: DataType,
        encoder: Arc<dyn SourceEncoder>,
    ) -> Self {
        self.source_encoders.retain(|(registered, _)| *registered != data_type);
        self.source_encoders.push((data_type, encoder));
        self
    }

    /// Loaders that handle `model`, in registration order.
    pub fn model_loaders(&self, model: &Model) -> Vec<Arc<dyn ModelLoader>> {
        self.model_loaders
            .iter()
            .filter(|loader| loader.handles(model))
            .cloned()
            .collect()
    }

    /// The decoders from `data_type` to `resource_type`, if there are any.
    pub fn load_path(&self, data_type: DataType, resource_type: ResourceType) -> Option<LoadPath> {
        let decoders: Vec<_> = self
            .decoders
            .iter()
            .filter(|entry| entry.data_type == data_type && entry.resource_type == resource_type)
            .map(|entry| entry.decoder.clone())
            .collect();
        (!decoders.is_empty()).then_some(LoadPath {
            data_type,
            resource_type,
            decoders,
        })
    }

    /// Resource types a load of `resource_type` may find in the resource disk cache.
    pub fn registered_resource_types(&self, resource_type: ResourceType) -> Vec<ResourceType> {
        if self
            .decoders
            .iter()
            .any(|entry| entry.resource_type == resource_type)
        {
            vec![resource_type]
        } else {
            Vec::new()
        }
    }

    pub fn result_encoder(&self, resource_type: ResourceType) -> Option<Arc<dyn ResourceEncoder>> {
        self.encoders
            .iter()
            .find(|(registered, _)| *registered == resource_type)
            .map(|(_, encoder)| encoder.clone())
    }

    pub fn source_encoder(&self, data_type: DataType) -> Option<Arc<dyn SourceEncoder>> {
        self.source_encoders
            .iter()
            .find(|(registered, _)| *registered == data_type)
            .map(|(_, encoder)| encoder.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes any data into a [`BytesResource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesDecoder;

impl ResourceDecoder for BytesDecoder {
    fn handles(&self, _data: &Data, _options: &Options) -> bool {
        true
    }

    fn decode(
        &self,
        data: &Data,
        _width: u32,
        _height: u32,
        _options: &Options,
    ) -> Result<Option<Arc<dyn Resource>>, FetchError> {
        Ok(Some(Arc::new(BytesResource::new(data.read_bytes()?))))
    }
}

/// Writes a [`BytesResource`] to disk unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesEncoder;

impl ResourceEncoder for BytesEncoder {
    fn encode_strategy(&self, _options: &Options) -> EncodeStrategy {
        EncodeStrategy::Transformed
    }

    fn encode(&self, resource: &dyn Resource, file: &Path, _options: &Options) -> io::Result<bool> {
        match resource.downcast_ref::<BytesResource>() {
            Some(bytes) => {
                std::fs::write(file, bytes.bytes())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Writes raw data to disk unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataEncoder;

impl SourceEncoder for DataEncoder {
    fn encode(&self, data: &Data, file: &Path, _options: &Options) -> io::Result<bool> {
        data.write_to(file)?;
        Ok(true)
    }
}
