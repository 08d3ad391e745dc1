//! Pixelflow Engine Library
//!
//! Request-deduplicating resource loader. Concurrent requests for the same
//! key share one job; results are served from memory, from resources other
//! consumers still hold, from a disk cache of source data or of finished
//! results, and only then from the source itself.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use pixelflow_engine::{
//!     Engine, EngineResource, LoadError, LoadRequest, Model, Registry, ResourceCallback,
//!     ResourceType,
//! };
//! use pixelflow_cache::{DataSource, EngineConfig};
//!
//! struct Print {
//!     lock: Mutex<()>,
//! }
//!
//! impl ResourceCallback for Print {
//!     fn on_resource_ready(&self, resource: EngineResource, origin: DataSource, _: bool) {
//!         println!("{} bytes from {:?}", resource.size(), origin);
//!     }
//!
//!     fn on_load_failed(&self, error: Arc<LoadError>) {
//!         eprintln!("{}", error);
//!     }
//!
//!     fn lock(&self) -> &Mutex<()> {
//!         &self.lock
//!     }
//! }
//!
//! let engine = Engine::from_config(&EngineConfig::default(), Registry::new()).unwrap();
//! let request = LoadRequest::new(Model::File("photo.jpg".into()), ResourceType::BYTES, 0, 0);
//! let executor = engine.main_executor();
//! engine.load(request, Arc::new(Print { lock: Mutex::new(()) }), executor);
//! ```

mod active;
mod decode_job;
mod engine;
mod error;
mod fetcher;
mod generator;
mod helper;
mod job;
mod jobs;
mod key;
mod locked;
mod memory;
mod recycler;
mod registry;
mod request;
mod resource;

// Re-export public API
pub use active::{ActiveResources, ReclaimObserver};
pub use engine::{Engine, EngineBuilder, LoadStatus};
pub use error::{EngineError, FetchError, LoadError};
pub use fetcher::{
    Data, DataCallback, DataFetcher, DataType, FileFetcher, FileLoader, LoadData, Model,
    ModelLoader,
};
pub use job::ResourceCallback;
pub use key::{DataCacheKey, EngineKey, Options, ResourceCacheKey, ResourceType};
pub use locked::LockedResource;
pub use memory::{LruResourceCache, MemoryCache, ResourceRemovedListener};
pub use recycler::ResourceRecycler;
pub use registry::{
    BytesDecoder, BytesEncoder, DataEncoder, LoadPath, Registry, ResourceDecoder,
    ResourceEncoder, SourceEncoder, Transformation, Transformations,
};
pub use request::LoadRequest;
pub use resource::{BytesResource, EngineResource, Resource, ResourceListener};
