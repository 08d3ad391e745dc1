//! Fetch contracts
//!
//! A [`ModelLoader`] turns a model (what the caller asked for) into
//! [`LoadData`]: the keys the data is cached under and a [`DataFetcher`] that
//! obtains it. Fetchers may complete synchronously on the calling thread or
//! later on a thread of their own.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pixelflow_cache::{DataSource, ObjectKey};
use pixelflow_scheduler::Priority;

use crate::error::FetchError;
use crate::key::Options;

/// Raw data produced by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

impl Data {
    pub fn data_type(&self) -> DataType {
        match self {
            Data::Bytes(_) => DataType::Bytes,
            Data::File(_) => DataType::File,
        }
    }

    /// Read the whole content into memory.
    pub fn read_bytes(&self) -> io::Result<Arc<[u8]>> {
        match self {
            Data::Bytes(bytes) => Ok(bytes.clone()),
            Data::File(path) => Ok(fs::read(path)?.into()),
        }
    }

    /// Write the content to `file`.
    pub fn write_to(&self, file: &Path) -> io::Result<()> {
        match self {
            Data::Bytes(bytes) => fs::write(file, bytes),
            Data::File(path) => fs::copy(path, file).map(|_| ()),
        }
    }
}

/// Shape of the data a fetcher produces; selects the decoders that can read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bytes,
    File,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bytes => f.write_str("bytes"),
            DataType::File => f.write_str("file"),
        }
    }
}

/// What a load asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Model {
    /// Anything addressed by a URI; resolved by registered model loaders.
    Uri(String),
    File(PathBuf),
}

impl Model {
    /// Identity of the model inside engine keys.
    pub fn cache_key(&self) -> ObjectKey {
        match self {
            Model::Uri(uri) => ObjectKey::new(uri.as_str()),
            Model::File(path) => ObjectKey::new(path.to_string_lossy()),
        }
    }
}

/// Receives the outcome of [`DataFetcher::load_data`] exactly once.
pub type DataCallback = Box<dyn FnOnce(Result<Data, FetchError>) + Send>;

/// Obtains raw data for one candidate.
pub trait DataFetcher: Send + Sync {
    /// Start fetching. `callback` may run before this returns or later on any thread.
    fn load_data(&self, priority: Priority, callback: DataCallback);

    /// Release anything held after the data has been consumed.
    fn cleanup(&self) {}

    /// Best effort cancellation; may be called from any thread.
    fn cancel(&self) {}

    fn data_type(&self) -> DataType;

    /// Where the data comes from.
    fn data_source(&self) -> DataSource;
}

/// One candidate way of loading a model.
pub struct LoadData {
    pub source_key: ObjectKey,
    /// Other keys the same data may be cached under.
    pub alternate_keys: Vec<ObjectKey>,
    pub fetcher: Arc<dyn DataFetcher>,
}

impl LoadData {
    pub fn new(source_key: ObjectKey, fetcher: Arc<dyn DataFetcher>) -> Self {
        Self {
            source_key,
            alternate_keys: Vec::new(),
            fetcher,
        }
    }

    pub fn with_alternate_keys(mut self, alternate_keys: Vec<ObjectKey>) -> Self {
        self.alternate_keys = alternate_keys;
        self
    }
}

impl fmt::Debug for LoadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadData")
            .field("source_key", &self.source_key)
            .field("alternate_keys", &self.alternate_keys)
            .field("data_type", &self.fetcher.data_type())
            .field("data_source", &self.fetcher.data_source())
            .finish()
    }
}

/// Produces load candidates for the models it handles.
pub trait ModelLoader: Send + Sync {
    fn handles(&self, model: &Model) -> bool;

    /// A candidate for `model`, or `None` if this loader cannot load it after all.
    fn build_load_data(
        &self,
        model: &Model,
        width: u32,
        height: u32,
        options: &Options,
    ) -> Option<LoadData>;
}

/// Loads [`Model::File`] models, including files found in the disk cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl ModelLoader for FileLoader {
    fn handles(&self, model: &Model) -> bool {
        matches!(model, Model::File(_))
    }

    fn build_load_data(
        &self,
        model: &Model,
        _width: u32,
        _height: u32,
        _options: &Options,
    ) -> Option<LoadData> {
        match model {
            Model::File(path) => Some(LoadData::new(
                model.cache_key(),
                Arc::new(FileFetcher::new(path.clone())),
            )),
            Model::Uri(_) => None,
        }
    }
}

/// Hands out a local file without reading it.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DataFetcher for FileFetcher {
    fn load_data(&self, _priority: Priority, callback: DataCallback) {
        if self.path.is_file() {
            callback(Ok(Data::File(self.path.clone())));
        } else {
            callback(Err(FetchError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a file", self.path.display()),
            ))));
        }
    }

    fn data_type(&self) -> DataType {
        DataType::File
    }

    fn data_source(&self) -> DataSource {
        DataSource::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn fetch(fetcher: &dyn DataFetcher) -> Result<Data, FetchError> {
        let (tx, rx) = mpsc::channel();
        fetcher.load_data(
            Priority::Normal,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        rx.try_recv().unwrap()
    }

    #[test]
    fn test_file_loader_handles_only_files() {
        let loader = FileLoader;
        assert!(loader.handles(&Model::File(PathBuf::from("/tmp/x"))));
        assert!(!loader.handles(&Model::Uri("https://example.com".into())));
        assert!(loader
            .build_load_data(&Model::Uri("u".into()), 0, 0, &Options::new())
            .is_none());
    }

    #[test]
    fn test_file_fetcher_reports_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.bin");
        fs::write(&path, b"hello").unwrap();

        let load_data = FileLoader
            .build_load_data(&Model::File(path.clone()), 0, 0, &Options::new())
            .unwrap();
        assert_eq!(load_data.fetcher.data_source(), DataSource::Local);
        assert_eq!(load_data.fetcher.data_type(), DataType::File);

        let data = fetch(load_data.fetcher.as_ref()).unwrap();
        assert_eq!(data, Data::File(path));
        assert_eq!(&*data.read_bytes().unwrap(), b"hello");
    }

    #[test]
    fn test_file_fetcher_missing_file_fails() {
        let fetcher = FileFetcher::new(PathBuf::from("/definitely/not/here.bin"));
        assert!(matches!(fetch(&fetcher), Err(FetchError::Io(_))));
    }

    #[test]
    fn test_data_write_to() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("copy.bin");
        Data::Bytes(Arc::from(&b"abc"[..])).write_to(&target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"abc");

        let second = dir.path().join("second.bin");
        Data::File(target).write_to(&second).unwrap();
        assert_eq!(fs::read(&second).unwrap(), b"abc");
    }

    #[test]
    fn test_model_cache_key() {
        assert_eq!(
            Model::Uri("https://example.com/a.png".into()).cache_key(),
            ObjectKey::new("https://example.com/a.png")
        );
        assert_eq!(Data::Bytes(Arc::from(&b""[..])).data_type(), DataType::Bytes);
    }
}
