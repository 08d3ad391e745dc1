//! Persistent disk cache with content-addressed storage and LRU eviction.
//!
//! Entries are files named after the hex digest of their [`DiskKey`]. Writers
//! produce a temporary file which is renamed into place only after the writer
//! reports success, so readers never observe a partially written entry.
//! Writers for the same key are serialized; different keys proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::key::DiskKey;

const ENTRY_EXTENSION: &str = "bin";
const TEMP_EXTENSION: &str = "tmp";

/// Errors produced while writing a disk cache entry.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    /// The writer or the file system failed.
    #[error("disk cache I/O error: {0}")]
    Io(#[from] io::Error),
    /// The writer declined to produce an entry.
    #[error("writer did not produce an entry for {0}")]
    NotWritten(String),
}

/// Produces the content of a new disk cache entry.
pub trait DiskWriter {
    /// Write the entry into `file`. Returning `Ok(false)` discards the entry.
    fn write(&mut self, file: &Path) -> io::Result<bool>;
}

impl<F> DiskWriter for F
where
    F: FnMut(&Path) -> io::Result<bool>,
{
    fn write(&mut self, file: &Path) -> io::Result<bool> {
        self(file)
    }
}

/// Disk cache contract used by the decode pipeline.
///
/// Implementations must be safe to share between jobs; writes are atomic per key.
pub trait DiskCache: Send + Sync {
    /// Path of the cached file for `key`, if present.
    fn get(&self, key: &dyn DiskKey) -> Option<PathBuf>;

    /// Write a new entry for `key`. An existing entry is kept and the writer is not called.
    fn put(&self, key: &dyn DiskKey, writer: &mut dyn DiskWriter) -> Result<(), DiskCacheError>;

    /// Remove the entry for `key`, if any.
    fn delete(&self, key: &dyn DiskKey);

    /// Remove every entry.
    fn clear(&self);
}

/// Statistics for monitoring disk cache performance
#[derive(Debug, Clone, Default)]
pub struct DiskCacheStats {
    /// Number of cache hits (successful retrievals)
    pub hits: u64,
    /// Number of cache misses (failed retrievals)
    pub misses: u64,
    /// Number of entries evicted to free space
    pub evictions: u64,
    /// Number of entries written
    pub writes: u64,
    /// Total number of entries in cache
    pub entry_count: usize,
    /// Total disk space used in bytes
    pub disk_used: usize,
}

impl DiskCacheStats {
    /// Calculate cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate disk utilization (0.0 to 1.0)
    pub fn disk_utilization(&self, limit: usize) -> f64 {
        if limit == 0 {
            0.0
        } else {
            self.disk_used as f64 / limit as f64
        }
    }
}

struct EntryMeta {
    path: PathBuf,
    size: usize,
    tick: u64,
}

/// Internal cache state
struct CacheState {
    /// Map of digests to cached files
    entries: HashMap<String, EntryMeta>,
    /// Recency order: smallest tick is least recently used
    order: BTreeMap<u64, String>,
    next_tick: u64,
    stats: DiskCacheStats,
    /// Disk space limit in bytes
    disk_limit: usize,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Mark an entry as recently used
    fn touch(&mut self, name: &str) {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(name) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, name.to_string());
        }
    }

    fn insert(&mut self, name: String, path: PathBuf, size: usize) {
        let tick = self.tick();
        self.order.insert(tick, name.clone());
        self.entries.insert(name, EntryMeta { path, size, tick });
        self.stats.entry_count = self.entries.len();
        self.stats.disk_used += size;
    }

    fn forget(&mut self, name: &str) -> Option<EntryMeta> {
        let entry = self.entries.remove(name)?;
        self.order.remove(&entry.tick);
        self.stats.entry_count = self.entries.len();
        self.stats.disk_used = self.stats.disk_used.saturating_sub(entry.size);
        Some(entry)
    }

    /// Evict least recently used entries until usage fits in the limit
    fn evict_to_limit(&mut self) {
        while self.stats.disk_used > self.disk_limit {
            let Some((_, name)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&name) {
                remove_file_quietly(&entry.path);
                self.stats.disk_used = self.stats.disk_used.saturating_sub(entry.size);
                self.stats.evictions += 1;
                trace!(key = %name, size = entry.size, "Evicted disk cache entry");
            }
        }
        self.stats.entry_count = self.entries.len();
    }
}

struct WriteLock {
    lock: Arc<Mutex<()>>,
    interested: usize,
}

/// Hands out one mutex per key currently being written.
#[derive(Default)]
struct WriteLocker {
    locks: Mutex<HashMap<String, WriteLock>>,
}

impl WriteLocker {
    fn acquire(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        let entry = locks.entry(name.to_string()).or_insert_with(|| WriteLock {
            lock: Arc::new(Mutex::new(())),
            interested: 0,
        });
        entry.interested += 1;
        entry.lock.clone()
    }

    fn release(&self, name: &str) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get_mut(name) {
            entry.interested -= 1;
            if entry.interested == 0 {
                locks.remove(name);
            }
        }
    }
}

/// File-backed disk cache bounded by a byte limit
///
/// Thread-safe for concurrent access from multiple jobs.
pub struct DiskLruCache {
    cache_dir: PathBuf,
    state: Mutex<CacheState>,
    write_locker: WriteLocker,
    temp_counter: AtomicU64,
}

impl DiskLruCache {
    /// Open a disk cache in `cache_dir`, indexing any entries already present
    pub fn open<P: AsRef<Path>>(cache_dir: P, disk_limit: usize) -> io::Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)?;

        let cache = Self {
            cache_dir,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                stats: DiskCacheStats::default(),
                disk_limit,
            }),
            write_locker: WriteLocker::default(),
            temp_counter: AtomicU64::new(0),
        };
        cache.load_from_disk()?;
        Ok(cache)
    }

    /// Open a disk cache with the limit given in megabytes
    pub fn with_mb_limit<P: AsRef<Path>>(cache_dir: P, megabytes: usize) -> io::Result<Self> {
        Self::open(cache_dir, megabytes * 1024 * 1024)
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", name, ENTRY_EXTENSION))
    }

    /// Rebuild the index from the cache directory
    ///
    /// Existing entries are ordered by modification time, oldest first.
    /// Leftover temporary files from interrupted writes are deleted.
    pub fn load_from_disk(&self) -> io::Result<()> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            match path.extension().and_then(|s| s.to_str()) {
                Some(ENTRY_EXTENSION) => {
                    let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    let metadata = entry.metadata()?;
                    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((modified, name.to_string(), path.clone(), metadata.len() as usize));
                }
                Some(TEMP_EXTENSION) => remove_file_quietly(&path),
                _ => {}
            }
        }
        found.sort_by_key(|(modified, ..)| *modified);

        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.order.clear();
        state.stats.entry_count = 0;
        state.stats.disk_used = 0;
        for (_, name, path, size) in found {
            state.insert(name, path, size);
        }
        state.evict_to_limit();
        debug!(
            dir = %self.cache_dir.display(),
            entries = state.stats.entry_count,
            bytes = state.stats.disk_used,
            "Opened disk cache"
        );
        Ok(())
    }

    /// Check for an entry without updating LRU order
    pub fn contains(&self, key: &dyn DiskKey) -> bool {
        self.state.lock().unwrap().entries.contains_key(&key.safe_key())
    }

    /// Get current cache statistics
    pub fn stats(&self) -> DiskCacheStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Get disk space limit in bytes
    pub fn disk_limit(&self) -> usize {
        self.state.lock().unwrap().disk_limit
    }

    /// Get current disk usage in bytes
    pub fn disk_used(&self) -> usize {
        self.state.lock().unwrap().stats.disk_used
    }

    /// Get number of entries in cache
    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Update disk space limit, evicting if usage is now over it
    pub fn set_disk_limit(&self, new_limit: usize) {
        let mut state = self.state.lock().unwrap();
        state.disk_limit = new_limit;
        state.evict_to_limit();
    }

    /// Get cache directory path
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn write_entry(
        &self,
        name: &str,
        writer: &mut dyn DiskWriter,
    ) -> Result<(), DiskCacheError> {
        let present = {
            let state = self.state.lock().unwrap();
            state.entries.get(name).is_some_and(|entry| entry.path.exists())
        };
        if present {
            trace!(key = %name, "Disk cache entry already present");
            return Ok(());
        }

        let temp = self.cache_dir.join(format!(
            "{}.{}.{}",
            name,
            self.temp_counter.fetch_add(1, Ordering::Relaxed),
            TEMP_EXTENSION
        ));
        let written = match writer.write(&temp) {
            Ok(written) => written,
            Err(e) => {
                remove_file_quietly(&temp);
                return Err(e.into());
            }
        };
        if !written {
            remove_file_quietly(&temp);
            return Err(DiskCacheError::NotWritten(name.to_string()));
        }

        let size = fs::metadata(&temp)?.len() as usize;
        let path = self.entry_path(name);
        if let Err(e) = fs::rename(&temp, &path) {
            remove_file_quietly(&temp);
            return Err(e.into());
        }

        let mut state = self.state.lock().unwrap();
        state.forget(name);
        state.insert(name.to_string(), path, size);
        state.stats.writes += 1;
        state.evict_to_limit();
        Ok(())
    }

    fn get_by_name(&self, name: &str) -> Option<PathBuf> {
        let mut state = self.state.lock().unwrap();
        let path = state.entries.get(name).map(|entry| entry.path.clone());
        match path {
            Some(path) if path.exists() => {
                state.touch(name);
                state.stats.hits += 1;
                Some(path)
            }
            Some(_) => {
                // Deleted behind our back.
                state.forget(name);
                state.stats.misses += 1;
                None
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }
}

impl DiskCache for DiskLruCache {
    fn get(&self, key: &dyn DiskKey) -> Option<PathBuf> {
        self.get_by_name(&key.safe_key())
    }

    fn put(&self, key: &dyn DiskKey, writer: &mut dyn DiskWriter) -> Result<(), DiskCacheError> {
        let name = key.safe_key();
        let lock = self.write_locker.acquire(&name);
        let result = {
            let _guard = lock.lock().unwrap();
            self.write_entry(&name, writer)
        };
        self.write_locker.release(&name);
        if let Err(e) = &result {
            warn!(key = ?key, error = %e, "Failed to write disk cache entry");
        }
        result
    }

    fn delete(&self, key: &dyn DiskKey) {
        let name = key.safe_key();
        if let Some(entry) = self.state.lock().unwrap().forget(&name) {
            remove_file_quietly(&entry.path);
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, entry) in state.entries.drain() {
            remove_file_quietly(&entry.path);
        }
        state.order.clear();
        state.stats.entry_count = 0;
        state.stats.disk_used = 0;
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove disk cache file");
        }
    }
}
