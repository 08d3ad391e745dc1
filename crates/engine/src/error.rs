//! Load failures
//!
//! [`FetchError`] describes one failed attempt: a fetch that could not produce
//! data, a decoder that rejected it, a cache that could not be written. Those
//! stay inside the pipeline, which falls back to the next candidate. Only when
//! every candidate is exhausted does a [`LoadError`] leave the pipeline,
//! carrying every attempt that actually failed.

use std::fmt;
use std::io;

use pixelflow_cache::{ConfigError, DataSource};
use thiserror::Error;

/// A single failed fetch or decode attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Reading the data failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The fetch was cancelled before it produced data.
    #[error("fetch cancelled")]
    Cancelled,

    /// A decoder accepted the data but could not decode it.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A transformation could not be applied to a decoded resource.
    #[error("transformation {id} failed: {reason}")]
    Transform { id: String, reason: String },

    /// Nothing registered can turn `from` into the requested resource type.
    #[error("no load path from {from} to {to}")]
    NoLoadPath { from: String, to: String },

    /// A resource had to be persisted but no encoder is registered for it.
    #[error("no result encoder available for {0}")]
    NoResultEncoder(String),

    /// A fetch attempt failed; records which key was tried and where from.
    #[error("failed to load {key} from {origin:?}: {source}")]
    Attempt {
        key: String,
        origin: DataSource,
        #[source]
        source: Box<FetchError>,
    },

    /// Every decoder of a load path failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Any other failure reported by a fetcher or decoder.
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Attach the attempted key and origin to this error.
    pub fn attempt(self, key: impl fmt::Debug, origin: DataSource) -> Self {
        FetchError::Attempt {
            key: format!("{:?}", key),
            origin,
            source: Box::new(self),
        }
    }

    /// Returns true if this failure is, or wraps, a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            FetchError::Cancelled => true,
            FetchError::Attempt { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Aggregate failure reported once a load has exhausted every path.
#[derive(Debug, Error)]
#[error("{message} ({} causes)", .causes.len())]
pub struct LoadError {
    message: String,
    causes: Vec<FetchError>,
}

impl LoadError {
    /// Create an error with the collected causes.
    pub fn new(message: impl Into<String>, causes: Vec<FetchError>) -> Self {
        Self {
            message: message.into(),
            causes,
        }
    }

    /// Top level summary.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The direct causes, one per failed attempt.
    pub fn causes(&self) -> &[FetchError] {
        &self.causes
    }

    /// The leaf causes, with nested aggregates and attempt context flattened away.
    pub fn root_causes(&self) -> Vec<&FetchError> {
        let mut roots = Vec::new();
        for cause in &self.causes {
            collect_roots(cause, &mut roots);
        }
        roots
    }
}

fn collect_roots<'a>(error: &'a FetchError, roots: &mut Vec<&'a FetchError>) {
    match error {
        FetchError::Load(load) => {
            for cause in &load.causes {
                collect_roots(cause, roots);
            }
        }
        FetchError::Attempt { source, .. } => collect_roots(source, roots),
        other => roots.push(other),
    }
}

/// Errors building an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to open disk cache: {0}")]
    DiskCache(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
