//! Partial-file media cache core.
//!
//! Caches large remote resources (video, audio, images) on disk while they
//! are still being downloaded, so consumers can read the parts that have
//! arrived without waiting for the whole file. Each resource is backed by
//! a sparse partial file plus a persisted range map recording exactly
//! which byte ranges are present; a single shared fetch session per
//! resource services every outstanding request through a prioritized,
//! continuously updated fetch plan.
//!
//! [`PartialFileStore`] is the entry point: open one per resource, then
//! subscribe for data, fetch completion, range coverage or coarse status.

pub mod bag;
pub mod config;
pub mod fetch;
pub mod file_map;
pub mod managed_file;
pub(crate) mod missing;
pub mod range_set;
pub mod store;
pub mod tracing_setup;

pub use config::{CacheConfig, ResourceId, ResourcePaths};
pub use fetch::{FetchError, FetchEvent, FetchPlan, FetchPriority, FetchStream, RangeFetcher};
pub use file_map::{FileMapError, FileRangeMap};
pub use range_set::RangeSet;
pub use store::{
    NullAccounting, PartialFileStore, RequestHandle, ResourceData, ResourceStatus,
    StorageAccounting, StoreError,
};

/// Common error type covering every layer of the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Range metadata error occurred
    #[error("File map error: {0}")]
    FileMap(#[from] FileMapError),

    /// Store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Fetch session failed
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
