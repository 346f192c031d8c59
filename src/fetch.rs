//! Fetch collaborator surface.
//!
//! The store never talks to the network itself. It hands the fetcher a
//! watch channel carrying the evolving fetch plan (missing ranges with
//! priorities) and consumes the stream of events the fetcher produces in
//! return. The plan may change at any time, including becoming empty; the
//! session stays up across plan edits and is only torn down when the last
//! interested request departs.

use std::ops::Range;
use std::path::PathBuf;

use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::watch;

/// Priority of one requested range, ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FetchPriority {
    /// Background prefetch
    Low = 0,
    /// Regular consumer request
    Default = 1,
    /// Needed immediately, e.g. for the current playback position
    High = 2,
}

/// Ranges the store currently wants fetched, highest priority first,
/// ranges non-overlapping across the whole list.
pub type FetchPlan = Vec<(Range<i64>, FetchPriority)>;

/// One event produced by an in-flight fetch session.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// A chunk of resource bytes arrived.
    DataPart {
        /// Offset of the chunk within the resource
        resource_offset: i64,
        /// Buffer holding the chunk (possibly alongside other data)
        data: Bytes,
        /// The chunk's bytes within `data`
        range: Range<usize>,
        /// Whether the fetcher has now delivered the end of the resource
        complete: bool,
    },
    /// The fetcher learned the authoritative total size of the resource.
    ResourceSizeUpdated(i64),
    /// The header region must be rewritten after the rest is known.
    ReplaceHeader {
        /// Buffer holding the header bytes
        data: Bytes,
        /// The header's bytes within `data`
        range: Range<usize>,
    },
    /// Previously fetched data is invalid (resource replaced server-side);
    /// everything cached so far must be dropped.
    Reset,
    /// A complete copy of the resource exists at `path`; take ownership of
    /// it by moving it into place.
    MoveLocalFile {
        /// Path to the file to move; it is consumed by the store
        path: PathBuf,
    },
    /// Same as [`FetchEvent::MoveLocalFile`], but the file is a temporary
    /// artifact the fetcher produced and no longer needs.
    MoveTempFile {
        /// Path to the temporary file; it is consumed by the store
        path: PathBuf,
    },
    /// A complete copy of the resource exists at `path` and must remain
    /// there; copy it into place instead of moving.
    CopyLocalItem {
        /// Path to the file to copy
        path: PathBuf,
    },
    /// Progress hint for consumers while the total size is unknown.
    ProgressUpdated(f32),
}

/// Errors a fetch session can fail with.
///
/// Cloned when fanning out to every request the failed session was
/// servicing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The transport gave up on the resource
    #[error("fetch failed: {reason}")]
    Network {
        /// Transport-supplied failure description
        reason: String,
    },

    /// The remote reports the resource no longer exists
    #[error("resource unavailable")]
    ResourceUnavailable,

    /// The session was torn down before the request was satisfied
    #[error("fetch cancelled")]
    Cancelled,
}

/// Stream of events from one fetch session.
pub type FetchStream = BoxStream<'static, Result<FetchEvent, FetchError>>;

/// External collaborator that streams resource bytes for a fetch plan.
///
/// Implementations receive the current plan and every subsequent revision
/// through the watch channel and must tolerate it changing at any time,
/// including becoming empty.
pub trait RangeFetcher: Send + Sync {
    /// Starts a fetch session for the given evolving plan.
    fn fetch(&self, plan: watch::Receiver<FetchPlan>) -> FetchStream;
}

impl<F> RangeFetcher for F
where
    F: Fn(watch::Receiver<FetchPlan>) -> FetchStream + Send + Sync,
{
    fn fetch(&self, plan: watch::Receiver<FetchPlan>) -> FetchStream {
        self(plan)
    }
}
