//! Partial-file store: the per-resource orchestrator.
//!
//! Owns one resource's partial data file, its range map, every pending
//! waiter, and the single active fetch session. Consumers subscribe for
//! data, fetch completion, range coverage or coarse status; the store
//! answers immediately when the cache already holds the bytes and
//! otherwise drives the shared fetch session until it can.
//!
//! All mutable state lives behind one mutex, so each public entry point is
//! a short serial critical section; overlapping requests from any number
//! of tasks interleave safely. The fetch session delivers its events
//! through one spawned consumer task, so events apply in delivery order.

use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bag::{Bag, BagKey};
use crate::config::{ResourceId, ResourcePaths};
use crate::fetch::{FetchError, FetchEvent, FetchPlan, FetchPriority, RangeFetcher};
use crate::file_map::FileRangeMap;
use crate::managed_file::SharedFile;
use crate::missing::{FinishedRequest, MissingRanges};
use crate::range_set::RangeSet;

/// Errors surfaced by store operations that touch the file system.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Availability notification for one data request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceData {
    /// File the bytes can be read from
    pub path: PathBuf,
    /// Offset of the first available byte within the resource
    pub offset: i64,
    /// Number of contiguous bytes available at `offset`
    pub size: i64,
    /// Whether the requested range is now fully available
    pub complete: bool,
}

/// Coarse availability of a resource as surfaced to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResourceStatus {
    /// Every byte is present locally; terminal
    Local,
    /// Not fully present and no fetch is running
    Remote {
        /// Fraction of the resource present, 0..1
        progress: f32,
    },
    /// A fetch session or full-range request is active
    Fetching {
        /// Whether the fetch is actively transferring
        active: bool,
        /// Fraction of the resource present, 0..1
        progress: f32,
    },
}

/// Collaborator receiving size updates for disk-usage accounting.
pub trait StorageAccounting: Send + Sync {
    /// Called on every meaningful size change: fill, truncate, reset and
    /// promotion to complete.
    fn update_size(&self, resource_id: &ResourceId, size: i64);
}

/// Accounting sink that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccounting;

impl StorageAccounting for NullAccounting {
    fn update_size(&self, _resource_id: &ResourceId, _size: i64) {}
}

struct DataRequest {
    range: Range<i64>,
    waiting_until_after_initial_fetch: bool,
    sender: mpsc::UnboundedSender<ResourceData>,
}

struct StatusRequest {
    sender: mpsc::UnboundedSender<ResourceStatus>,
    size: Option<i64>,
}

struct FullRangeRequest {
    fetch_key: Option<BagKey>,
}

struct FetchSessionHandle {
    id: u64,
    plan_tx: watch::Sender<FetchPlan>,
    task: JoinHandle<()>,
}

impl FetchSessionHandle {
    fn abort(self) {
        self.task.abort();
    }
}

struct StoreState {
    file_map: FileRangeMap,
    data_requests: Bag<DataRequest>,
    missing: MissingRanges,
    range_status_requests: Bag<mpsc::UnboundedSender<RangeSet>>,
    status_requests: Bag<StatusRequest>,
    full_range_requests: Bag<FullRangeRequest>,
    current_fetch: Option<FetchSessionHandle>,
    next_session_id: u64,
    processed_at_least_one_fetch: bool,
    /// Set once the resource is promoted to its complete file; terminal.
    complete_size: Option<i64>,
}

struct StoreShared {
    resource_id: ResourceId,
    paths: ResourcePaths,
    file: SharedFile,
    accounting: Arc<dyn StorageAccounting>,
    state: Mutex<StoreState>,
}

/// Store managing one resource's partially downloaded file.
///
/// Cheap to clone; clones share the same state. Dropping the last clone
/// tears down any in-flight fetch session.
#[derive(Clone)]
pub struct PartialFileStore {
    shared: Arc<StoreShared>,
}

/// Cancellation handle for one subscription.
///
/// Dropping (or explicitly cancelling) the handle deregisters exactly one
/// registry entry, idempotently and without side effects on the cached
/// data. Handles for requests answered synchronously are inert.
pub struct RequestHandle {
    shared: Weak<StoreShared>,
    kind: Option<HandleKind>,
}

enum HandleKind {
    Data(BagKey),
    Fetched(BagKey),
    RangeStatus(BagKey),
    Status(BagKey),
    FullRange { full: BagKey, fetch: BagKey },
}

impl RequestHandle {
    fn new(shared: &Arc<StoreShared>, kind: HandleKind) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            kind: Some(kind),
        }
    }

    fn satisfied() -> Self {
        Self {
            shared: Weak::new(),
            kind: None,
        }
    }

    /// Cancels the subscription now instead of at drop time.
    pub fn cancel(self) {}

    fn cancel_inner(&mut self) {
        if let Some(kind) = self.kind.take()
            && let Some(shared) = self.shared.upgrade()
        {
            shared.cancel(kind);
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

impl PartialFileStore {
    /// Opens (or resumes) the store for one resource.
    ///
    /// Persisted metadata is loaded when present and consistent with the
    /// partial file's real length; otherwise bookkeeping restarts empty.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the partial file cannot be opened
    pub fn open(
        resource_id: ResourceId,
        paths: ResourcePaths,
        accounting: Arc<dyn StorageAccounting>,
    ) -> Result<Self, StoreError> {
        let file = SharedFile::open_read_write(&paths.partial)?;
        let data_len = file.len()?;
        let file_map = FileRangeMap::load_consistent(&paths.meta, data_len);
        accounting.update_size(&resource_id, file_map.sum());

        Ok(Self {
            shared: Arc::new(StoreShared {
                resource_id,
                paths,
                file,
                accounting,
                state: Mutex::new(StoreState {
                    file_map,
                    data_requests: Bag::new(),
                    missing: MissingRanges::new(),
                    range_status_requests: Bag::new(),
                    status_requests: Bag::new(),
                    full_range_requests: Bag::new(),
                    current_fetch: None,
                    next_session_id: 0,
                    processed_at_least_one_fetch: false,
                    complete_size: None,
                }),
            }),
        })
    }

    /// Reads `range` from the resource's metadata and partial file without
    /// opening a store. Returns `None` unless the whole range is cached.
    pub fn extract_cached_data(paths: &ResourcePaths, range: Range<i64>) -> Option<Bytes> {
        let file_map = FileRangeMap::read(&paths.meta).ok()?;
        let actual = file_map.contains(&range)?;
        let file = SharedFile::open_read(&paths.partial).ok()?;
        file.read_at(actual.start, (actual.end - actual.start) as usize)
            .ok()
    }

    /// Whether `range` is fully cached, judged from metadata alone.
    pub fn is_data_cached(paths: &ResourcePaths, range: Range<i64>) -> bool {
        FileRangeMap::read(&paths.meta)
            .ok()
            .is_some_and(|map| map.contains(&range).is_some())
    }

    /// Total bytes currently stored for this resource.
    pub fn stored_size(&self) -> i64 {
        let state = self.shared.state.lock();
        state.complete_size.unwrap_or_else(|| state.file_map.sum())
    }

    /// Subscribes to availability of `range`.
    ///
    /// If the range is already fully covered, one final complete event is
    /// delivered synchronously. Otherwise an immediate zero-byte event is
    /// delivered (unless `wait_until_after_initial_fetch` suppresses it
    /// until the first fetch round has processed an event), followed by
    /// events as bytes arrive.
    pub fn data(
        &self,
        range: Range<i64>,
        wait_until_after_initial_fetch: bool,
    ) -> (mpsc::UnboundedReceiver<ResourceData>, RequestHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();

        if let Some(size) = state.complete_size {
            let _ = sender.send(ResourceData {
                path: self.shared.paths.complete.clone(),
                offset: range.start,
                size: (size - range.start).max(0),
                complete: true,
            });
            return (receiver, RequestHandle::satisfied());
        }
        if let Some(actual) = state.file_map.contains(&range) {
            let _ = sender.send(ResourceData {
                path: self.shared.paths.partial.clone(),
                offset: actual.start,
                size: actual.end - actual.start,
                complete: true,
            });
            return (receiver, RequestHandle::satisfied());
        }

        let waiting = wait_until_after_initial_fetch && !state.processed_at_least_one_fetch;
        if !waiting {
            let _ = sender.send(ResourceData {
                path: self.shared.paths.partial.clone(),
                offset: range.start,
                size: 0,
                complete: false,
            });
        }
        let key = state.data_requests.add(DataRequest {
            range,
            waiting_until_after_initial_fetch: waiting,
            sender,
        });
        (receiver, RequestHandle::new(&self.shared, HandleKind::Data(key)))
    }

    /// Synchronously reads `range` if it is fully cached.
    ///
    /// Returns `None` on a miss or on a low-level read failure; partial
    /// local corruption degrades to "unavailable" instead of an error.
    pub fn read(&self, range: Range<i64>) -> Option<Bytes> {
        let state = self.shared.state.lock();

        if let Some(size) = state.complete_size {
            let upper = range.end.min(size);
            if range.start >= upper {
                return None;
            }
            drop(state);
            let file = SharedFile::open_read(&self.shared.paths.complete).ok()?;
            return match file.read_at(range.start, (upper - range.start) as usize) {
                Ok(data) => Some(data),
                Err(io_error) => {
                    error!(
                        resource = %self.shared.resource_id,
                        %io_error,
                        "complete file read failed"
                    );
                    None
                }
            };
        }

        let actual = state.file_map.contains(&range)?;
        match self
            .shared
            .file
            .read_at(actual.start, (actual.end - actual.start) as usize)
        {
            Ok(data) => Some(data),
            Err(io_error) => {
                error!(
                    resource = %self.shared.resource_id,
                    %io_error,
                    "partial file read failed"
                );
                None
            }
        }
    }

    /// Registers interest in `range` being fetched (not necessarily
    /// delivered as bytes), starting or extending the shared fetch session
    /// as needed. The receiver resolves exactly once: `Ok` when the range
    /// is fully stored, `Err` if the servicing fetch fails. Cancelling the
    /// handle drops the range from the next fetch plan if no other request
    /// wants it.
    pub fn fetched(
        &self,
        range: Range<i64>,
        priority: FetchPriority,
        fetcher: Arc<dyn RangeFetcher>,
    ) -> (
        oneshot::Receiver<Result<(), FetchError>>,
        RequestHandle,
    ) {
        let (outcome, receiver) = oneshot::channel();
        let mut state = self.shared.state.lock();

        if state.complete_size.is_some() || state.file_map.contains(&range).is_some() {
            let _ = outcome.send(Ok(()));
            return (receiver, RequestHandle::satisfied());
        }

        let (key, plan, finished) = {
            let StoreState {
                missing, file_map, ..
            } = &mut *state;
            missing.add_request(file_map, range, priority, outcome, None)
        };
        self.shared.finish_requests(&mut state, finished, Ok(()));
        if let Some(plan) = plan {
            self.shared
                .update_request_ranges(&mut state, plan, Some(&fetcher));
        }
        (
            receiver,
            RequestHandle::new(&self.shared, HandleKind::Fetched(key)),
        )
    }

    /// Ensures the whole resource ends up local.
    ///
    /// Tracked separately from plain range requests: a resource with a
    /// live full-range request reports `Fetching` even before any specific
    /// byte range is outstanding.
    pub fn fetched_full_range(
        &self,
        fetcher: Arc<dyn RangeFetcher>,
    ) -> (
        oneshot::Receiver<Result<(), FetchError>>,
        RequestHandle,
    ) {
        let (outcome, receiver) = oneshot::channel();
        let mut state = self.shared.state.lock();

        if state.complete_size.is_some() {
            let _ = outcome.send(Ok(()));
            return (receiver, RequestHandle::satisfied());
        }

        let full_key = state
            .full_range_requests
            .add(FullRangeRequest { fetch_key: None });
        let (fetch_key, plan, finished) = {
            let StoreState {
                missing, file_map, ..
            } = &mut *state;
            missing.add_request(
                file_map,
                0..i64::MAX,
                FetchPriority::Default,
                outcome,
                Some(full_key),
            )
        };
        if let Some(entry) = state.full_range_requests.get_mut(full_key) {
            entry.fetch_key = Some(fetch_key);
        }
        self.shared.finish_requests(&mut state, finished, Ok(()));
        self.shared.update_statuses(&mut state);
        if let Some(plan) = plan {
            self.shared
                .update_request_ranges(&mut state, plan, Some(&fetcher));
        }
        (
            receiver,
            RequestHandle::new(
                &self.shared,
                HandleKind::FullRange {
                    full: full_key,
                    fetch: fetch_key,
                },
            ),
        )
    }

    /// Drops every live full-range request and re-publishes statuses.
    pub fn cancel_full_range_fetches(&self) {
        let mut state = self.shared.state.lock();
        let entries = state.full_range_requests.drain();
        for entry in entries {
            if let Some(fetch_key) = entry.fetch_key {
                self.shared.remove_fetch_request(&mut state, fetch_key);
            }
        }
        self.shared.update_statuses(&mut state);
    }

    /// Subscribes to the stored range set: the current set is pushed
    /// immediately, then again after every fill, until the resource is
    /// complete (signalled by the channel closing).
    pub fn range_status(&self) -> (mpsc::UnboundedReceiver<RangeSet>, RequestHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();

        if let Some(size) = state.complete_size {
            let _ = sender.send(RangeSet::from_range(0..size));
            return (receiver, RequestHandle::satisfied());
        }
        let _ = sender.send(state.file_map.ranges().clone());
        if state.file_map.is_complete() {
            return (receiver, RequestHandle::satisfied());
        }
        let key = state.range_status_requests.add(sender);
        (
            receiver,
            RequestHandle::new(&self.shared, HandleKind::RangeStatus(key)),
        )
    }

    /// Subscribes to coarse status. The current status is pushed
    /// immediately, then on every change; the channel closes once the
    /// resource is `Local` (terminal).
    ///
    /// `size` is an externally known total size used for progress when the
    /// map does not yet know the truncation size.
    pub fn status(
        &self,
        size: Option<i64>,
    ) -> (mpsc::UnboundedReceiver<ResourceStatus>, RequestHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();

        let status = self.shared.immediate_status(&state, size);
        let _ = sender.send(status.clone());
        if status == ResourceStatus::Local {
            return (receiver, RequestHandle::satisfied());
        }
        let key = state.status_requests.add(StatusRequest { sender, size });
        (
            receiver,
            RequestHandle::new(&self.shared, HandleKind::Status(key)),
        )
    }

    /// Writes the `data_range` slice of `data` at `offset` within the
    /// resource, records the bytes as present, persists metadata and
    /// re-evaluates every pending waiter.
    ///
    /// A failed low-level write is logged and leaves the range map
    /// untouched, so the bytes remain fetchable.
    pub fn write(&self, offset: i64, data: &Bytes, data_range: Range<usize>) {
        let mut state = self.shared.state.lock();
        if state.complete_size.is_some() {
            return;
        }
        self.shared
            .write_internal(&mut state, offset, data, data_range);
    }

    /// Clips stored coverage at `size` and re-evaluates waiters: a waiter
    /// whose range fits below the new boundary completes even though fewer
    /// bytes than requested exist.
    pub fn truncate(&self, size: i64) {
        let mut state = self.shared.state.lock();
        if state.complete_size.is_some() {
            return;
        }
        self.shared.truncate_internal(&mut state, size);
    }

    /// Records a fetcher-supplied progress hint and re-publishes statuses.
    pub fn progress_updated(&self, progress: f32) {
        let mut state = self.shared.state.lock();
        if state.complete_size.is_some() {
            return;
        }
        state.file_map.progress_updated(progress);
        self.shared.persist_map(&state.file_map);
        self.shared.update_statuses(&mut state);
    }

    /// Forgets all cached data: the previous bytes are known to be
    /// invalid (e.g. the resource changed server-side). Every pending data
    /// request receives a fresh zero-byte event and the fetch plan is
    /// recomputed from scratch.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        if state.complete_size.is_some() {
            return;
        }
        self.shared.reset_internal(&mut state);
    }

    /// Promotes the resource to complete by moving an externally produced
    /// full file into place. Partial artifacts are unlinked, every pending
    /// waiter resolves with full data, and status becomes `Local` forever.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the file cannot be moved into place
    pub fn move_local_file(&self, temp_path: &Path) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        std::fs::rename(temp_path, &self.shared.paths.complete)?;
        self.shared.finalize_complete(&mut state)
    }

    /// Same as [`PartialFileStore::move_local_file`], but copies from a
    /// source that must stay in place.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the file cannot be copied into place
    pub fn copy_local_item(&self, source: &Path) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        std::fs::copy(source, &self.shared.paths.complete)?;
        self.shared.finalize_complete(&mut state)
    }
}

impl StoreShared {
    fn cancel(self: &Arc<Self>, kind: HandleKind) {
        let mut state = self.state.lock();
        match kind {
            HandleKind::Data(key) => {
                state.data_requests.remove(key);
            }
            HandleKind::Fetched(key) => {
                self.remove_fetch_request(&mut state, key);
            }
            HandleKind::RangeStatus(key) => {
                state.range_status_requests.remove(key);
            }
            HandleKind::Status(key) => {
                state.status_requests.remove(key);
            }
            HandleKind::FullRange { full, fetch } => {
                state.full_range_requests.remove(full);
                self.remove_fetch_request(&mut state, fetch);
            }
        }
    }

    fn remove_fetch_request(self: &Arc<Self>, state: &mut StoreState, key: BagKey) {
        let (full_key, plan, finished) = {
            let StoreState {
                missing, file_map, ..
            } = &mut *state;
            missing.remove_request(file_map, key)
        };
        if let Some(full_key) = full_key {
            state.full_range_requests.remove(full_key);
        }
        self.finish_requests(state, finished, Ok(()));
        if let Some(plan) = plan {
            self.update_request_ranges(state, plan, None);
        }
        self.update_statuses(state);
    }

    /// Resolves finished fetch requests and drops their full-range
    /// registrations.
    fn finish_requests(
        &self,
        state: &mut StoreState,
        finished: Vec<FinishedRequest>,
        result: Result<(), FetchError>,
    ) {
        for request in finished {
            if let Some(full_key) = request.full_range_key {
                state.full_range_requests.remove(full_key);
            }
            let _ = request.outcome.send(result.clone());
        }
    }

    fn persist_map(&self, file_map: &FileRangeMap) {
        if let Err(io_error) = file_map.persist(&self.paths.meta) {
            warn!(
                resource = %self.resource_id,
                %io_error,
                "failed to persist range metadata"
            );
        }
    }

    fn write_internal(
        self: &Arc<Self>,
        state: &mut StoreState,
        offset: i64,
        data: &Bytes,
        data_range: Range<usize>,
    ) {
        let chunk = &data[data_range];
        if chunk.is_empty() {
            return;
        }
        if let Err(io_error) = self.file.write_at(offset, chunk) {
            // Bytes that failed to land are not recorded as present, so
            // they stay fetchable.
            error!(
                resource = %self.resource_id,
                offset,
                len = chunk.len(),
                %io_error,
                "partial file write failed"
            );
            return;
        }

        let range = offset..offset + chunk.len() as i64;
        state.file_map.fill(range.clone());
        self.persist_map(&state.file_map);
        self.accounting
            .update_size(&self.resource_id, state.file_map.sum());
        self.check_data_requests_after_fill(state, range);
    }

    fn truncate_internal(self: &Arc<Self>, state: &mut StoreState, size: i64) {
        state.file_map.truncate(size);
        self.persist_map(&state.file_map);
        self.accounting
            .update_size(&self.resource_id, state.file_map.sum());
        self.check_data_requests_after_fill(state, size..i64::MAX);
    }

    fn reset_internal(self: &Arc<Self>, state: &mut StoreState) {
        state.file_map.reset();
        self.persist_map(&state.file_map);

        for request in state.data_requests.iter() {
            let _ = request.sender.send(ResourceData {
                path: self.paths.partial.clone(),
                offset: request.range.start,
                size: 0,
                complete: false,
            });
        }

        let (plan, finished) = {
            let StoreState {
                missing, file_map, ..
            } = &mut *state;
            missing.recompute(file_map)
        };
        self.finish_requests(state, finished, Ok(()));
        if let Some(plan) = plan {
            self.update_request_ranges(state, plan, None);
        }

        let ranges = state.file_map.ranges().clone();
        for sender in state.range_status_requests.iter() {
            let _ = sender.send(ranges.clone());
        }

        self.accounting.update_size(&self.resource_id, 0);
        self.update_statuses(state);
    }

    /// Re-evaluates every waiter after coverage changed over `range`.
    fn check_data_requests_after_fill(
        self: &Arc<Self>,
        state: &mut StoreState,
        range: Range<i64>,
    ) {
        let mut resolved: Vec<(BagKey, bool)> = Vec::new();
        for (key, request) in state.data_requests.iter_with_keys() {
            if request.range.start >= range.end || range.start >= request.range.end {
                continue;
            }
            let max_value = state
                .file_map
                .truncation_size()
                .unwrap_or(request.range.end);
            if request.range.start > max_value {
                // Caller bug: request begins past the end of the resource.
                debug_assert!(false, "data request starts past truncation size");
                resolved.push((key, false));
            } else {
                let clipped = request.range.start..request.range.end.min(max_value);
                if state.file_map.ranges().covers(&clipped) {
                    resolved.push((key, true));
                }
            }
        }
        for (key, satisfied) in resolved {
            if let Some(request) = state.data_requests.remove(key) {
                if satisfied {
                    let mut upper = request.range.end;
                    if let Some(truncation) = state.file_map.truncation_size()
                        && truncation < upper
                    {
                        upper = truncation;
                    }
                    let _ = request.sender.send(ResourceData {
                        path: self.paths.partial.clone(),
                        offset: request.range.start,
                        size: upper - request.range.start,
                        complete: true,
                    });
                }
            }
        }

        let is_completed = state.file_map.is_complete();

        if is_completed {
            let finished = state.missing.clear();
            self.finish_requests(state, finished, Ok(()));
        } else {
            let filled = {
                let StoreState { missing, .. } = &mut *state;
                missing.fill(range)
            };
            if let Some((plan, finished)) = filled {
                self.update_request_ranges(state, plan, None);
                self.finish_requests(state, finished, Ok(()));
            }
        }

        if !state.range_status_requests.is_empty() {
            let ranges = state.file_map.ranges().clone();
            for sender in state.range_status_requests.iter() {
                let _ = sender.send(ranges.clone());
            }
            if is_completed {
                // Closing the channels signals completion.
                state.range_status_requests.drain();
            }
        }

        if is_completed {
            for request in state.status_requests.drain() {
                let _ = request.sender.send(ResourceStatus::Local);
            }
            self.promote_in_place(state);
        } else {
            self.update_statuses(state);
        }
    }

    /// The map just became complete through fills: fsync the partial file
    /// and link it into place as the immutable complete artifact.
    fn promote_in_place(self: &Arc<Self>, state: &mut StoreState) {
        if let Err(io_error) = self.file.sync_all() {
            warn!(resource = %self.resource_id, %io_error, "fsync before promotion failed");
        }

        let promoted = match std::fs::hard_link(&self.paths.partial, &self.paths.complete) {
            Ok(()) => true,
            Err(io_error) if io_error.kind() == ErrorKind::AlreadyExists => true,
            Err(io_error) => {
                warn!(
                    resource = %self.resource_id,
                    %io_error,
                    "hard link failed, copying instead"
                );
                match std::fs::copy(&self.paths.partial, &self.paths.complete) {
                    Ok(_) => true,
                    Err(io_error) => {
                        error!(
                            resource = %self.resource_id,
                            %io_error,
                            "could not produce complete file"
                        );
                        false
                    }
                }
            }
        };

        let size = state.file_map.sum();
        if promoted {
            state.complete_size = Some(size);
        }
        self.accounting.update_size(&self.resource_id, size);
        if let Some(session) = state.current_fetch.take() {
            session.abort();
        }
    }

    /// Promotion via an externally produced complete file already moved or
    /// copied to the complete path.
    fn finalize_complete(self: &Arc<Self>, state: &mut StoreState) -> Result<(), StoreError> {
        let size = std::fs::metadata(&self.paths.complete)?.len() as i64;

        let _ = std::fs::remove_file(&self.paths.partial);
        let _ = std::fs::remove_file(&self.paths.meta);

        let finished = state.missing.clear();
        self.finish_requests(state, finished, Ok(()));
        state.full_range_requests.drain();

        if let Some(session) = state.current_fetch.take() {
            session.abort();
        }

        for request in state.data_requests.drain() {
            let _ = request.sender.send(ResourceData {
                path: self.paths.complete.clone(),
                offset: request.range.start,
                size: (size - request.range.start).max(0),
                complete: true,
            });
        }
        for sender in state.range_status_requests.drain() {
            let _ = sender.send(RangeSet::from_range(0..size));
        }
        for request in state.status_requests.drain() {
            let _ = request.sender.send(ResourceStatus::Local);
        }

        state.complete_size = Some(size);
        self.accounting.update_size(&self.resource_id, size);
        debug!(resource = %self.resource_id, size, "resource promoted to complete");
        Ok(())
    }

    fn immediate_status(&self, state: &StoreState, size: Option<i64>) -> ResourceStatus {
        if state.complete_size.is_some() {
            return ResourceStatus::Local;
        }
        let progress = {
            let sum = state.file_map.sum();
            match state.file_map.truncation_size() {
                Some(truncation) if truncation != 0 => sum as f32 / truncation as f32,
                _ => match size {
                    Some(size) if size != 0 => sum as f32 / size as f32,
                    _ => state.file_map.progress().unwrap_or(0.0),
                },
            }
        };

        let fetching =
            !state.full_range_requests.is_empty() || state.current_fetch.is_some();
        if fetching {
            ResourceStatus::Fetching {
                active: true,
                progress,
            }
        } else if state
            .file_map
            .truncation_size()
            .is_some_and(|truncation| truncation == state.file_map.sum())
        {
            ResourceStatus::Local
        } else {
            ResourceStatus::Remote { progress }
        }
    }

    fn update_statuses(&self, state: &mut StoreState) {
        if state.status_requests.is_empty() {
            return;
        }
        let statuses: Vec<(BagKey, ResourceStatus)> = state
            .status_requests
            .iter_with_keys()
            .map(|(key, request)| (key, self.immediate_status(state, request.size)))
            .collect();
        for (key, status) in statuses {
            if let Some(request) = state.status_requests.get_mut(key) {
                let _ = request.sender.send(status);
            }
        }
    }

    /// Applies a changed fetch plan: tears the session down when the plan
    /// is empty, pushes the new plan into a live session, or starts a
    /// fresh session when a fetcher is at hand.
    fn update_request_ranges(
        self: &Arc<Self>,
        state: &mut StoreState,
        plan: FetchPlan,
        fetcher: Option<&Arc<dyn RangeFetcher>>,
    ) {
        #[cfg(debug_assertions)]
        for (range, _) in &plan {
            debug_assert!(range.start < range.end);
        }

        if plan.is_empty() {
            if let Some(session) = state.current_fetch.take() {
                self.update_statuses(state);
                session.abort();
            }
        } else if let Some(session) = &state.current_fetch {
            let _ = session.plan_tx.send(plan);
        } else if let Some(fetcher) = fetcher {
            let id = state.next_session_id;
            state.next_session_id += 1;

            let (plan_tx, plan_rx) = watch::channel(plan);
            let mut stream = fetcher.fetch(plan_rx);
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    match event {
                        Ok(event) => shared.apply_fetch_event(id, event),
                        Err(fetch_error) => {
                            shared.handle_fetch_error(id, fetch_error);
                            return;
                        }
                    }
                }
                if let Some(shared) = weak.upgrade() {
                    shared.session_ended(id);
                }
            });
            state.current_fetch = Some(FetchSessionHandle { id, plan_tx, task });
            self.update_statuses(state);
        }
    }

    fn apply_fetch_event(self: &Arc<Self>, session_id: u64, event: FetchEvent) {
        let mut state = self.state.lock();
        if state
            .current_fetch
            .as_ref()
            .is_none_or(|session| session.id != session_id)
        {
            return;
        }

        match event {
            FetchEvent::Reset => {
                if !state.file_map.ranges().is_empty() {
                    self.reset_internal(&mut state);
                }
            }
            FetchEvent::ResourceSizeUpdated(size) => {
                self.truncate_internal(&mut state, size);
            }
            FetchEvent::DataPart {
                resource_offset,
                data,
                range,
                complete,
            } => {
                let part_len = range.len() as i64;
                if !range.is_empty() {
                    self.write_internal(&mut state, resource_offset, &data, range);
                }
                if complete && state.complete_size.is_none() {
                    if let Some(max_stored) = state.file_map.ranges().last_upper_bound() {
                        let upper = (resource_offset + part_len).max(max_stored);
                        self.truncate_internal(&mut state, upper);
                    }
                }
            }
            FetchEvent::ReplaceHeader { data, range } => {
                self.write_internal(&mut state, 0, &data, range);
            }
            FetchEvent::MoveLocalFile { path } | FetchEvent::MoveTempFile { path } => {
                match std::fs::rename(&path, &self.paths.complete) {
                    Ok(()) => {
                        if let Err(error) = self.finalize_complete(&mut state) {
                            error!(resource = %self.resource_id, %error, "promotion failed");
                        }
                    }
                    Err(io_error) => {
                        error!(
                            resource = %self.resource_id,
                            source = %path.display(),
                            %io_error,
                            "moving fetched file into place failed"
                        );
                    }
                }
            }
            FetchEvent::CopyLocalItem { path } => {
                match std::fs::copy(&path, &self.paths.complete) {
                    Ok(_) => {
                        if let Err(error) = self.finalize_complete(&mut state) {
                            error!(resource = %self.resource_id, %error, "promotion failed");
                        }
                    }
                    Err(io_error) => {
                        error!(
                            resource = %self.resource_id,
                            source = %path.display(),
                            %io_error,
                            "copying fetched file into place failed"
                        );
                    }
                }
            }
            FetchEvent::ProgressUpdated(progress) => {
                state.file_map.progress_updated(progress);
                self.persist_map(&state.file_map);
                self.update_statuses(&mut state);
            }
        }

        if !state.processed_at_least_one_fetch {
            state.processed_at_least_one_fetch = true;
            self.release_initial_fetch_holds(&mut state);
        }
    }

    /// After the first processed session event, every data request that
    /// suppressed its placeholder event is re-evaluated and released from
    /// the hold, covered or not.
    fn release_initial_fetch_holds(self: &Arc<Self>, state: &mut StoreState) {
        let mut satisfied = Vec::new();
        let mut placeholders = Vec::new();
        for (key, request) in state.data_requests.iter_mut_with_keys() {
            if !request.waiting_until_after_initial_fetch {
                continue;
            }
            request.waiting_until_after_initial_fetch = false;
            match state.file_map.contains(&request.range) {
                Some(actual) => satisfied.push((key, actual)),
                None => placeholders.push(key),
            }
        }
        for (key, actual) in satisfied {
            if let Some(request) = state.data_requests.remove(key) {
                let _ = request.sender.send(ResourceData {
                    path: self.paths.partial.clone(),
                    offset: actual.start,
                    size: actual.end - actual.start,
                    complete: true,
                });
            }
        }
        for key in placeholders {
            if let Some(request) = state.data_requests.get_mut(key) {
                let _ = request.sender.send(ResourceData {
                    path: self.paths.partial.clone(),
                    offset: request.range.start,
                    size: 0,
                    complete: false,
                });
            }
        }
    }

    /// The in-flight session failed: every outstanding fetch request hears
    /// the error once, the registry is cleared, and the store stays usable
    /// so a later request can start a fresh session.
    fn handle_fetch_error(self: &Arc<Self>, session_id: u64, fetch_error: FetchError) {
        let mut state = self.state.lock();
        if state
            .current_fetch
            .as_ref()
            .is_none_or(|session| session.id != session_id)
        {
            return;
        }
        warn!(resource = %self.resource_id, %fetch_error, "fetch session failed");

        let finished = state.missing.clear();
        self.finish_requests(&mut state, finished, Err(fetch_error));
        if let Some(session) = state.current_fetch.take() {
            session.abort();
        }
        self.update_statuses(&mut state);
    }

    /// The session's stream ended without an error.
    fn session_ended(self: &Arc<Self>, session_id: u64) {
        let mut state = self.state.lock();
        if let Some(session) = &state.current_fetch
            && session.id == session_id
        {
            state.current_fetch = None;
            self.update_statuses(&mut state);
        }
    }
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        if let Some(session) = self.state.get_mut().current_fetch.take() {
            session.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> PartialFileStore {
        let paths = ResourcePaths {
            partial: dir.path().join("res_partial"),
            meta: dir.path().join("res_partial.meta"),
            complete: dir.path().join("res"),
        };
        PartialFileStore::open(
            ResourceId::new(vec![0xab]),
            paths,
            Arc::new(NullAccounting),
        )
        .unwrap()
    }

    fn bytes_of_len(len: usize) -> Bytes {
        Bytes::from(vec![0x5a; len])
    }

    #[tokio::test]
    async fn test_data_request_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut rx, _handle) = store.data(0..100, false);
        let first = rx.try_recv().unwrap();
        assert_eq!((first.offset, first.size, first.complete), (0, 0, false));

        store.write(0, &bytes_of_len(100), 0..100);
        let second = rx.try_recv().unwrap();
        assert_eq!((second.offset, second.size, second.complete), (0, 100, true));

        // Request auto-removed: further writes produce no more events.
        store.write(100, &bytes_of_len(50), 0..50);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_data_answered_synchronously_when_covered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.write(0, &bytes_of_len(200), 0..200);

        let (mut rx, _handle) = store.data(50..150, false);
        let event = rx.try_recv().unwrap();
        assert_eq!((event.offset, event.size, event.complete), (50, 100, true));
    }

    #[tokio::test]
    async fn test_disjoint_writes_both_covered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.write(100, &bytes_of_len(50), 0..50);
        store.write(0, &bytes_of_len(50), 0..50);

        assert!(store.read(0..50).is_some());
        assert!(store.read(100..150).is_some());
        assert!(store.read(0..150).is_none());
    }

    #[tokio::test]
    async fn test_truncation_satisfies_larger_request() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut rx, _handle) = store.data(0..500, false);
        let _ = rx.try_recv().unwrap();

        store.write(0, &bytes_of_len(300), 0..300);
        assert!(rx.try_recv().is_err());

        store.truncate(300);
        let event = rx.try_recv().unwrap();
        assert_eq!((event.offset, event.size, event.complete), (0, 300, true));
        assert_eq!(store.stored_size(), 300);
    }

    #[tokio::test]
    async fn test_completion_by_fill_promotes_and_reports_local() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut status_rx, _status_handle) = store.status(None);
        assert_eq!(
            status_rx.try_recv().unwrap(),
            ResourceStatus::Remote { progress: 0.0 }
        );

        store.write(0, &bytes_of_len(300), 0..300);
        store.truncate(300);

        // The pending status subscription saw the terminal transition.
        let mut last = None;
        while let Ok(status) = status_rx.try_recv() {
            last = Some(status);
        }
        assert_eq!(last, Some(ResourceStatus::Local));

        // The complete artifact exists and new subscriptions are Local.
        assert!(dir.path().join("res").exists());
        let (mut rx, _handle) = store.status(None);
        assert_eq!(rx.try_recv().unwrap(), ResourceStatus::Local);
    }

    #[tokio::test]
    async fn test_move_local_file_resolves_all_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut data_a, _ha) = store.data(0..100, false);
        let (mut data_b, _hb) = store.data(200..400, false);
        let (mut status_rx, _hs) = store.status(None);
        let _ = data_a.try_recv().unwrap();
        let _ = data_b.try_recv().unwrap();
        let _ = status_rx.try_recv().unwrap();

        let temp = dir.path().join("download.tmp");
        std::fs::write(&temp, vec![1u8; 500]).unwrap();
        store.move_local_file(&temp).unwrap();

        let event = data_a.try_recv().unwrap();
        assert_eq!((event.offset, event.size, event.complete), (0, 500, true));
        assert_eq!(event.path, dir.path().join("res"));
        let event = data_b.try_recv().unwrap();
        assert_eq!((event.offset, event.size, event.complete), (200, 300, true));
        assert_eq!(status_rx.try_recv().unwrap(), ResourceStatus::Local);

        // Partial artifacts are gone, the store answers Local forever.
        assert!(!dir.path().join("res_partial").exists());
        assert!(!dir.path().join("res_partial.meta").exists());
        let (mut rx, _h) = store.status(None);
        assert_eq!(rx.try_recv().unwrap(), ResourceStatus::Local);
        assert_eq!(store.stored_size(), 500);
    }

    #[tokio::test]
    async fn test_copy_local_item_promotes_and_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut data_rx, _data_handle) = store.data(0..100, false);
        let _ = data_rx.try_recv().unwrap();
        let (mut status_rx, _status_handle) = store.status(None);
        let _ = status_rx.try_recv().unwrap();

        let source = dir.path().join("imported.bin");
        std::fs::write(&source, vec![6u8; 250]).unwrap();
        store.copy_local_item(&source).unwrap();

        let event = data_rx.try_recv().unwrap();
        assert_eq!((event.offset, event.size, event.complete), (0, 250, true));
        assert_eq!(event.path, dir.path().join("res"));
        assert_eq!(status_rx.try_recv().unwrap(), ResourceStatus::Local);

        // The source stays in place; the complete artifact is a copy.
        assert!(source.exists());
        assert!(dir.path().join("res").exists());
        assert_eq!(store.stored_size(), 250);
        assert_eq!(store.read(0..250).map(|b| b.len()), Some(250));
    }

    #[tokio::test]
    async fn test_reset_sends_fresh_zero_byte_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut rx, _handle) = store.data(0..100, false);
        let _ = rx.try_recv().unwrap();
        store.write(0, &bytes_of_len(50), 0..50);

        store.reset();
        let event = rx.try_recv().unwrap();
        assert_eq!((event.offset, event.size, event.complete), (0, 0, false));
        assert_eq!(store.stored_size(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_data_request_receives_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut rx, handle) = store.data(0..100, false);
        let _ = rx.try_recv().unwrap();
        handle.cancel();

        store.write(0, &bytes_of_len(100), 0..100);
        // Sender side was dropped on cancellation.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_range_status_pushes_on_every_fill() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let (mut rx, _handle) = store.range_status();
        assert!(rx.try_recv().unwrap().is_empty());

        store.write(0, &bytes_of_len(10), 0..10);
        let ranges = rx.try_recv().unwrap();
        assert!(ranges.covers(&(0..10)));

        store.write(10, &bytes_of_len(10), 0..10);
        let ranges = rx.try_recv().unwrap();
        assert!(ranges.covers(&(0..20)));
    }

    #[tokio::test]
    async fn test_status_progress_against_external_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.write(0, &bytes_of_len(25), 0..25);

        let (mut rx, _handle) = store.status(Some(100));
        assert_eq!(
            rx.try_recv().unwrap(),
            ResourceStatus::Remote { progress: 0.25 }
        );
    }

    #[tokio::test]
    async fn test_read_returns_none_for_uncovered_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.write(0, &bytes_of_len(10), 0..10);

        assert_eq!(store.read(0..10).map(|b| b.len()), Some(10));
        assert!(store.read(5..15).is_none());
    }

    #[tokio::test]
    async fn test_stale_metadata_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            store.write(0, &bytes_of_len(100), 0..100);
        }
        // Truncate the partial file behind the metadata's back, simulating
        // a crash that lost data after the map was persisted.
        let partial = dir.path().join("res_partial");
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&partial)
            .unwrap();
        file.set_len(40).unwrap();
        drop(file);

        let store = open_store(&dir);
        assert_eq!(store.stored_size(), 0);
    }

    #[tokio::test]
    async fn test_resume_from_consistent_metadata() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            store.write(0, &bytes_of_len(100), 0..100);
        }
        let store = open_store(&dir);
        assert_eq!(store.stored_size(), 100);
        assert!(store.read(0..100).is_some());
    }

    #[tokio::test]
    async fn test_extract_cached_data_without_store() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ResourcePaths {
            partial: dir.path().join("res_partial"),
            meta: dir.path().join("res_partial.meta"),
            complete: dir.path().join("res"),
        };
        {
            let store = open_store(&dir);
            store.write(0, &bytes_of_len(64), 0..64);
        }

        assert!(PartialFileStore::is_data_cached(&paths, 0..64));
        assert!(!PartialFileStore::is_data_cached(&paths, 0..65));
        let data = PartialFileStore::extract_cached_data(&paths, 16..32).unwrap();
        assert_eq!(data.len(), 16);
    }
}
