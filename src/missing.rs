//! Tracking of requested-but-not-yet-stored byte ranges.
//!
//! Holds every live fetch request and derives the fetch plan from them:
//! per-priority unions of still-missing bytes, deduplicated so a byte is
//! claimed only by the highest priority that asked for it. Plan
//! recomputation compares against the previous per-priority buckets and
//! reports a plan only when it structurally changed, so an identical
//! in-flight fetch is never restarted spuriously.

use std::collections::BTreeMap;
use std::ops::Range;

use tokio::sync::oneshot;

use crate::bag::{Bag, BagKey};
use crate::fetch::{FetchError, FetchPlan, FetchPriority};
use crate::file_map::FileRangeMap;
use crate::range_set::RangeSet;

/// Exactly-once outcome channel of one fetch request.
pub(crate) type RequestOutcome = oneshot::Sender<Result<(), FetchError>>;

#[derive(Debug)]
struct MissingRangeRequest {
    range: Range<i64>,
    priority: FetchPriority,
    /// Bytes of `range` not yet on disk. Re-derived from the file map on
    /// every registry or map change.
    remaining: RangeSet,
    outcome: RequestOutcome,
    full_range_key: Option<BagKey>,
}

/// A request that just finished; the store fires its outcome and drops the
/// matching full-range registration, if any.
#[derive(Debug)]
pub(crate) struct FinishedRequest {
    pub outcome: RequestOutcome,
    pub full_range_key: Option<BagKey>,
}

/// Registry of live fetch requests plus the cached fetch-plan derivation.
#[derive(Debug, Default)]
pub(crate) struct MissingRanges {
    requests: Bag<MissingRangeRequest>,
    /// Union of every request's remaining bytes.
    flattened: RangeSet,
    /// Remaining bytes grouped by priority; the structural-change baseline.
    by_priority: BTreeMap<FetchPriority, RangeSet>,
}

impl MissingRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every request, returning their outcome channels for the store
    /// to resolve (completion on promotion, error on fetch failure).
    pub fn clear(&mut self) -> Vec<FinishedRequest> {
        let finished = self
            .requests
            .drain()
            .into_iter()
            .map(|request| FinishedRequest {
                outcome: request.outcome,
                full_range_key: request.full_range_key,
            })
            .collect();
        self.flattened = RangeSet::new();
        self.by_priority = BTreeMap::new();
        finished
    }

    /// Registers a request. Returns its key, the new fetch plan if it
    /// changed, and any requests that turned out to be already satisfied.
    pub fn add_request(
        &mut self,
        file_map: &FileRangeMap,
        range: Range<i64>,
        priority: FetchPriority,
        outcome: RequestOutcome,
        full_range_key: Option<BagKey>,
    ) -> (BagKey, Option<FetchPlan>, Vec<FinishedRequest>) {
        let key = self.requests.add(MissingRangeRequest {
            range: range.clone(),
            priority,
            remaining: RangeSet::from_range(range),
            outcome,
            full_range_key,
        });
        let (plan, finished) = self.update(file_map);
        (key, plan, finished)
    }

    /// Removes a request by key (cancellation). Dropping its outcome
    /// channel tells the caller nothing will be delivered.
    pub fn remove_request(
        &mut self,
        file_map: &FileRangeMap,
        key: BagKey,
    ) -> (Option<BagKey>, Option<FetchPlan>, Vec<FinishedRequest>) {
        let Some(removed) = self.requests.remove(key) else {
            return (None, None, Vec::new());
        };
        let (plan, finished) = self.update(file_map);
        (removed.full_range_key, plan, finished)
    }

    /// Recomputes the plan after the file map changed wholesale (reset or
    /// external mutation).
    pub fn recompute(
        &mut self,
        file_map: &FileRangeMap,
    ) -> (Option<FetchPlan>, Vec<FinishedRequest>) {
        self.update(file_map)
    }

    /// Marks `range` as newly stored.
    ///
    /// Returns `None` when the range touched no tracked missing byte, i.e.
    /// the fetch plan needs no change. Otherwise returns the refreshed plan
    /// plus every request this write completed.
    pub fn fill(&mut self, range: Range<i64>) -> Option<(FetchPlan, Vec<FinishedRequest>)> {
        if !self.flattened.intersects(&range) {
            return None;
        }
        self.flattened.remove(range.clone());
        for bucket in self.by_priority.values_mut() {
            bucket.remove(range.clone());
        }
        self.by_priority.retain(|_, bucket| !bucket.is_empty());

        let mut finished_keys = Vec::new();
        for (key, request) in self.requests.iter_mut_with_keys() {
            if request.range.start < range.end && range.start < request.range.end {
                request.remaining.remove(range.clone());
                if request.remaining.is_empty() {
                    finished_keys.push(key);
                }
            }
        }
        let finished = self.take_finished(finished_keys);

        Some((self.missing_requested_intervals(), finished))
    }

    /// Full state-transition pass: re-derives every request's remaining
    /// bytes from the file map, completes satisfied requests, and rebuilds
    /// the per-priority buckets. Returns the plan only when the buckets
    /// structurally changed.
    fn update(&mut self, file_map: &FileRangeMap) -> (Option<FetchPlan>, Vec<FinishedRequest>) {
        let mut satisfied = Vec::new();
        for (key, request) in self.requests.iter_mut_with_keys() {
            let mut remaining = RangeSet::from_range(request.range.clone());
            remaining.subtract(file_map.ranges());
            request.remaining = remaining;
            if request.remaining.is_empty() {
                satisfied.push(key);
            }
        }
        let finished = self.take_finished(satisfied);

        let mut by_priority: BTreeMap<FetchPriority, RangeSet> = BTreeMap::new();
        let mut flattened = RangeSet::new();
        for request in self.requests.iter() {
            by_priority
                .entry(request.priority)
                .or_default()
                .union_with(&request.remaining);
            flattened.union_with(&request.remaining);
        }

        if by_priority != self.by_priority {
            self.by_priority = by_priority;
            self.flattened = flattened;
            (Some(self.missing_requested_intervals()), finished)
        } else {
            self.flattened = flattened;
            (None, finished)
        }
    }

    fn take_finished(&mut self, keys: Vec<BagKey>) -> Vec<FinishedRequest> {
        keys.into_iter()
            .filter_map(|key| self.requests.remove(key))
            .map(|request| FinishedRequest {
                outcome: request.outcome,
                full_range_key: request.full_range_key,
            })
            .collect()
    }

    /// Flattens the live requests into the ordered fetch plan: priorities
    /// descending, each claiming its bytes and removing them from the pool
    /// so no byte is fetched twice at two priorities.
    fn missing_requested_intervals(&self) -> FetchPlan {
        let mut pool = self.flattened.clone();
        let mut plan = FetchPlan::new();
        for (priority, bucket) in self.by_priority.iter().rev() {
            let claimed = bucket.intersection(&pool);
            pool.subtract(&claimed);
            for range in claimed.iter() {
                plan.push((range.clone(), *priority));
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> (
        RequestOutcome,
        oneshot::Receiver<Result<(), FetchError>>,
    ) {
        oneshot::channel()
    }

    #[test]
    fn test_priority_buckets_do_not_overlap() {
        // Scenario: high-priority 50..150 and low-priority 100..200 on an
        // empty map. The overlap goes to the higher priority.
        let map = FileRangeMap::new();
        let mut missing = MissingRanges::new();

        let (tx, _rx) = outcome();
        let (_, plan, _) = missing.add_request(&map, 50..150, FetchPriority::High, tx, None);
        assert_eq!(plan, Some(vec![(50..150, FetchPriority::High)]));

        let (tx, _rx) = outcome();
        let (_, plan, _) = missing.add_request(&map, 100..200, FetchPriority::Low, tx, None);
        assert_eq!(
            plan,
            Some(vec![
                (50..150, FetchPriority::High),
                (150..200, FetchPriority::Low),
            ])
        );
    }

    #[test]
    fn test_identical_request_does_not_change_plan() {
        let map = FileRangeMap::new();
        let mut missing = MissingRanges::new();

        let (tx, _rx1) = outcome();
        let (_, plan, _) = missing.add_request(&map, 0..100, FetchPriority::Default, tx, None);
        assert!(plan.is_some());

        let (tx, _rx2) = outcome();
        let (_, plan, _) = missing.add_request(&map, 0..100, FetchPriority::Default, tx, None);
        assert_eq!(plan, None);
    }

    #[test]
    fn test_stored_bytes_are_not_planned() {
        let mut map = FileRangeMap::new();
        map.fill(0..50);
        let mut missing = MissingRanges::new();

        let (tx, _rx) = outcome();
        let (_, plan, _) = missing.add_request(&map, 0..100, FetchPriority::Default, tx, None);
        assert_eq!(plan, Some(vec![(50..100, FetchPriority::Default)]));
    }

    #[test]
    fn test_fill_completes_request_exactly_once() {
        let map = FileRangeMap::new();
        let mut missing = MissingRanges::new();

        let (tx, mut rx) = outcome();
        let (_, _, _) = missing.add_request(&map, 0..100, FetchPriority::Default, tx, None);

        let (plan, finished) = missing.fill(0..60).unwrap();
        assert!(finished.is_empty());
        assert_eq!(plan, vec![(60..100, FetchPriority::Default)]);

        let (plan, finished) = missing.fill(60..100).unwrap();
        assert_eq!(finished.len(), 1);
        assert!(plan.is_empty());

        for request in finished {
            request.outcome.send(Ok(())).unwrap();
        }
        assert_eq!(rx.try_recv().unwrap(), Ok(()));

        // The registry no longer knows the request.
        assert!(missing.fill(0..100).is_none());
    }

    #[test]
    fn test_fill_outside_tracked_ranges_returns_none() {
        let map = FileRangeMap::new();
        let mut missing = MissingRanges::new();

        let (tx, _rx) = outcome();
        missing.add_request(&map, 100..200, FetchPriority::Default, tx, None);

        assert!(missing.fill(0..100).is_none());
        assert!(missing.fill(200..300).is_none());
    }

    #[test]
    fn test_remove_request_drops_outcome_channel() {
        let map = FileRangeMap::new();
        let mut missing = MissingRanges::new();

        let (tx, mut rx) = outcome();
        let (key, _, _) = missing.add_request(&map, 0..100, FetchPriority::Default, tx, None);

        let (full_key, plan, _) = missing.remove_request(&map, key);
        assert_eq!(full_key, None);
        assert_eq!(plan, Some(Vec::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clear_returns_every_outcome() {
        let map = FileRangeMap::new();
        let mut missing = MissingRanges::new();

        let (tx_a, mut rx_a) = outcome();
        missing.add_request(&map, 0..10, FetchPriority::Default, tx_a, None);
        let (tx_b, mut rx_b) = outcome();
        missing.add_request(&map, 20..30, FetchPriority::High, tx_b, None);

        let finished = missing.clear();
        assert_eq!(finished.len(), 2);
        for request in finished {
            let _ = request.outcome.send(Err(FetchError::ResourceUnavailable));
        }
        assert_eq!(rx_a.try_recv().unwrap(), Err(FetchError::ResourceUnavailable));
        assert_eq!(rx_b.try_recv().unwrap(), Err(FetchError::ResourceUnavailable));
    }

    #[test]
    fn test_recompute_after_reset_reexpands_remaining() {
        let mut map = FileRangeMap::new();
        map.fill(0..50);
        let mut missing = MissingRanges::new();

        let (tx, _rx) = outcome();
        let (_, plan, _) = missing.add_request(&map, 0..100, FetchPriority::Default, tx, None);
        assert_eq!(plan, Some(vec![(50..100, FetchPriority::Default)]));

        map.reset();
        let (plan, finished) = missing.recompute(&map);
        assert!(finished.is_empty());
        assert_eq!(plan, Some(vec![(0..100, FetchPriority::Default)]));
    }

    #[test]
    fn test_already_satisfied_request_finishes_on_add() {
        let mut map = FileRangeMap::new();
        map.fill(0..100);
        let mut missing = MissingRanges::new();

        let (tx, mut rx) = outcome();
        let (_, plan, finished) =
            missing.add_request(&map, 10..20, FetchPriority::Default, tx, None);
        assert_eq!(plan, None);
        assert_eq!(finished.len(), 1);
        for request in finished {
            request.outcome.send(Ok(())).unwrap();
        }
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }
}
