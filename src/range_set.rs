//! Ordered sets of non-overlapping byte ranges.
//!
//! Foundation for all range bookkeeping in the cache: which bytes are on
//! disk, which bytes a request still misses, which bytes a fetch plan
//! claims. Ranges are half-open `[start, end)` over `i64`; `i64::MAX` as an
//! upper bound stands for "rest of the resource".

use std::ops::Range;

use serde::Serialize;

/// Sorted collection of disjoint, non-adjacent byte ranges.
///
/// Inserting a range that touches or overlaps existing ranges merges them,
/// so the set stays minimal. Empty ranges are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RangeSet {
    ranges: Vec<Range<i64>>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Creates a set holding a single range.
    pub fn from_range(range: Range<i64>) -> Self {
        let mut set = Self::new();
        set.insert(range);
        set
    }

    /// Inserts `range`, merging it with any overlapping or adjacent ranges.
    pub fn insert(&mut self, range: Range<i64>) {
        if range.start >= range.end {
            return;
        }
        // First range whose end touches or passes the new start, and first
        // range strictly past the new end: everything between coalesces.
        let first = self.ranges.partition_point(|r| r.end < range.start);
        let last = self.ranges.partition_point(|r| r.start <= range.end);
        if first == last {
            self.ranges.insert(first, range);
        } else {
            let start = range.start.min(self.ranges[first].start);
            let end = range.end.max(self.ranges[last - 1].end);
            self.ranges.splice(first..last, [start..end]);
        }
    }

    /// Removes every byte of `range` from the set, splitting stored ranges
    /// where necessary.
    pub fn remove(&mut self, range: Range<i64>) {
        if range.start >= range.end || self.ranges.is_empty() {
            return;
        }
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for stored in self.ranges.drain(..) {
            if stored.end <= range.start || stored.start >= range.end {
                result.push(stored);
                continue;
            }
            if stored.start < range.start {
                result.push(stored.start..range.start);
            }
            if stored.end > range.end {
                result.push(range.end..stored.end);
            }
        }
        self.ranges = result;
    }

    /// Adds every range of `other` to this set.
    pub fn union_with(&mut self, other: &RangeSet) {
        for range in &other.ranges {
            self.insert(range.clone());
        }
    }

    /// Returns the union of both sets.
    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut result = self.clone();
        result.union_with(other);
        result
    }

    /// Returns the bytes present in both sets.
    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        let mut result = Vec::new();
        let mut i = 0;
        let mut j = 0;
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = &self.ranges[i];
            let b = &other.ranges[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                result.push(start..end);
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        RangeSet { ranges: result }
    }

    /// Keeps only the bytes also present in `other`.
    pub fn intersect_with(&mut self, other: &RangeSet) {
        *self = self.intersection(other);
    }

    /// Removes every byte of `other` from this set.
    pub fn subtract(&mut self, other: &RangeSet) {
        for range in &other.ranges {
            self.remove(range.clone());
        }
    }

    /// Whether any byte of `range` is present.
    pub fn intersects(&self, range: &Range<i64>) -> bool {
        if range.start >= range.end {
            return false;
        }
        let index = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(index)
            .is_some_and(|stored| stored.start < range.end)
    }

    /// Whether every byte of `range` is present.
    ///
    /// Because stored ranges are merged, full coverage means a single
    /// stored range contains the queried one.
    pub fn covers(&self, range: &Range<i64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        let index = self.ranges.partition_point(|r| r.end < range.end);
        self.ranges
            .get(index)
            .is_some_and(|stored| stored.start <= range.start && range.end <= stored.end)
    }

    /// Whether every byte of `other` is present in this set.
    pub fn is_superset(&self, other: &RangeSet) -> bool {
        other.ranges.iter().all(|range| self.covers(range))
    }

    /// Stored ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Range<i64>> {
        self.ranges.iter()
    }

    /// Number of stored ranges.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the set holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of bytes across all stored ranges.
    pub fn total_len(&self) -> i64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// Upper bound of the last stored range, if any.
    pub fn last_upper_bound(&self) -> Option<i64> {
        self.ranges.last().map(|r| r.end)
    }

    /// Removes all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl From<Range<i64>> for RangeSet {
    fn from(range: Range<i64>) -> Self {
        RangeSet::from_range(range)
    }
}

impl FromIterator<Range<i64>> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range<i64>>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}
