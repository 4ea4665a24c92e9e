//! Sets of disjoint half-open byte ranges.
//!
//! The content cache tracks which bytes are resident locally and which are
//! dirty with one [`RangeSet`] each. Ranges are kept sorted, non-overlapping
//! and non-adjacent: inserting `[0, 4)` and `[4, 8)` yields `[0, 8)`.

use cloudfs_core::ports::ByteRange;

/// Sorted set of disjoint, coalesced `[start, end)` intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of bytes covered.
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Iterates the ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    /// Removes every range.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Adds `range`, merging it with any overlapping or adjacent ranges.
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        // First range whose end reaches the new start (adjacent counts).
        let lo = self.ranges.partition_point(|r| r.end < range.start);
        // First range that starts strictly after the new end.
        let hi = self.ranges.partition_point(|r| r.start <= range.end);

        let mut merged = range;
        if lo < hi {
            merged.start = merged.start.min(self.ranges[lo].start);
            merged.end = merged.end.max(self.ranges[hi - 1].end);
        }
        self.ranges.splice(lo..hi, std::iter::once(merged));
    }

    /// Subtracts `range` from the set, splitting ranges that straddle it.
    pub fn remove(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        let lo = self.ranges.partition_point(|r| r.end <= range.start);
        let hi = self.ranges.partition_point(|r| r.start < range.end);
        if lo >= hi {
            return;
        }

        let mut kept = Vec::with_capacity(2);
        let first = self.ranges[lo];
        let last = self.ranges[hi - 1];
        if first.start < range.start {
            kept.push(ByteRange::new(first.start, range.start));
        }
        if last.end > range.end {
            kept.push(ByteRange::new(range.end, last.end));
        }
        self.ranges.splice(lo..hi, kept);
    }

    /// Drops everything at or beyond `len`.
    pub fn truncate(&mut self, len: u64) {
        self.remove(ByteRange::new(len, u64::MAX));
    }

    /// Returns true if every byte of `range` is in the set.
    pub fn contains(&self, range: ByteRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.start <= range.start && r.end >= range.end)
    }

    /// Returns true if any byte of `range` is in the set.
    pub fn overlaps(&self, range: ByteRange) -> bool {
        if range.is_empty() {
            return false;
        }
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges.get(idx).is_some_and(|r| r.start < range.end)
    }

    /// The parts of `range` covered by the set, in ascending order.
    pub fn intersection(&self, range: ByteRange) -> Vec<ByteRange> {
        if range.is_empty() {
            return Vec::new();
        }
        let lo = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges[lo..]
            .iter()
            .take_while(|r| r.start < range.end)
            .map(|r| ByteRange::new(r.start.max(range.start), r.end.min(range.end)))
            .collect()
    }

    /// The parts of `range` not covered by the set, in ascending order.
    pub fn gaps(&self, range: ByteRange) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = range.start;
        for covered in self.intersection(range) {
            if covered.start > cursor {
                gaps.push(ByteRange::new(cursor, covered.start));
            }
            cursor = covered.end;
        }
        if cursor < range.end {
            gaps.push(ByteRange::new(cursor, range.end));
        }
        gaps
    }
}

impl FromIterator<ByteRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = ByteRange>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

/// Splits `range` into consecutive pieces of at most `max_len` bytes.
pub fn split_range(range: ByteRange, max_len: u64) -> Vec<ByteRange> {
    let max_len = max_len.max(1);
    let mut pieces = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = range.end.min(start.saturating_add(max_len));
        pieces.push(ByteRange::new(start, end));
        start = end;
    }
    pieces
}
