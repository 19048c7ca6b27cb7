//! # Byte ranges
//!
//! Byte ranges of a single resource and the set algebra used by the fragment
//! store and the action planner.
//!
//! A range is a `[lower, upper]` pair of offsets where `upper` is the end
//! offset: the range covers `upper - lower` bytes, a write of `n` bytes at
//! offset `o` is recorded as `[o, o + n]`, and an HTTP request for the range
//! asks for `bytes=lower-(upper - 1)`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A span of bytes within one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct ByteRange {
    pub lower: u64,
    pub upper: u64,
}

impl ByteRange {
    pub const fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// Range starting at `offset` spanning `len` bytes.
    pub fn with_len(offset: u64, len: u64) -> Self {
        Self::new(offset, offset.saturating_add(len))
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.upper.saturating_sub(self.lower)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A range is valid when it covers at least one byte.
    pub fn is_valid(&self) -> bool {
        self.lower < self.upper
    }

    /// Whether the two ranges share at least one byte.
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }

    /// Whether the two ranges can be merged into one contiguous range.
    pub fn touches(&self, other: &ByteRange) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    /// Intersection with `bounds`, `None` when they share no byte.
    pub fn clamped(&self, bounds: &ByteRange) -> Option<ByteRange> {
        let clamped = ByteRange::new(self.lower.max(bounds.lower), self.upper.min(bounds.upper));
        clamped.is_valid().then_some(clamped)
    }

    /// Splits the range into consecutive pieces of at most `limit` bytes.
    pub fn split(&self, limit: u64) -> Vec<ByteRange> {
        if !self.is_valid() {
            return Vec::new();
        }
        if limit == 0 {
            return vec![*self];
        }

        let mut pieces = Vec::with_capacity(self.len().div_ceil(limit) as usize);
        let mut lower = self.lower;
        while lower < self.upper {
            let upper = lower.saturating_add(limit).min(self.upper);
            pieces.push(ByteRange::new(lower, upper));
            lower = upper;
        }
        pieces
    }

    /// The parts of `self` not covered by any of `ranges`, ascending.
    pub fn subtracting(&self, ranges: &[ByteRange]) -> Vec<ByteRange> {
        let mut covering: Vec<ByteRange> = ranges
            .iter()
            .filter_map(|range| range.clamped(self))
            .collect();
        covering.sort();

        let mut gaps = Vec::new();
        let mut cursor = self.lower;
        for range in covering {
            if range.lower > cursor {
                gaps.push(ByteRange::new(cursor, range.lower));
            }
            cursor = cursor.max(range.upper);
        }
        if cursor < self.upper {
            gaps.push(ByteRange::new(cursor, self.upper));
        }
        gaps
    }

    /// Value of an HTTP `Range` header requesting exactly this range.
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.lower, self.upper.saturating_sub(1))
    }
}

impl From<(u64, u64)> for ByteRange {
    fn from((lower, upper): (u64, u64)) -> Self {
        Self::new(lower, upper)
    }
}

impl From<ByteRange> for (u64, u64) {
    fn from(range: ByteRange) -> Self {
        (range.lower, range.upper)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// Inserts `range` into a sorted, disjoint set, merging anything it touches.
pub(crate) fn union_into(ranges: &mut Vec<ByteRange>, range: ByteRange) {
    let mut merged = range;
    let mut result = Vec::with_capacity(ranges.len() + 1);
    let mut inserted = false;

    for existing in ranges.drain(..) {
        if existing.touches(&merged) {
            merged = ByteRange::new(
                merged.lower.min(existing.lower),
                merged.upper.max(existing.upper),
            );
        } else if existing.upper < merged.lower {
            result.push(existing);
        } else {
            if !inserted {
                result.push(merged);
                inserted = true;
            }
            result.push(existing);
        }
    }
    if !inserted {
        result.push(merged);
    }

    *ranges = result;
}

/// Stored ranges intersecting `query`, each clamped to it.
pub(crate) fn overlapping(ranges: &[ByteRange], query: &ByteRange) -> Vec<ByteRange> {
    ranges
        .iter()
        .filter_map(|range| range.clamped(query))
        .collect()
}
