//! Sorted set of disjoint, non-adjacent half-open `u64` ranges.
//!
//! Used for received packet numbers (selective acknowledgment) and for the
//! acknowledged / lost byte ranges of a stream's send buffer.

use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Insert `range`, merging it with overlapping or adjacent ranges.
    ///
    /// Returns true if at least one value was not already present.
    pub fn insert(&mut self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return false;
        }
        let mut start = range.start;
        let mut end = range.end;

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= end {
                return false;
            }
            if e >= start {
                self.ranges.remove(&s);
                start = s;
            }
        }

        while let Some((s, e)) = self.ranges.range(start..=end).next().map(|(&s, &e)| (s, e)) {
            self.ranges.remove(&s);
            end = end.max(e);
        }

        self.ranges.insert(start, end);
        true
    }

    /// Remove every value in `range`, splitting ranges as needed.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }

        if let Some((&s, &e)) = self.ranges.range(..range.start).next_back() {
            if e > range.start {
                self.ranges.insert(s, range.start);
                if e > range.end {
                    self.ranges.insert(range.end, e);
                    return;
                }
            }
        }

        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(range.start..range.end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if e > range.end {
                self.ranges.insert(range.end, e);
            }
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges
            .range(..=value)
            .next_back()
            .is_some_and(|(_, &e)| value < e)
    }

    /// Whether every value of `range` is present.
    pub fn contains_range(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        self.ranges
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &e)| e >= range.end)
    }

    pub fn first(&self) -> Option<Range<u64>> {
        self.ranges.first_key_value().map(|(&s, &e)| s..e)
    }

    pub fn last(&self) -> Option<Range<u64>> {
        self.ranges.last_key_value().map(|(&s, &e)| s..e)
    }

    pub fn pop_first(&mut self) -> Option<Range<u64>> {
        self.ranges.pop_first().map(|(s, e)| s..e)
    }

    /// Largest value in the set.
    pub fn max(&self) -> Option<u64> {
        self.last().map(|r| r.end - 1)
    }

    /// Ranges in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }

    /// Drop the lowest ranges until at most `max` remain. Returns the new
    /// lowest value if anything was dropped.
    pub fn truncate_low(&mut self, max: usize) -> Option<u64> {
        let mut dropped = false;
        while self.ranges.len() > max.max(1) {
            self.ranges.pop_first();
            dropped = true;
        }
        if dropped {
            self.first().map(|r| r.start)
        } else {
            None
        }
    }

    /// Sub-ranges of `range` that are not present in the set.
    pub fn gaps_in(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        if range.start >= range.end {
            return gaps;
        }
        let mut cursor = range.start;
        if let Some((_, &e)) = self.ranges.range(..=range.start).next_back() {
            cursor = cursor.max(e);
        }
        for (&s, &e) in self.ranges.range(range.start..range.end) {
            if cursor >= range.end {
                break;
            }
            if s > cursor {
                gaps.push(cursor..s);
            }
            cursor = cursor.max(e);
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }
}
