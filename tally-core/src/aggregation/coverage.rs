use std::ops::Range;

/// A set of disjoint half-open intervals. New intervals are merged with any
/// overlapping or touching neighbours on insert, so the set is always sorted.
#[derive(Clone, Debug, Default)]
pub struct DisjointIntervals<T: Ord + Clone> {
    intervals: Vec<Range<T>>,
}

impl<T: Ord + Clone> DisjointIntervals<T> {
    pub fn new() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }

    pub fn add_interval(&mut self, interval: Range<T>) {
        if interval.start >= interval.end {
            return;
        }
        let mut merged = interval;
        let mut kept = Vec::with_capacity(self.intervals.len() + 1);
        for existing in self.intervals.drain(..) {
            if existing.end < merged.start || merged.end < existing.start {
                kept.push(existing);
            } else {
                // Overlapping or adjacent, absorb it
                merged = Range {
                    start: existing.start.min(merged.start),
                    end: existing.end.max(merged.end),
                };
            }
        }
        let position = kept
            .iter()
            .position(|i| i.start > merged.start)
            .unwrap_or(kept.len());
        kept.insert(position, merged);
        self.intervals = kept;
    }

    /// The parts of `range` not covered by any interval, in order.
    pub fn gaps(&self, range: Range<T>) -> Vec<Range<T>> {
        let mut gaps = Vec::new();
        let mut cursor = range.start;
        for interval in &self.intervals {
            if interval.end <= cursor {
                continue;
            }
            if interval.start >= range.end {
                break;
            }
            if interval.start > cursor {
                gaps.push(cursor.clone()..interval.start.clone());
            }
            cursor = cursor.max(interval.end.clone());
            if cursor >= range.end {
                return gaps;
            }
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn as_slice(&self) -> &[Range<T>] {
        &self.intervals
    }
}
