use std::cmp::Ordering;
use std::collections::HashMap;

use super::bucket::RankedEntry;
use super::function::AggregateState;

/// Descending by value, ties broken by dimension value ascending.
fn rank_order(a: &RankedEntry, b: &RankedEntry) -> Ordering {
    b.value
        .total_cmp(&a.value)
        .then_with(|| a.dimension_value.cmp(&b.dimension_value))
}

/// Turn per-dimension-value states into the `n` best entries.
///
/// Uses a partial selection first, so only the winners are fully sorted.
pub fn top_n(groups: HashMap<String, AggregateState>, n: usize) -> Vec<RankedEntry> {
    let mut entries: Vec<RankedEntry> = groups
        .into_iter()
        .filter_map(|(dimension_value, state)| {
            Some(RankedEntry {
                value: state.value()?,
                sample_count: state.sample_count(),
                dimension_value,
            })
        })
        .collect();
    if n == 0 {
        return Vec::new();
    }
    if entries.len() > n {
        entries.select_nth_unstable_by(n - 1, rank_order);
        entries.truncate(n);
    }
    entries.sort_by(rank_order);
    entries
}
