//! Record collection merge
//!
//! Pure merge/dedup used when freshly fetched records land on top of a
//! cached collection.

use std::collections::HashMap;

use super::record::Record;

/// Merge `incoming` into `existing` by id.
///
/// Incoming always wins on an id collision, regardless of either record's
/// date (last-writer-wins per merge call). The result is sorted by
/// normalized date descending, newest first; records whose date fails to
/// parse sort last.
pub fn merge(existing: &[Record], incoming: &[Record]) -> Vec<Record> {
    let mut by_id: HashMap<&str, &Record> =
        HashMap::with_capacity(existing.len() + incoming.len());
    for record in existing.iter().chain(incoming.iter()) {
        by_id.insert(record.id.as_str(), record);
    }

    let mut merged: Vec<Record> = by_id.into_values().cloned().collect();
    merged.sort_by(|a, b| b.date.instant().cmp(&a.date.instant()));
    merged
}
