use std::collections::hash_map::Entry;
use std::collections::HashMap;

use cmdb_store::{ChangeEvent, OperationType};

/// Collapses a batch of change events to at most one event per row.
///
/// The newest event of a row wins and keeps its position in the stream. A row
/// whose first event in the batch is an insert did not exist before the batch:
/// if it ends deleted nothing is emitted for it, otherwise its surviving event
/// becomes an insert.
#[must_use]
pub fn aggregate(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    // (collection, oid) -> (first operation, position of the newest event)
    let mut rows: HashMap<(&str, &str), (OperationType, usize)> = HashMap::new();

    for (idx, event) in events.iter().enumerate() {
        match rows.entry((event.collection.as_str(), event.oid.as_str())) {
            Entry::Occupied(mut entry) => entry.get_mut().1 = idx,
            Entry::Vacant(entry) => {
                let _ignored = entry.insert((event.operation, idx));
            }
        }
    }

    let mut keep = vec![None; events.len()];
    for (first, newest) in rows.into_values() {
        if let Some(slot) = keep.get_mut(newest) {
            *slot = Some(first);
        }
    }

    events
        .into_iter()
        .zip(keep)
        .filter_map(|(mut event, first)| {
            let first = first?;

            if first != OperationType::Insert {
                return Some(event);
            }

            match event.operation {
                OperationType::Delete => None,
                OperationType::Insert | OperationType::Update => {
                    event.operation = OperationType::Insert;
                    Some(event)
                }
            }
        })
        .collect()
}
