//! Removes candidates that were already delivered in an earlier run.
//!
//! Read-only against the store: nothing is marked seen here.

use crate::error::StoreError;
use crate::models::CandidateItem;
use crate::state::StateStore;
use std::collections::HashSet;
use tracing::debug;

/// Keep candidates whose `(id, source)` is not in the seen-set, dropping
/// repeats within the batch as well.
pub fn filter_unseen(
    candidates: Vec<CandidateItem>,
    store: &StateStore,
) -> Result<Vec<CandidateItem>, StoreError> {
    let total = candidates.len();
    let mut in_batch = HashSet::new();
    let mut fresh = Vec::with_capacity(total);

    for item in candidates {
        if !in_batch.insert(item.key()) {
            continue;
        }
        if store.has_seen(&item.id, &item.source)? {
            continue;
        }
        fresh.push(item);
    }

    debug!("Dedup kept {} of {} candidate(s)", fresh.len(), total);
    Ok(fresh)
}
