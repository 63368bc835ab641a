//! Heartbeat liveness reconciliation.

use std::collections::HashSet;

use serde::Serialize;

use execq_core::RecordId;

/// Result of reconciling an executor's claimed jobs against the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatOutcome {
    /// Claimed jobs the store still assigns to the executor.
    pub known_ids: Vec<RecordId>,
    /// Claimed jobs the executor must abandon: finished, reassigned,
    /// cancelled, or never existed.
    pub cancel_ids: Vec<RecordId>,
}

/// Split `claimed` into known and abandon sets.
///
/// Both lists keep the caller's order and contain no duplicates; together they
/// cover every distinct claimed id exactly once.
pub fn reconcile(claimed: &[RecordId], known: &[RecordId]) -> HeartbeatOutcome {
    let known: HashSet<RecordId> = known.iter().copied().collect();
    let mut seen = HashSet::with_capacity(claimed.len());
    let mut outcome = HeartbeatOutcome::default();

    for id in claimed {
        if !seen.insert(*id) {
            continue;
        }
        if known.contains(id) {
            outcome.known_ids.push(*id);
        } else {
            outcome.cancel_ids.push(*id);
        }
    }

    outcome
}
