use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bucket::HistoryEntry;

/// Workspace-wide limits on what the history keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryPolicy {
    /// States older than this many seconds are evicted on cleanup.
    pub file_state_longevity_secs: u64,
    /// Most states kept per path.
    pub max_file_states: usize,
    /// Files larger than this many bytes are never recorded.
    pub max_file_state_size: u64,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            file_state_longevity_secs: 7 * 24 * 60 * 60,
            max_file_states: 50,
            max_file_state_size: 1024 * 1024,
        }
    }
}

impl HistoryPolicy {
    pub fn longevity(&self) -> Duration {
        let secs = self.file_state_longevity_secs.min((i64::MAX / 1000) as u64);
        Duration::seconds(secs as i64)
    }

    /// Snapshot of the limits for one sweep, relative to the current time.
    pub fn cutoff(&self) -> Cutoff {
        let now = Utc::now().timestamp_millis();
        Cutoff {
            max_states: self.max_file_states,
            min_timestamp: now.saturating_sub(self.longevity().num_milliseconds()),
        }
    }

    pub fn accepts_size(&self, length: u64) -> bool {
        length <= self.max_file_state_size
    }
}

/// Retention limits fixed at the start of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoff {
    pub max_states: usize,
    /// Milliseconds since the epoch; anything older is evicted.
    pub min_timestamp: i64,
}

/// Evicts occurrences past `max_states` or older than `min_timestamp`,
/// queueing their blobs in `pending`. Returns the number evicted.
///
/// Entries are ordered newest first, so the first `max_states` indices are
/// the most recent states.
pub fn apply_policy(entry: &mut HistoryEntry, cutoff: Cutoff, pending: &mut HashSet<Uuid>) -> usize {
    let before = entry.len();
    entry.retain(|i, o| {
        let keep = i < cutoff.max_states && o.timestamp >= cutoff.min_timestamp;
        if !keep {
            pending.insert(o.id);
        }
        keep
    });
    before - entry.len()
}

/// Removes every still-referenced id from the pending set.
pub fn reconcile<I>(live: I, mut pending: HashSet<Uuid>) -> HashSet<Uuid>
where
    I: IntoIterator<Item = Uuid>,
{
    for id in live {
        pending.remove(&id);
        if pending.is_empty() {
            break;
        }
    }
    pending
}
