use crate::model::Change;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When and how changes are folded into chunks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistLimits {
    /// Changes newer than this stay buffered. `None` makes every change
    /// eligible.
    pub min_change_timestamp: Option<DateTime<Utc>>,
    /// A flush happens once any eligible change is older than this. `None`
    /// treats every eligible change as overdue.
    pub max_change_timestamp: Option<DateTime<Utc>>,
    pub max_changes: Option<usize>,
    pub max_change_bytes: Option<usize>,
    pub max_chunk_changes: usize,
    pub max_chunk_change_bytes: usize,
    /// Request a resync when replayed content disagrees with its hash.
    pub auto_resync: bool,
}

impl Default for PersistLimits {
    fn default() -> Self {
        Self {
            min_change_timestamp: None,
            max_change_timestamp: None,
            max_changes: None,
            max_change_bytes: None,
            max_chunk_changes: 1000,
            max_chunk_change_bytes: 5 * 1024 * 1024,
            auto_resync: false,
        }
    }
}

impl PersistLimits {
    /// Length of the prefix of `changes` old enough to persist.
    pub fn eligible_count(&self, changes: &[Change]) -> usize {
        match self.min_change_timestamp {
            None => changes.len(),
            Some(min) => changes.iter().take_while(|c| c.timestamp() < min).count(),
        }
    }

    /// Whether an eligible batch is large or old enough to flush now.
    pub fn should_flush(&self, eligible: &[Change], total_bytes: usize) -> bool {
        if eligible.is_empty() {
            return false;
        }
        let overdue = match self.max_change_timestamp {
            None => true,
            Some(max) => eligible.iter().any(|c| c.timestamp() < max),
        };
        overdue
            || self.max_changes.is_some_and(|max| eligible.len() > max)
            || self.max_change_bytes.is_some_and(|max| total_bytes > max)
    }
}

/// What to do when an edit's expected content hash does not match the
/// replayed content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMismatchPolicy {
    /// Log once per flush, keep the change and flag a resync.
    #[default]
    Lenient,
    /// Reject the change.
    Strict,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(ts: DateTime<Utc>) -> Change {
        Change::new(vec![], ts)
    }

    #[test]
    fn test_eligible_prefix() {
        let now = Utc::now();
        let changes = vec![
            at(now - Duration::hours(3)),
            at(now - Duration::hours(2)),
            at(now - Duration::minutes(1)),
            at(now - Duration::hours(4)),
        ];
        let limits = PersistLimits {
            min_change_timestamp: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(limits.eligible_count(&changes), 2);
        assert_eq!(PersistLimits::default().eligible_count(&changes), 4);
    }

    #[test]
    fn test_flush_triggers() {
        let now = Utc::now();
        let recent = vec![at(now), at(now)];
        let limits = PersistLimits {
            max_change_timestamp: Some(now - Duration::hours(2)),
            ..Default::default()
        };
        assert!(!limits.should_flush(&recent, 10));
        assert!(!limits.should_flush(&[], 10));
        assert!(limits.should_flush(&[at(now - Duration::hours(3))], 10));

        let by_count = PersistLimits {
            max_changes: Some(1),
            ..limits.clone()
        };
        assert!(by_count.should_flush(&recent, 10));

        let by_bytes = PersistLimits {
            max_change_bytes: Some(5),
            ..limits
        };
        assert!(by_bytes.should_flush(&recent, 10));
        assert!(PersistLimits::default().should_flush(&recent, 0));
    }
}
