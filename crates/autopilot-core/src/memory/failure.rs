//! FailureMemory - 何が壊れ、何を試し、何が効いたか

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ring::RingBuffer;
use crate::domain::FailureId;
use crate::observability::StoreStats;
use crate::ports::{Clock, IdGenerator};

/// 窓の中でこの回数起きたら「再発」
pub const RECURRING_THRESHOLD: usize = 3;
pub const DEFAULT_RECURRING_WINDOW_MINUTES: i64 = 60;
const STATS_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Default)]
pub struct FailureInput {
    pub source_name: String,
    pub error_type: String,
    pub error_message: String,
    pub context: serde_json::Value,
    pub recovery_action: Option<String>,
    pub recovery_succeeded: Option<bool>,
    pub recovery_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub id: FailureId,
    pub source_name: String,
    pub error_type: String,
    pub error_message: String,
    pub context: serde_json::Value,
    pub recovery_action: Option<String>,
    pub recovery_succeeded: Option<bool>,
    pub recovery_time_ms: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPath {
    pub action: String,
    pub success_rate: f64,
    pub average_recovery_time_ms: f64,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStats {
    pub total_failures: usize,
    pub unique_error_types: usize,
    pub recovery_success_rate: f64,
    pub average_recovery_time_ms: f64,
}

pub struct FailureMemory {
    records: RwLock<RingBuffer<FailureRecord>>,
    recurring_window: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl FailureMemory {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            records: RwLock::new(RingBuffer::new(capacity)),
            recurring_window: Duration::minutes(DEFAULT_RECURRING_WINDOW_MINUTES),
            clock,
            ids,
        }
    }

    pub fn with_recurring_window(mut self, window: Duration) -> Self {
        self.recurring_window = window;
        self
    }

    pub fn record_failure(&self, input: FailureInput) -> FailureId {
        let id = self.ids.generate_failure_id();
        let record = FailureRecord {
            id,
            source_name: input.source_name,
            error_type: input.error_type,
            error_message: input.error_message,
            context: input.context,
            recovery_action: input.recovery_action,
            recovery_succeeded: input.recovery_succeeded,
            recovery_time_ms: input.recovery_time_ms,
            occurred_at: self.clock.now(),
        };
        debug!(
            source = %record.source_name,
            error_type = %record.error_type,
            recovery = ?record.recovery_action,
            "failure recorded"
        );
        self.records.write().push(record);
        id
    }

    /// Most recent failures of `source`, newest first.
    pub fn failure_history(&self, source: &str, limit: usize) -> Vec<FailureRecord> {
        self.records
            .read()
            .iter_recent()
            .filter(|f| f.source_name == source)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Recovery actions tried for `(source, error_type)`, best first
    /// (successes desc, then occurrences desc).
    pub fn recovery_paths(&self, source: &str, error_type: &str) -> Vec<RecoveryPath> {
        #[derive(Default)]
        struct Acc {
            occurrences: usize,
            successes: usize,
            time_sum: u64,
            timed: usize,
        }

        let mut by_action: BTreeMap<String, Acc> = BTreeMap::new();
        for f in self
            .records
            .read()
            .iter()
            .filter(|f| f.source_name == source && f.error_type == error_type)
        {
            let Some(action) = &f.recovery_action else {
                continue;
            };
            let acc = by_action.entry(action.clone()).or_default();
            acc.occurrences += 1;
            if f.recovery_succeeded == Some(true) {
                acc.successes += 1;
            }
            if let Some(ms) = f.recovery_time_ms {
                acc.time_sum += ms;
                acc.timed += 1;
            }
        }

        let mut paths: Vec<(usize, RecoveryPath)> = by_action
            .into_iter()
            .map(|(action, acc)| {
                let path = RecoveryPath {
                    action,
                    success_rate: acc.successes as f64 / acc.occurrences as f64,
                    average_recovery_time_ms: if acc.timed == 0 {
                        0.0
                    } else {
                        acc.time_sum as f64 / acc.timed as f64
                    },
                    occurrences: acc.occurrences,
                };
                (acc.successes, path)
            })
            .collect();
        paths.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.occurrences.cmp(&a.1.occurrences))
        });
        paths.into_iter().map(|(_, p)| p).collect()
    }

    /// 最後に成功した回復（なければ `None`）
    ///
    /// `None` は「既知の回復なし」。呼び出し側は推測せずにエスカレーションする。
    pub fn last_successful_recovery(&self, source: &str, error_type: &str) -> Option<RecoveryPath> {
        self.records
            .read()
            .iter_recent()
            .find(|f| {
                f.source_name == source
                    && f.error_type == error_type
                    && f.recovery_succeeded == Some(true)
                    && f.recovery_action.is_some()
            })
            .and_then(|f| {
                Some(RecoveryPath {
                    action: f.recovery_action.clone()?,
                    success_rate: 1.0,
                    average_recovery_time_ms: f.recovery_time_ms.unwrap_or(0) as f64,
                    occurrences: 1,
                })
            })
    }

    /// `(source, error_type)` が再発の窓の中で 3 回以上起きていれば true
    pub fn is_recurring_failure(&self, source: &str, error_type: &str) -> bool {
        let cutoff = self.clock.now() - self.recurring_window;
        let count = self
            .records
            .read()
            .iter()
            .filter(|f| {
                f.occurred_at > cutoff && f.source_name == source && f.error_type == error_type
            })
            .count();
        if count >= RECURRING_THRESHOLD {
            warn!(source, error_type, count, "recurring failure");
            true
        } else {
            false
        }
    }

    /// Failure statistics of `source` over 7 d.
    pub fn failure_stats(&self, source: &str) -> FailureStats {
        let cutoff = self.clock.now() - Duration::days(STATS_WINDOW_DAYS);
        let records = self.records.read();

        let mut total = 0usize;
        let mut kinds = HashSet::new();
        let mut recovered = 0usize;
        let mut time_sum = 0u64;
        let mut timed = 0usize;
        for f in records
            .iter()
            .filter(|f| f.source_name == source && f.occurred_at > cutoff)
        {
            total += 1;
            kinds.insert(f.error_type.as_str());
            if f.recovery_succeeded == Some(true) {
                recovered += 1;
                if let Some(ms) = f.recovery_time_ms {
                    time_sum += ms;
                    timed += 1;
                }
            }
        }

        FailureStats {
            total_failures: total,
            unique_error_types: kinds.len(),
            recovery_success_rate: if total == 0 {
                0.0
            } else {
                recovered as f64 / total as f64
            },
            average_recovery_time_ms: if timed == 0 {
                0.0
            } else {
                time_sum as f64 / timed as f64
            },
        }
    }

    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        self.records.write().retain(|f| f.occurred_at >= cutoff)
    }

    pub fn stats(&self) -> StoreStats {
        let records = self.records.read();
        StoreStats {
            len: records.len(),
            capacity: records.capacity(),
            evicted: records.evicted(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;

    fn memory() -> (FailureMemory, Arc<FixedClock>) {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        (FailureMemory::new(1000, clock.clone(), ids), clock)
    }

    fn failure(error_type: &str) -> FailureInput {
        FailureInput {
            source_name: "pg".into(),
            error_type: error_type.into(),
            error_message: "boom".into(),
            ..Default::default()
        }
    }

    fn recovered(error_type: &str, action: &str, ok: bool, ms: u64) -> FailureInput {
        FailureInput {
            recovery_action: Some(action.into()),
            recovery_succeeded: Some(ok),
            recovery_time_ms: Some(ms),
            ..failure(error_type)
        }
    }

    #[test]
    fn last_successful_recovery_is_most_recent_success() {
        let (mem, clock) = memory();
        assert_eq!(mem.last_successful_recovery("pg", "ETIMEDOUT"), None);

        mem.record_failure(recovered("ETIMEDOUT", "retry", true, 100));
        clock.advance(Duration::seconds(1));
        mem.record_failure(recovered("ETIMEDOUT", "reconnect", true, 300));
        clock.advance(Duration::seconds(1));
        mem.record_failure(recovered("ETIMEDOUT", "failover", false, 900));
        mem.record_failure(recovered("ECONNRESET", "reset", true, 5));

        let last = mem.last_successful_recovery("pg", "ETIMEDOUT").unwrap();
        assert_eq!(last.action, "reconnect");
        assert_eq!(last.average_recovery_time_ms, 300.0);
    }

    #[test]
    fn unrecovered_failures_have_no_known_recovery() {
        let (mem, _) = memory();
        mem.record_failure(failure("ETIMEDOUT"));
        mem.record_failure(recovered("ETIMEDOUT", "retry", false, 10));
        assert_eq!(mem.last_successful_recovery("pg", "ETIMEDOUT"), None);
    }

    #[test]
    fn recurring_needs_three_within_window() {
        let (mem, clock) = memory();
        mem.record_failure(failure("ECONNRESET"));
        clock.advance(Duration::minutes(61));
        mem.record_failure(failure("ECONNRESET"));
        mem.record_failure(failure("ECONNRESET"));
        assert!(!mem.is_recurring_failure("pg", "ECONNRESET"));

        mem.record_failure(failure("ECONNRESET"));
        assert!(mem.is_recurring_failure("pg", "ECONNRESET"));
        assert!(!mem.is_recurring_failure("pg", "ETIMEDOUT"));
    }

    #[test]
    fn recovery_paths_rank_by_successes() {
        let (mem, _) = memory();
        mem.record_failure(recovered("E", "restart", false, 50));
        mem.record_failure(recovered("E", "restart", false, 50));
        mem.record_failure(recovered("E", "retry", true, 10));
        mem.record_failure(recovered("E", "retry", true, 30));
        mem.record_failure(recovered("E", "retry", false, 20));
        mem.record_failure(failure("E"));

        let paths = mem.recovery_paths("pg", "E");
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].action, "retry");
        assert_eq!(paths[0].occurrences, 3);
        assert!((paths[0].success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(paths[0].average_recovery_time_ms, 20.0);
        assert_eq!(paths[1].action, "restart");
        assert_eq!(paths[1].success_rate, 0.0);
    }

    #[test]
    fn failure_stats_over_seven_days() {
        let (mem, clock) = memory();
        mem.record_failure(failure("OLD"));
        clock.advance(Duration::days(8));
        mem.record_failure(recovered("A", "retry", true, 40));
        mem.record_failure(recovered("B", "retry", false, 10));
        mem.record_failure(failure("A"));

        let stats = mem.failure_stats("pg");
        assert_eq!(stats.total_failures, 3);
        assert_eq!(stats.unique_error_types, 2);
        assert!((stats.recovery_success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.average_recovery_time_ms, 40.0);
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let (mem, _) = memory();
        mem.record_failure(failure("A"));
        let b = mem.record_failure(failure("B"));
        let history = mem.failure_history("pg", 1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, b);
    }
}
