//! CognitiveMemory - pattern / failure memory と source ごとの health 履歴への単一の読み口

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::failure::{FailureInput, FailureMemory, FailureRecord, RecoveryPath};
use super::pattern::{PatternMemory, QueryInput, UsagePattern};
use super::ring::RingBuffer;
use super::MemoryCapacities;
use crate::domain::{FailureId, QueryId};
use crate::observability::{MemoryStats, StoreStats};
use crate::ports::{Clock, IdGenerator};

/// `source_intelligence` が見る失敗の件数
const RECENT_FAILURE_LIMIT: usize = 10;
/// 最新の health スコアがこれ未満なら unhealthy
const UNHEALTHY_SCORE: f64 = 0.5;
/// Smoothing constant of the failure-count fallback.
const FAILURE_SMOOTHING: f64 = 1000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub source_name: String,
    /// 0.0 ..= 1.0
    pub health_score: f64,
    pub latency: LatencyPercentiles,
    pub success_rate: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIntelligence {
    pub average_latency: f64,
    pub overall_success_rate: f64,
    pub recent_failures: usize,
    pub last_failure: Option<FailureRecord>,
    /// error type -> recovery paths tried for it
    pub known_recovery_paths: BTreeMap<String, Vec<RecoveryPath>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthSample {
    pub timestamp: DateTime<Utc>,
    pub global_health: f64,
    pub source_count: usize,
    pub unhealthy_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub cutoff: DateTime<Utc>,
    pub patterns_pruned: usize,
    pub failures_pruned: usize,
    pub health_pruned: usize,
    pub samples_pruned: usize,
}

/// CognitiveMemory はプロセスに 1 つ作って engine / healer に注入する
pub struct CognitiveMemory {
    patterns: PatternMemory,
    failures: FailureMemory,
    health: RwLock<HashMap<String, RingBuffer<HealthMetrics>>>,
    history: RwLock<RingBuffer<SystemHealthSample>>,
    health_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl CognitiveMemory {
    pub fn new(capacities: MemoryCapacities, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            patterns: PatternMemory::new(capacities.patterns, Arc::clone(&clock), Arc::clone(&ids)),
            failures: FailureMemory::new(capacities.failures, Arc::clone(&clock), ids),
            health: RwLock::new(HashMap::new()),
            history: RwLock::new(RingBuffer::new(capacities.metrics_history)),
            health_capacity: capacities.health_per_source,
            clock,
        }
    }

    pub fn patterns(&self) -> &PatternMemory {
        &self.patterns
    }

    pub fn failures(&self) -> &FailureMemory {
        &self.failures
    }

    // pattern memory

    pub fn record_query(&self, input: QueryInput) -> QueryId {
        self.patterns.record_query(input)
    }

    pub fn average_latency(&self, source: &str) -> f64 {
        self.patterns.average_latency(source)
    }

    pub fn success_rate(&self, source: &str, query_type: &str) -> f64 {
        self.patterns.success_rate(source, query_type)
    }

    pub fn similar_query_success(&self, query_type: &str, params: &serde_json::Value) -> f64 {
        self.patterns.similar_query_success(query_type, params)
    }

    pub fn widget_patterns(&self, widget_id: &str) -> UsagePattern {
        self.patterns.widget_patterns(widget_id)
    }

    // failure memory

    pub fn record_failure(&self, input: FailureInput) -> FailureId {
        self.failures.record_failure(input)
    }

    pub fn recovery_paths(&self, source: &str, error_type: &str) -> Vec<RecoveryPath> {
        self.failures.recovery_paths(source, error_type)
    }

    pub fn last_successful_recovery(&self, source: &str, error_type: &str) -> Option<RecoveryPath> {
        self.failures.last_successful_recovery(source, error_type)
    }

    pub fn is_recurring_failure(&self, source: &str, error_type: &str) -> bool {
        self.failures.is_recurring_failure(source, error_type)
    }

    // health

    pub fn record_health_metrics(&self, metrics: HealthMetrics) {
        let mut health = self.health.write();
        health
            .entry(metrics.source_name.clone())
            .or_insert_with(|| RingBuffer::new(self.health_capacity))
            .push(metrics);
    }

    /// Newest first.
    pub fn health_history(&self, source: &str, limit: usize) -> Vec<HealthMetrics> {
        self.health
            .read()
            .get(source)
            .map(|ring| ring.iter_recent().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Mean of each source's latest health score; 1.0 without data.
    pub fn global_health(&self) -> f64 {
        let health = self.health.read();
        let latest: Vec<f64> = health
            .values()
            .filter_map(|ring| ring.latest().map(|m| m.health_score))
            .collect();
        if latest.is_empty() {
            1.0
        } else {
            latest.iter().sum::<f64>() / latest.len() as f64
        }
    }

    /// 現在の health をスナップショットして metrics 履歴に積む
    pub fn analyze_system_health(&self) -> SystemHealthSample {
        let (source_count, mut unhealthy_sources) = {
            let health = self.health.read();
            let unhealthy: Vec<String> = health
                .iter()
                .filter(|(_, ring)| ring.latest().is_some_and(|m| m.health_score < UNHEALTHY_SCORE))
                .map(|(name, _)| name.clone())
                .collect();
            (health.len(), unhealthy)
        };
        unhealthy_sources.sort();

        let sample = SystemHealthSample {
            timestamp: self.clock.now(),
            global_health: self.global_health(),
            source_count,
            unhealthy_sources,
        };
        self.history.write().push(sample.clone());
        sample
    }

    /// Newest first.
    pub fn health_samples(&self, limit: usize) -> Vec<SystemHealthSample> {
        self.history.read().iter_recent().take(limit).cloned().collect()
    }

    /// source の順位付けと回復戦略の選択に使う要約
    ///
    /// The success rate comes from the last 7 d of queries; without query
    /// data it falls back to `1 - f / (f + 1000)` over the 7 d failure count.
    pub fn source_intelligence(&self, source: &str) -> SourceIntelligence {
        let history = self.failures.failure_history(source, RECENT_FAILURE_LIMIT);

        let overall_success_rate = self.patterns.source_success_rate(source).unwrap_or_else(|| {
            let f = self.failures.failure_stats(source).total_failures as f64;
            1.0 - f / (f + FAILURE_SMOOTHING)
        });

        let mut seen = HashSet::new();
        let mut known_recovery_paths = BTreeMap::new();
        for failure in &history {
            if !seen.insert(failure.error_type.as_str()) {
                continue;
            }
            let paths = self.failures.recovery_paths(source, &failure.error_type);
            if !paths.is_empty() {
                known_recovery_paths.insert(failure.error_type.clone(), paths);
            }
        }

        SourceIntelligence {
            average_latency: self.patterns.average_latency(source),
            overall_success_rate,
            recent_failures: history.len(),
            last_failure: history.first().cloned(),
            known_recovery_paths,
        }
    }

    /// 全ストアから `retention` より古いものを捨てる
    pub fn consolidate(&self, retention: Duration) -> ConsolidationReport {
        let cutoff = self.clock.now() - retention;

        let patterns_pruned = self.patterns.prune_older_than(cutoff);
        let failures_pruned = self.failures.prune_older_than(cutoff);
        let health_pruned = {
            let mut health = self.health.write();
            let pruned: usize = health
                .values_mut()
                .map(|ring| ring.retain(|m| m.timestamp >= cutoff))
                .sum();
            health.retain(|_, ring| !ring.is_empty());
            pruned
        };
        let samples_pruned = self.history.write().retain(|s| s.timestamp >= cutoff);

        let report = ConsolidationReport {
            cutoff,
            patterns_pruned,
            failures_pruned,
            health_pruned,
            samples_pruned,
        };
        info!(
            %cutoff,
            patterns = patterns_pruned,
            failures = failures_pruned,
            health = health_pruned,
            samples = samples_pruned,
            "memory consolidated"
        );
        report
    }

    pub fn stats(&self) -> MemoryStats {
        let (health_records, health_sources, health_evicted): (usize, usize, u64) = {
            let health = self.health.read();
            (
                health.values().map(|r| r.len()).sum(),
                health.len(),
                health.values().map(|r| r.evicted()).sum(),
            )
        };
        let history = self.history.read();
        MemoryStats {
            patterns: self.patterns.stats(),
            failures: self.failures.stats(),
            health_sources,
            health: StoreStats {
                len: health_records,
                capacity: self.health_capacity,
                evicted: health_evicted,
            },
            metrics_history: StoreStats {
                len: history.len(),
                capacity: history.capacity(),
                evicted: history.evicted(),
            },
        }
    }
}
