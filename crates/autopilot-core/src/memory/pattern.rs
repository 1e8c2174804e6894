//! PatternMemory - どの source がどのクエリに、どれだけ速く確実に答えたか

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ring::RingBuffer;
use crate::domain::QueryId;
use crate::domain::signature::query_signature;
use crate::observability::StoreStats;
use crate::ports::{Clock, IdGenerator};

/// Window of `average_latency`.
pub const LATENCY_WINDOW_HOURS: i64 = 24;
/// Window of `success_rate`, `widget_patterns`.
pub const SUCCESS_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct QueryInput {
    pub widget_id: String,
    pub query_type: String,
    pub params: serde_json::Value,
    pub source_used: String,
    pub latency_ms: u64,
    pub result_size: Option<u64>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    /// Hour of day, 0..24.
    pub time_of_day: u32,
    /// 0 = Sunday.
    pub day_of_week: u32,
}

impl UserContext {
    pub fn at(ts: DateTime<Utc>) -> Self {
        Self {
            time_of_day: ts.hour(),
            day_of_week: ts.weekday().num_days_from_sunday(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPattern {
    pub id: QueryId,
    pub widget_id: String,
    pub query_type: String,
    pub query_signature: String,
    pub source_used: String,
    pub latency_ms: u64,
    pub result_size: Option<u64>,
    pub success: bool,
    pub user_context: UserContext,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarQuery {
    pub pattern: QueryPattern,
    /// Always 1.0: matching is by exact signature.
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HourFrequency {
    pub hour: u32,
    pub frequency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePattern {
    pub widget_id: String,
    /// Up to five sources, most used first.
    pub common_sources: Vec<String>,
    pub average_latency: f64,
    pub time_patterns: Vec<HourFrequency>,
}

pub struct PatternMemory {
    records: RwLock<RingBuffer<QueryPattern>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl PatternMemory {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            records: RwLock::new(RingBuffer::new(capacity)),
            clock,
            ids,
        }
    }

    pub fn record_query(&self, input: QueryInput) -> QueryId {
        let now = self.clock.now();
        let id = self.ids.generate_query_id();
        let pattern = QueryPattern {
            id,
            query_signature: query_signature(&input.query_type, &input.params),
            widget_id: input.widget_id,
            query_type: input.query_type,
            source_used: input.source_used,
            latency_ms: input.latency_ms,
            result_size: input.result_size,
            success: input.success,
            user_context: UserContext::at(now),
            timestamp: now,
        };
        debug!(
            widget = %pattern.widget_id,
            query_type = %pattern.query_type,
            source = %pattern.source_used,
            latency_ms = pattern.latency_ms,
            "pattern recorded"
        );
        self.records.write().push(pattern);
        id
    }

    /// シグネチャ完全一致（新しい順）
    pub fn find_similar_queries(
        &self,
        query_type: &str,
        params: &serde_json::Value,
        limit: usize,
    ) -> Vec<SimilarQuery> {
        let signature = query_signature(query_type, params);
        self.records
            .read()
            .iter_recent()
            .filter(|p| p.query_signature == signature)
            .take(limit)
            .map(|p| SimilarQuery {
                pattern: p.clone(),
                similarity: 1.0,
            })
            .collect()
    }

    /// 直近 10 件の同一クエリの成功割合（履歴がなければ 0.5）
    pub fn similar_query_success(&self, query_type: &str, params: &serde_json::Value) -> f64 {
        let similar = self.find_similar_queries(query_type, params, 10);
        if similar.is_empty() {
            return 0.5;
        }
        let ok = similar.iter().filter(|s| s.pattern.success).count();
        ok as f64 / similar.len() as f64
    }

    /// Mean latency of successful queries in the last 24 h; 0 without data.
    pub fn average_latency(&self, source: &str) -> f64 {
        let cutoff = self.clock.now() - Duration::hours(LATENCY_WINDOW_HOURS);
        let records = self.records.read();
        let (sum, n) = records
            .iter()
            .filter(|p| p.source_used == source && p.success && p.timestamp > cutoff)
            .fold((0u64, 0u64), |(sum, n), p| (sum + p.latency_ms, n + 1));
        if n == 0 { 0.0 } else { sum as f64 / n as f64 }
    }

    /// Success ratio for `(source, query_type)` over 7 d; 0 without data.
    pub fn success_rate(&self, source: &str, query_type: &str) -> f64 {
        self.ratio_since(SUCCESS_WINDOW_DAYS, |p| {
            p.source_used == source && p.query_type == query_type
        })
        .unwrap_or(0.0)
    }

    /// Success ratio for `source` across all query types over 7 d.
    pub fn source_success_rate(&self, source: &str) -> Option<f64> {
        self.ratio_since(SUCCESS_WINDOW_DAYS, |p| p.source_used == source)
    }

    fn ratio_since(&self, days: i64, matches: impl Fn(&QueryPattern) -> bool) -> Option<f64> {
        let cutoff = self.clock.now() - Duration::days(days);
        let records = self.records.read();
        let (ok, total) = records
            .iter()
            .filter(|p| p.timestamp > cutoff && matches(p))
            .fold((0usize, 0usize), |(ok, total), p| {
                (ok + usize::from(p.success), total + 1)
            });
        (total > 0).then(|| ok as f64 / total as f64)
    }

    /// Usage profile of a widget from successful queries over 7 d.
    pub fn widget_patterns(&self, widget_id: &str) -> UsagePattern {
        let cutoff = self.clock.now() - Duration::days(SUCCESS_WINDOW_DAYS);
        let mut sources: HashMap<&str, usize> = HashMap::new();
        let mut hours: HashMap<u32, usize> = HashMap::new();
        let mut latency_sum = 0u64;
        let mut count = 0usize;

        let records = self.records.read();
        for p in records
            .iter()
            .filter(|p| p.widget_id == widget_id && p.success && p.timestamp > cutoff)
        {
            *sources.entry(p.source_used.as_str()).or_default() += 1;
            *hours.entry(p.user_context.time_of_day).or_default() += 1;
            latency_sum += p.latency_ms;
            count += 1;
        }

        let mut common: Vec<(&str, usize)> = sources.into_iter().collect();
        common.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut time_patterns: Vec<HourFrequency> = hours
            .into_iter()
            .map(|(hour, frequency)| HourFrequency { hour, frequency })
            .collect();
        time_patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency).then(a.hour.cmp(&b.hour)));

        UsagePattern {
            widget_id: widget_id.to_string(),
            common_sources: common.into_iter().take(5).map(|(s, _)| s.to_string()).collect(),
            average_latency: if count == 0 {
                0.0
            } else {
                latency_sum as f64 / count as f64
            },
            time_patterns,
        }
    }

    /// Drop records older than `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        self.records.write().retain(|p| p.timestamp >= cutoff)
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
