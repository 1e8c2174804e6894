use serde::{Deserialize, Serialize};

/// Priority queue counters. `depth` is the current length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub reprioritizations: u64,
    pub rejected_after_close: u64,
}

/// Occupancy of one bounded store. `evicted` counts capacity evictions only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub len: usize,
    pub capacity: usize,
    pub evicted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub patterns: StoreStats,
    pub failures: StoreStats,
    pub health_sources: usize,
    /// Summed over sources; `capacity` is the per-source cap.
    pub health: StoreStats,
    pub metrics_history: StoreStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub subscriptions: usize,
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub publish_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
    pub observations: StoreStats,
    pub patterns: usize,
    pub pending_suggestions: usize,
    pub approved_suggestions: usize,
    pub rejected_suggestions: usize,
    pub executions: usize,
    pub rejected_requests: u64,
}
