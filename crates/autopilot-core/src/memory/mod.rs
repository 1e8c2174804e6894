//! Memory - クエリ・失敗・source health の有界な追記型統計
//!
//! # 主要コンポーネント
//! - **PatternMemory**: どの source がどのクエリにどう答えたか
//! - **FailureMemory**: 何が壊れ、何を試し、何が効いたか
//! - **CognitiveMemory**: 上記 + health 履歴の単一の読み口
//! - **RingBuffer**: O(1) で最古を捨てる固定容量バッファ

pub mod cognitive;
pub mod failure;
pub mod pattern;
pub mod ring;

pub use cognitive::{
    CognitiveMemory, ConsolidationReport, HealthMetrics, LatencyPercentiles, SourceIntelligence,
    SystemHealthSample,
};
pub use failure::{FailureInput, FailureMemory, FailureRecord, FailureStats, RecoveryPath};
pub use pattern::{PatternMemory, QueryInput, QueryPattern, SimilarQuery, UsagePattern};
pub use ring::RingBuffer;

/// MemoryCapacities は各ストアのリング容量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCapacities {
    pub patterns: usize,
    pub failures: usize,
    pub health_per_source: usize,
    pub metrics_history: usize,
}

impl Default for MemoryCapacities {
    fn default() -> Self {
        Self {
            patterns: 10_000,
            failures: 10_000,
            health_per_source: 1_000,
            metrics_history: 1_000,
        }
    }
}
