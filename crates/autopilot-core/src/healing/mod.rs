//! Healing - 自己修復
//!
//! # 主要コンポーネント
//! - **SelfHealingDispatcher**: エラーコード → 回復戦略（depth guard つき）
//! - **BreakerBoard**: エラーコードごとの circuit breaker
//! - **ScoringStrategy**: 学習済み回復パスの順位付け

pub mod breaker;
pub mod dispatcher;
pub mod scoring;
pub mod strategy;

pub use breaker::BreakerState;
pub use dispatcher::{
    HealingConfig, HealingOutcome, HealingRejection, HealingStats, SelfHealingDispatcher,
    ServiceStatus, SystemStatus,
};
pub use scoring::{HistoricalScoring, RecoveryRecommendation, ScoringStrategy};
pub use strategy::{FnAction, HealingAction, HealingStrategy, Incident, healing_fn};
