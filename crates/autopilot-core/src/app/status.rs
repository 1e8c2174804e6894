//! Status - エンジン状態のクエリ

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{ExecutionResult, StressLevel, Task, TaskState, TaskType};
use crate::observability::QueueStats;

/// ExecutionLog は実行履歴の 1 件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub task: Task,
    pub result: ExecutionResult,
    pub state: TaskState,
    pub source: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `result` から導出された後続タスク
    pub follow_ups: Vec<TaskType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: EngineState,
    pub queue: QueueStats,
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub current_task: Option<TaskType>,
    pub stress: StressLevel,
    pub global_health: f64,
}
