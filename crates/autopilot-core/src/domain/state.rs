//! State - タスクと suggestion の状態

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskState はタスクの状態を表現
///
/// # 状態遷移
/// - Queued -> Executing -> Completed
/// - Queued -> Executing -> Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Executing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// SuggestionStatus は自動化提案のライフサイクル
///
/// # 状態遷移
/// - Pending -> Approved
/// - Pending -> Rejected
///
/// どちらも終端状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
}

impl SuggestionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SuggestionStatus::Pending)
    }

    pub fn can_transition_to(self, next: SuggestionStatus) -> bool {
        matches!(
            (self, next),
            (SuggestionStatus::Pending, SuggestionStatus::Approved)
                | (SuggestionStatus::Pending, SuggestionStatus::Rejected)
        )
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// OverallHealth は self-healing dispatcher が報告する健全性の粗い分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

/// StressLevel は `StressProbe` が報告するストレス水準
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressLevel {
    #[default]
    Low,
    Medium,
    High,
}
