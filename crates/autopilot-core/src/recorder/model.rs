use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionId, ObservationId, RecorderError, SuggestionId, SuggestionStatus};

/// ObservationInput は実行済みタスク 1 件について呼び出し側が知っていること
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationInput {
    pub task_type: String,
    pub params: serde_json::Value,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskObservation {
    pub id: ObservationId,
    pub task_type: String,
    pub task_signature: String,
    pub user_id: String,
    pub org_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// TaskPattern は 1 シグネチャの累積統計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPattern {
    pub task_signature: String,
    pub task_type: String,
    pub frequency: u64,
    pub successes: u64,
    /// successes / frequency, over every observation of the signature
    pub success_rate: f64,
    pub average_duration_ms: Option<f64>,
    #[serde(skip)]
    pub(crate) timed_observations: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// `"key:value"` -> count
    pub contexts: BTreeMap<String, u64>,
    /// Most recent suggestion raised for this signature.
    pub last_suggestion: Option<SuggestionId>,
}

/// AutomationSuggestion は自動化の提案
///
/// recorder だけが作り、すべて承認が必要。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationSuggestion {
    pub id: SuggestionId,
    pub task_signature: String,
    pub task_type: String,
    pub confidence: f64,
    pub observed_count: u64,
    pub suggested_action: String,
    pub estimated_benefit: String,
    pub created_at: DateTime<Utc>,
    pub status: SuggestionStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    requires_approval: bool,
}

impl AutomationSuggestion {
    pub(crate) fn pending(id: SuggestionId, pattern: &TaskPattern, now: DateTime<Utc>) -> Self {
        let estimated_benefit = match pattern.average_duration_ms {
            Some(ms) => format!("Saves ~{ms:.0}ms per execution"),
            None => "Reduces manual repetition".to_string(),
        };
        Self {
            id,
            task_signature: pattern.task_signature.clone(),
            task_type: pattern.task_type.clone(),
            confidence: pattern.success_rate,
            observed_count: pattern.frequency,
            suggested_action: format!(
                "Automate \"{}\" task (observed {} times with {:.0}% success rate)",
                pattern.task_type,
                pattern.frequency,
                pattern.success_rate * 100.0
            ),
            estimated_benefit,
            created_at: now,
            status: SuggestionStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            requires_approval: true,
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.requires_approval
    }
}

/// ExecutionRequest は suggestion が示す自動化の実行要求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub suggestion_id: SuggestionId,
    pub task_type: String,
    pub params: serde_json::Value,
    pub requested_by: String,
}

/// ExecutionDecision は `{approved, execution_id?}` + 拒否時の型付き理由
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionDecision {
    pub approved: bool,
    pub execution_id: Option<ExecutionId>,
    pub rejection: Option<RecorderError>,
}

impl ExecutionDecision {
    pub(crate) fn approved(id: ExecutionId) -> Self {
        Self {
            approved: true,
            execution_id: Some(id),
            rejection: None,
        }
    }

    pub(crate) fn rejected(reason: RecorderError) -> Self {
        Self {
            approved: false,
            execution_id: None,
            rejection: Some(reason),
        }
    }
}

/// ExecutionRecord は承認された実行（実際に行うのは呼び出し側）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub suggestion_id: SuggestionId,
    pub task_signature: String,
    pub task_type: String,
    pub params: serde_json::Value,
    pub requested_by: String,
    pub approved_by: String,
    pub executed_at: DateTime<Utc>,
}
