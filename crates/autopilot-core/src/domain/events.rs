//! Events - ドメインイベント
//!
//! `Event` は durable 配送のワイヤフォーマットも兼ねる。
//! JSON `{event_type, payload, timestamp}` としてシリアライズされる。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// すべてのイベントを受け取る購読キー
pub const WILDCARD: &str = "*";

/// 予約: 高優先度の diagnostic タスクを起こす
pub const SYSTEM_ALERT: &str = "system.alert";

/// 予約: 実行結果が recorder の観測になる唯一の経路
pub const TASK_EXECUTED: &str = "task.executed";

pub const SUGGESTION_CREATED: &str = "taskrecorder.suggestion.created";
pub const SUGGESTION_APPROVED: &str = "taskrecorder.suggestion.approved";
pub const SUGGESTION_REJECTED: &str = "taskrecorder.suggestion.rejected";
pub const EXECUTION_STARTED: &str = "taskrecorder.execution.started";

pub const HEALING_SUCCEEDED: &str = "healing.succeeded";
pub const HEALING_FAILED: &str = "healing.failed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp,
        }
    }
}

/// TaskExecutedEvent は `task.executed` の payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutedEvent {
    pub task_type: String,

    #[serde(default)]
    pub params: serde_json::Value,

    pub success: bool,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,

    /// パターンのヒストグラムに合算される任意のコンテキスト
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_wire_format_uses_snake_case_keys() {
        let ts = Utc::now();
        let v = serde_json::to_value(Event::new(SYSTEM_ALERT, json!({"x": 1}), ts)).unwrap();
        assert_eq!(v["event_type"], SYSTEM_ALERT);
        assert_eq!(v["payload"]["x"], 1);
        assert!(v.get("timestamp").is_some());
    }

    #[test]
    fn task_executed_accepts_minimal_payload() {
        let ev: TaskExecutedEvent =
            serde_json::from_value(json!({"taskType": "sync", "success": true})).unwrap();
        assert_eq!(ev.task_type, "sync");
        assert_eq!(ev.duration_ms, 0);
        assert!(ev.params.is_null());
        assert!(ev.context.is_empty());
    }
}
