//! Task - スケジューラが扱う作業単位
//!
//! # 学習ポイント
//! - newtype（`TaskType`）で予約済みタスク種別を定数として持つ
//! - lineage で後続タスクの導出深さを制限

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskType はタスク種別（`crm.sync` などの任意文字列 + 予約済み種別）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    /// `system.alert` イベントで起こされる
    pub const DIAGNOSTIC: &'static str = "diagnostic";
    /// 失敗した実行の後続（データ不足）
    pub const DATA_COLLECTION: &'static str = "data_collection";
    /// パターンを見つけた実行の後続
    pub const PATTERN_EXPLORATION: &'static str = "pattern_exploration";
    /// memory の定期的な整理
    pub const MEMORY_OPTIMIZATION: &'static str = "memory_optimization";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// base score 未指定のタスクに与える値
pub const DEFAULT_BASE_SCORE: f64 = 50.0;

/// Task はスケジューラの作業単位
///
/// 永続化しない。イベントハンドラ・後続導出・maintenance タイマーが作り、
/// dequeue が消費する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_type: TaskType,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub base_score: f64,
    pub is_maintenance_task: bool,
    pub is_simple: bool,

    /// 何回の後続導出でできたタスクか（0 = 外部から投入）
    #[serde(default)]
    pub lineage: u32,
}

impl Task {
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: serde_json::Map::new(),
            base_score: DEFAULT_BASE_SCORE,
            is_maintenance_task: false,
            is_simple: false,
            lineage: 0,
        }
    }

    /// payload を置き換え（オブジェクト以外は `"value"` キーに入れる）
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    pub fn with_base_score(mut self, score: f64) -> Self {
        self.base_score = score;
        self
    }

    pub fn maintenance(mut self) -> Self {
        self.is_maintenance_task = true;
        self
    }

    pub fn simple(mut self) -> Self {
        self.is_simple = true;
        self
    }

    /// `parent` から導出されたタスクとして印をつける
    pub fn derived_from(mut self, parent: &Task) -> Self {
        self.lineage = parent.lineage.saturating_add(1);
        self
    }

    pub fn payload_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.payload.clone())
    }
}

/// TaskIntent は 1 タスクについて engine が source に頼む内容
#[derive(Debug, Clone, PartialEq)]
pub struct TaskIntent {
    /// 選ばれる source が宣言しているべき capability
    pub capability: String,
    pub operation: String,
    pub params: serde_json::Value,
}

impl TaskIntent {
    /// capability を上書きする payload キー（デフォルトはタスク種別）
    pub const CAPABILITY_KEY: &'static str = "capability";

    pub fn from_task(task: &Task) -> Self {
        let capability = task
            .payload
            .get(Self::CAPABILITY_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| task.task_type.as_str().to_string());

        Self {
            capability,
            operation: task.task_type.as_str().to_string(),
            params: task.payload_value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_task_uses_default_score() {
        let task = Task::new("sync");
        assert_eq!(task.base_score, DEFAULT_BASE_SCORE);
        assert!(!task.is_simple);
        assert!(!task.is_maintenance_task);
        assert_eq!(task.lineage, 0);
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let task = Task::new("sync").with_payload(json!(42));
        assert_eq!(task.payload.get("value"), Some(&json!(42)));
    }

    #[test]
    fn derived_task_increments_lineage() {
        let parent = Task::new("a").derived_from(&Task::new("root"));
        let child = Task::new("b").derived_from(&parent);
        assert_eq!(parent.lineage, 1);
        assert_eq!(child.lineage, 2);
    }

    #[test]
    fn intent_capability_defaults_to_task_type() {
        let intent = TaskIntent::from_task(&Task::new("diagnostic"));
        assert_eq!(intent.capability, "diagnostic");
        assert_eq!(intent.operation, "diagnostic");
    }

    #[test]
    fn intent_capability_can_be_overridden_by_payload() {
        let task = Task::new("diagnostic").with_payload(json!({"capability": "database.health"}));
        let intent = TaskIntent::from_task(&task);
        assert_eq!(intent.capability, "database.health");
        assert_eq!(intent.params["capability"], "database.health");
    }
}
