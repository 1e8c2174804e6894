//! Outcome model: the result of executing one task.
//!
//! An `ExecutionResult` is produced exactly once per execution and is never
//! mutated afterwards. The engine reads it to derive follow-up tasks and to
//! update memory.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Seeds a `data_collection` follow-up.
    pub needs_more_data: bool,

    /// Seeds a `pattern_exploration` follow-up.
    pub found_pattern: bool,
}

impl ExecutionResult {
    /// Key a source sets in its response object to report a discovered pattern.
    pub const PATTERN_KEY: &'static str = "pattern";

    /// Successful execution. `found_pattern` is derived from the data.
    pub fn success(data: serde_json::Value) -> Self {
        let found_pattern = data
            .as_object()
            .is_some_and(|obj| obj.get(Self::PATTERN_KEY).is_some_and(|p| !p.is_null()));
        Self {
            success: true,
            data: Some(data),
            error: None,
            needs_more_data: false,
            found_pattern,
        }
    }

    /// Failed execution. Failures always ask for more data.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            needs_more_data: true,
            found_pattern: false,
        }
    }

    /// The pattern payload reported by the source, if any.
    pub fn pattern(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()?.get(Self::PATTERN_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_requests_more_data() {
        let r = ExecutionResult::failure("timeout");
        assert!(!r.success);
        assert!(r.needs_more_data);
        assert!(!r.found_pattern);
        assert_eq!(r.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn success_detects_reported_pattern() {
        let r = ExecutionResult::success(json!({"rows": 3, "pattern": {"kind": "spike"}}));
        assert!(r.found_pattern);
        assert_eq!(r.pattern(), Some(&json!({"kind": "spike"})));
    }

    #[test]
    fn success_without_pattern() {
        let r = ExecutionResult::success(json!({"rows": 3, "pattern": null}));
        assert!(!r.found_pattern);
        assert!(!r.needs_more_data);

        let r = ExecutionResult::success(json!([1, 2, 3]));
        assert!(!r.found_pattern);
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(ExecutionResult::failure("x")).unwrap();
        assert_eq!(v["needsMoreData"], true);
        assert_eq!(v["foundPattern"], false);
        assert!(v.get("data").is_none());
    }
}
