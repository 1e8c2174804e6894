//! DemoSource - デモ用の source
//!
//! すべての capability に答える。`reset_every` 回ごとに接続を落とし、
//! `pattern_every` 回ごとにパターンを報告する。

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use autopilot_core::domain::{Capability, SourceError};
use autopilot_core::ports::Source;

/// DemoSource は呼び出し回数で振る舞いを変える source
pub struct DemoSource {
    name: String,
    capabilities: Vec<Capability>,
    reset_every: u64,
    pattern_every: u64,
    calls: AtomicU64,
}

impl DemoSource {
    pub fn new(name: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|c| Capability::parse(c)).collect(),
            reset_every: 4,
            pattern_every: 5,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Source for DemoSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn query(&self, operation: &str, params: &Value) -> Result<Value, SourceError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        if n % self.reset_every == 0 {
            return Err(SourceError::ConnectionReset(format!("{} dropped call #{n}", self.name)));
        }
        if n % self.pattern_every == 0 {
            return Ok(json!({ "operation": operation, "pattern": { "kind": "burst", "call": n } }));
        }
        Ok(json!({ "operation": operation, "echo": params }))
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}
