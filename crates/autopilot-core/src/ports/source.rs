//! Source port - engine が問い合わせる外部の capability 提供者

use async_trait::async_trait;

use crate::domain::{Capability, SourceError};

/// Source は capability を宣言し、問い合わせに答える
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    async fn query(
        &self,
        operation: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, SourceError>;

    async fn is_healthy(&self) -> bool;

    /// `requested` を満たす宣言済み capability のうち最も具体的なもの
    fn best_match(&self, requested: &str) -> Option<&Capability> {
        self.capabilities()
            .iter()
            .filter(|c| c.matches(requested))
            .min_by_key(|c| c.specificity())
    }
}
