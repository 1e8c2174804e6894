//! Strategy - incident と回復アクション

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{HealingActionError, SourceError};

/// Incident は dispatcher に渡すエラー（`code` で戦略を選ぶ）
///
/// `preferred_action` は `code` の戦略より先に試す戦略の description。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub code: String,
    pub message: String,
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_action: Option<String>,
}

impl Incident {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
            preferred_action: None,
        }
    }

    pub fn from_source(source: &str, err: &SourceError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            source: Some(source.to_string()),
            preferred_action: None,
        }
    }

    pub fn prefer(mut self, action: impl Into<String>) -> Self {
        self.preferred_action = Some(action.into());
        self
    }
}

/// HealingAction は回復アクション（`Ok(true)` で解決）
#[async_trait]
pub trait HealingAction: Send + Sync {
    async fn heal(&self, incident: &Incident) -> Result<bool, HealingActionError>;
}

/// async クロージャによるアクション（[`healing_fn`] を参照）
pub struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> HealingAction for FnAction<F>
where
    F: Fn(Incident) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HealingActionError>> + Send,
{
    async fn heal(&self, incident: &Incident) -> Result<bool, HealingActionError> {
        (self.0)(incident.clone()).await
    }
}

pub fn healing_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(Incident) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HealingActionError>> + Send,
{
    FnAction(f)
}

#[derive(Clone)]
pub struct HealingStrategy {
    pub error_code: String,
    pub description: String,
    pub action: Arc<dyn HealingAction>,
}

impl std::fmt::Debug for HealingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealingStrategy")
            .field("error_code", &self.error_code)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// 待ってから解決済みとして返す
pub(crate) fn wait_and_retry(delay: std::time::Duration) -> impl HealingAction {
    healing_fn(move |_incident| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, HealingActionError>(true)
    })
}
