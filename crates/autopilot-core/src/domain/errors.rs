//! Errors - エラー型と分類
//!
//! # 分類
//! - SourceError: 外部 source の失敗（code で healing 戦略を引く）
//! - RecorderError: 承認ワークフローの型付き拒否
//! - ConfigError / BuildError: 起動時に検出する設定ミス
//! - HandlerError / HealingActionError: ログに残すだけで伝播しない

use thiserror::Error;

use super::ids::SuggestionId;
use super::state::SuggestionStatus;

/// SourceError は `Source` への問い合わせの失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("no healthy source for capability={0}")]
    NoSource(String),

    #[error("[{code}] {message}")]
    Other { code: String, message: String },
}

impl SourceError {
    /// healing 戦略の検索に使うエラーコード
    pub fn code(&self) -> &str {
        match self {
            SourceError::ConnectionReset(_) => "ECONNRESET",
            SourceError::Timeout(_) => "ETIMEDOUT",
            SourceError::Unavailable(_) => "ServiceUnavailable",
            SourceError::NoSource(_) => "NoSource",
            SourceError::Other { code, .. } => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate source name={0}")]
    DuplicateSource(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("no broker for url: {0}")]
    UnsupportedUrl(String),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("event encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("durable subscription needs a tokio runtime")]
    NoRuntime,
}

/// HandlerError はイベントハンドラの失敗（hub がログに残す。伝播しない）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// RecorderError は承認ワークフローの型付き拒否
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    #[error("suggestion not found: {0}")]
    SuggestionNotFound(SuggestionId),

    #[error("suggestion {id} is {status}, not approved")]
    NotApproved {
        id: SuggestionId,
        status: SuggestionStatus,
    },

    #[error("suggestion {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SuggestionId,
        from: SuggestionStatus,
        to: SuggestionStatus,
    },

    #[error("suggestion {id} authorizes signature {expected}, request has {actual}")]
    SignatureMismatch {
        id: SuggestionId,
        expected: String,
        actual: String,
    },
}

/// HealingActionError は回復アクションの失敗（`false` として扱われる）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("healing action failed: {0}")]
pub struct HealingActionError(pub String);

/// ConfigError は `CoreConfig::validate` の検証エラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} must be at least {min}, got {value}")]
    TooSmall { name: &'static str, min: u64, value: u64 },

    #[error("{name} must be at most {max}, got {value}")]
    TooLarge { name: &'static str, max: u64, value: u64 },

    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine stopped")]
    Stopped,

    #[error("engine needs a tokio runtime")]
    NoRuntime,
}
