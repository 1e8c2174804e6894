//! Domain model (ids, tasks, outcomes, events, errors, ...).
//!
//! # 構成
//! - ids / signature: 型付き ID と決定的シグネチャ
//! - task / capability / state: タスク・capability・状態機械
//! - outcome / events / errors: 実行結果・イベント・エラー分類

pub mod capability;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod signature;
pub mod state;
pub mod task;

pub use capability::Capability;
pub use errors::{
    BrokerError, ConfigError, EngineError, HandlerError, HealingActionError, HubError,
    RecorderError, RegistryError, SourceError,
};
pub use events::{Event, TaskExecutedEvent};
pub use ids::{ExecutionId, FailureId, ObservationId, QueryId, SuggestionId};
pub use outcome::ExecutionResult;
pub use state::{OverallHealth, StressLevel, SuggestionStatus, TaskState};
pub use task::{DEFAULT_BASE_SCORE, Task, TaskIntent, TaskType};
