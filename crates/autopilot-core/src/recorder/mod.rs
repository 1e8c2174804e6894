//! Recorder - タスクの観測・パターン学習・承認ゲート

pub mod model;
pub mod task_recorder;

pub use model::{
    AutomationSuggestion, ExecutionDecision, ExecutionRecord, ExecutionRequest, ObservationInput,
    TaskObservation, TaskPattern,
};
pub use task_recorder::{Observed, RecorderConfig, TaskRecorder};
