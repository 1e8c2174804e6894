//! App - アプリケーション層
//!
//! このモジュールは、ports / memory / hub / recorder / healer を組み合わせて
//! 動き続けるシステムを組み立てます。
//!
//! # 主要コンポーネント
//! - **CoreBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **AutonomousTaskEngine**: キュー + 実行 + 後続タスクの導出
//! - **SchedulerLoop**: タスク実行ループ（dequeue→execute→derive→reprioritize）
//! - **MaintenanceLoop**: 定期的なメモリ最適化

pub mod builder;
pub mod engine;
mod maintenance_loop;
mod scheduler_loop;
pub mod status;

pub use self::builder::{BuildError, Core, CoreBuilder};
pub use self::engine::{AutonomousTaskEngine, EngineConfig};
pub use self::status::{EngineState, EngineStatus, ExecutionLog};
