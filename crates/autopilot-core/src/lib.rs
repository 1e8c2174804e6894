//! autopilot-core
//!
//! Core building blocks for the autopilot runtime.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（tasks, outcomes, events, ids, states, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, Source, Broker, StressProbe）
//! - **queue**: 優先度ポリシーと優先度付きタスクキュー
//! - **memory**: `CognitiveMemory` の裏にある pattern / failure / health memory
//! - **hub**: publish/subscribe イベントハブ（in-process または broker 経由）
//! - **recorder**: 実行されたタスクを観測して自動化を提案
//! - **healing**: エラーコードごとの circuit breaker つき self-healing
//! - **app**: builder, engine とバックグラウンドループ
//! - **impls**: 実装（source registry, loopback broker）
//! - **config**: 環境変数で上書きできる `CoreConfig`

pub mod app;
pub mod config;
pub mod domain;
pub mod healing;
pub mod hub;
pub mod impls;
pub mod memory;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod recorder;

pub use app::{AutonomousTaskEngine, BuildError, Core, CoreBuilder};
pub use config::CoreConfig;
