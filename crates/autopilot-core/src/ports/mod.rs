//! Ports - 抽象化レイヤー
//!
//! コアが所有しないもの（時刻, ID, source, broker, stress シグナル）との境界。
//!
//! # 含まれる port
//! - **Clock**: 時刻の抽象化
//! - **IdGenerator**: ID 生成
//! - **Source**: capability を提供する外部システム
//! - **Broker**: durable 配送の外部トランスポート
//! - **StressProbe**: 再優先度付け用のストレス水準

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod source;
pub mod stress;

pub use self::broker::Broker;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::source::Source;
pub use self::stress::{ManualStressProbe, StressProbe};
