//! ポート実装 - 開発用・プロセス内で使う実装群

pub mod loopback_broker;
pub mod source_registry;

use std::sync::Arc;

use crate::domain::BrokerError;
use crate::ports::Broker;

pub use self::loopback_broker::LoopbackBroker;
pub use self::source_registry::SourceRegistry;

/// `durable_bus_url` から Broker を組み立てる
///
/// 現状 `loopback://` のみ。それ以外のスキームは `UnsupportedUrl`。
pub fn broker_for_url(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme).unwrap_or(url);
    match scheme {
        "loopback" => Ok(Arc::new(LoopbackBroker::new())),
        _ => Err(BrokerError::UnsupportedUrl(url.to_string())),
    }
}
