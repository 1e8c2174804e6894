//! Broker port - durable 配送の外部トランスポート
//!
//! チャネルはただの文字列。`*` で終わるチャネルの購読は、その prefix を持つ
//! チャネルへの publish をすべて受け取る。

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::BrokerError;

#[async_trait]
/// Broker はバイト列をチャネル単位で運ぶ
pub trait Broker: Send + Sync {
    /// hub の構築時に 1 回だけ呼ばれる。エラーなら hub は in-process に縮退
    async fn connect(&self) -> Result<(), BrokerError>;

    fn publish(&self, channel: &str, message: Vec<u8>) -> Result<(), BrokerError>;

    fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BrokerError>;
}
