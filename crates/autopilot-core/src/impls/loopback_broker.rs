//! LoopbackBroker - 開発用・テスト用のプロセス内 broker
//!
//! # 学習ポイント
//! - `Broker` port の最小実装
//! - `*` で終わるパターンはその prefix を持つ全チャネルにマッチ
//! - mpsc の受信側が drop された購読は publish 時に掃除

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::BrokerError;
use crate::ports::Broker;

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Subscriber {
    fn matches(&self, channel: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => self.pattern == channel,
        }
    }
}

/// LoopbackBroker はプロセス内で完結する broker
pub struct LoopbackBroker {
    available: bool,
    connected: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    published: Mutex<Vec<String>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            available: true,
            connected: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// `connect` が必ず失敗する broker
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// publish されたチャネル（順序どおり）
    pub fn published_channels(&self) -> Vec<String> {
        self.published.lock().clone()
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("not connected".into()))
        }
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for LoopbackBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if !self.available {
            return Err(BrokerError::Unavailable("loopback broker disabled".into()));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn publish(&self, channel: &str, message: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.published.lock().push(channel.to_string());

        let mut subscribers = self.subscribers.lock();
        // 受信側が drop された購読はここで掃除する
        subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0usize;
        for s in subscribers.iter().filter(|s| s.matches(channel)) {
            if s.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(channel, delivered, "loopback publish");
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BrokerError> {
        self.ensure_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            pattern: channel.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pattern_subscription_receives_prefixed_channels() {
        let broker = LoopbackBroker::new();
        broker.connect().await.unwrap();

        let mut exact = broker.subscribe("p:events:a").unwrap();
        let mut all = broker.subscribe("p:events:*").unwrap();

        broker.publish("p:events:a", b"1".to_vec()).unwrap();
        broker.publish("p:events:b", b"2".to_vec()).unwrap();

        assert_eq!(exact.recv().await.unwrap(), b"1".to_vec());
        assert!(exact.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap(), b"1".to_vec());
        assert_eq!(all.recv().await.unwrap(), b"2".to_vec());
    }

    #[tokio::test]
    async fn unavailable_broker_refuses_to_connect() {
        let broker = LoopbackBroker::unavailable();
        assert!(broker.connect().await.is_err());
        assert!(broker.publish("x", vec![]).is_err());
    }
}
