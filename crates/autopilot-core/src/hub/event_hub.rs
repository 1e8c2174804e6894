//! EventHub - プロセス全体の publish/subscribe
//!
//! 配送方式は構築時に 1 回だけ決める:
//! - `InProcess`: publisher の呼び出し経路で同期的にハンドラを実行
//!   （detached 購読は blocking pool で実行）
//! - `Durable`: イベントをシリアライズして `Broker` に送る。購読チャネルごとに
//!   forwarder タスクが 1 つあり、受信メッセージをデコードしてハンドラに渡す
//!
//! broker がない、または接続できない durable hub は `InProcess` に縮退し、
//! ログにそう残す。
//!
//! # 学習ポイント
//! - tagged union（`Delivery`）による配送方式の切り替え
//! - ハンドラの `Err` と panic の封じ込め

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::EventHandler;
use crate::domain::events::WILDCARD;
use crate::domain::{Event, HubError};
use crate::observability::HubStats;
use crate::ports::{Broker, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    InProcess,
    Durable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    detached: bool,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    publish_errors: AtomicU64,
}

/// イベント種別（または `*`）ごとのハンドラ
#[derive(Default)]
struct Registry {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    counters: Counters,
}

impl Registry {
    /// `key` の最初のハンドラなら true
    fn add(&self, key: &str, registration: Registration) -> bool {
        let mut handlers = self.handlers.write();
        let list = handlers.entry(key.to_string()).or_default();
        list.push(registration);
        list.len() == 1
    }

    /// 購読していた key と、それが空になったかを返す
    fn remove(&self, id: SubscriptionId) -> Option<(String, bool)> {
        let mut handlers = self.handlers.write();
        let key = handlers
            .iter()
            .find(|(_, list)| list.iter().any(|r| r.id == id))
            .map(|(key, _)| key.clone())?;
        let now_empty = match handlers.get_mut(&key) {
            Some(list) => {
                list.retain(|r| r.id != id);
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            handlers.remove(&key);
        }
        Some((key, now_empty))
    }

    fn len(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// `key` に登録されたハンドラをすべて実行
    ///
    /// 先にリストをコピーするので、ハンドラ内で publish / subscribe してもデッドロックしない。
    fn dispatch(&self, key: &str, event: &Event) {
        let targets: Vec<(Arc<dyn EventHandler>, bool)> = match self.handlers.read().get(key) {
            Some(list) => list
                .iter()
                .map(|r| (Arc::clone(&r.handler), r.detached))
                .collect(),
            None => return,
        };

        for (handler, detached) in targets {
            if detached && let Ok(rt) = Handle::try_current() {
                let event = event.clone();
                rt.spawn_blocking(move || {
                    // 切り離し実行: 結果はログのみ
                    invoke(handler.as_ref(), &event);
                });
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if invoke(handler.as_ref(), event) {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// ハンドラを 1 つ呼ぶ（`Err` も panic も外に出さない）
fn invoke(handler: &dyn EventHandler, event: &Event) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(event_type = %event.event_type, error = %e, "event handler failed");
            false
        }
        Err(_) => {
            error!(event_type = %event.event_type, "event handler panicked");
            false
        }
    }
}

struct DurableDelivery {
    broker: Arc<dyn Broker>,
    prefix: String,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DurableDelivery {
    fn channel(&self, key: &str) -> String {
        format!("{}:events:{}", self.prefix, key)
    }
}

enum Delivery {
    InProcess,
    Durable(DurableDelivery),
}

pub struct EventHub {
    delivery: Delivery,
    degraded: bool,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl EventHub {
    pub fn in_process(clock: Arc<dyn Clock>) -> Self {
        Self::with_delivery(Delivery::InProcess, false, clock)
    }

    /// 要求されたモードで hub を構築
    ///
    /// `Durable` には接続できる broker が必要。なければ `InProcess` に縮退。
    pub async fn connect(
        requested: DeliveryMode,
        broker: Option<Arc<dyn Broker>>,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if requested == DeliveryMode::InProcess {
            info!("event hub: in-process delivery");
            return Self::in_process(clock);
        }

        let Some(broker) = broker else {
            warn!("event hub: durable delivery requested but no broker configured, degrading to in-process");
            return Self::with_delivery(Delivery::InProcess, true, clock);
        };

        match broker.connect().await {
            Ok(()) => {
                let prefix = prefix.into();
                info!(prefix = %prefix, "event hub: durable delivery");
                Self::with_delivery(
                    Delivery::Durable(DurableDelivery {
                        broker,
                        prefix,
                        forwarders: Mutex::new(HashMap::new()),
                    }),
                    false,
                    clock,
                )
            }
            Err(e) => {
                warn!(error = %e, "event hub: broker unavailable, degrading to in-process");
                Self::with_delivery(Delivery::InProcess, true, clock)
            }
        }
    }

    fn with_delivery(delivery: Delivery, degraded: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            delivery,
            degraded,
            registry: Arc::new(Registry::default()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    /// 実際の配送モード
    pub fn mode(&self) -> DeliveryMode {
        match self.delivery {
            Delivery::InProcess => DeliveryMode::InProcess,
            Delivery::Durable(_) => DeliveryMode::Durable,
        }
    }

    /// durable を要求されたが使えなかったら true
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// イベントを publish（失敗しない。配送の問題はログに残す）
    pub fn publish(&self, event_type: &str, payload: serde_json::Value) {
        let event = Event::new(event_type, payload, self.clock.now());
        self.registry.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(event_type, "publishing event");

        match &self.delivery {
            Delivery::InProcess => {
                self.registry.dispatch(event_type, &event);
                if event_type != WILDCARD {
                    self.registry.dispatch(WILDCARD, &event);
                }
            }
            Delivery::Durable(durable) => {
                let result = serde_json::to_vec(&event)
                    .map_err(HubError::from)
                    .and_then(|bytes| {
                        durable
                            .broker
                            .publish(&durable.channel(event_type), bytes)
                            .map_err(HubError::from)
                    });
                if let Err(e) = result {
                    self.registry.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                    error!(event_type, error = %e, "durable publish failed");
                }
            }
        }
    }

    /// `event_type` を購読（`"*"` ですべて）
    pub fn subscribe(
        &self,
        event_type: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<SubscriptionId, HubError> {
        self.register(event_type, Arc::new(handler), false)
    }

    /// `subscribe` と同じだが、ハンドラは publisher の経路ではなく blocking pool で実行
    pub fn subscribe_detached(
        &self,
        event_type: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<SubscriptionId, HubError> {
        self.register(event_type, Arc::new(handler), true)
    }

    fn register(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        detached: bool,
    ) -> Result<SubscriptionId, HubError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if let Delivery::Durable(durable) = &self.delivery {
            // forwarder は最初の購読時にだけ張る
            let mut forwarders = durable.forwarders.lock();
            if !forwarders.contains_key(event_type) {
                let rt = Handle::try_current().map_err(|_| HubError::NoRuntime)?;
                let channel = durable.channel(event_type);
                let mut rx = durable.broker.subscribe(&channel)?;
                let registry = Arc::clone(&self.registry);
                let key = event_type.to_string();
                let join = rt.spawn(async move {
                    while let Some(bytes) = rx.recv().await {
                        match serde_json::from_slice::<Event>(&bytes) {
                            Ok(event) => registry.dispatch(&key, &event),
                            Err(e) => warn!(channel = %key, error = %e, "undecodable broker message"),
                        }
                    }
                    debug!(channel = %key, "broker subscription closed");
                });
                forwarders.insert(event_type.to_string(), join);
            }
        }

        self.registry.add(
            event_type,
            Registration {
                id,
                handler,
                detached,
            },
        );
        debug!(event_type, subscription = id.0, detached, "subscribed");
        Ok(id)
    }

    /// 購読を解除（未知なら false）
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((key, now_empty)) = self.registry.remove(id) else {
            return false;
        };
        if now_empty
            && let Delivery::Durable(durable) = &self.delivery
            && let Some(join) = durable.forwarders.lock().remove(&key)
        {
            join.abort();
        }
        true
    }

    pub fn stats(&self) -> HubStats {
        let c = &self.registry.counters;
        HubStats {
            subscriptions: self.registry.len(),
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            publish_errors: c.publish_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        if let Delivery::Durable(durable) = &self.delivery {
            for (_, join) in durable.forwarders.lock().drain() {
                join.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandlerError;
    use crate::domain::events::{SYSTEM_ALERT, TASK_EXECUTED};
    use crate::hub::handler_fn;
    use crate::impls::LoopbackBroker;
    use crate::ports::SystemClock;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    fn collector() -> (
        impl EventHandler + 'static,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |event| {
            tx.send(event.clone())
                .map_err(|e| HandlerError::new(e.to_string()))
        });
        (handler, rx)
    }

    #[test]
    fn in_process_delivers_to_type_and_wildcard() {
        let hub = EventHub::in_process(clock());
        let (typed, mut typed_rx) = collector();
        let (all, mut all_rx) = collector();
        hub.subscribe(SYSTEM_ALERT, typed).unwrap();
        hub.subscribe(WILDCARD, all).unwrap();

        hub.publish(SYSTEM_ALERT, json!({"level": "critical"}));
        hub.publish(TASK_EXECUTED, json!({}));

        assert_eq!(typed_rx.try_recv().unwrap().payload["level"], "critical");
        assert!(typed_rx.try_recv().is_err());
        assert_eq!(all_rx.try_recv().unwrap().event_type, SYSTEM_ALERT);
        assert_eq!(all_rx.try_recv().unwrap().event_type, TASK_EXECUTED);
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_reach_publisher() {
        let hub = EventHub::in_process(clock());
        hub.subscribe("x", handler_fn(|_| Err(HandlerError::new("nope"))))
            .unwrap();
        hub.subscribe("x", handler_fn(|_| panic!("handler bug"))).unwrap();
        let (ok, mut rx) = collector();
        hub.subscribe("x", ok).unwrap();

        hub.publish("x", json!(null));

        assert!(rx.try_recv().is_ok());
        let stats = hub.stats();
        assert_eq!(stats.handler_failures, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = EventHub::in_process(clock());
        let (h, mut rx) = collector();
        let id = hub.subscribe("x", h).unwrap();

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.publish("x", json!(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.stats().subscriptions, 0);
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let hub = Arc::new(EventHub::in_process(clock()));
        let weak = Arc::downgrade(&hub);
        hub.subscribe(
            "first",
            handler_fn(move |_| {
                if let Some(hub) = weak.upgrade() {
                    hub.publish("second", json!({}));
                }
                Ok(())
            }),
        )
        .unwrap();
        let (h, mut rx) = collector();
        hub.subscribe("second", h).unwrap();

        hub.publish("first", json!({}));
        assert_eq!(rx.try_recv().unwrap().event_type, "second");
    }

    #[tokio::test]
    async fn detached_handlers_run_off_the_call_path() {
        let hub = EventHub::in_process(clock());
        let (h, mut rx) = collector();
        hub.subscribe_detached("slow", h).unwrap();

        hub.publish("slow", json!({"n": 1}));
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["n"], 1);
    }

    #[tokio::test]
    async fn durable_without_broker_degrades_and_still_round_trips() {
        let hub = EventHub::connect(DeliveryMode::Durable, None, "autopilot", clock()).await;
        assert_eq!(hub.mode(), DeliveryMode::InProcess);
        assert!(hub.is_degraded());

        let (h, mut rx) = collector();
        hub.subscribe(SYSTEM_ALERT, h).unwrap();
        hub.publish(SYSTEM_ALERT, json!({"source": "disk"}));
        assert_eq!(rx.try_recv().unwrap().payload["source"], "disk");
    }

    #[tokio::test]
    async fn durable_with_unavailable_broker_degrades() {
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::unavailable());
        let hub = EventHub::connect(DeliveryMode::Durable, Some(broker), "autopilot", clock()).await;
        assert!(hub.is_degraded());

        let (h, mut rx) = collector();
        hub.subscribe(WILDCARD, h).unwrap();
        hub.publish(TASK_EXECUTED, json!({"ok": true}));
        assert_eq!(rx.try_recv().unwrap().event_type, TASK_EXECUTED);
    }

    #[tokio::test]
    async fn durable_delivery_goes_through_the_broker() {
        let broker = Arc::new(LoopbackBroker::new());
        let hub = EventHub::connect(
            DeliveryMode::Durable,
            Some(broker.clone() as Arc<dyn Broker>),
            "autopilot",
            clock(),
        )
        .await;
        assert_eq!(hub.mode(), DeliveryMode::Durable);
        assert!(!hub.is_degraded());

        let (typed, mut typed_rx) = collector();
        let (all, mut all_rx) = collector();
        hub.subscribe(SYSTEM_ALERT, typed).unwrap();
        hub.subscribe(WILDCARD, all).unwrap();

        hub.publish(SYSTEM_ALERT, json!({"n": 7}));

        let wait = Duration::from_secs(2);
        let got = tokio::time::timeout(wait, typed_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.payload["n"], 7);
        let got = tokio::time::timeout(wait, all_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.event_type, SYSTEM_ALERT);

        assert_eq!(
            broker.published_channels(),
            vec!["autopilot:events:system.alert".to_string()]
        );
    }

    #[test]
    fn durable_subscription_outside_runtime_is_an_error() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::new());
        let hub = rt.block_on(EventHub::connect(
            DeliveryMode::Durable,
            Some(broker),
            "p",
            clock(),
        ));

        let (h, _rx) = collector();
        assert!(matches!(hub.subscribe("x", h), Err(HubError::NoRuntime)));
    }
}
