//! CoreBuilder - コアの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 依存の注入（Clock / Broker / StressProbe を差し替え可能）

use std::sync::Arc;

use tracing::{info, warn};

use super::engine::AutonomousTaskEngine;
use crate::config::CoreConfig;
use crate::domain::{ConfigError, EngineError, HubError, RegistryError};
use crate::healing::SelfHealingDispatcher;
use crate::hub::EventHub;
use crate::impls::{SourceRegistry, broker_for_url};
use crate::memory::CognitiveMemory;
use crate::ports::{
    Broker, Clock, IdGenerator, ManualStressProbe, Source, StressProbe, SystemClock, UlidGenerator,
};
use crate::queue::PriorityPolicy;
use crate::recorder::TaskRecorder;

/// CoreBuilder はコア一式を構築
///
/// # 使用例
/// ```ignore
/// let core = CoreBuilder::new(CoreConfig::from_env())
///     .source(Arc::new(CrmSource::new()))?
///     .expect_capabilities(&["crm.sync"])
///     .build()
///     .await?;
/// core.start()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_capabilities() で期待される capability を登録
/// - build() 時に「期待集合 ⊆ 登録済み source の capability」をチェック
/// - 不足があれば BuildError を返す
pub struct CoreBuilder {
    config: CoreConfig,
    sources: SourceRegistry,
    broker: Option<Arc<dyn Broker>>,
    stress: Option<Arc<dyn StressProbe>>,
    clock: Arc<dyn Clock>,
    policy: PriorityPolicy,
    expected_capabilities: Option<Vec<String>>,
}

/// BuildError はコア構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing capabilities: {0:?}. These capabilities were expected but no source declares them.")]
    MissingCapabilities(Vec<String>),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("recorder could not subscribe: {0}")]
    Hub(#[from] HubError),
}

impl CoreBuilder {
    /// 新しい CoreBuilder を作成
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            sources: SourceRegistry::new(),
            broker: None,
            stress: None,
            clock: Arc::new(SystemClock),
            policy: PriorityPolicy::standard(),
            expected_capabilities: None,
        }
    }

    /// Source を登録（名前の重複はエラー）
    pub fn source(mut self, source: Arc<dyn Source>) -> Result<Self, RegistryError> {
        self.sources.register(source)?;
        Ok(self)
    }

    /// durable 配送用の Broker を注入
    ///
    /// config が durable を要求したときだけ使う。`durable_bus_url` より優先。
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// 未指定なら `Low` 固定の `ManualStressProbe`
    pub fn stress_probe(mut self, stress: Arc<dyn StressProbe>) -> Self {
        self.stress = Some(stress);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(mut self, policy: PriorityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 期待される capability のリストを設定
    pub fn expect_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.expected_capabilities = Some(capabilities.iter().map(|c| c.to_string()).collect());
        self
    }

    /// コアを構築
    ///
    /// # フロー
    /// 1. config を検証
    /// 2. 期待 capability のカバーを検証
    /// 3. EventHub を接続（durable が使えなければ in-process に縮退）
    /// 4. memory / recorder / healer / engine を生成してつなぐ
    pub async fn build(self) -> Result<Core, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_capabilities {
            let missing: Vec<String> = expected
                .iter()
                .filter(|c| !self.sources.covers(c))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingCapabilities(missing));
            }
        }

        let config = self.config;
        let clock = self.clock;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let broker = match self.broker {
            Some(broker) => Some(broker),
            None if config.durable_bus => resolve_broker(config.durable_bus_url.as_deref()),
            None => None,
        };
        let hub = Arc::new(
            EventHub::connect(
                config.delivery_mode(),
                broker,
                config.channel_prefix.clone(),
                Arc::clone(&clock),
            )
            .await,
        );
        let memory = Arc::new(CognitiveMemory::new(
            config.memory_capacities(),
            Arc::clone(&clock),
            Arc::clone(&ids),
        ));

        let recorder = Arc::new(
            TaskRecorder::new(config.recorder_config(), Arc::clone(&clock), ids)
                .with_hub(Arc::clone(&hub)),
        );
        recorder.attach(&hub)?;

        let healer = Arc::new(
            SelfHealingDispatcher::with_default_strategies(config.healing_config(), Arc::clone(&clock))
                .with_memory(Arc::clone(&memory))
                .with_hub(Arc::clone(&hub)),
        );

        let stress: Arc<dyn StressProbe> = match self.stress {
            Some(stress) => stress,
            None => Arc::new(ManualStressProbe::default()),
        };
        let sources = Arc::new(self.sources);
        let engine = Arc::new(AutonomousTaskEngine::new(
            config.engine_config(),
            self.policy,
            Arc::clone(&sources),
            Arc::clone(&memory),
            Arc::clone(&hub),
            Some(Arc::clone(&healer)),
            stress,
            clock,
        ));

        info!(
            sources = sources.len(),
            delivery = ?hub.mode(),
            degraded = hub.is_degraded(),
            "autopilot core built"
        );
        Ok(Core {
            config,
            hub,
            memory,
            recorder,
            healer,
            engine,
            sources,
        })
    }
}

fn resolve_broker(url: Option<&str>) -> Option<Arc<dyn Broker>> {
    let Some(url) = url else {
        warn!("durable bus requested without a broker or url");
        return None;
    };
    match broker_for_url(url) {
        Ok(broker) => Some(broker),
        Err(err) => {
            warn!(error = %err, "durable bus url not usable");
            None
        }
    }
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

/// Core は `build` が組み立てた一式（各部品は共有ハンドル）
pub struct Core {
    pub config: CoreConfig,
    pub hub: Arc<EventHub>,
    pub memory: Arc<CognitiveMemory>,
    pub recorder: Arc<TaskRecorder>,
    pub healer: Arc<SelfHealingDispatcher>,
    pub engine: Arc<AutonomousTaskEngine>,
    pub sources: Arc<SourceRegistry>,
}

impl Core {
    pub fn start(&self) -> Result<(), EngineError> {
        self.engine.start()
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
