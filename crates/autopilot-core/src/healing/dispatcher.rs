//! SelfHealingDispatcher - エラーコードから回復アクションへのディスパッチ
//!
//! # ガード
//! - depth: 試行中は同じ dispatcher への試行を拒否（回復アクションが自分の
//!   回復を起こせない）
//! - breaker: 失敗し続ける戦略は reset window が過ぎるまでスキップ
//!
//! # 戦略の選択
//! 1. incident の preferred action（学習済み回復パス）が登録済みで breaker が
//!    通すなら、それを実行
//! 2. そうでなければ incident のコードに登録された戦略
//!
//! 失敗はすべて `false` として返る。呼び出し側にエラーは伝播しない。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::breaker::{BreakerBoard, BreakerPermit, BreakerState};
use super::scoring::{HistoricalScoring, RecoveryRecommendation, ScoringStrategy, rank_recovery_paths};
use super::strategy::{HealingAction, HealingStrategy, Incident, wait_and_retry};
use crate::domain::OverallHealth;
use crate::domain::events::{HEALING_FAILED, HEALING_SUCCEEDED};
use crate::hub::EventHub;
use crate::memory::CognitiveMemory;
use crate::ports::Clock;

/// 成功率がこれ以下の学習済み回復パスは推奨しない
pub const LEARNED_RECOVERY_MIN_SUCCESS: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct HealingConfig {
    pub max_depth: u32,
    pub failure_threshold: u32,
    pub reset_window: Duration,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_depth: 1,
            failure_threshold: 5,
            reset_window: Duration::seconds(60),
        }
    }
}

/// HealingOutcome は `heal` 1 回の結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingOutcome {
    pub healed: bool,
    /// 実行した戦略の description（実行しなかったら `None`）
    pub strategy: Option<String>,
    pub elapsed_ms: u64,
    pub rejection: Option<HealingRejection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingRejection {
    InFlight,
    NoStrategy,
    BreakerOpen,
}

impl HealingOutcome {
    fn rejected(reason: HealingRejection) -> Self {
        Self {
            healed: false,
            strategy: None,
            elapsed_ms: 0,
            rejection: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub overall_health: OverallHealth,
    pub services: Vec<ServiceStatus>,
    pub uptime_ms: i64,
    pub last_incident: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealingStats {
    pub attempts: u64,
    pub healed: u64,
    pub failed: u64,
    pub rejected_in_flight: u64,
    pub rejected_no_strategy: u64,
    pub rejected_breaker_open: u64,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    healed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    no_strategy: AtomicU64,
    breaker_open: AtomicU64,
}

/// depth の枠を 1 つ保持し、drop で返す
struct DepthGuard<'a>(&'a AtomicU32);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a AtomicU32, max: u32) -> Option<Self> {
        depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| (d < max).then_some(d + 1))
            .ok()
            .map(|_| Self(depth))
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// SelfHealingDispatcher はエラーコードごとの回復戦略を実行
///
/// # 使用例
/// ```ignore
/// let healer = SelfHealingDispatcher::with_default_strategies(config, clock)
///     .with_memory(memory)
///     .with_hub(hub);
/// let healed = healer.attempt_healing(&incident, "task:crm.sync").await;
/// ```
pub struct SelfHealingDispatcher {
    config: HealingConfig,
    strategies: RwLock<HashMap<String, HealingStrategy>>,
    depth: AtomicU32,
    breakers: Mutex<BreakerBoard>,
    services: RwLock<BTreeMap<String, ServiceStatus>>,
    last_incident: RwLock<Option<DateTime<Utc>>>,
    started_at: DateTime<Utc>,
    counters: Counters,
    memory: Option<Arc<CognitiveMemory>>,
    scoring: Box<dyn ScoringStrategy>,
    hub: Option<Arc<EventHub>>,
    clock: Arc<dyn Clock>,
}

impl SelfHealingDispatcher {
    pub fn new(config: HealingConfig, clock: Arc<dyn Clock>) -> Self {
        let breakers = BreakerBoard::new(config.failure_threshold, config.reset_window);
        Self {
            config,
            strategies: RwLock::new(HashMap::new()),
            depth: AtomicU32::new(0),
            breakers: Mutex::new(breakers),
            services: RwLock::new(BTreeMap::new()),
            last_incident: RwLock::new(None),
            started_at: clock.now(),
            counters: Counters::default(),
            memory: None,
            scoring: Box::new(HistoricalScoring::default()),
            hub: None,
            clock,
        }
    }

    /// `new` + `ECONNRESET` / `ETIMEDOUT` / `ServiceUnavailable` の
    /// wait-and-retry 戦略
    pub fn with_default_strategies(config: HealingConfig, clock: Arc<dyn Clock>) -> Self {
        let d = Self::new(config, clock);
        d.register_strategy(
            "ECONNRESET",
            "Wait and retry connection",
            wait_and_retry(std::time::Duration::from_millis(1000)),
        );
        d.register_strategy(
            "ETIMEDOUT",
            "Quick retry",
            wait_and_retry(std::time::Duration::from_millis(500)),
        );
        d.register_strategy(
            "ServiceUnavailable",
            "Reconnect backoff",
            wait_and_retry(std::time::Duration::from_millis(2000)),
        );
        d
    }

    pub fn with_memory(mut self, memory: Arc<CognitiveMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_scoring(mut self, scoring: impl ScoringStrategy + 'static) -> Self {
        self.scoring = Box::new(scoring);
        self
    }

    pub fn with_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// 戦略を登録（同じコードは後勝ち）
    pub fn register_strategy(
        &self,
        error_code: &str,
        description: &str,
        action: impl HealingAction + 'static,
    ) {
        let strategy = HealingStrategy {
            error_code: error_code.to_string(),
            description: description.to_string(),
            action: Arc::new(action),
        };
        let replaced = self
            .strategies
            .write()
            .insert(error_code.to_string(), strategy)
            .is_some();
        info!(error_code, description, replaced, "healing strategy registered");
    }

    pub fn strategy(&self, error_code: &str) -> Option<HealingStrategy> {
        self.strategies.read().get(error_code).cloned()
    }

    /// description が `action` の戦略（複数あればコードの若い方）
    pub fn strategy_for_action(&self, action: &str) -> Option<HealingStrategy> {
        self.strategies
            .read()
            .values()
            .filter(|s| s.description == action)
            .min_by(|a, b| a.error_code.cmp(&b.error_code))
            .cloned()
    }

    /// 候補: preferred action → コードの戦略
    fn candidates(&self, incident: &Incident) -> Vec<HealingStrategy> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(action) = &incident.preferred_action {
            match self.strategy_for_action(action) {
                Some(s) => candidates.push(s),
                None => debug!(code = %incident.code, action = %action, "preferred action not registered"),
            }
        }
        if let Some(s) = self.strategy(&incident.code)
            && candidates.iter().all(|c| c.error_code != s.error_code)
        {
            candidates.push(s);
        }
        candidates
    }

    pub fn strategy_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.strategies.read().keys().cloned().collect();
        codes.sort();
        codes
    }

    /// `heal(..).healed`.
    pub async fn attempt_healing(&self, incident: &Incident, context: &str) -> bool {
        self.heal(incident, context).await.healed
    }

    pub async fn heal(&self, incident: &Incident, context: &str) -> HealingOutcome {
        let Some(_depth) = DepthGuard::enter(&self.depth, self.config.max_depth) else {
            self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            error!(
                code = %incident.code,
                context,
                error = %incident.message,
                "CRITICAL: recursive healing attempt rejected"
            );
            return HealingOutcome::rejected(HealingRejection::InFlight);
        };

        let now = self.clock.now();
        *self.last_incident.write() = Some(now);
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        warn!(code = %incident.code, context, "self-healing triggered");

        let candidates = self.candidates(incident);
        if candidates.is_empty() {
            self.counters.no_strategy.fetch_add(1, Ordering::Relaxed);
            error!(code = %incident.code, context, "no healing strategy, escalating");
            self.emit(HEALING_FAILED, incident, context, json!({ "reason": "no_strategy" }));
            return HealingOutcome::rejected(HealingRejection::NoStrategy);
        }

        let acquired = candidates.into_iter().find_map(|s| {
            let permit = BreakerPermit::acquire(&self.breakers, &s.error_code, now);
            if permit.is_none() {
                debug!(code = %s.error_code, strategy = %s.description, "breaker open for candidate");
            }
            permit.map(|p| (s, p))
        });
        let Some((strategy, permit)) = acquired else {
            self.counters.breaker_open.fetch_add(1, Ordering::Relaxed);
            warn!(code = %incident.code, context, "healing breaker open, skipping");
            self.emit(HEALING_FAILED, incident, context, json!({ "reason": "breaker_open" }));
            return HealingOutcome::rejected(HealingRejection::BreakerOpen);
        };

        if incident.preferred_action.as_deref() == Some(strategy.description.as_str()) {
            info!(code = %incident.code, strategy = %strategy.description, "using learned recovery action");
        }
        info!(code = %incident.code, strategy = %strategy.description, "executing healing strategy");
        let started = tokio::time::Instant::now();

        // panic は JoinError として受ける
        let action = Arc::clone(&strategy.action);
        let owned = incident.clone();
        let joined = tokio::spawn(async move { action.heal(&owned).await }).await;

        let healed = match joined {
            Ok(Ok(healed)) => healed,
            Ok(Err(e)) => {
                warn!(code = %incident.code, error = %e, "healing action returned an error");
                false
            }
            Err(e) => {
                error!(code = %incident.code, error = %e, "CRITICAL: healing action crashed");
                false
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        permit.finish(healed, self.clock.now());

        if healed {
            self.counters.healed.fetch_add(1, Ordering::Relaxed);
            info!(code = %incident.code, elapsed_ms, "healed");
            self.emit(
                HEALING_SUCCEEDED,
                incident,
                context,
                json!({ "strategy": strategy.description, "elapsedMs": elapsed_ms }),
            );
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(code = %incident.code, elapsed_ms, "strategy ran but did not resolve the incident");
            self.emit(
                HEALING_FAILED,
                incident,
                context,
                json!({ "reason": "strategy_failed", "strategy": strategy.description }),
            );
        }

        HealingOutcome {
            healed,
            strategy: Some(strategy.description),
            elapsed_ms,
            rejection: None,
        }
    }

    pub fn breaker_state(&self, error_code: &str) -> BreakerState {
        self.breakers.lock().state(error_code, self.clock.now())
    }

    /// `(source, error_type)` の学習済み回復パスのうち最良のもの
    ///
    /// 成功率が `LEARNED_RECOVERY_MIN_SUCCESS` を超えるものだけが対象。
    pub fn recommend_recovery(&self, source: &str, error_type: &str) -> Option<RecoveryRecommendation> {
        let memory = self.memory.as_ref()?;
        let paths = memory.recovery_paths(source, error_type);
        rank_recovery_paths(&paths, self.scoring.as_ref(), LEARNED_RECOVERY_MIN_SUCCESS)
    }

    pub fn update_service_status(&self, name: &str, healthy: bool) {
        let now = self.clock.now();
        let previous = self.services.write().insert(
            name.to_string(),
            ServiceStatus {
                name: name.to_string(),
                healthy,
                last_check: now,
            },
        );
        if !healthy {
            *self.last_incident.write() = Some(now);
            if previous.is_none_or(|p| p.healthy) {
                warn!(service = name, "service marked unhealthy");
            }
        }
    }

    pub fn system_status(&self) -> SystemStatus {
        let services: Vec<ServiceStatus> = self.services.read().values().cloned().collect();
        let unhealthy = services.iter().filter(|s| !s.healthy).count();
        let overall_health = if unhealthy == 0 {
            OverallHealth::Healthy
        } else if unhealthy < services.len() {
            OverallHealth::Degraded
        } else {
            OverallHealth::Critical
        };
        SystemStatus {
            overall_health,
            services,
            uptime_ms: (self.clock.now() - self.started_at).num_milliseconds(),
            last_incident: *self.last_incident.read(),
        }
    }

    pub fn stats(&self) -> HealingStats {
        let c = &self.counters;
        HealingStats {
            attempts: c.attempts.load(Ordering::Relaxed),
            healed: c.healed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected_in_flight: c.in_flight.load(Ordering::Relaxed),
            rejected_no_strategy: c.no_strategy.load(Ordering::Relaxed),
            rejected_breaker_open: c.breaker_open.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, event_type: &str, incident: &Incident, context: &str, extra: serde_json::Value) {
        let Some(hub) = &self.hub else {
            return;
        };
        let mut payload = json!({ "incident": incident, "context": context });
        if let (Some(obj), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            obj.extend(extra);
        }
        hub.publish(event_type, payload);
    }
}
