//! AutonomousTaskEngine - 自律タスク実行エンジン
//!
//! 1 イテレーション:
//! 1. 最優先タスクを dequeue
//! 2. capability を持つ healthy な source のうち最良のものに問い合わせる
//! 3. 結果を memory に記録し、`task.executed` を publish
//! 4. 後続タスクを導出し、stress / health からキューを reprioritize
//!
//! # 学習ポイント
//! - `Weak` 参照でループとエンジンの寿命を切り離す
//! - `watch` チャネルによる shutdown 通知
//! - 失敗時は self-healing を挟んで 1 回だけ再試行

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::maintenance_loop::maintenance_loop;
use super::scheduler_loop::scheduler_loop;
use super::status::{EngineState, EngineStatus, ExecutionLog};
use crate::domain::events::{SYSTEM_ALERT, TASK_EXECUTED};
use crate::domain::{
    EngineError, ExecutionResult, HubError, SourceError, Task, TaskExecutedEvent, TaskIntent,
    TaskState, TaskType,
};
use crate::healing::{Incident, SelfHealingDispatcher};
use crate::hub::{EventHub, SubscriptionId, handler_fn};
use crate::impls::SourceRegistry;
use crate::memory::{
    CognitiveMemory, FailureInput, HealthMetrics, LatencyPercentiles, QueryInput, RingBuffer,
};
use crate::ports::{Clock, Source, StressProbe};
use crate::queue::{PriorityPolicy, PriorityTaskQueue};

/// タスクが属する widget を示す payload キー（なければ `"unknown"`）
pub const WIDGET_KEY: &str = "widgetId";
const UNKNOWN_WIDGET: &str = "unknown";

pub const DATA_COLLECTION_SCORE: f64 = 60.0;
pub const PATTERN_EXPLORATION_SCORE: f64 = 70.0;
pub const ALERT_SCORE: f64 = 100.0;

/// EngineConfig はエンジンの実行パラメータ
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub maintenance_interval: Duration,
    pub memory_retention: chrono::Duration,
    /// lineage がこの深さ以上のタスクからは後続を導出しない
    pub max_follow_up_depth: u32,
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            memory_retention: chrono::Duration::days(30),
            max_follow_up_depth: 3,
            history_capacity: 100,
        }
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    scheduler: Option<JoinHandle<()>>,
    maintenance: JoinHandle<()>,
    alert_subscription: Option<SubscriptionId>,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// AutonomousTaskEngine はキューを回し続けるエンジン
///
/// # 使用例
/// ```ignore
/// engine.enqueue(Task::new("crm.sync"))?;
/// engine.start()?;
/// // ...
/// engine.shutdown().await;
/// ```
pub struct AutonomousTaskEngine {
    config: EngineConfig,
    queue: PriorityTaskQueue,
    policy: PriorityPolicy,
    sources: Arc<SourceRegistry>,
    memory: Arc<CognitiveMemory>,
    hub: Arc<EventHub>,
    healer: Option<Arc<SelfHealingDispatcher>>,
    stress: Arc<dyn StressProbe>,
    clock: Arc<dyn Clock>,
    history: RwLock<RingBuffer<ExecutionLog>>,
    current: RwLock<Option<TaskType>>,
    running: Mutex<Option<Running>>,
    stopped: AtomicBool,
    counters: Counters,
}

impl AutonomousTaskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        policy: PriorityPolicy,
        sources: Arc<SourceRegistry>,
        memory: Arc<CognitiveMemory>,
        hub: Arc<EventHub>,
        healer: Option<Arc<SelfHealingDispatcher>>,
        stress: Arc<dyn StressProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let history = RingBuffer::new(config.history_capacity);
        Self {
            config,
            queue: PriorityTaskQueue::new(),
            policy,
            sources,
            memory,
            hub,
            healer,
            stress,
            clock,
            history: RwLock::new(history),
            current: RwLock::new(None),
            running: Mutex::new(None),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn queue(&self) -> &PriorityTaskQueue {
        &self.queue
    }

    /// 現在のシグナルで policy が決めた優先度で enqueue
    pub fn enqueue(&self, task: Task) -> Result<(), EngineError> {
        let priority = self
            .policy
            .priority(&task, self.stress.stress_level(), self.memory.global_health());
        self.enqueue_at(task, priority)
    }

    pub fn enqueue_at(&self, task: Task, priority: f64) -> Result<(), EngineError> {
        let task_type = task.task_type.clone();
        if !self.queue.enqueue(task, priority) {
            return Err(EngineError::Stopped);
        }
        debug!(task_type = %task_type, priority, "task enqueued");
        Ok(())
    }

    /// scheduler / maintenance ループを起動し、`system.alert` を購読
    ///
    /// tokio runtime の外から呼ぶと `EngineError` を返す。
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::NoRuntime);
        }
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let alert_subscription = match self.subscribe_alerts() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "system.alert subscription failed, alerts will not seed tasks");
                None
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = tokio::spawn(scheduler_loop(
            Arc::downgrade(self),
            self.config.poll_interval,
            shutdown_rx.clone(),
        ));
        let maintenance = tokio::spawn(maintenance_loop(
            Arc::downgrade(self),
            self.config.maintenance_interval,
            shutdown_rx,
        ));

        *running = Some(Running {
            shutdown_tx,
            scheduler: Some(scheduler),
            maintenance,
            alert_subscription,
        });
        info!(sources = self.sources.len(), "autonomous task engine started");
        Ok(())
    }

    fn subscribe_alerts(self: &Arc<Self>) -> Result<SubscriptionId, HubError> {
        let engine = Arc::downgrade(self);
        self.hub.subscribe(
            SYSTEM_ALERT,
            handler_fn(move |event| {
                let Some(engine) = engine.upgrade() else {
                    return Ok(());
                };
                let task = Task::new(TaskType::DIAGNOSTIC)
                    .with_payload(event.payload.clone())
                    .with_base_score(ALERT_SCORE)
                    .maintenance();
                if engine.enqueue_at(task, ALERT_SCORE).is_err() {
                    debug!("alert dropped, engine stopped");
                }
                Ok(())
            }),
        )
    }

    /// ループを停止（冪等）
    ///
    /// 戻った後の dequeue は必ず失敗する。実行中のタスクは待たない。
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.close();
        if let Some(running) = self.running.lock().take() {
            let _ = running.shutdown_tx.send(true);
            running.maintenance.abort();
            if let Some(id) = running.alert_subscription {
                self.hub.unsubscribe(id);
            }
        }
        info!(pending = self.queue.len(), "autonomous task engine stopped");
    }

    /// `stop` してから scheduler ループの終了を待つ
    pub async fn shutdown(&self) {
        let scheduler = self
            .running
            .lock()
            .as_mut()
            .and_then(|r| r.scheduler.take());
        self.stop();
        if let Some(join) = scheduler {
            let _ = join.await;
        }
    }

    /// ループ 1 回分。何も dequeue できなければ `None`
    pub async fn run_once(&self) -> Option<ExecutionLog> {
        let entry = self.queue.dequeue()?;
        let task = entry.task;
        *self.current.write() = Some(task.task_type.clone());

        let started_at = self.clock.now();
        let timer = tokio::time::Instant::now();
        let (result, source) = self.run_task(&task).await;
        let duration_ms = timer.elapsed().as_millis() as u64;

        let follow_ups = self.derive_follow_ups(&task, &result);
        let follow_up_types: Vec<TaskType> =
            follow_ups.iter().map(|t| t.task_type.clone()).collect();
        for follow_up in follow_ups {
            if self.enqueue(follow_up).is_err() {
                debug!("follow-up dropped, engine stopped");
            }
        }
        self.reprioritize();

        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        let state = if result.success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            TaskState::Completed
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            TaskState::Failed
        };

        info!(
            task_type = %task.task_type,
            priority = entry.priority,
            success = result.success,
            source = source.as_deref().unwrap_or("-"),
            duration_ms,
            follow_ups = follow_up_types.len(),
            "task executed"
        );

        let log = ExecutionLog {
            task,
            result,
            state,
            source,
            started_at,
            duration_ms,
            follow_ups: follow_up_types,
        };
        self.history.write().push(log.clone());
        *self.current.write() = None;
        Some(log)
    }

    pub async fn execute_task(&self, task: &Task) -> ExecutionResult {
        self.run_task(task).await.0
    }

    async fn run_task(&self, task: &Task) -> (ExecutionResult, Option<String>) {
        if task.task_type.as_str() == TaskType::MEMORY_OPTIMIZATION {
            return (self.optimize_memory(), None);
        }

        let intent = TaskIntent::from_task(task);
        let widget_id = task
            .payload
            .get(WIDGET_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or(UNKNOWN_WIDGET)
            .to_string();

        let Some(source) = self.select_source(&intent.capability).await else {
            let err = SourceError::NoSource(intent.capability.clone());
            warn!(capability = %intent.capability, "no healthy source");
            self.publish_executed(task, &intent, None, 0, Err(&err));
            return (ExecutionResult::failure(err.to_string()), None);
        };
        let name = source.name().to_string();

        let timer = tokio::time::Instant::now();
        let mut outcome = source.query(&intent.operation, &intent.params).await;
        let mut latency_ms = timer.elapsed().as_millis() as u64;
        self.record_query(&widget_id, &intent, &name, latency_ms, &outcome);

        if let Err(err) = &outcome {
            let healed = self.recover(&name, &intent, err).await;
            if healed {
                let retry = tokio::time::Instant::now();
                outcome = source.query(&intent.operation, &intent.params).await;
                latency_ms = retry.elapsed().as_millis() as u64;
                self.record_query(&widget_id, &intent, &name, latency_ms, &outcome);
            }
        }

        self.record_health(&name, latency_ms, outcome.is_ok());
        if let Some(healer) = &self.healer {
            healer.update_service_status(&name, outcome.is_ok());
        }
        self.publish_executed(task, &intent, Some(&name), latency_ms, outcome.as_ref());

        let result = match outcome {
            Ok(data) => ExecutionResult::success(data),
            Err(e) => ExecutionResult::failure(e.to_string()),
        };
        (result, Some(name))
    }

    /// `capability` を持つ healthy な source（全体成功率の高い順）
    ///
    /// 同率なら registry の順序（より具体的な capability が先）。
    async fn select_source(&self, capability: &str) -> Option<Arc<dyn Source>> {
        let mut healthy = Vec::new();
        for source in self.sources.resolve(capability) {
            if source.is_healthy().await {
                let score = self
                    .memory
                    .source_intelligence(source.name())
                    .overall_success_rate;
                healthy.push((source, score));
            } else {
                debug!(source = source.name(), "skipping unhealthy source");
            }
        }
        healthy.sort_by(|a, b| b.1.total_cmp(&a.1));
        healthy.into_iter().next().map(|(s, _)| s)
    }

    fn record_query(
        &self,
        widget_id: &str,
        intent: &TaskIntent,
        source: &str,
        latency_ms: u64,
        outcome: &Result<serde_json::Value, SourceError>,
    ) {
        let result_size = outcome
            .as_ref()
            .ok()
            .and_then(|data| serde_json::to_vec(data).ok())
            .map(|bytes| bytes.len() as u64);
        self.memory.record_query(QueryInput {
            widget_id: widget_id.to_string(),
            query_type: intent.operation.clone(),
            params: intent.params.clone(),
            source_used: source.to_string(),
            latency_ms,
            result_size,
            success: outcome.is_ok(),
        });
    }

    /// source の全体成功率でスコアした health サンプルを記録
    fn record_health(&self, source: &str, latency_ms: u64, ok: bool) {
        let score = self.memory.source_intelligence(source).overall_success_rate;
        let latency = latency_ms as f64;
        self.memory.record_health_metrics(HealthMetrics {
            source_name: source.to_string(),
            health_score: score,
            latency: LatencyPercentiles {
                p50: latency,
                p95: latency,
                p99: latency,
            },
            success_rate: score,
            request_count: 1,
            error_count: u64::from(!ok),
            timestamp: self.clock.now(),
        });
    }

    /// 失敗を記録し、dispatcher があれば self-healing を試す
    ///
    /// 学習済みの回復パスがあれば incident の preferred action として渡す。
    async fn recover(&self, source: &str, intent: &TaskIntent, err: &SourceError) -> bool {
        let mut failure = FailureInput {
            source_name: source.to_string(),
            error_type: err.code().to_string(),
            error_message: err.to_string(),
            context: json!({ "operation": intent.operation, "params": intent.params }),
            ..Default::default()
        };

        let healed = match &self.healer {
            Some(healer) => {
                let mut incident = Incident::from_source(source, err);
                if let Some(learned) = healer.recommend_recovery(source, err.code()) {
                    debug!(source, action = %learned.action, score = learned.score, "learned recovery available");
                    incident = incident.prefer(learned.action);
                }
                let outcome = healer.heal(&incident, &format!("task:{}", intent.operation)).await;
                if let Some(strategy) = outcome.strategy {
                    failure.recovery_action = Some(strategy);
                    failure.recovery_succeeded = Some(outcome.healed);
                    failure.recovery_time_ms = Some(outcome.elapsed_ms);
                }
                outcome.healed
            }
            None => false,
        };

        self.memory.record_failure(failure);
        healed
    }

    fn publish_executed(
        &self,
        task: &Task,
        intent: &TaskIntent,
        source: Option<&str>,
        duration_ms: u64,
        outcome: Result<&serde_json::Value, &SourceError>,
    ) {
        let event = TaskExecutedEvent {
            task_type: task.task_type.to_string(),
            params: intent.params.clone(),
            success: outcome.is_ok(),
            duration_ms,
            source: source.map(str::to_string),
            error: outcome.err().map(|e| e.to_string()),
            user_id: None,
            org_id: None,
            context: serde_json::Map::new(),
        };
        match serde_json::to_value(&event) {
            Ok(payload) => self.hub.publish(TASK_EXECUTED, payload),
            Err(e) => warn!(error = %e, "task.executed not published"),
        }
    }

    fn optimize_memory(&self) -> ExecutionResult {
        let report = self.memory.consolidate(self.config.memory_retention);
        let sample = self.memory.analyze_system_health();
        ExecutionResult::success(json!({ "consolidation": report, "health": sample }))
    }

    /// `result` から後続タスクを導出
    ///
    /// lineage が `max_follow_up_depth` に達したら何も導出しない。
    pub fn derive_follow_ups(&self, task: &Task, result: &ExecutionResult) -> Vec<Task> {
        if task.lineage >= self.config.max_follow_up_depth {
            if result.needs_more_data || result.found_pattern {
                debug!(task_type = %task.task_type, lineage = task.lineage, "follow-up depth reached");
            }
            return Vec::new();
        }

        let capability = TaskIntent::from_task(task).capability;
        let mut follow_ups = Vec::new();
        if result.needs_more_data {
            follow_ups.push(
                Task::new(TaskType::DATA_COLLECTION)
                    .with_payload(json!({
                        "capability": capability,
                        "reason": result.error.as_deref().unwrap_or("Missing data"),
                    }))
                    .with_base_score(DATA_COLLECTION_SCORE)
                    .simple()
                    .derived_from(task),
            );
        }
        if result.found_pattern {
            follow_ups.push(
                Task::new(TaskType::PATTERN_EXPLORATION)
                    .with_payload(json!({
                        "capability": capability,
                        "pattern": result.pattern().cloned().unwrap_or_default(),
                    }))
                    .with_base_score(PATTERN_EXPLORATION_SCORE)
                    .derived_from(task),
            );
        }
        follow_ups
    }

    /// 現在の stress / health からキュー全体の優先度を再計算
    pub fn reprioritize(&self) {
        let stress = self.stress.stress_level();
        let global_health = self.memory.analyze_system_health().global_health;
        self.queue
            .reprioritize(|task| self.policy.priority(task, stress, global_health));
    }

    /// 新しい順
    pub fn execution_history(&self) -> Vec<ExecutionLog> {
        self.history.read().iter_recent().cloned().collect()
    }

    pub fn status(&self) -> EngineStatus {
        let state = if self.stopped.load(Ordering::Acquire) {
            EngineState::Stopped
        } else if self.running.lock().is_some() {
            EngineState::Running
        } else {
            EngineState::Idle
        };
        EngineStatus {
            state,
            queue: self.queue.stats(),
            executed: self.counters.executed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            current_task: self.current.read().clone(),
            stress: self.stress.stress_level(),
            global_health: self.memory.global_health(),
        }
    }
}

impl Drop for AutonomousTaskEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.maintenance.abort();
            if let Some(scheduler) = running.scheduler {
                scheduler.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, HealingActionError, StressLevel};
    use crate::healing::{HealingConfig, healing_fn};
    use crate::memory::MemoryCapacities;
    use crate::ports::{ManualStressProbe, SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;

    struct Scripted {
        name: &'static str,
        caps: Vec<Capability>,
        healthy: bool,
        replies: Mutex<VecDeque<Result<Value, SourceError>>>,
        calls: AtomicU64,
    }

    impl Scripted {
        fn new(name: &'static str, caps: &[&str]) -> Self {
            Self {
                name,
                caps: caps.iter().map(|c| Capability::parse(c)).collect(),
                healthy: true,
                replies: Mutex::new(VecDeque::new()),
                calls: AtomicU64::new(0),
            }
        }

        fn replying(self, replies: Vec<Result<Value, SourceError>>) -> Self {
            *self.replies.lock() = replies.into();
            self
        }

        fn unhealthy(mut self) -> Self {
            self.healthy = false;
            self
        }
    }

    #[async_trait]
    impl Source for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }

        async fn query(&self, _op: &str, _params: &Value) -> Result<Value, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"ok": true})))
        }

        async fn is_healthy(&self) -> bool {
            self.healthy
        }
    }

    fn boxed(source: Scripted) -> Arc<dyn Source> {
        Arc::new(source)
    }

    fn shared(source: &Arc<Scripted>) -> Arc<dyn Source> {
        source.clone()
    }

    struct Fixture {
        engine: Arc<AutonomousTaskEngine>,
        hub: Arc<EventHub>,
        memory: Arc<CognitiveMemory>,
        stress: Arc<ManualStressProbe>,
    }

    fn fixture(sources: Vec<Arc<dyn Source>>, healer: Option<Arc<SelfHealingDispatcher>>) -> Fixture {
        fixture_with(sources, |_| healer)
    }

    /// `make_healer` にはエンジンと同じ memory が渡る
    fn fixture_with(
        sources: Vec<Arc<dyn Source>>,
        make_healer: impl FnOnce(Arc<CognitiveMemory>) -> Option<Arc<SelfHealingDispatcher>>,
    ) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let memory = Arc::new(CognitiveMemory::new(
            MemoryCapacities::default(),
            Arc::clone(&clock),
            ids,
        ));
        let healer = make_healer(Arc::clone(&memory));
        let hub = Arc::new(EventHub::in_process(Arc::clone(&clock)));
        let stress = Arc::new(ManualStressProbe::default());
        let mut registry = SourceRegistry::new();
        for s in sources {
            registry.register(s).unwrap();
        }
        let config = EngineConfig {
            poll_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let engine = Arc::new(AutonomousTaskEngine::new(
            config,
            PriorityPolicy::standard(),
            Arc::new(registry),
            Arc::clone(&memory),
            Arc::clone(&hub),
            healer,
            stress.clone(),
            clock,
        ));
        Fixture {
            engine,
            hub,
            memory,
            stress,
        }
    }

    #[tokio::test]
    async fn high_stress_runs_simple_data_collection_before_diagnostic() {
        let f = fixture(vec![boxed(Scripted::new("any", &["*"]))], None);
        f.stress.set(StressLevel::High);

        f.engine
            .enqueue(Task::new(TaskType::DIAGNOSTIC).with_base_score(100.0))
            .unwrap();
        f.engine
            .enqueue(Task::new(TaskType::DATA_COLLECTION).with_base_score(60.0).simple())
            .unwrap();

        let first = f.engine.run_once().await.unwrap();
        assert_eq!(first.task.task_type.as_str(), TaskType::DATA_COLLECTION);
        let second = f.engine.run_once().await.unwrap();
        assert_eq!(second.task.task_type.as_str(), TaskType::DIAGNOSTIC);
    }

    #[tokio::test]
    async fn successful_task_is_recorded_and_published() {
        let source = Arc::new(Scripted::new("crm", &["crm.*"]).replying(vec![Ok(json!({"rows": 3}))]));
        let f = fixture(vec![shared(&source)], None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.hub
            .subscribe(
                TASK_EXECUTED,
                handler_fn(move |e| {
                    sink.lock().push(e.payload.clone());
                    Ok(())
                }),
            )
            .unwrap();

        f.engine
            .enqueue(Task::new("crm.sync").with_payload(json!({"widgetId": "w1"})))
            .unwrap();
        let log = f.engine.run_once().await.unwrap();

        assert!(log.result.success);
        assert_eq!(log.state, TaskState::Completed);
        assert_eq!(log.source.as_deref(), Some("crm"));
        assert!(log.follow_ups.is_empty());
        assert_eq!(f.memory.success_rate("crm", "crm.sync"), 1.0);
        assert_eq!(f.memory.widget_patterns("w1").common_sources, vec!["crm".to_string()]);

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["taskType"], "crm.sync");
        assert_eq!(events[0]["source"], "crm");
        assert_eq!(events[0]["success"], true);
    }

    #[tokio::test]
    async fn found_pattern_derives_exploration_task() {
        let source = Scripted::new("graph", &["*"]).replying(vec![Ok(json!({"pattern": "weekly spike"}))]);
        let f = fixture(vec![boxed(source)], None);

        f.engine.enqueue(Task::new("analyze")).unwrap();
        let log = f.engine.run_once().await.unwrap();
        assert_eq!(log.follow_ups, vec![TaskType::new(TaskType::PATTERN_EXPLORATION)]);

        let queued = f.engine.queue().snapshot();
        assert_eq!(queued.len(), 1);
        let explore = &queued[0].task;
        assert_eq!(explore.base_score, PATTERN_EXPLORATION_SCORE);
        assert!(!explore.is_simple);
        assert_eq!(explore.lineage, 1);
        assert_eq!(explore.payload["pattern"], "weekly spike");
        assert_eq!(explore.payload["capability"], "analyze");
    }

    #[tokio::test]
    async fn missing_source_fails_and_follow_ups_stop_at_depth_limit() {
        let f = fixture(vec![boxed(Scripted::new("down", &["*"]).unhealthy())], None);
        f.engine.enqueue(Task::new("report")).unwrap();

        let mut executed = 0;
        while let Some(log) = f.engine.run_once().await {
            assert!(!log.result.success);
            assert!(log.result.needs_more_data);
            executed += 1;
            assert!(executed <= 10, "follow-ups did not stop");
        }
        // root + data_collection 3 世代
        assert_eq!(executed, 4);
        let history = f.engine.execution_history();
        assert_eq!(history[0].task.lineage, 3);
        assert!(history[0].follow_ups.is_empty());
        assert_eq!(f.engine.status().failed, 4);
    }

    #[tokio::test]
    async fn source_error_is_healed_and_retried() {
        let source = Arc::new(
            Scripted::new("crm", &["*"])
                .replying(vec![Err(SourceError::ConnectionReset("peer".into())), Ok(json!([1, 2]))]),
        );
        let healer = Arc::new(SelfHealingDispatcher::new(
            HealingConfig::default(),
            Arc::new(SystemClock),
        ));
        healer.register_strategy(
            "ECONNRESET",
            "reconnect",
            healing_fn(|_| async { Ok::<_, HealingActionError>(true) }),
        );
        let f = fixture(vec![shared(&source)], Some(healer.clone()));

        f.engine.enqueue(Task::new("sync")).unwrap();
        let log = f.engine.run_once().await.unwrap();

        assert!(log.result.success);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        let recovery = f.memory.last_successful_recovery("crm", "ECONNRESET").unwrap();
        assert_eq!(recovery.action, "reconnect");
        assert_eq!(healer.system_status().services[0].name, "crm");
        assert!(healer.system_status().services[0].healthy);
    }

    #[tokio::test]
    async fn learned_recovery_path_picks_the_strategy() {
        let source = Arc::new(
            Scripted::new("crm", &["*"])
                .replying(vec![Err(SourceError::ConnectionReset("peer".into())), Ok(json!([1]))]),
        );
        let reconnects = Arc::new(AtomicU64::new(0));
        let recycles = Arc::new(AtomicU64::new(0));
        let (reconnect_count, recycle_count) = (Arc::clone(&reconnects), Arc::clone(&recycles));

        let f = fixture_with(vec![shared(&source)], move |memory| {
            for _ in 0..3 {
                memory.record_failure(FailureInput {
                    source_name: "crm".into(),
                    error_type: "ECONNRESET".into(),
                    recovery_action: Some("recycle pool".into()),
                    recovery_succeeded: Some(true),
                    recovery_time_ms: Some(40),
                    ..Default::default()
                });
            }
            let healer = SelfHealingDispatcher::new(HealingConfig::default(), Arc::new(SystemClock))
                .with_memory(memory);
            healer.register_strategy(
                "ECONNRESET",
                "reconnect",
                healing_fn(move |_| {
                    let n = Arc::clone(&reconnect_count);
                    async move {
                        n.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, HealingActionError>(true)
                    }
                }),
            );
            healer.register_strategy(
                "POOL_EXHAUSTED",
                "recycle pool",
                healing_fn(move |_| {
                    let n = Arc::clone(&recycle_count);
                    async move {
                        n.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, HealingActionError>(true)
                    }
                }),
            );
            Some(Arc::new(healer))
        });

        f.engine.enqueue(Task::new("sync")).unwrap();
        let log = f.engine.run_once().await.unwrap();

        assert!(log.result.success);
        assert_eq!(recycles.load(Ordering::SeqCst), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
        let latest = f.memory.failures().failure_history("crm", 1);
        assert_eq!(latest[0].recovery_action.as_deref(), Some("recycle pool"));
        assert_eq!(latest[0].recovery_succeeded, Some(true));
    }

    #[tokio::test]
    async fn without_history_the_code_strategy_runs() {
        let source = Scripted::new("crm", &["*"])
            .replying(vec![Err(SourceError::ConnectionReset("peer".into())), Ok(json!([1]))]);
        let f = fixture_with(vec![boxed(source)], |memory| {
            let healer = SelfHealingDispatcher::new(HealingConfig::default(), Arc::new(SystemClock))
                .with_memory(memory);
            healer.register_strategy(
                "ECONNRESET",
                "reconnect",
                healing_fn(|_| async { Ok::<_, HealingActionError>(true) }),
            );
            healer.register_strategy(
                "POOL_EXHAUSTED",
                "recycle pool",
                healing_fn(|_| async { Ok::<_, HealingActionError>(false) }),
            );
            Some(Arc::new(healer))
        });

        f.engine.enqueue(Task::new("sync")).unwrap();
        assert!(f.engine.run_once().await.unwrap().result.success);
        let latest = f.memory.failures().failure_history("crm", 1);
        assert_eq!(latest[0].recovery_action.as_deref(), Some("reconnect"));
    }

    #[tokio::test]
    async fn unhealed_error_records_failure_without_recovery() {
        let source = Scripted::new("crm", &["*"])
            .replying(vec![Err(SourceError::Other { code: "EPIPE".into(), message: "x".into() })]);
        let f = fixture(vec![boxed(source)], None);

        f.engine.enqueue(Task::new("sync")).unwrap();
        let log = f.engine.run_once().await.unwrap();

        assert!(!log.result.success);
        assert_eq!(log.follow_ups, vec![TaskType::new(TaskType::DATA_COLLECTION)]);
        let history = f.memory.failures().failure_history("crm", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error_type, "EPIPE");
        assert!(history[0].recovery_action.is_none());
    }

    #[tokio::test]
    async fn memory_optimization_consolidates_without_a_source() {
        let f = fixture(vec![], None);
        f.engine
            .enqueue(crate::app::maintenance_loop::maintenance_task())
            .unwrap();
        let log = f.engine.run_once().await.unwrap();
        assert!(log.result.success);
        assert!(log.source.is_none());
        assert!(log.result.data.as_ref().unwrap().get("consolidation").is_some());
    }

    #[tokio::test]
    async fn running_engine_processes_tasks_and_alerts_until_stopped() {
        let f = fixture(vec![boxed(Scripted::new("any", &["*"]))], None);
        f.engine.start().unwrap();
        assert!(matches!(f.engine.start(), Err(EngineError::AlreadyStarted)));

        f.engine.enqueue(Task::new("sync")).unwrap();
        f.hub.publish(SYSTEM_ALERT, json!({"reason": "disk"}));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.engine.status().executed < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let types: Vec<String> = f
            .engine
            .execution_history()
            .iter()
            .map(|l| l.task.task_type.to_string())
            .collect();
        assert!(types.contains(&"diagnostic".to_string()));
        assert!(types.contains(&"sync".to_string()));

        f.engine.shutdown().await;
        f.engine.stop();
        assert_eq!(f.engine.status().state, EngineState::Stopped);
        assert!(matches!(f.engine.enqueue(Task::new("late")), Err(EngineError::Stopped)));
        assert!(f.engine.run_once().await.is_none());
        assert!(matches!(f.engine.start(), Err(EngineError::Stopped)));

        // stop 後の alert は無視される
        f.hub.publish(SYSTEM_ALERT, json!({}));
        assert_eq!(f.engine.queue().len(), 0);
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let f = fixture(vec![], None);
        assert!(matches!(f.engine.start(), Err(EngineError::NoRuntime)));
    }
}
