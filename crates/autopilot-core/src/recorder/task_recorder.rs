//! TaskRecorder - 観測・学習・提案と、承認による自動化のゲート
//!
//! ここでは実アクションを実行しない。承認された suggestion は、それが出された
//! シグネチャに限って `authorize` が `ExecutionRecord` を払い出せるようにするだけ。
//!
//! # フロー
//! 1. `task.executed` を観測してシグネチャごとのパターンを更新
//! 2. 回数と成功率がしきい値を超えたら pending の suggestion を作成
//! 3. 人が approve / reject
//! 4. approve 済みの suggestion だけが実行要求を通す

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use super::model::{
    AutomationSuggestion, ExecutionDecision, ExecutionRecord, ExecutionRequest, ObservationInput,
    TaskObservation, TaskPattern,
};
use crate::domain::events::{
    EXECUTION_STARTED, SUGGESTION_APPROVED, SUGGESTION_CREATED, SUGGESTION_REJECTED,
    TASK_EXECUTED,
};
use crate::domain::signature::task_signature;
use crate::domain::{
    HandlerError, HubError, ObservationId, RecorderError, SuggestionId, SuggestionStatus,
    TaskExecutedEvent,
};
use crate::hub::{EventHub, SubscriptionId, handler_fn};
use crate::memory::RingBuffer;
use crate::observability::{RecorderStats, StoreStats};
use crate::ports::{Clock, IdGenerator};

const DEFAULT_USER: &str = "system";
const DEFAULT_ORG: &str = "default";

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub min_observations: u64,
    pub min_confidence: f64,
    /// 観測履歴・実行履歴の容量
    pub history_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            min_observations: 3,
            min_confidence: 0.7,
            history_capacity: 10_000,
        }
    }
}

/// Observed は `observe_task` の結果
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub observation_id: ObservationId,
    pub signature: String,
    /// この観測で新しい suggestion が出たら `Some`
    pub suggestion: Option<SuggestionId>,
}

impl From<TaskExecutedEvent> for ObservationInput {
    fn from(ev: TaskExecutedEvent) -> Self {
        let mut context = ev.context;
        if let Some(source) = ev.source {
            context
                .entry("source")
                .or_insert(serde_json::Value::String(source));
        }
        Self {
            task_type: ev.task_type,
            params: ev.params,
            user_id: ev.user_id,
            org_id: ev.org_id,
            duration_ms: Some(ev.duration_ms),
            success: ev.success,
            result: ev.error.map(|e| json!({ "error": e })),
            context,
        }
    }
}

pub struct TaskRecorder {
    config: RecorderConfig,
    patterns: DashMap<String, TaskPattern>,
    suggestions: DashMap<SuggestionId, AutomationSuggestion>,
    observations: RwLock<RingBuffer<TaskObservation>>,
    executions: RwLock<RingBuffer<ExecutionRecord>>,
    rejected_requests: AtomicU64,
    hub: Option<Arc<EventHub>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskRecorder {
    pub fn new(config: RecorderConfig, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        let capacity = config.history_capacity;
        Self {
            config,
            patterns: DashMap::new(),
            suggestions: DashMap::new(),
            observations: RwLock::new(RingBuffer::new(capacity)),
            executions: RwLock::new(RingBuffer::new(capacity)),
            rejected_requests: AtomicU64::new(0),
            hub: None,
            clock,
            ids,
        }
    }

    /// recorder のイベントを `hub` に publish する
    pub fn with_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// `hub` の `task.executed` を観測する
    pub fn attach(self: &Arc<Self>, hub: &EventHub) -> Result<SubscriptionId, HubError> {
        let recorder = Arc::downgrade(self);
        hub.subscribe(
            TASK_EXECUTED,
            handler_fn(move |event| {
                let Some(recorder) = recorder.upgrade() else {
                    return Ok(());
                };
                let executed: TaskExecutedEvent = serde_json::from_value(event.payload.clone())
                    .map_err(|e| HandlerError::new(format!("bad task.executed payload: {e}")))?;
                recorder.observe_task(executed.into());
                Ok(())
            }),
        )
    }

    pub fn observe_task(&self, input: ObservationInput) -> Observed {
        let now = self.clock.now();
        let signature = task_signature(&input.task_type, &input.params);
        let observation = TaskObservation {
            id: self.ids.generate_observation_id(),
            task_signature: signature.clone(),
            task_type: input.task_type,
            user_id: input.user_id.unwrap_or_else(|| DEFAULT_USER.to_string()),
            org_id: input.org_id.unwrap_or_else(|| DEFAULT_ORG.to_string()),
            timestamp: now,
            duration_ms: input.duration_ms,
            success: input.success,
            result: input.result,
            context: input.context,
        };
        let observation_id = observation.id;

        // entry guard で同一 signature の更新を直列化する
        let created = {
            let mut pattern = self
                .patterns
                .entry(signature.clone())
                .or_insert_with(|| TaskPattern {
                    task_signature: signature.clone(),
                    task_type: observation.task_type.clone(),
                    frequency: 0,
                    successes: 0,
                    success_rate: 0.0,
                    average_duration_ms: None,
                    timed_observations: 0,
                    first_seen: now,
                    last_seen: now,
                    contexts: Default::default(),
                    last_suggestion: None,
                });
            apply_observation(&mut pattern, &observation);
            self.maybe_suggest(&mut pattern, now)
                .map(|s| (s, pattern.clone()))
        };

        debug!(
            signature = %signature,
            task_type = %observation.task_type,
            success = observation.success,
            "task observed"
        );
        self.observations.write().push(observation);

        let suggestion = created.map(|(suggestion, pattern)| {
            info!(
                suggestion = %suggestion.id,
                signature = %signature,
                confidence = suggestion.confidence,
                observed = suggestion.observed_count,
                "automation suggested"
            );
            let id = suggestion.id;
            self.emit(SUGGESTION_CREATED, json!({ "suggestion": suggestion, "pattern": pattern }));
            id
        });

        Observed {
            observation_id,
            signature,
            suggestion,
        }
    }

    /// パターンが条件を満たせば suggestion を出す（パターンの entry ロック中に呼ぶ）
    ///
    /// 新しい suggestion を止めるのは `Pending` だけ。Approved / Rejected は
    /// 解決済みなので同じシグネチャで再度出せる。Approved の方は引き続き実行を許可する。
    fn maybe_suggest(&self, pattern: &mut TaskPattern, now: DateTime<Utc>) -> Option<AutomationSuggestion> {
        if pattern.frequency < self.config.min_observations
            || pattern.success_rate < self.config.min_confidence
        {
            return None;
        }

        if let Some(last) = pattern.last_suggestion {
            let pending = self
                .suggestions
                .get(&last)
                .is_some_and(|s| s.status == SuggestionStatus::Pending);
            if pending {
                return None;
            }
        }

        let suggestion =
            AutomationSuggestion::pending(self.ids.generate_suggestion_id(), pattern, now);
        pattern.last_suggestion = Some(suggestion.id);
        self.suggestions.insert(suggestion.id, suggestion.clone());
        Some(suggestion)
    }

    /// pending の suggestion（confidence の高い順）
    pub fn pending_suggestions(&self) -> Vec<AutomationSuggestion> {
        let mut pending: Vec<AutomationSuggestion> = self
            .suggestions
            .iter()
            .filter(|s| s.status == SuggestionStatus::Pending)
            .map(|s| s.value().clone())
            .collect();
        pending.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pending
    }

    pub fn suggestion(&self, id: SuggestionId) -> Option<AutomationSuggestion> {
        self.suggestions.get(&id).map(|s| s.value().clone())
    }

    pub fn approve_suggestion(
        &self,
        id: SuggestionId,
        approver: &str,
    ) -> Result<AutomationSuggestion, RecorderError> {
        let approved = self.review(id, SuggestionStatus::Approved, approver)?;
        info!(suggestion = %id, approver, "suggestion approved");
        self.emit(SUGGESTION_APPROVED, json!({ "suggestion": approved }));
        Ok(approved)
    }

    pub fn reject_suggestion(
        &self,
        id: SuggestionId,
        rejecter: &str,
    ) -> Result<AutomationSuggestion, RecorderError> {
        let rejected = self.review(id, SuggestionStatus::Rejected, rejecter)?;
        info!(suggestion = %id, rejecter, "suggestion rejected");
        self.emit(SUGGESTION_REJECTED, json!({ "suggestion": rejected }));
        Ok(rejected)
    }

    fn review(
        &self,
        id: SuggestionId,
        to: SuggestionStatus,
        reviewer: &str,
    ) -> Result<AutomationSuggestion, RecorderError> {
        let mut suggestion = self
            .suggestions
            .get_mut(&id)
            .ok_or(RecorderError::SuggestionNotFound(id))?;
        if !suggestion.status.can_transition_to(to) {
            return Err(RecorderError::InvalidTransition {
                id,
                from: suggestion.status,
                to,
            });
        }
        suggestion.status = to;
        suggestion.reviewed_by = Some(reviewer.to_string());
        suggestion.reviewed_at = Some(self.clock.now());
        Ok(suggestion.clone())
    }

    /// 要求を suggestion と照合し、実行を記録
    ///
    /// # 検証
    /// - suggestion が `Approved` であること
    /// - 要求の `(task_type, params)` のシグネチャが suggestion と一致すること
    pub fn authorize(&self, request: &ExecutionRequest) -> Result<ExecutionRecord, RecorderError> {
        let result = self.check(request);
        match &result {
            Ok(record) => {
                info!(
                    execution = %record.execution_id,
                    suggestion = %record.suggestion_id,
                    requested_by = %record.requested_by,
                    "execution authorized"
                );
                self.executions.write().push(record.clone());
                self.emit(EXECUTION_STARTED, json!({ "execution": record }));
            }
            Err(e) => {
                self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                warn!(
                    suggestion = %request.suggestion_id,
                    requested_by = %request.requested_by,
                    reason = %e,
                    "execution request rejected"
                );
            }
        }
        result
    }

    fn check(&self, request: &ExecutionRequest) -> Result<ExecutionRecord, RecorderError> {
        let id = request.suggestion_id;
        let suggestion = self
            .suggestion(id)
            .ok_or(RecorderError::SuggestionNotFound(id))?;

        if !suggestion.requires_approval() || suggestion.status != SuggestionStatus::Approved {
            return Err(RecorderError::NotApproved {
                id,
                status: suggestion.status,
            });
        }

        let actual = task_signature(&request.task_type, &request.params);
        if actual != suggestion.task_signature {
            return Err(RecorderError::SignatureMismatch {
                id,
                expected: suggestion.task_signature,
                actual,
            });
        }

        Ok(ExecutionRecord {
            execution_id: self.ids.generate_execution_id(),
            suggestion_id: id,
            task_signature: actual,
            task_type: request.task_type.clone(),
            params: request.params.clone(),
            requested_by: request.requested_by.clone(),
            approved_by: suggestion.reviewed_by.unwrap_or_default(),
            executed_at: self.clock.now(),
        })
    }

    /// `authorize` の `{approved, execution_id?}` 版
    pub fn request_task_execution(&self, request: &ExecutionRequest) -> ExecutionDecision {
        match self.authorize(request) {
            Ok(record) => ExecutionDecision::approved(record.execution_id),
            Err(e) => ExecutionDecision::rejected(e),
        }
    }

    pub fn pattern(&self, signature: &str) -> Option<TaskPattern> {
        self.patterns.get(signature).map(|p| p.value().clone())
    }

    /// 全パターン（頻度の高い順）
    pub fn patterns(&self) -> Vec<TaskPattern> {
        let mut all: Vec<TaskPattern> = self.patterns.iter().map(|p| p.value().clone()).collect();
        all.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.task_signature.cmp(&b.task_signature))
        });
        all
    }

    /// Most recent first.
    pub fn observations(&self, limit: usize) -> Vec<TaskObservation> {
        self.observations.read().iter_recent().take(limit).cloned().collect()
    }

    /// Oldest first.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.read().iter().cloned().collect()
    }

    pub fn stats(&self) -> RecorderStats {
        let (mut pending, mut approved, mut rejected) = (0, 0, 0);
        for s in self.suggestions.iter() {
            match s.status {
                SuggestionStatus::Pending => pending += 1,
                SuggestionStatus::Approved => approved += 1,
                SuggestionStatus::Rejected => rejected += 1,
            }
        }
        let observations = {
            let obs = self.observations.read();
            StoreStats {
                len: obs.len(),
                capacity: obs.capacity(),
                evicted: obs.evicted(),
            }
        };
        RecorderStats {
            observations,
            patterns: self.patterns.len(),
            pending_suggestions: pending,
            approved_suggestions: approved,
            rejected_suggestions: rejected,
            executions: self.executions.read().len(),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(hub) = &self.hub {
            hub.publish(event_type, payload);
        }
    }
}

fn apply_observation(pattern: &mut TaskPattern, observation: &TaskObservation) {
    pattern.frequency += 1;
    if observation.success {
        pattern.successes += 1;
    }
    pattern.success_rate = pattern.successes as f64 / pattern.frequency as f64;

    if let Some(ms) = observation.duration_ms {
        let n = pattern.timed_observations as f64;
        let avg = pattern.average_duration_ms.unwrap_or(0.0);
        pattern.average_duration_ms = Some((avg * n + ms as f64) / (n + 1.0));
        pattern.timed_observations += 1;
    }

    if observation.timestamp < pattern.first_seen {
        pattern.first_seen = observation.timestamp;
    }
    if observation.timestamp > pattern.last_seen {
        pattern.last_seen = observation.timestamp;
    }

    for (key, value) in &observation.context {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        *pattern.contexts.entry(format!("{key}:{rendered}")).or_default() += 1;
    }
}
