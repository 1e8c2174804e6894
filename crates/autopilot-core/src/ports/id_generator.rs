//! IdGenerator port - ID 生成の抽象化
//!
//! `UlidGenerator` は ULID の時刻部分を `Clock` から取る。`FixedClock` なら
//! timestamp は同じでもランダム部分で ID は異なる。

use ulid::Ulid;

use crate::domain::ids::{ExecutionId, FailureId, Id, IdMarker, ObservationId, QueryId, SuggestionId};
use crate::ports::Clock;

/// IdGenerator は各 ID ファミリーの ID を生成
pub trait IdGenerator: Send + Sync {
    fn generate_observation_id(&self) -> ObservationId;

    fn generate_suggestion_id(&self) -> SuggestionId;

    fn generate_execution_id(&self) -> ExecutionId;

    fn generate_query_id(&self) -> QueryId;

    fn generate_failure_id(&self) -> FailureId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Id::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_observation_id(&self) -> ObservationId {
        self.next()
    }

    fn generate_suggestion_id(&self) -> SuggestionId {
        self.next()
    }

    fn generate_execution_id(&self) -> ExecutionId {
        self.next()
    }

    fn generate_query_id(&self) -> QueryId {
        self.next()
    }

    fn generate_failure_id(&self) -> FailureId {
        self.next()
    }
}
