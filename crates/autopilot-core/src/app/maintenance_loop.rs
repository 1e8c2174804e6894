//! MaintenanceLoop - 定期的なメモリ最適化
//!
//! interval ごとに `memory_optimization` タスクを 1 件 enqueue する。
//! 最初の tick は起動から 1 interval 後。

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::engine::AutonomousTaskEngine;
use crate::domain::{Task, TaskType};

pub(crate) fn maintenance_task() -> Task {
    Task::new(TaskType::MEMORY_OPTIMIZATION).maintenance().simple()
}

pub(crate) async fn maintenance_loop(
    engine: Weak<AutonomousTaskEngine>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.enqueue(maintenance_task()) {
                    warn!(error = %e, "maintenance task not enqueued");
                    break;
                }
                debug!("memory optimization scheduled");
            }
        }
    }

    debug!("maintenance loop exited");
}
