//! SchedulerLoop - タスク実行ループ
//!
//! # フロー
//! 1. dequeue で最優先タスクを取得
//! 2. execute（必要なら self-healing → 再試行）
//! 3. 結果から後続タスクを derive して enqueue
//! 4. reprioritize
//!
//! engine は Weak で保持する。engine が drop されるとループも終わる。

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::engine::AutonomousTaskEngine;

pub(crate) async fn scheduler_loop(
    engine: Weak<AutonomousTaskEngine>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some(notify) = engine.upgrade().map(|e| e.queue().notified()) else {
        return;
    };
    info!(poll_interval_ms = poll_interval.as_millis() as u64, "scheduler loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let processed = {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.run_once().await.is_some()
        };
        if processed {
            continue;
        }

        // 空のときだけ待つ: enqueue 通知 / poll 間隔 / shutdown のどれか
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = notify.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    debug!("scheduler loop exited");
}
