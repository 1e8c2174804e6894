//! PriorityTaskQueue - 優先度付きタスクキュー
//!
//! # 学習ポイント
//! - 優先度の降順で保持し、同じ優先度は enqueue 順（`seq` 昇順）
//! - 優先度が変わるのは `reprioritize` だけ。再計算とソートはロックの外で行う
//! - `Notify` で空キューの待機を起こす

use std::collections::{HashSet, VecDeque};
use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::Task;
use crate::observability::QueueStats;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task: Task,
    pub priority: f64,
    pub seq: u64,
}

fn entry_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| a.seq.cmp(&b.seq))
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
    closed: bool,
    stats: QueueStats,
}

impl QueueState {
    fn insert_sorted(&mut self, entry: QueueEntry) {
        let idx = self
            .entries
            .partition_point(|e| entry_order(e, &entry) == Ordering::Less);
        self.entries.insert(idx, entry);
    }

    fn push(&mut self, task: Task, priority: f64) -> bool {
        if self.closed {
            self.stats.rejected_after_close += 1;
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert_sorted(QueueEntry {
            task,
            priority,
            seq,
        });
        self.stats.enqueued += 1;
        true
    }
}

/// PriorityTaskQueue はスレッドセーフな優先度キュー（producer 複数・consumer 1 つ）
pub struct PriorityTaskQueue {
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// close 後は false
    pub fn enqueue(&self, task: Task, priority: f64) -> bool {
        let accepted = self.state.lock().push(task, priority);
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// 各タスクを base score で enqueue し、受け付けた件数を返す
    pub fn enqueue_all(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        let mut accepted = 0;
        {
            let mut state = self.state.lock();
            for task in tasks {
                let priority = task.base_score;
                if state.push(task, priority) {
                    accepted += 1;
                }
            }
        }
        if accepted > 0 {
            self.notify.notify_one();
        }
        accepted
    }

    /// 最優先のエントリ（空または close 後は `None`）
    pub fn dequeue(&self) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let entry = state.entries.pop_front()?;
        state.stats.dequeued += 1;
        Some(entry)
    }

    /// `priority_of` で全優先度を再計算して並べ直す
    ///
    /// # 実装
    /// 1. ロック中にエントリをコピー
    /// 2. ロックの外で再計算・ソート
    /// 3. ロック中に差し戻す（間に dequeue されたものは除き、間に enqueue された
    ///    ものはその優先度でマージ）
    pub fn reprioritize<F>(&self, priority_of: F)
    where
        F: Fn(&Task) -> f64,
    {
        let (copied, watermark) = {
            let state = self.state.lock();
            if state.closed || state.entries.is_empty() {
                return;
            }
            (state.entries.iter().cloned().collect::<Vec<_>>(), state.next_seq)
        };

        let mut recomputed: Vec<QueueEntry> = copied
            .into_iter()
            .map(|mut entry| {
                entry.priority = priority_of(&entry.task);
                entry
            })
            .collect();
        recomputed.sort_by(entry_order);

        let mut state = self.state.lock();
        let mut present = HashSet::with_capacity(state.entries.len());
        let mut arrived = Vec::new();
        for entry in state.entries.drain(..) {
            if entry.seq >= watermark {
                arrived.push(entry);
            } else {
                present.insert(entry.seq);
            }
        }

        state.entries = recomputed
            .into_iter()
            .filter(|e| present.contains(&e.seq))
            .collect();
        for entry in arrived {
            state.insert_sorted(entry);
        }
        state.stats.reprioritizations += 1;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// 現在のエントリ（dequeue 順）
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    /// 受け付けと払い出しを止める（冪等）
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            depth: state.entries.len(),
            ..state.stats.clone()
        }
    }

    /// 次の enqueue または close で解決する
    pub(crate) fn notified(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> Task {
        Task::new(name)
    }

    fn drain(queue: &PriorityTaskQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.task.task_type.to_string())
            .collect()
    }

    #[test]
    fn dequeue_returns_highest_priority_first() {
        let q = PriorityTaskQueue::new();
        q.enqueue(task("low"), 10.0);
        q.enqueue(task("high"), 90.0);
        q.enqueue(task("mid"), 50.0);

        assert_eq!(drain(&q), vec!["high", "mid", "low"]);
    }

    #[test]
    fn equal_priority_keeps_enqueue_order() {
        let q = PriorityTaskQueue::new();
        for name in ["a", "b", "c", "d"] {
            q.enqueue(task(name), 50.0);
        }
        q.enqueue(task("first"), 60.0);

        assert_eq!(drain(&q), vec!["first", "a", "b", "c", "d"]);
    }

    #[test]
    fn enqueue_all_uses_base_scores() {
        let q = PriorityTaskQueue::new();
        let accepted = q.enqueue_all(vec![
            task("a").with_base_score(1.0),
            task("b").with_base_score(3.0),
            task("c").with_base_score(2.0),
        ]);
        assert_eq!(accepted, 3);
        assert_eq!(drain(&q), vec!["b", "c", "a"]);
    }

    #[test]
    fn reprioritize_resorts_and_is_idempotent() {
        let q = PriorityTaskQueue::new();
        q.enqueue(task("complex").with_base_score(100.0), 100.0);
        q.enqueue(task("simple").with_base_score(60.0).simple(), 60.0);

        let boost_simple = |t: &Task| if t.is_simple { t.base_score + 50.0 } else { t.base_score - 30.0 };
        q.reprioritize(boost_simple);
        let first: Vec<_> = q.snapshot().into_iter().map(|e| (e.seq, e.priority)).collect();
        q.reprioritize(boost_simple);
        let second: Vec<_> = q.snapshot().into_iter().map(|e| (e.seq, e.priority)).collect();

        assert_eq!(first, second);
        assert_eq!(drain(&q), vec!["simple", "complex"]);
    }

    #[test]
    fn reprioritize_keeps_stable_ties() {
        let q = PriorityTaskQueue::new();
        for name in ["a", "b", "c"] {
            q.enqueue(task(name), 0.0);
        }
        q.reprioritize(|_| 5.0);
        assert_eq!(drain(&q), vec!["a", "b", "c"]);
    }

    #[test]
    fn closed_queue_rejects_and_hands_out_nothing() {
        let q = PriorityTaskQueue::new();
        q.enqueue(task("a"), 1.0);
        q.close();
        q.close();

        assert!(q.dequeue().is_none());
        assert!(!q.enqueue(task("b"), 1.0));
        assert_eq!(q.stats().rejected_after_close, 1);
    }

    #[test]
    fn concurrent_enqueues_during_reprioritize_are_not_lost() {
        let q = Arc::new(PriorityTaskQueue::new());
        for i in 0..200 {
            q.enqueue(task(&format!("seed-{i}")), i as f64);
        }

        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..200 {
                    q.enqueue(task(&format!("late-{i}")), 1000.0);
                }
            })
        };
        for _ in 0..20 {
            q.reprioritize(|t| t.base_score);
        }
        producer.join().unwrap();

        let entries = q.snapshot();
        assert_eq!(entries.len(), 400);
        for pair in entries.windows(2) {
            assert!(entry_order(&pair[0], &pair[1]) != Ordering::Greater);
        }
        // 同じ優先度の後着は enqueue 順のまま
        let late: Vec<u64> = entries
            .iter()
            .filter(|e| e.priority == 1000.0)
            .map(|e| e.seq)
            .collect();
        assert!(late.windows(2).all(|w| w[0] < w[1]));
    }
}
