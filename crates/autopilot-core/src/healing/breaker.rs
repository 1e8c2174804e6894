//! Breaker - エラーコードごとの circuit breaker
//!
//! # 状態遷移
//! - Closed: `failure_threshold` 回連続で失敗するまで
//! - Open: `reset_window` の間は試行しない
//! - HalfOpen: window 経過後に 1 回だけ試行。成功で Closed、失敗で再び Open
//!
//! 試行枠は `BreakerPermit` で持つ。結果を記録せずに drop されたら枠を返す。

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probing: bool,
}

#[derive(Debug)]
pub(crate) struct BreakerBoard {
    breakers: HashMap<String, Breaker>,
    failure_threshold: u32,
    reset_window: Duration,
}

impl BreakerBoard {
    pub(crate) fn new(failure_threshold: u32, reset_window: Duration) -> Self {
        Self {
            breakers: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            reset_window,
        }
    }

    /// `code` の試行を今してよいか。期限切れの Open は HalfOpen に移す
    pub(crate) fn try_acquire(&mut self, code: &str, now: DateTime<Utc>) -> bool {
        let Some(b) = self.breakers.get_mut(code) else {
            return true;
        };
        match b.opened_at {
            None => true,
            Some(_) if b.probing => false,
            Some(at) if now - at >= self.reset_window => {
                b.probing = true;
                true
            }
            Some(_) => false,
        }
    }

    pub(crate) fn record(&mut self, code: &str, healed: bool, now: DateTime<Utc>) {
        let b = self.breakers.entry(code.to_string()).or_default();
        if healed {
            *b = Breaker::default();
            return;
        }
        b.consecutive_failures += 1;
        if b.probing || b.consecutive_failures >= self.failure_threshold {
            b.opened_at = Some(now);
            b.probing = false;
        }
    }

    /// 結果を記録せずに half-open の枠を返す
    pub(crate) fn release(&mut self, code: &str) {
        if let Some(b) = self.breakers.get_mut(code) {
            b.probing = false;
        }
    }

    pub(crate) fn state(&self, code: &str, now: DateTime<Utc>) -> BreakerState {
        match self.breakers.get(code) {
            Some(Breaker {
                opened_at: Some(_),
                probing: true,
                ..
            }) => BreakerState::HalfOpen,
            Some(Breaker {
                opened_at: Some(at),
                ..
            }) if now - *at < self.reset_window => BreakerState::Open,
            Some(Breaker {
                opened_at: Some(_),
                ..
            }) => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// `try_acquire` で得た実行枠。`finish` せずに drop されたら枠を返す。
pub(crate) struct BreakerPermit<'a> {
    board: &'a Mutex<BreakerBoard>,
    code: String,
    armed: bool,
}

impl<'a> BreakerPermit<'a> {
    pub(crate) fn acquire(board: &'a Mutex<BreakerBoard>, code: &str, now: DateTime<Utc>) -> Option<Self> {
        board.lock().try_acquire(code, now).then(|| Self {
            board,
            code: code.to_string(),
            armed: true,
        })
    }

    pub(crate) fn finish(mut self, healed: bool, now: DateTime<Utc>) {
        self.armed = false;
        self.board.lock().record(&self.code, healed, now);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.board.lock().release(&self.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut board = BreakerBoard::new(3, Duration::seconds(60));
        for _ in 0..2 {
            assert!(board.try_acquire("E", t0()));
            board.record("E", false, t0());
        }
        assert_eq!(board.state("E", t0()), BreakerState::Closed);
        board.record("E", false, t0());
        assert_eq!(board.state("E", t0()), BreakerState::Open);
        assert!(!board.try_acquire("E", t0() + Duration::seconds(59)));
        // 他のコードとは独立
        assert!(board.try_acquire("F", t0()));
    }

    #[test]
    fn success_resets_the_count() {
        let mut board = BreakerBoard::new(2, Duration::seconds(60));
        board.record("E", false, t0());
        board.record("E", true, t0());
        board.record("E", false, t0());
        assert_eq!(board.state("E", t0()), BreakerState::Closed);
    }

    #[test]
    fn half_open_allows_one_attempt() {
        let mut board = BreakerBoard::new(1, Duration::seconds(60));
        board.record("E", false, t0());
        let later = t0() + Duration::seconds(60);

        assert!(board.try_acquire("E", later));
        assert_eq!(board.state("E", later), BreakerState::HalfOpen);
        assert!(!board.try_acquire("E", later));

        // half-open で失敗したら丸 1 window 開き直す
        board.record("E", false, later);
        assert!(!board.try_acquire("E", later + Duration::seconds(30)));

        let much_later = later + Duration::seconds(60);
        assert!(board.try_acquire("E", much_later));
        board.record("E", true, much_later);
        assert_eq!(board.state("E", much_later), BreakerState::Closed);
    }

    #[test]
    fn dropped_permit_frees_the_half_open_slot() {
        let board = Mutex::new(BreakerBoard::new(1, Duration::seconds(60)));
        board.lock().record("E", false, t0());
        let later = t0() + Duration::seconds(60);

        let permit = BreakerPermit::acquire(&board, "E", later).unwrap();
        assert!(BreakerPermit::acquire(&board, "E", later).is_none());
        drop(permit);

        assert_eq!(board.lock().state("E", later), BreakerState::HalfOpen);
        let permit = BreakerPermit::acquire(&board, "E", later).unwrap();
        permit.finish(true, later);
        assert_eq!(board.lock().state("E", later), BreakerState::Closed);
    }

    #[test]
    fn finished_permit_is_not_released_again() {
        let board = Mutex::new(BreakerBoard::new(1, Duration::seconds(60)));
        board.lock().record("E", false, t0());
        let later = t0() + Duration::seconds(60);

        BreakerPermit::acquire(&board, "E", later).unwrap().finish(false, later);
        assert_eq!(board.lock().state("E", later), BreakerState::Open);
    }
}
