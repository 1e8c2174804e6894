//! StressProbe port - システムのストレス水準

use parking_lot::RwLock;

use crate::domain::StressLevel;

/// StressProbe は再優先度付けに使うストレス水準を報告
pub trait StressProbe: Send + Sync {
    fn stress_level(&self) -> StressLevel;
}

/// ManualStressProbe は手で水準を設定する probe（運用者・テスト・CLI デモ用）
#[derive(Debug, Default)]
pub struct ManualStressProbe {
    level: RwLock<StressLevel>,
}

impl ManualStressProbe {
    pub fn new(level: StressLevel) -> Self {
        Self {
            level: RwLock::new(level),
        }
    }

    pub fn set(&self, level: StressLevel) {
        *self.level.write() = level;
    }
}

impl StressProbe for ManualStressProbe {
    fn stress_level(&self) -> StressLevel {
        *self.level.read()
    }
}
