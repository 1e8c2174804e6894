//! PriorityPolicy - ライブシグナルからタスクの優先度を決める

use crate::domain::{StressLevel, Task};

/// PriorityPolicy はキュー内タスクの優先度を計算
///
/// `priority = base_score + stress_adjustment + health_adjustment`
#[derive(Debug, Clone)]
pub struct PriorityPolicy {
    /// 高ストレス時に単純なタスクへ加算
    pub stress_bonus_simple: f64,

    /// 高ストレス時に複雑なタスクから減算
    pub stress_penalty_complex: f64,

    /// 全体の health がこれを下回ると maintenance タスクを優遇
    pub low_health_threshold: f64,

    pub maintenance_bonus: f64,
}

impl PriorityPolicy {
    pub fn standard() -> Self {
        Self {
            stress_bonus_simple: 50.0,
            stress_penalty_complex: 30.0,
            low_health_threshold: 0.5,
            maintenance_bonus: 100.0,
        }
    }

    pub fn priority(&self, task: &Task, stress: StressLevel, global_health: f64) -> f64 {
        let mut priority = task.base_score;

        if stress == StressLevel::High {
            if task.is_simple {
                priority += self.stress_bonus_simple;
            } else {
                priority -= self.stress_penalty_complex;
            }
        }

        if global_health < self.low_health_threshold && task.is_maintenance_task {
            priority += self.maintenance_bonus;
        }

        priority
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, false, StressLevel::Low, 1.0, 50.0)]
    #[case(true, false, StressLevel::High, 1.0, 100.0)]
    #[case(false, false, StressLevel::High, 1.0, 20.0)]
    #[case(false, false, StressLevel::Medium, 1.0, 50.0)]
    #[case(false, true, StressLevel::Low, 0.4, 150.0)]
    #[case(false, true, StressLevel::Low, 0.5, 50.0)]
    #[case(false, true, StressLevel::High, 0.2, 120.0)]
    fn priority_adjustments(
        #[case] simple: bool,
        #[case] maintenance: bool,
        #[case] stress: StressLevel,
        #[case] health: f64,
        #[case] expected: f64,
    ) {
        let mut task = Task::new("t");
        task.is_simple = simple;
        task.is_maintenance_task = maintenance;

        let p = PriorityPolicy::standard().priority(&task, stress, health);
        assert_eq!(p, expected);
    }

    #[test]
    fn high_stress_flips_diagnostic_and_data_collection() {
        let policy = PriorityPolicy::standard();
        let diagnostic = Task::new("diagnostic").with_base_score(100.0);
        let collection = Task::new("data_collection").with_base_score(60.0).simple();

        let d = policy.priority(&diagnostic, StressLevel::High, 1.0);
        let c = policy.priority(&collection, StressLevel::High, 1.0);
        assert!(c > d);
    }
}
