//! Scoring - 学習済み回復パスの順位付け
//!
//! 乱数ではなく決定的なスコアを使う。`ScoringStrategy` で差し替え可能。

use serde::Serialize;

use crate::memory::RecoveryPath;

/// Scores a recovery path. Higher is better. Must be deterministic.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, path: &RecoveryPath) -> f64;
}

/// Success rate discounted by how little evidence backs it, with a mild
/// penalty for slow recoveries.
///
/// `score = success_rate * n / (n + prior) / (1 + avg_ms / slow_ms)`
#[derive(Debug, Clone)]
pub struct HistoricalScoring {
    pub prior: f64,
    pub slow_ms: f64,
}

impl Default for HistoricalScoring {
    fn default() -> Self {
        Self {
            prior: 1.0,
            slow_ms: 60_000.0,
        }
    }
}

impl ScoringStrategy for HistoricalScoring {
    fn name(&self) -> &str {
        "historical"
    }

    fn score(&self, path: &RecoveryPath) -> f64 {
        let n = path.occurrences as f64;
        let evidence = n / (n + self.prior);
        let speed = 1.0 / (1.0 + path.average_recovery_time_ms.max(0.0) / self.slow_ms);
        path.success_rate * evidence * speed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRecommendation {
    pub action: String,
    pub score: f64,
    pub success_rate: f64,
    pub occurrences: usize,
    pub scored_by: String,
}

/// Best path by `scoring` among those whose success rate exceeds
/// `min_success_rate`.
pub fn rank_recovery_paths(
    paths: &[RecoveryPath],
    scoring: &dyn ScoringStrategy,
    min_success_rate: f64,
) -> Option<RecoveryRecommendation> {
    paths
        .iter()
        .filter(|p| p.success_rate > min_success_rate)
        .map(|p| (p, scoring.score(p)))
        .max_by(|(a, sa), (b, sb)| {
            sa.total_cmp(sb)
                // 同点なら名前の若い方
                .then_with(|| b.action.cmp(&a.action))
        })
        .map(|(p, score)| RecoveryRecommendation {
            action: p.action.clone(),
            score,
            success_rate: p.success_rate,
            occurrences: p.occurrences,
            scored_by: scoring.name().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn path(action: &str, success_rate: f64, occurrences: usize, ms: f64) -> RecoveryPath {
        RecoveryPath {
            action: action.into(),
            success_rate,
            average_recovery_time_ms: ms,
            occurrences,
        }
    }

    #[rstest]
    #[case(path("a", 1.0, 1, 0.0), 0.5)]
    #[case(path("a", 1.0, 3, 0.0), 0.75)]
    #[case(path("a", 0.5, 1, 0.0), 0.25)]
    #[case(path("a", 1.0, 1, 60_000.0), 0.25)]
    fn historical_score(#[case] p: RecoveryPath, #[case] expected: f64) {
        let s = HistoricalScoring::default().score(&p);
        assert!((s - expected).abs() < 1e-9, "{s} != {expected}");
    }

    #[test]
    fn well_evidenced_path_beats_lucky_one() {
        let paths = vec![
            path("reconnect", 1.0, 1, 100.0),
            path("fallback:replica", 0.9, 20, 100.0),
        ];
        let best = rank_recovery_paths(&paths, &HistoricalScoring::default(), 0.7).unwrap();
        assert_eq!(best.action, "fallback:replica");
        assert_eq!(best.scored_by, "historical");
    }

    #[test]
    fn paths_at_or_below_threshold_are_not_recommended() {
        let paths = vec![path("reconnect", 0.7, 50, 0.0), path("restart", 0.2, 5, 0.0)];
        assert!(rank_recovery_paths(&paths, &HistoricalScoring::default(), 0.7).is_none());
    }

    #[test]
    fn ties_prefer_lexicographically_first_action() {
        let paths = vec![path("b", 1.0, 2, 0.0), path("a", 1.0, 2, 0.0)];
        let best = rank_recovery_paths(&paths, &HistoricalScoring::default(), 0.7).unwrap();
        assert_eq!(best.action, "a");
    }
}
