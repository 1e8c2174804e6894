//! Config - 実行時設定
//!
//! デフォルトのままで動く。環境変数は個別のフィールドを上書きする。
//! パースできない値は warn を出して無視する。
//!
//! # 検証
//! - `validate()` で下限・上限・[0, 1] 範囲をチェック
//! - 時間系の値は上限つき（Duration 変換で panic しない）

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::EngineConfig;
use crate::domain::ConfigError;
use crate::healing::HealingConfig;
use crate::hub::DeliveryMode;
use crate::memory::MemoryCapacities;
use crate::recorder::RecorderConfig;

pub const ENV_DURABLE_BUS: &str = "AUTOPILOT_DURABLE_BUS";
pub const ENV_DURABLE_BUS_URL: &str = "AUTOPILOT_DURABLE_BUS_URL";
pub const ENV_CHANNEL_PREFIX: &str = "AUTOPILOT_CHANNEL_PREFIX";
pub const ENV_MIN_OBSERVATIONS: &str = "MIN_OBSERVATIONS_FOR_SUGGESTION";
pub const ENV_MIN_CONFIDENCE: &str = "MIN_CONFIDENCE_FOR_SUGGESTION";
pub const ENV_OBSERVATION_CAPACITY: &str = "AUTOPILOT_OBSERVATION_CAPACITY";
pub const ENV_PATTERN_CAPACITY: &str = "AUTOPILOT_PATTERN_CAPACITY";
pub const ENV_FAILURE_CAPACITY: &str = "AUTOPILOT_FAILURE_CAPACITY";
pub const ENV_HEALTH_CAPACITY: &str = "AUTOPILOT_HEALTH_CAPACITY";
pub const ENV_METRICS_HISTORY_CAPACITY: &str = "AUTOPILOT_METRICS_HISTORY_CAPACITY";
pub const ENV_HEALING_MAX_DEPTH: &str = "AUTOPILOT_HEALING_MAX_DEPTH";
pub const ENV_HEALING_FAILURE_THRESHOLD: &str = "AUTOPILOT_HEALING_FAILURE_THRESHOLD";
pub const ENV_HEALING_RESET_WINDOW_SECS: &str = "AUTOPILOT_HEALING_RESET_WINDOW_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "AUTOPILOT_POLL_INTERVAL_MS";
pub const ENV_MAINTENANCE_INTERVAL_SECS: &str = "AUTOPILOT_MAINTENANCE_INTERVAL_SECS";
pub const ENV_MEMORY_RETENTION_DAYS: &str = "AUTOPILOT_MEMORY_RETENTION_DAYS";
pub const ENV_MAX_FOLLOW_UP_DEPTH: &str = "AUTOPILOT_MAX_FOLLOW_UP_DEPTH";

// 時間系の上限: chrono / tokio の Duration 演算が溢れない範囲
pub const MAX_HEALING_RESET_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;
pub const MAX_POLL_INTERVAL_MS: u64 = 60 * 60 * 1_000;
pub const MAX_MAINTENANCE_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;
pub const MAX_MEMORY_RETENTION_DAYS: u64 = 3_650;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// durable 配送を要求する。broker に届かなければ hub は in-process に縮退
    pub durable_bus: bool,
    pub durable_bus_url: Option<String>,
    pub channel_prefix: String,

    pub min_observations: u64,
    pub min_confidence: f64,
    pub observation_capacity: usize,

    pub pattern_capacity: usize,
    pub failure_capacity: usize,
    pub health_capacity: usize,
    pub metrics_history_capacity: usize,

    pub healing_max_depth: u32,
    pub healing_failure_threshold: u32,
    pub healing_reset_window_secs: u64,

    pub poll_interval_ms: u64,
    pub maintenance_interval_secs: u64,
    pub memory_retention_days: u64,
    pub max_follow_up_depth: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            durable_bus: false,
            durable_bus_url: None,
            channel_prefix: "autopilot".to_string(),
            min_observations: 3,
            min_confidence: 0.7,
            observation_capacity: 10_000,
            pattern_capacity: 10_000,
            failure_capacity: 10_000,
            health_capacity: 1_000,
            metrics_history_capacity: 1_000,
            healing_max_depth: 1,
            healing_failure_threshold: 5,
            healing_reset_window_secs: 60,
            poll_interval_ms: 1_000,
            maintenance_interval_secs: 86_400,
            memory_retention_days: 30,
            max_follow_up_depth: 3,
        }
    }
}

impl CoreConfig {
    /// デフォルト + プロセス環境変数による上書き
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// デフォルト + `lookup` による上書き（テスト容易性のため）
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.apply_overrides(lookup);
        config
    }

    /// 環境変数による上書きをその場で適用
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup(ENV_DURABLE_BUS) {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: {ENV_DURABLE_BUS}=true");
                    self.durable_bus = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: {ENV_DURABLE_BUS}=false");
                    self.durable_bus = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for {ENV_DURABLE_BUS}: '{val}'. Expected true/false. Ignoring."
                    );
                }
            }
        }

        if let Some(url) = lookup(ENV_DURABLE_BUS_URL).filter(|u| !u.trim().is_empty()) {
            tracing::info!("Environment override: {ENV_DURABLE_BUS_URL} set");
            self.durable_bus_url = Some(url);
        }
        if let Some(prefix) = lookup(ENV_CHANNEL_PREFIX).filter(|p| !p.trim().is_empty()) {
            tracing::info!("Environment override: {ENV_CHANNEL_PREFIX}={prefix}");
            self.channel_prefix = prefix;
        }

        override_parsed(&lookup, ENV_MIN_OBSERVATIONS, &mut self.min_observations);
        override_parsed(&lookup, ENV_MIN_CONFIDENCE, &mut self.min_confidence);
        override_parsed(&lookup, ENV_OBSERVATION_CAPACITY, &mut self.observation_capacity);
        override_parsed(&lookup, ENV_PATTERN_CAPACITY, &mut self.pattern_capacity);
        override_parsed(&lookup, ENV_FAILURE_CAPACITY, &mut self.failure_capacity);
        override_parsed(&lookup, ENV_HEALTH_CAPACITY, &mut self.health_capacity);
        override_parsed(&lookup, ENV_METRICS_HISTORY_CAPACITY, &mut self.metrics_history_capacity);
        override_parsed(&lookup, ENV_HEALING_MAX_DEPTH, &mut self.healing_max_depth);
        override_parsed(&lookup, ENV_HEALING_FAILURE_THRESHOLD, &mut self.healing_failure_threshold);
        override_parsed(&lookup, ENV_HEALING_RESET_WINDOW_SECS, &mut self.healing_reset_window_secs);
        override_parsed(&lookup, ENV_POLL_INTERVAL_MS, &mut self.poll_interval_ms);
        override_parsed(&lookup, ENV_MAINTENANCE_INTERVAL_SECS, &mut self.maintenance_interval_secs);
        override_parsed(&lookup, ENV_MEMORY_RETENTION_DAYS, &mut self.memory_retention_days);
        override_parsed(&lookup, ENV_MAX_FOLLOW_UP_DEPTH, &mut self.max_follow_up_depth);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("min_observations", 1, self.min_observations)?;
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::OutOfRange {
                name: "min_confidence",
                value: self.min_confidence,
            });
        }
        at_least("observation_capacity", 1, self.observation_capacity as u64)?;
        at_least("pattern_capacity", 1, self.pattern_capacity as u64)?;
        at_least("failure_capacity", 1, self.failure_capacity as u64)?;
        at_least("health_capacity", 1, self.health_capacity as u64)?;
        at_least("metrics_history_capacity", 1, self.metrics_history_capacity as u64)?;
        at_least("healing_max_depth", 1, u64::from(self.healing_max_depth))?;
        at_least("healing_failure_threshold", 1, u64::from(self.healing_failure_threshold))?;
        at_most("healing_reset_window_secs", MAX_HEALING_RESET_WINDOW_SECS, self.healing_reset_window_secs)?;
        at_least("poll_interval_ms", 1, self.poll_interval_ms)?;
        at_most("poll_interval_ms", MAX_POLL_INTERVAL_MS, self.poll_interval_ms)?;
        at_least("maintenance_interval_secs", 1, self.maintenance_interval_secs)?;
        at_most(
            "maintenance_interval_secs",
            MAX_MAINTENANCE_INTERVAL_SECS,
            self.maintenance_interval_secs,
        )?;
        at_most("memory_retention_days", MAX_MEMORY_RETENTION_DAYS, self.memory_retention_days)?;
        Ok(())
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.durable_bus {
            DeliveryMode::Durable
        } else {
            DeliveryMode::InProcess
        }
    }

    pub fn memory_capacities(&self) -> MemoryCapacities {
        MemoryCapacities {
            patterns: self.pattern_capacity,
            failures: self.failure_capacity,
            health_per_source: self.health_capacity,
            metrics_history: self.metrics_history_capacity,
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            min_observations: self.min_observations,
            min_confidence: self.min_confidence,
            history_capacity: self.observation_capacity,
        }
    }

    pub fn healing_config(&self) -> HealingConfig {
        HealingConfig {
            max_depth: self.healing_max_depth,
            failure_threshold: self.healing_failure_threshold,
            reset_window: seconds_capped(self.healing_reset_window_secs, MAX_HEALING_RESET_WINDOW_SECS),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.min(MAX_POLL_INTERVAL_MS))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.min(MAX_MAINTENANCE_INTERVAL_SECS))
    }

    pub fn memory_retention(&self) -> chrono::Duration {
        seconds_capped(
            self.memory_retention_days.saturating_mul(SECS_PER_DAY),
            MAX_MEMORY_RETENTION_DAYS * SECS_PER_DAY,
        )
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: self.poll_interval(),
            maintenance_interval: self.maintenance_interval(),
            memory_retention: self.memory_retention(),
            max_follow_up_depth: self.max_follow_up_depth,
            ..EngineConfig::default()
        }
    }
}

fn override_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr + Display,
{
    let Some(val) = lookup(key) else {
        return;
    };
    match val.trim().parse::<T>() {
        Ok(parsed) => {
            tracing::info!("Environment override: {key}={parsed}");
            *slot = parsed;
        }
        Err(_) => {
            tracing::warn!("Invalid value for {key}: '{val}'. Keeping {slot}. Ignoring.");
        }
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// `validate` 済みなら cap には届かない。未検証の値でも panic しない。
fn seconds_capped(secs: u64, cap: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(cap)).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
}

fn at_most(name: &'static str, max: u64, value: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::TooLarge { name, max, value });
    }
    Ok(())
}

fn at_least(name: &'static str, min: u64, value: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { name, min, value });
    }
    Ok(())
}
