use std::collections::HashMap;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static ENV_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid pattern"));

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub rules: RuleThresholds,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Used for packets that carry no vehicle identifier
    #[serde(default = "default_vehicle_id")]
    pub vehicle_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
            vehicle_id: default_vehicle_id(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub path: Option<String>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Replay the packet list from the start after the last packet
    #[serde(default)]
    pub cycle: bool,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_ms: 1000,
            cycle: false,
            history_len: 10,
        }
    }
}

/// Thresholds for the rule gate. Defaults are the calibrated fleet values.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuleThresholds {
    #[serde(default = "default_cell_delta")]
    pub cell_delta_v: f64,
    #[serde(default = "default_imbalance_current")]
    pub imbalance_current_a: f64,
    #[serde(default = "default_motor_rpm")]
    pub motor_rpm: f64,
    #[serde(default = "default_inverter_temp")]
    pub inverter_temp_c: f64,
    #[serde(default = "default_temp_rise_rate")]
    pub battery_temp_rise_c_per_min: f64,
    #[serde(default = "default_pack_voltage_floor")]
    pub pack_voltage_floor_v: f64,
    #[serde(default = "default_stress_current")]
    pub stress_current_a: f64,
    #[serde(default = "default_gps_delta")]
    pub gps_wheel_delta: f64,
    #[serde(default = "default_wheel_variance")]
    pub wheel_variance_ratio: f64,
    #[serde(default = "default_thermal_cycles")]
    pub thermal_cycle_count: f64,
    #[serde(default = "default_aging_temp")]
    pub aging_battery_temp_c: f64,
    #[serde(default = "default_ambient_temp")]
    pub ambient_temp_c: f64,
    #[serde(default = "default_vehicle_load")]
    pub vehicle_load_kg: f64,
    #[serde(default = "default_load_current")]
    pub load_current_a: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            cell_delta_v: 0.08,
            imbalance_current_a: 120.0,
            motor_rpm: 7600.0,
            inverter_temp_c: 56.0,
            battery_temp_rise_c_per_min: 0.48,
            pack_voltage_floor_v: 370.0,
            stress_current_a: 125.0,
            gps_wheel_delta: 2.2,
            wheel_variance_ratio: 1.06,
            thermal_cycle_count: 950.0,
            aging_battery_temp_c: 33.5,
            ambient_temp_c: 30.0,
            vehicle_load_kg: 220.0,
            load_current_a: 122.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowConfig {
    #[serde(default = "default_window_capacity")]
    pub capacity: usize,
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: usize,
    /// Anomalies older than this relative to the newest one are dropped; 0 keeps them
    #[serde(default = "default_window_max_age")]
    pub max_age_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 300,
            trigger_threshold: 20,
            max_age_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 60,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Absent means records are kept in memory only
    pub sqlite_path: Option<String>,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            busy_timeout_ms: 5000,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file: {}", path))
    }

    /// Parse after `${VAR}` expansion, then validate.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(&expand_env_vars(content))
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.window;
        if w.capacity == 0 {
            anyhow::bail!("window.capacity must be greater than zero");
        }
        if w.trigger_threshold == 0 || w.trigger_threshold > w.capacity {
            anyhow::bail!(
                "window.trigger_threshold must be between 1 and capacity ({}), got {}",
                w.capacity,
                w.trigger_threshold
            );
        }
        if self.ingest.interval_ms == 0 && self.ingest.cycle {
            anyhow::bail!("ingest.cycle requires a non-zero ingest.interval_ms");
        }
        Ok(())
    }
}

/// Unset variables expand to an empty string.
fn expand_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| std::env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_vehicle_id() -> String { "default".to_string() }
fn default_interval_ms() -> u64 { 1000 }
fn default_history_len() -> usize { 10 }
fn default_cell_delta() -> f64 { 0.08 }
fn default_imbalance_current() -> f64 { 120.0 }
fn default_motor_rpm() -> f64 { 7600.0 }
fn default_inverter_temp() -> f64 { 56.0 }
fn default_temp_rise_rate() -> f64 { 0.48 }
fn default_pack_voltage_floor() -> f64 { 370.0 }
fn default_stress_current() -> f64 { 125.0 }
fn default_gps_delta() -> f64 { 2.2 }
fn default_wheel_variance() -> f64 { 1.06 }
fn default_thermal_cycles() -> f64 { 950.0 }
fn default_aging_temp() -> f64 { 33.5 }
fn default_ambient_temp() -> f64 { 30.0 }
fn default_vehicle_load() -> f64 { 220.0 }
fn default_load_current() -> f64 { 122.0 }
fn default_window_capacity() -> usize { 300 }
fn default_trigger_threshold() -> usize { 20 }
fn default_window_max_age() -> u64 { 300 }
fn default_analyzer_timeout() -> u64 { 60 }
fn default_busy_timeout() -> u64 { 5000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.window.capacity, 300);
        assert_eq!(config.window.trigger_threshold, 20);
        assert_eq!(config.rules, RuleThresholds::default());
        assert_eq!(config.agent.vehicle_id, "default");
        assert!(config.storage.sqlite_path.is_none());
    }

    #[test]
    fn env_vars_are_expanded() {
        std::env::set_var("VRA_TEST_ANALYZER_KEY", "secret-token");
        let config = Config::from_toml(
            r#"
            [analyzer]
            endpoint = "http://localhost:8080/analyze"
            api_key = "${VRA_TEST_ANALYZER_KEY}"
            "#,
        )
        .unwrap();
        assert_eq!(config.analyzer.api_key.as_deref(), Some("secret-token"));
        assert_eq!(config.analyzer.timeout_secs, 60);
    }

    #[test]
    fn threshold_above_capacity_is_rejected() {
        let err = Config::from_toml(
            r#"
            [window]
            capacity = 10
            trigger_threshold = 11
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("trigger_threshold"));
    }

    #[test]
    fn rule_overrides_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [rules]
            motor_rpm = 8000.0
            "#,
        )
        .unwrap();
        assert_eq!(config.rules.motor_rpm, 8000.0);
        assert_eq!(config.rules.cell_delta_v, 0.08);
    }
}
