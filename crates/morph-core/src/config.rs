//! Process-wide configuration, loaded once at startup and immutable after.
//!
//! Precedence: built-in defaults < `config/gateway.toml` (or the file named by
//! `MORPH_CONFIG`) < `MORPH__*` environment overrides < the short-form knobs
//! (`EPSILON`, `REGEN_GAP`, `MIN_TRIALS`, `REQUEST_DEADLINE_MS`,
//! `STORAGE_URI`) kept for operator muscle memory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

fn default_reward_map() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("click".to_string(), 1.0);
    m.insert("add_to_cart".to_string(), 2.0);
    m.insert("purchase".to_string(), 5.0);
    m
}

fn default_blocked_phrases() -> Vec<String> {
    vec![
        "guaranteed results".to_string(),
        "miracle cure".to_string(),
        "act now or lose".to_string(),
    ]
}

/// Global application configuration (core + gateway).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Application identity shown on the health endpoint.
    pub app_name: String,
    /// HTTP port for the gateway.
    pub port: u16,
    /// Base directory for the sled store. `STORAGE_URI` overrides.
    pub storage_path: String,

    /// Exploration probability for the selection policy.
    pub epsilon: f64,
    /// Score gap between slots that schedules regeneration of the loser.
    pub regen_gap: f64,
    /// Minimum trials on both slots before regeneration may trigger.
    pub min_trials: u64,
    /// Soft deadline for the optimize pipeline.
    pub request_deadline_ms: u64,
    /// Wall-clock bound on one language-model call.
    pub regen_deadline_ms: u64,
    /// TTL on the storage-held regeneration lock.
    pub regen_lock_ttl_secs: u64,

    /// Sliding window the behavioral aggregator reads.
    pub event_window_secs: u64,
    /// Most recent events considered per aggregation.
    pub event_limit: usize,
    /// Ingest write-queue watermark; above it, throttleable events drop first.
    pub ingest_queue_depth: usize,

    /// Per-api-key request rate (token bucket refill per second).
    pub rate_limit_per_sec: u32,
    /// Per-api-key burst allowance.
    pub rate_limit_burst: u32,

    /// Upper bound on candidate markup size, in bytes.
    pub guardrail_max_bytes: usize,
    /// Phrases the guardrail rejects outright (matched case-insensitively).
    #[serde(default = "default_blocked_phrases")]
    pub blocked_phrases: Vec<String>,

    /// Reward type -> scalar. The reward endpoint's explicit `reward` field
    /// takes precedence over this map.
    #[serde(default = "default_reward_map")]
    pub reward_map: HashMap<String, f64>,

    /// Model identifier passed to the rewrite bridge.
    pub llm_model: String,
}

impl CoreConfig {
    /// Load config from file and environment. See the module docs for
    /// precedence. Never fails on a missing file; fails on a malformed one.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("MORPH_CONFIG").unwrap_or_else(|_| "config/gateway".to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Morph Gateway")?
            .set_default("port", 8080_i64)?
            .set_default("storage_path", "./data/morph_store")?
            .set_default("epsilon", 0.2_f64)?
            .set_default("regen_gap", 1.0_f64)?
            .set_default("min_trials", 5_i64)?
            .set_default("request_deadline_ms", 500_i64)?
            .set_default("regen_deadline_ms", 10_000_i64)?
            .set_default("regen_lock_ttl_secs", 30_i64)?
            .set_default("event_window_secs", 600_i64)?
            .set_default("event_limit", 50_i64)?
            .set_default("ingest_queue_depth", 1024_i64)?
            .set_default("rate_limit_per_sec", 100_i64)?
            .set_default("rate_limit_burst", 200_i64)?
            .set_default("guardrail_max_bytes", 65_536_i64)?
            .set_default("llm_model", "meta-llama/llama-3.3-70b-instruct")?;

        let path = Path::new(&config_path);
        let builder = if path.exists() || Path::new(&format!("{config_path}.toml")).exists() {
            builder.add_source(config::File::with_name(&config_path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("MORPH").separator("__"))
            .build()?;

        let mut cfg: Self = built.try_deserialize()?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Short-form operator knobs. Unset or unparsable values keep the
    /// configured value.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_f64("EPSILON") {
            self.epsilon = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_f64("REGEN_GAP") {
            self.regen_gap = v.max(0.0);
        }
        if let Some(v) = env_u64("MIN_TRIALS") {
            self.min_trials = v;
        }
        if let Some(v) = env_u64("REQUEST_DEADLINE_MS") {
            self.request_deadline_ms = v;
        }
        if let Ok(uri) = std::env::var("STORAGE_URI") {
            let uri = uri.trim();
            if !uri.is_empty() {
                self.storage_path = uri.to_string();
            }
        }
    }

    /// Scalar reward for a named reward type; 1.0 when unmapped.
    pub fn reward_for(&self, reward_type: &str) -> f64 {
        self.reward_map.get(reward_type).copied().unwrap_or(1.0)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_name: "Morph Gateway".to_string(),
            port: 8080,
            storage_path: "./data/morph_store".to_string(),
            epsilon: 0.2,
            regen_gap: 1.0,
            min_trials: 5,
            request_deadline_ms: 500,
            regen_deadline_ms: 10_000,
            regen_lock_ttl_secs: 30,
            event_window_secs: 600,
            event_limit: 50,
            ingest_queue_depth: 1024,
            rate_limit_per_sec: 100,
            rate_limit_burst: 200,
            guardrail_max_bytes: 65_536,
            blocked_phrases: default_blocked_phrases(),
            reward_map: default_reward_map(),
            llm_model: "meta-llama/llama-3.3-70b-instruct".to_string(),
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.epsilon, 0.2);
        assert_eq!(cfg.regen_gap, 1.0);
        assert_eq!(cfg.min_trials, 5);
        assert_eq!(cfg.request_deadline_ms, 500);
        assert_eq!(cfg.guardrail_max_bytes, 64 * 1024);
    }

    #[test]
    fn reward_for_falls_back_to_unit() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.reward_for("click"), 1.0);
        assert_eq!(cfg.reward_for("scroll_depth_75"), 1.0);
        assert_eq!(cfg.reward_for("purchase"), 5.0);
    }
}
