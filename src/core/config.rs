//! Runtime configuration
//!
//! Every option can be overridden from the environment; defaults keep the
//! runtime safe (dry-run) out of the box.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Detector thresholds and windows
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub semantic_similarity_threshold: f64,
    pub conversation_window: usize,
    pub conversation_timeout_secs: u64,
    pub dedup_window_secs: u64,
    pub certainty_high: f64,
    pub fp_high: f64,
}

/// Remediation gating and TTLs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemediationConfig {
    pub real_mode: bool,
    pub enable_action_whitelist: bool,
    pub enable_schema_validation: bool,
    pub enable_input_sanitization: bool,
    pub approval_ttl_secs: u64,
    pub block_ttl_secs: u64,
    pub rate_limit_default: u32,
    pub rate_limit_window_secs: u64,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub effector_timeout_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

/// Embedded store settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub db_path: String,
    pub connection_pool_size: usize,
    pub db_timeout_ms: u64,
    pub sweep_interval_secs: u64,
}

/// LLM adapter wiring (generateContent-style endpoint)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
}

/// Message bus bounds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusConfig {
    pub subscriber_queue_capacity: usize,
    pub publish_deadline_ms: u64,
}

/// Main configuration for the SOC runtime
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocConfig {
    pub detection: DetectionConfig,
    pub remediation: RemediationConfig,
    pub memory: MemoryConfig,
    pub llm: LlmConfig,
    pub bus: BusConfig,
    /// Absent flag disables the CTF challenge (logged at startup).
    pub ctf_flag: Option<String>,
}

impl Default for SocConfig {
    fn default() -> Self {
        SocConfig {
            detection: DetectionConfig {
                semantic_similarity_threshold: 0.65,
                conversation_window: 20,
                conversation_timeout_secs: 1800,
                dedup_window_secs: 10,
                certainty_high: 0.7,
                fp_high: 0.7,
            },
            remediation: RemediationConfig {
                real_mode: false,
                enable_action_whitelist: true,
                enable_schema_validation: true,
                enable_input_sanitization: true,
                approval_ttl_secs: 86_400,
                block_ttl_secs: 3_600,
                rate_limit_default: 5,
                rate_limit_window_secs: 120,
                queue_capacity: 512,
                worker_count: 4,
                effector_timeout_ms: 10_000,
                breaker_failure_threshold: 5,
                breaker_cooldown_secs: 60,
            },
            memory: MemoryConfig {
                db_path: "rustsoc.db".to_string(),
                connection_pool_size: 5,
                db_timeout_ms: 2_000,
                sweep_interval_secs: 60,
            },
            llm: LlmConfig {
                base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
                api_key: String::new(),
                model: "gemini-2.0-flash".to_string(),
                timeout_ms: 30_000,
            },
            bus: BusConfig {
                subscriber_queue_capacity: 1024,
                publish_deadline_ms: 1_000,
            },
            ctf_flag: None,
        }
    }
}

impl SocConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let d = SocConfig::default();

        let real_mode = env_bool("REAL_MODE", d.remediation.real_mode);
        let ctf_flag = env::var("CTF_FLAG").ok().filter(|v| !v.is_empty());
        if ctf_flag.is_none() {
            warn!("[Config] CTF_FLAG not set - CTF challenge disabled");
        }

        SocConfig {
            detection: DetectionConfig {
                semantic_similarity_threshold: env_parse(
                    "SEMANTIC_SIMILARITY_THRESHOLD",
                    d.detection.semantic_similarity_threshold,
                ),
                conversation_window: env_parse("CONVERSATION_WINDOW", d.detection.conversation_window),
                conversation_timeout_secs: env_parse(
                    "CONVERSATION_TIMEOUT",
                    d.detection.conversation_timeout_secs,
                ),
                dedup_window_secs: env_parse("DEDUP_WINDOW_SECONDS", d.detection.dedup_window_secs),
                certainty_high: env_parse("CERTAINTY_HIGH", d.detection.certainty_high),
                fp_high: env_parse("FP_HIGH", d.detection.fp_high),
            },
            remediation: RemediationConfig {
                real_mode,
                enable_action_whitelist: env_bool(
                    "ENABLE_ACTION_WHITELIST",
                    d.remediation.enable_action_whitelist,
                ),
                enable_schema_validation: env_bool(
                    "ENABLE_SCHEMA_VALIDATION",
                    d.remediation.enable_schema_validation,
                ),
                enable_input_sanitization: env_bool(
                    "ENABLE_INPUT_SANITIZATION",
                    d.remediation.enable_input_sanitization,
                ),
                approval_ttl_secs: env_parse("APPROVAL_TTL_SECONDS", d.remediation.approval_ttl_secs),
                block_ttl_secs: env_parse("BLOCK_TTL_SECONDS", d.remediation.block_ttl_secs),
                rate_limit_default: env_parse("RATE_LIMIT_DEFAULT", d.remediation.rate_limit_default),
                rate_limit_window_secs: env_parse(
                    "RATE_LIMIT_WINDOW_SECONDS",
                    d.remediation.rate_limit_window_secs,
                ),
                queue_capacity: env_parse("REMEDIATOR_QUEUE_CAPACITY", d.remediation.queue_capacity),
                worker_count: env_parse("REMEDIATOR_WORKERS", d.remediation.worker_count),
                effector_timeout_ms: env_parse(
                    "EFFECTOR_TIMEOUT_MS",
                    d.remediation.effector_timeout_ms,
                ),
                breaker_failure_threshold: env_parse(
                    "BREAKER_FAILURE_THRESHOLD",
                    d.remediation.breaker_failure_threshold,
                ),
                breaker_cooldown_secs: env_parse(
                    "BREAKER_COOLDOWN_SECONDS",
                    d.remediation.breaker_cooldown_secs,
                ),
            },
            memory: MemoryConfig {
                db_path: env::var("SOC_DB_PATH").unwrap_or(d.memory.db_path),
                connection_pool_size: env_parse("CONNECTION_POOL_SIZE", d.memory.connection_pool_size),
                db_timeout_ms: env_parse("DB_TIMEOUT_MS", d.memory.db_timeout_ms),
                sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECONDS", d.memory.sweep_interval_secs),
            },
            llm: LlmConfig {
                base_url: env::var("MODEL_BASE_URL").unwrap_or(d.llm.base_url),
                api_key: env::var("MODEL_API_KEY").unwrap_or_default(),
                model: env::var("MODEL_NAME").unwrap_or(d.llm.model),
                timeout_ms: env_parse("LLM_TIMEOUT_MS", d.llm.timeout_ms),
            },
            bus: BusConfig {
                subscriber_queue_capacity: env_parse(
                    "BUS_QUEUE_CAPACITY",
                    d.bus.subscriber_queue_capacity,
                ),
                publish_deadline_ms: env_parse("BUS_PUBLISH_DEADLINE_MS", d.bus.publish_deadline_ms),
            },
            ctf_flag,
        }
    }

    /// Dry-run is always the negation of real mode.
    pub fn dry_run(&self) -> bool {
        !self.remediation.real_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_dry_run() {
        let cfg = SocConfig::default();
        assert!(cfg.dry_run());
        assert_eq!(cfg.memory.connection_pool_size, 5);
        assert_eq!(cfg.remediation.queue_capacity, 512);
        assert_eq!(cfg.detection.semantic_similarity_threshold, 0.65);
    }
}
