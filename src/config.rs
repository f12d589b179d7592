use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::analysis::ExecutorConfig;
use crate::queue::{RetentionPolicy, WorkerPoolConfig, DEFAULT_MAX_ATTEMPTS};
use crate::scheduler::AnalysisSweepConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub llm: LLMConfig,
    pub queue: QueueConfig,
    pub executor: ExecutorSettings,
    pub scheduler: SchedulerConfig,
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Required unless running with the in-memory repository.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub rate_limit_max: usize,
    pub rate_limit_window_secs: u64,
    pub backoff_base_ms: u64,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub stall_threshold_secs: u64,
    pub stall_check_interval_secs: u64,
    pub retain_completed: usize,
    pub retain_failed: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    pub timeout_secs: u64,
    pub freshness_window_secs: u64,
    pub processing_lease_secs: u64,
    pub weekly_window_days: u64,
    pub analysis_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub analysis_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub usage_interval_secs: u64,
    pub lookback_mins: u64,
    pub batch_cap: usize,
    pub stagger_ms: u64,
    pub cleanup_max_age_days: u64,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let provider = string_or(&lookup, "LLM_PROVIDER", "openai");
        let api_key = match provider.as_str() {
            "openrouter" => lookup("OPENROUTER_API_KEY"),
            _ => lookup("OPENAI_API_KEY"),
        }
        .or_else(|| lookup("LLM_API_KEY"))
        .unwrap_or_default();

        let config = Self {
            server: ServerConfig {
                port: parse_or(&lookup, "PORT", 3000)?,
                host: string_or(&lookup, "HOST", "0.0.0.0"),
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
                max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
                min_connections: parse_or(&lookup, "DB_MIN_CONNECTIONS", 1)?,
                acquire_timeout_secs: parse_or(&lookup, "DB_ACQUIRE_TIMEOUT_SECS", 10)?,
            },
            redis: RedisConfig {
                url: string_or(&lookup, "REDIS_URL", "redis://localhost:6379"),
                prefix: string_or(&lookup, "QUEUE_PREFIX", crate::queue::redis_store::DEFAULT_PREFIX),
            },
            llm: LLMConfig {
                provider,
                api_key,
                base_url: lookup("LLM_BASE_URL").filter(|v| !v.trim().is_empty()),
                model: string_or(&lookup, "LLM_MODEL", "gpt-4o-mini"),
                max_tokens: parse_or(&lookup, "LLM_MAX_TOKENS", 1200)?,
                temperature: parse_or(&lookup, "LLM_TEMPERATURE", 0.3)?,
            },
            queue: QueueConfig {
                concurrency: parse_or(&lookup, "QUEUE_CONCURRENCY", 2)?,
                rate_limit_max: parse_or(&lookup, "QUEUE_RATE_LIMIT_MAX", 10)?,
                rate_limit_window_secs: parse_or(&lookup, "QUEUE_RATE_LIMIT_WINDOW_SECS", 60)?,
                backoff_base_ms: parse_or(&lookup, "QUEUE_BACKOFF_BASE_MS", 2000)?,
                max_attempts: parse_or(&lookup, "QUEUE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
                poll_interval_ms: parse_or(&lookup, "QUEUE_POLL_INTERVAL_MS", 500)?,
                stall_threshold_secs: parse_or(&lookup, "QUEUE_STALL_THRESHOLD_SECS", 120)?,
                stall_check_interval_secs: parse_or(&lookup, "QUEUE_STALL_CHECK_INTERVAL_SECS", 30)?,
                retain_completed: parse_or(&lookup, "QUEUE_RETAIN_COMPLETED", 100)?,
                retain_failed: parse_or(&lookup, "QUEUE_RETAIN_FAILED", 50)?,
            },
            executor: ExecutorSettings {
                timeout_secs: parse_or(&lookup, "ANALYSIS_TIMEOUT_SECS", 30)?,
                freshness_window_secs: parse_or(&lookup, "ANALYSIS_FRESHNESS_SECS", 3600)?,
                processing_lease_secs: parse_or(&lookup, "ANALYSIS_PROCESSING_LEASE_SECS", 90)?,
                weekly_window_days: parse_or(&lookup, "ANALYSIS_WEEKLY_WINDOW_DAYS", 7)?,
                analysis_version: string_or(&lookup, "ANALYSIS_VERSION", "1"),
            },
            scheduler: SchedulerConfig {
                enabled: parse_or(&lookup, "SCHEDULER_ENABLED", true)?,
                analysis_interval_secs: parse_or(&lookup, "SWEEP_ANALYSIS_INTERVAL_SECS", 30 * 60)?,
                cleanup_interval_secs: parse_or(&lookup, "SWEEP_CLEANUP_INTERVAL_SECS", 24 * 60 * 60)?,
                usage_interval_secs: parse_or(&lookup, "SWEEP_USAGE_INTERVAL_SECS", 60 * 60)?,
                lookback_mins: parse_or(&lookup, "SWEEP_LOOKBACK_MINS", 35)?,
                batch_cap: parse_or(&lookup, "SWEEP_BATCH_CAP", 50)?,
                stagger_ms: parse_or(&lookup, "SWEEP_STAGGER_MS", 2000)?,
                cleanup_max_age_days: parse_or(&lookup, "SWEEP_CLEANUP_MAX_AGE_DAYS", 30)?,
            },
            log_dir: lookup("LOG_DIR").filter(|v| !v.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// A stalled job must find the dead run's processing mark expired when
    /// it is requeued, and a live run must finish inside its own mark.
    fn validate(&self) -> Result<()> {
        let lease = self.executor.processing_lease_secs;
        if lease <= self.executor.timeout_secs {
            bail!(
                "ANALYSIS_PROCESSING_LEASE_SECS ({}) must be greater than ANALYSIS_TIMEOUT_SECS ({})",
                lease,
                self.executor.timeout_secs
            );
        }
        if lease >= self.queue.stall_threshold_secs {
            bail!(
                "ANALYSIS_PROCESSING_LEASE_SECS ({}) must be less than QUEUE_STALL_THRESHOLD_SECS ({})",
                lease,
                self.queue.stall_threshold_secs
            );
        }
        Ok(())
    }
}

impl QueueConfig {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.concurrency.max(1),
            rate_limit_max: self.rate_limit_max,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            stall_threshold: Duration::from_secs(self.stall_threshold_secs),
            stall_check_interval: Duration::from_secs(self.stall_check_interval_secs.max(1)),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed_per_kind: self.retain_completed,
            failed_per_kind: self.retain_failed,
        }
    }
}

impl ExecutorSettings {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            freshness_window: Duration::from_secs(self.freshness_window_secs),
            processing_lease: Duration::from_secs(self.processing_lease_secs),
            weekly_window: Duration::from_secs(self.weekly_window_days * 24 * 60 * 60),
            analysis_version: self.analysis_version.clone(),
        }
    }
}

impl SchedulerConfig {
    pub fn analysis_sweep(&self) -> AnalysisSweepConfig {
        AnalysisSweepConfig {
            lookback: Duration::from_secs(self.lookback_mins * 60),
            batch_cap: self.batch_cap,
            stagger: Duration::from_millis(self.stagger_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_queue_policy() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        let pool = config.queue.pool_config();

        assert_eq!(pool.concurrency, 2);
        assert_eq!(pool.rate_limit_max, 10);
        assert_eq!(pool.rate_limit_window, Duration::from_secs(60));
        assert_eq!(pool.backoff_base, Duration::from_millis(2000));
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.retention(), RetentionPolicy::default());

        let executor = config.executor.executor_config();
        assert_eq!(executor.timeout, Duration::from_secs(30));
        assert_eq!(executor.freshness_window, Duration::from_secs(3600));
        assert!(executor.processing_lease > executor.timeout);
        assert!(executor.processing_lease < pool.stall_threshold);

        let sweep = config.scheduler.analysis_sweep();
        assert_eq!(sweep.lookback, Duration::from_secs(35 * 60));
        assert_eq!(sweep.batch_cap, 50);
        assert_eq!(sweep.stagger, Duration::from_secs(2));
        assert!(config.database.url.is_none());
        assert_eq!(config.redis.prefix, "tj:queue");
    }

    #[test]
    fn test_overrides_and_provider_key_selection() {
        let config = Config::from_lookup(lookup_from(&[
            ("LLM_PROVIDER", "openrouter"),
            ("OPENROUTER_API_KEY", "sk-or"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("QUEUE_CONCURRENCY", "4"),
            ("SCHEDULER_ENABLED", "false"),
        ]))
        .unwrap();

        assert_eq!(config.llm.api_key, "sk-or");
        assert_eq!(config.queue.concurrency, 4);
        assert!(!config.scheduler.enabled);
    }

    #[test]
    fn test_processing_lease_must_sit_between_timeout_and_stall_threshold() {
        let err = Config::from_lookup(lookup_from(&[("ANALYSIS_PROCESSING_LEASE_SECS", "300")])).unwrap_err();
        assert!(err.to_string().contains("QUEUE_STALL_THRESHOLD_SECS"));

        let err = Config::from_lookup(lookup_from(&[
            ("ANALYSIS_PROCESSING_LEASE_SECS", "120"),
            ("QUEUE_STALL_THRESHOLD_SECS", "120"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("must be less than"));

        let err = Config::from_lookup(lookup_from(&[("ANALYSIS_PROCESSING_LEASE_SECS", "30")])).unwrap_err();
        assert!(err.to_string().contains("ANALYSIS_TIMEOUT_SECS"));

        let config = Config::from_lookup(lookup_from(&[
            ("ANALYSIS_PROCESSING_LEASE_SECS", "300"),
            ("QUEUE_STALL_THRESHOLD_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(config.executor.executor_config().processing_lease, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[("QUEUE_RATE_LIMIT_MAX", "ten")])).unwrap_err();
        assert!(err.to_string().contains("QUEUE_RATE_LIMIT_MAX"));
    }
}
