//! Process configuration read from environment variables.
//!
//! Every value has a default except the ones that point at external systems
//! (`DATABASE_URL` when persistence is on, the WeChat credentials when the
//! WeChat adapter is enabled).

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use orderflow_events::RetryConfig;
use orderflow_reconciliation::ReconciliationConfig;

use crate::external::WeChatConfig;
use crate::outbox::RelayConfig;
use crate::scheduling::Cadence;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

/// Cron expressions (UTC, seconds first) for the scheduled jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub payment_cron: String,
    pub refund_cron: String,
    pub settlement_cron: String,
    pub cleanup_cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            payment_cron: "0 0 2 * * *".to_string(),
            refund_cron: "0 5 2 * * *".to_string(),
            settlement_cron: "0 10 2 * * *".to_string(),
            cleanup_cron: "0 30 3 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub persistence: PersistenceConfig,
    /// Enables the broker publisher when the `redis` feature is compiled in.
    pub redis_url: Option<String>,
    pub node_id: i64,
    pub retry: RetryConfig,
    pub relay: RelayConfig,
    /// Completed outbox rows older than this are purged by the cleanup job.
    pub outbox_retention: Duration,
    pub memory_queue_capacity: usize,
    pub reconciliation: ReconciliationConfig,
    pub schedule: ScheduleConfig,
    /// `None` runs reconciliation against an empty static ledger.
    pub wechat: Option<WeChatConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig {
                use_persistent_stores: false,
                database_url: None,
                max_connections: 10,
            },
            redis_url: None,
            node_id: 1,
            retry: RetryConfig::default(),
            relay: RelayConfig::default(),
            outbox_retention: Duration::from_secs(7 * 24 * 3600),
            memory_queue_capacity: 1024,
            reconciliation: ReconciliationConfig::default(),
            schedule: ScheduleConfig::default(),
            wechat: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = AppConfig::default();

        let use_persistent_stores = env.parse_or("USE_PERSISTENT_STORES", false)?;
        let database_url = env.get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        let persistence = PersistenceConfig {
            use_persistent_stores,
            database_url,
            max_connections: env.parse_or(
                "DATABASE_MAX_CONNECTIONS",
                defaults.persistence.max_connections,
            )?,
        };

        let retry = RetryConfig::new(
            env.parse_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            env.millis_or("RETRY_INITIAL_INTERVAL_MS", defaults.retry.initial_interval)?,
            env.parse_or("RETRY_MULTIPLIER", defaults.retry.multiplier)?,
            env.millis_or("RETRY_MAX_INTERVAL_MS", defaults.retry.max_interval)?,
        )
        .with_jitter(env.parse_or("RETRY_JITTER", defaults.retry.jitter)?);
        if retry.max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let relay = RelayConfig {
            batch_size: env.parse_or("OUTBOX_BATCH_SIZE", defaults.relay.batch_size)?,
            poll_interval: env.millis_or("OUTBOX_POLL_INTERVAL_MS", defaults.relay.poll_interval)?,
            max_retries: env.parse_or("OUTBOX_MAX_RETRIES", defaults.relay.max_retries)?,
            stale_after: env.secs_or("OUTBOX_STALE_AFTER_SECS", defaults.relay.stale_after)?,
            ..defaults.relay
        };
        let outbox_retention = env.days_or("OUTBOX_RETENTION_DAYS", defaults.outbox_retention)?;

        let memory_queue_capacity =
            env.parse_or("MEMORY_QUEUE_CAPACITY", defaults.memory_queue_capacity)?;
        if memory_queue_capacity == 0 {
            return Err(invalid("MEMORY_QUEUE_CAPACITY", "0", "must be at least 1"));
        }

        let recon_defaults = defaults.reconciliation;
        let reconciliation = ReconciliationConfig {
            batch_size: env.parse_or("RECON_BATCH_SIZE", recon_defaults.batch_size)?,
            retry_attempts: env.parse_or("RECON_RETRY_ATTEMPTS", recon_defaults.retry_attempts)?,
            alert_threshold: env.parse_or("RECON_ALERT_THRESHOLD", recon_defaults.alert_threshold)?,
            amount_tolerance_cents: env.parse_or(
                "RECON_AMOUNT_TOLERANCE_CENTS",
                recon_defaults.amount_tolerance_cents,
            )?,
            task_timeout: env.secs_or("RECON_TASK_TIMEOUT_SECS", recon_defaults.task_timeout)?,
            retention_days: env.parse_or("RECON_RETENTION_DAYS", recon_defaults.retention_days)?,
        };
        if !(0.0..=1.0).contains(&reconciliation.alert_threshold) {
            return Err(invalid(
                "RECON_ALERT_THRESHOLD",
                &reconciliation.alert_threshold.to_string(),
                "must be between 0 and 1",
            ));
        }

        let schedule = ScheduleConfig {
            payment_cron: env.cron_or("RECON_PAYMENT_AT", defaults.schedule.payment_cron)?,
            refund_cron: env.cron_or("RECON_REFUND_AT", defaults.schedule.refund_cron)?,
            settlement_cron: env.cron_or("RECON_SETTLEMENT_AT", defaults.schedule.settlement_cron)?,
            cleanup_cron: env.cron_or("RECON_CLEANUP_AT", defaults.schedule.cleanup_cron)?,
        };

        let wechat = match env.get("WECHAT_API_BASE_URL") {
            None => None,
            Some(base_url) => Some(WeChatConfig {
                base_url,
                mch_id: env.require("WECHAT_MCH_ID")?,
                api_token: env.require("WECHAT_API_TOKEN")?,
                timeout: env.secs_or("WECHAT_TIMEOUT_SECS", Duration::from_secs(30))?,
                min_interval: env.millis_or("WECHAT_MIN_INTERVAL_MS", Duration::from_millis(200))?,
            }),
        };

        Ok(Self {
            persistence,
            redis_url: env.get("REDIS_URL"),
            node_id: env.parse_or("NODE_ID", defaults.node_id)?,
            retry,
            relay,
            outbox_retention,
            memory_queue_capacity,
            reconciliation,
            schedule,
            wechat,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
        }
    }

    fn millis_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn secs_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or(key, default.as_secs()).map(Duration::from_secs)
    }

    fn days_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or(key, default.as_secs() / 86_400)
            .map(|days| Duration::from_secs(days * 86_400))
    }

    fn cron_or(&self, key: &'static str, default: String) -> Result<String, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => Cadence::parse(&raw)
                .map(|_| raw.clone())
                .map_err(|e| invalid(key, &raw, &e.reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = load(&[]).unwrap();
        assert!(!cfg.persistence.use_persistent_stores);
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.retry, RetryConfig::default());
        assert_eq!(cfg.relay.batch_size, 100);
        assert_eq!(cfg.relay.max_retries, 5);
        assert_eq!(cfg.outbox_retention, Duration::from_secs(7 * 86_400));
        assert_eq!(cfg.memory_queue_capacity, 1024);
        assert_eq!(cfg.reconciliation, ReconciliationConfig::default());
        assert_eq!(cfg.schedule, ScheduleConfig::default());
        assert!(cfg.wechat.is_none());
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = load(&[
            ("NODE_ID", "42"),
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("RETRY_INITIAL_INTERVAL_MS", "250"),
            ("RETRY_JITTER", "0.2"),
            ("OUTBOX_POLL_INTERVAL_MS", "50"),
            ("RECON_ALERT_THRESHOLD", "0.05"),
            ("RECON_TASK_TIMEOUT_SECS", "60"),
            ("RECON_PAYMENT_AT", "0 15 1 * * ?"),
            ("REDIS_URL", "redis://cache:6379"),
        ])
        .unwrap();

        assert_eq!(cfg.node_id, 42);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.initial_interval, Duration::from_millis(250));
        assert_eq!(cfg.retry.jitter, 0.2);
        assert_eq!(cfg.relay.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.reconciliation.alert_threshold, 0.05);
        assert_eq!(cfg.reconciliation.task_timeout, Duration::from_secs(60));
        assert_eq!(cfg.schedule.payment_cron, "0 15 1 * * ?");
        assert_eq!(cfg.schedule.refund_cron, "0 5 2 * * *");
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn persistence_requires_database_url() {
        assert_eq!(
            load(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
        let cfg = load(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/orderflow"),
        ])
        .unwrap();
        assert!(cfg.persistence.use_persistent_stores);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            load(&[("NODE_ID", "abc")]),
            Err(ConfigError::Invalid { key: "NODE_ID", .. })
        ));
        assert!(matches!(
            load(&[("RECON_CLEANUP_AT", "25:00")]),
            Err(ConfigError::Invalid { key: "RECON_CLEANUP_AT", .. })
        ));
        assert!(matches!(
            load(&[("RECON_ALERT_THRESHOLD", "1.5")]),
            Err(ConfigError::Invalid { key: "RECON_ALERT_THRESHOLD", .. })
        ));
        assert!(matches!(
            load(&[("MEMORY_QUEUE_CAPACITY", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn wechat_needs_credentials_once_enabled() {
        assert_eq!(
            load(&[("WECHAT_API_BASE_URL", "https://api.mch.weixin.qq.com")]).unwrap_err(),
            ConfigError::Missing("WECHAT_MCH_ID")
        );
        let cfg = load(&[
            ("WECHAT_API_BASE_URL", "https://api.mch.weixin.qq.com"),
            ("WECHAT_MCH_ID", "1900000001"),
            ("WECHAT_API_TOKEN", "secret"),
        ])
        .unwrap();
        let wechat = cfg.wechat.unwrap();
        assert_eq!(wechat.timeout, Duration::from_secs(30));
        assert_eq!(wechat.min_interval, Duration::from_millis(200));
    }
}
