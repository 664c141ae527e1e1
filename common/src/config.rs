// Configuration management with layered configuration (file, env)

use crate::models::FrequencyTier;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub nats: NatsSettings,
    pub scheduler: SchedulerSettings,
    pub worker: WorkerSettings,
    pub adapter: AdapterSettings,
    pub notifier: NotifierSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsSettings {
    pub url: String,
    pub stream_name: String,
    pub subject: String,
    pub consumer_name: String,
    /// How long queued refresh jobs are retained by the broker
    pub max_age_seconds: u64,
    pub publish_timeout_seconds: u64,
    /// Unacked refresh jobs allowed across every worker process sharing the
    /// consumer (0 = broker default)
    #[serde(default)]
    pub max_ack_pending: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub daily_heartbeat_seconds: u64,
    pub weekly_heartbeat_seconds: u64,
    pub monthly_heartbeat_seconds: u64,
    /// Added on top of hard limit + retry delay when computing the lease TTL
    pub lease_margin_seconds: u64,
    /// Due watches read per page; a heartbeat pages through all of them
    pub scan_page_size: usize,
    /// Spread the enqueues of each page over this window (0 = back to back)
    #[serde(default)]
    pub enqueue_spread_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub soft_limit_seconds: u64,
    pub hard_limit_seconds: u64,
    pub retry_delay_seconds: u64,
    pub max_retries: u32,
    pub max_jobs_per_worker: u32,
    pub poll_wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    pub base_url: String,
    pub request_timeout_seconds: u64,
    /// Lookups allowed per window across all workers (0 disables the limiter)
    #[serde(default)]
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSettings {
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
    /// IANA zone used to render timestamps in notifications
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl SchedulerSettings {
    /// Heartbeat period for a tier
    pub fn heartbeat(&self, tier: FrequencyTier) -> Duration {
        let seconds = match tier {
            FrequencyTier::Daily => self.daily_heartbeat_seconds,
            FrequencyTier::Weekly => self.weekly_heartbeat_seconds,
            FrequencyTier::Monthly => self.monthly_heartbeat_seconds,
        };
        Duration::from_secs(seconds)
    }
}

impl NotifierSettings {
    pub fn tz(&self) -> Result<Tz, String> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| format!("Invalid notifier timezone '{}': {}", self.timezone, e))
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("WATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Time a watch stays leased once a refresh is enqueued or an attempt starts
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(
            self.worker.hard_limit_seconds
                + self.worker.retry_delay_seconds
                + self.scheduler.lease_margin_seconds,
        )
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.stream_name.is_empty() {
            return Err("NATS stream_name cannot be empty".to_string());
        }
        if self.nats.subject.is_empty() {
            return Err("NATS subject cannot be empty".to_string());
        }

        for tier in FrequencyTier::ALL {
            let heartbeat = self.scheduler.heartbeat(tier);
            if heartbeat.is_zero() {
                return Err(format!("Scheduler heartbeat for {} must be greater than 0", tier));
            }
            if tier.interval().to_std().is_ok_and(|interval| heartbeat > interval) {
                return Err(format!("Scheduler heartbeat for {} exceeds the tier interval", tier));
            }
        }
        if self.scheduler.lease_margin_seconds == 0 {
            return Err("Scheduler lease_margin_seconds must be greater than 0".to_string());
        }
        if self.scheduler.scan_page_size == 0 {
            return Err("Scheduler scan_page_size must be greater than 0".to_string());
        }

        if self.worker.pool_size == 0 {
            return Err("Worker pool_size must be greater than 0".to_string());
        }
        if self.worker.soft_limit_seconds == 0
            || self.worker.soft_limit_seconds >= self.worker.hard_limit_seconds
        {
            return Err("Worker soft limit must be positive and below the hard limit".to_string());
        }
        if self.worker.max_retries == 0 {
            return Err("Worker max_retries must be greater than 0".to_string());
        }
        if self.worker.max_jobs_per_worker == 0 {
            return Err("Worker max_jobs_per_worker must be greater than 0".to_string());
        }

        if self.adapter.base_url.is_empty() {
            return Err("Adapter base_url cannot be empty".to_string());
        }
        if self.adapter.rate_limit_max_requests > 0 {
            if self.redis.url.is_empty() {
                return Err("Redis URL is required when rate limiting is enabled".to_string());
            }
            if self.adapter.rate_limit_window_seconds == 0 {
                return Err("Adapter rate_limit_window_seconds must be greater than 0".to_string());
            }
        }

        self.notifier.tz()?;

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/case_watch".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            nats: NatsSettings {
                url: "nats://localhost:4222".to_string(),
                stream_name: "WATCH_REFRESH".to_string(),
                subject: "watch.refresh".to_string(),
                consumer_name: "refresh_workers".to_string(),
                max_age_seconds: 7 * 24 * 3600,
                publish_timeout_seconds: 5,
                max_ack_pending: 0,
            },
            scheduler: SchedulerSettings {
                daily_heartbeat_seconds: 3600,
                weekly_heartbeat_seconds: 6 * 3600,
                monthly_heartbeat_seconds: 24 * 3600,
                lease_margin_seconds: 120,
                scan_page_size: 500,
                enqueue_spread_seconds: 0,
            },
            worker: WorkerSettings {
                pool_size: 4,
                soft_limit_seconds: 300,
                hard_limit_seconds: 600,
                retry_delay_seconds: 60,
                max_retries: 3,
                max_jobs_per_worker: 100,
                poll_wait_seconds: 5,
            },
            adapter: AdapterSettings {
                base_url: "http://localhost:8088".to_string(),
                request_timeout_seconds: 120,
                rate_limit_max_requests: 0,
                rate_limit_window_seconds: 60,
            },
            notifier: NotifierSettings {
                webhook_url: None,
                timeout_seconds: 10,
                timezone: "America/Bogota".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_lifecycle_limits() {
        let settings = Settings::default();
        assert_eq!(settings.worker.soft_limit_seconds, 300);
        assert_eq!(settings.worker.hard_limit_seconds, 600);
        assert_eq!(settings.worker.retry_delay_seconds, 60);
        assert_eq!(settings.worker.max_retries, 3);
        assert_eq!(settings.worker.max_jobs_per_worker, 100);
        assert_eq!(settings.lease_ttl(), Duration::from_secs(780));
    }

    #[test]
    fn test_default_heartbeats_are_a_fraction_of_tier_intervals() {
        // A watch refreshed just after a heartbeat must be picked up within
        // one interval plus one heartbeat, not two intervals
        let settings = Settings::default();
        for tier in FrequencyTier::ALL {
            let interval = tier.interval().to_std().unwrap();
            assert!(settings.scheduler.heartbeat(tier) * 24 <= interval);
        }
        assert_eq!(settings.scheduler.heartbeat(FrequencyTier::Daily), Duration::from_secs(3600));
    }

    #[test]
    fn test_validation_catches_heartbeat_longer_than_interval() {
        let mut settings = Settings::default();
        settings.scheduler.weekly_heartbeat_seconds = 8 * 24 * 3600;
        assert!(settings.validate().is_err());

        settings.scheduler.weekly_heartbeat_seconds = 7 * 24 * 3600;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_inverted_limits() {
        let mut settings = Settings::default();
        settings.worker.soft_limit_seconds = 700;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.notifier.timezone = "Mars/Olympus".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.worker.max_retries, 3);
        assert_eq!(settings.notifier.timezone, "America/Bogota");
    }

    #[test]
    fn test_load_reads_default_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[worker]\npool_size = 8\nmax_retries = 5\n",
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.worker.pool_size, 8);
        assert_eq!(settings.worker.max_retries, 5);
        assert_eq!(settings.worker.hard_limit_seconds, 600);
    }
}
