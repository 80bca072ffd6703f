//! Service configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use stream_transport::{AssignmentStrategy, ConsumerGroupConfig, ProducerMode, TransportConfig};

use crate::error::{AppError, Result};
use crate::models::EntityKind;

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_token: String,
    /// Zone the source API expects its time-window parameters in
    pub timezone: Tz,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub lock_lease: Duration,
    pub page_size: u32,
    /// Ask the source not to mark listed records as processed
    pub leave_unprocessed: bool,
}

/// Flag values used until (or unless) the flag store overrides them.
#[derive(Debug, Clone)]
pub struct FlagDefaults {
    pub poll_lab_results: bool,
    pub poll_patients: bool,
    pub consume_lab_results: bool,
    pub pause_consumers: bool,
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    pub producer_mode: ProducerMode,
    pub consumer_group: String,
    pub assignment_strategy: AssignmentStrategy,
    pub lab_results_topic: String,
    pub patients_topic: String,
    pub redis_url: String,
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub relay: RelayConfig,
    pub flags: FlagDefaults,
}

impl Config {
    /// Load from the process environment (after `.env`, if present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; missing keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let transport = TransportConfig {
            brokers: env
                .string("KAFKA_BROKERS", "localhost:9092")
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect(),
            client_id: env.string("KAFKA_CLIENT_ID", "chart-sync"),
            producer_retries: env.parse("KAFKA_PRODUCER_RETRIES", 5)?,
            delivery_timeout: Duration::from_millis(env.parse("KAFKA_DELIVERY_TIMEOUT_MS", 30_000)?),
            request_timeout: Duration::from_secs(30),
        };

        let http_timeout = Duration::from_millis(env.parse("SOURCE_TIMEOUT_MS", 10_000)?);

        let config = Self {
            transport,
            producer_mode: env.parse("KAFKA_PRODUCER_MODE", ProducerMode::Sync)?,
            consumer_group: env.string("KAFKA_CONSUMER_GROUP", "chart-sync"),
            assignment_strategy: env.parse("KAFKA_ASSIGNMENT_STRATEGY", AssignmentStrategy::Range)?,
            lab_results_topic: env.string("KAFKA_LAB_RESULTS_TOPIC", "chart-sync.lab-results"),
            patients_topic: env.string("KAFKA_PATIENTS_TOPIC", "chart-sync.patients"),
            redis_url: env.string("REDIS_URL", "redis://127.0.0.1:6379"),
            source: SourceConfig {
                base_url: env.string("SOURCE_BASE_URL", "http://localhost:8081"),
                api_token: env.string("SOURCE_API_TOKEN", ""),
                timezone: env.parse("SOURCE_TIMEZONE", chrono_tz::America::New_York)?,
                timeout: http_timeout,
            },
            target: TargetConfig {
                base_url: env.string("TARGET_BASE_URL", "http://localhost:8082"),
                api_token: env.string("TARGET_API_TOKEN", ""),
                timeout: http_timeout,
            },
            relay: RelayConfig {
                poll_interval: Duration::from_secs(env.parse("POLL_INTERVAL_SECS", 60)?),
                lock_lease: Duration::from_secs(env.parse("LOCK_LEASE_SECS", 300)?),
                page_size: env.parse("PAGE_SIZE", 100)?,
                leave_unprocessed: env.parse("LEAVE_UNPROCESSED", false)?,
            },
            flags: FlagDefaults {
                poll_lab_results: env.parse("POLL_LAB_RESULTS", true)?,
                poll_patients: env.parse("POLL_PATIENTS", true)?,
                consume_lab_results: env.parse("CONSUME_LAB_RESULTS", true)?,
                pause_consumers: env.parse("PAUSE_CONSUMERS", false)?,
                refresh_interval: Duration::from_secs(env.parse("FLAG_REFRESH_SECS", 15)?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.transport
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;
        self.consumer_group_config()
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;

        if self.patients_topic.trim().is_empty() {
            return Err(AppError::Config("patients topic must not be empty".into()));
        }
        if self.relay.page_size == 0 {
            return Err(AppError::Config("PAGE_SIZE must be greater than zero".into()));
        }
        if self.relay.poll_interval.is_zero() {
            return Err(AppError::Config("POLL_INTERVAL_SECS must be greater than zero".into()));
        }
        if self.relay.lock_lease.is_zero() {
            return Err(AppError::Config("LOCK_LEASE_SECS must be greater than zero".into()));
        }
        if self.flags.refresh_interval.is_zero() {
            return Err(AppError::Config("FLAG_REFRESH_SECS must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn topic_for(&self, entity: EntityKind) -> &str {
        match entity {
            EntityKind::LabResults => &self.lab_results_topic,
            EntityKind::Patients => &self.patients_topic,
        }
    }

    /// Consumer group over the topics this service merges from.
    pub fn consumer_group_config(&self) -> ConsumerGroupConfig {
        let mut group =
            ConsumerGroupConfig::new(&self.consumer_group, vec![self.lab_results_topic.clone()]);
        group.strategy = self.assignment_strategy;
        group
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<'a, F: Fn(&str) -> Option<String>> Env<'a, F> {
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key).map(|v| v.trim().to_string()) {
            Some(raw) if !raw.is_empty() => raw
                .parse()
                .map_err(|e| AppError::Config(format!("invalid {}={}: {}", key, raw, e))),
            _ => Ok(default),
        }
    }
}
