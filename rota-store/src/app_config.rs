use chrono::NaiveTime;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub rules: RuleConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Upper bound on how long one job run may hold its lease.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

fn default_lease_seconds() -> u64 { 1800 }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_notification_topic")]
    pub topic: String,
}

fn default_notification_topic() -> String { "notifications.push".to_string() }

/// Fixed daily fire times, `HH:mm` in UTC.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_batch_times")]
    pub batch_clustering_times: Vec<String>,
    #[serde(default = "default_sweep_time")]
    pub expiry_sweep_time: String,
}

fn default_batch_times() -> Vec<String> {
    vec!["00:00".to_string(), "12:00".to_string(), "18:00".to_string()]
}

fn default_sweep_time() -> String { "01:00".to_string() }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            batch_clustering_times: default_batch_times(),
            expiry_sweep_time: default_sweep_time(),
        }
    }
}

impl ScheduleConfig {
    pub fn batch_times(&self) -> Result<Vec<NaiveTime>, config::ConfigError> {
        self.batch_clustering_times.iter().map(|t| parse_time(t)).collect()
    }

    pub fn sweep_times(&self) -> Result<Vec<NaiveTime>, config::ConfigError> {
        Ok(vec![parse_time(&self.expiry_sweep_time)?])
    }
}

fn parse_time(raw: &str) -> Result<NaiveTime, config::ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| config::ConfigError::Message(format!("invalid schedule time {:?}: {}", raw, e)))
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuleConfig {
    /// Fixes the rotation shuffle; random when absent.
    pub rng_seed: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `ROTA__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("ROTA").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml(raw: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_empty_config() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.database.is_none());
        assert_eq!(config.schedule.batch_times().unwrap().len(), 3);
        assert_eq!(
            config.schedule.sweep_times().unwrap(),
            vec![NaiveTime::from_hms_opt(1, 0, 0).unwrap()]
        );
        assert_eq!(config.rules.rng_seed, None);
    }

    #[test]
    fn test_postgres_section() {
        let config = Config::from_toml(
            r#"
            [store]
            backend = "postgres"

            [database]
            url = "postgres://rota@localhost/rota"

            [redis]
            url = "redis://localhost"

            [schedule]
            batch_clustering_times = ["06:00"]

            [rules]
            rng_seed = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.database.unwrap().max_connections, 5);
        assert_eq!(config.redis.unwrap().lease_seconds, 1800);
        assert_eq!(config.schedule.batch_clustering_times, vec!["06:00"]);
        assert_eq!(config.rules.rng_seed, Some(7));
    }

    #[test]
    fn test_rejects_bad_schedule_time() {
        let config = Config::from_toml(
            r#"
            [schedule]
            expiry_sweep_time = "25:99"
            "#,
        )
        .unwrap();
        assert!(config.schedule.sweep_times().is_err());
    }
}
