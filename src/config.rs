use crate::error::TallyError;
use crate::retry::RetryPolicy;
use crate::summary::{KafkaConfig, DEFAULT_SUMMARY_TOPIC};
use ::config::{Config as Cfg, Environment, File};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

/// Settings of a tally run.
#[derive(Debug, Deserialize, Clone)]
pub struct TallyConfig {
    #[serde(default = "default_account_batch_size")]
    pub account_batch_size: usize,
    /// Products worth tallying. Anything else a host declares is ignored.
    #[serde(default)]
    pub applicable_products: BTreeSet<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub summary: Option<SummaryConfig>,
}

/// Where tally summaries are published.
#[derive(Debug, Deserialize, Clone)]
pub struct SummaryConfig {
    pub bootstrap_servers: String,
    #[serde(default = "default_summary_topic")]
    pub topic: String,
    #[serde(default)]
    pub producer_overrides: HashMap<String, String>,
}

fn default_account_batch_size() -> usize {
    500
}

fn default_summary_topic() -> String {
    DEFAULT_SUMMARY_TOPIC.to_string()
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            account_batch_size: default_account_batch_size(),
            applicable_products: BTreeSet::new(),
            retry: RetryPolicy::default(),
            summary: None,
        }
    }
}

impl TallyConfig {
    /// Reads an optional `tally.{toml,json,yaml}` file, then `TALLY__*`
    /// environment variables on top of it.
    pub fn load() -> Result<Self, TallyError> {
        let config = Cfg::builder()
            .add_source(File::with_name("tally").required(false))
            .add_source(Environment::with_prefix("TALLY").separator("__"))
            .build()?;

        Self::from_config(config)
    }

    pub fn from_config(config: Cfg) -> Result<Self, TallyError> {
        let tally: TallyConfig = config.try_deserialize()?;
        tally.validate()?;
        Ok(tally)
    }

    pub fn validate(&self) -> Result<(), TallyError> {
        if self.account_batch_size == 0 {
            return Err(TallyError::InvalidConfig(
                "account_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(TallyError::InvalidConfig(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl SummaryConfig {
    pub fn kafka_config(&self) -> KafkaConfig {
        KafkaConfig::new(&self.bootstrap_servers)
            .with_overrides(self.producer_overrides.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::TallyConfig;
    use crate::error::TallyError;
    use ::config::{Config, File, FileFormat};

    fn parse(toml: &str) -> Result<TallyConfig, TallyError> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        TallyConfig::from_config(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.account_batch_size, 500);
        assert!(config.applicable_products.is_empty());
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.summary.is_none());
    }

    #[test]
    fn test_full_configuration() {
        let config = parse(
            r#"
            account_batch_size = 2
            applicable_products = ["RHEL", "RHEL Workstation"]

            [retry]
            max_attempts = 2
            initial_backoff_ms = 10

            [summary]
            bootstrap_servers = "localhost:9092"

            [summary.producer_overrides]
            acks = "all"
            "#,
        )
        .unwrap();

        assert_eq!(config.account_batch_size, 2);
        assert!(config.applicable_products.contains("RHEL Workstation"));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 10);
        assert_eq!(config.retry.max_backoff_ms, 10_000);
        let summary = config.summary.unwrap();
        assert_eq!(summary.topic, "tally-summary");
        assert_eq!(summary.bootstrap_servers, "localhost:9092");

        let client_config = summary.kafka_config().client_config();
        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client_config.get("acks"), Some("all"));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        assert!(matches!(
            parse("account_batch_size = 0"),
            Err(TallyError::InvalidConfig(_))
        ));
    }
}
