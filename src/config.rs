use crate::error::ConfigError;
use crate::identity::KeyBuilder;
use crate::rules::{parse_rules, LimitRule, MatchCondition};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Configuration as supplied by the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PluginConfig {
    /// Requests allowed per identity per second
    #[validate(range(min = 1, message = "qps must be greater than 0"))]
    pub qps: i64,

    /// Log each counter key at info level
    pub log: bool,

    /// JSON array of `{type, key, value}` rules
    pub limit_resources_json: String,

    #[validate(length(min = 1, message = "redis_host is required"))]
    pub redis_host: String,

    #[validate(range(min = 1, max = 65535, message = "redis_port must be within 1..=65535"))]
    pub redis_port: i64,

    pub redis_auth: Option<String>,

    #[validate(range(min = 0, message = "redis_db must not be negative"))]
    pub redis_db: i64,

    /// Connect and operation timeout
    #[validate(range(min = 1, message = "redis_timeout_second must be greater than 0"))]
    pub redis_timeout_second: i64,

    pub redis_limit_key_prefix: String,

    /// Suppress the limit/remaining response headers
    pub hide_client_header: bool,

    /// "", "and" or "or"
    #[validate(custom(function = "validate_match_condition"))]
    pub match_condition: String,
}

fn validate_match_condition(value: &str) -> Result<(), ValidationError> {
    if MatchCondition::parse(value).is_some() {
        Ok(())
    } else {
        Err(ValidationError::new("oneof"))
    }
}

/// Connection parameters for the counter store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub timeout: Duration,
}

/// Everything a request evaluation needs, derived once from a valid config.
#[derive(Debug, Clone)]
pub struct Policy {
    pub limit: u64,
    pub rules: Vec<LimitRule>,
    pub condition: MatchCondition,
    pub keys: KeyBuilder,
    pub verbose: bool,
    pub hide_client_headers: bool,
    pub timeout: Duration,
}

impl PluginConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Document)
    }

    /// Validate scalar fields and parse the rule list.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        self.validate()?;
        let rules = parse_rules(&self.limit_resources_json)?;

        Ok(Policy {
            limit: self.qps as u64,
            rules,
            condition: MatchCondition::parse(&self.match_condition).unwrap_or_default(),
            keys: KeyBuilder::new(&self.redis_limit_key_prefix),
            verbose: self.log,
            hide_client_headers: self.hide_client_header,
            timeout: self.timeout(),
        })
    }

    pub fn store_settings(&self) -> Result<StoreSettings, ConfigError> {
        self.validate()?;
        Ok(StoreSettings {
            host: self.redis_host.clone(),
            port: self.redis_port as u16,
            password: self.redis_auth.clone().filter(|p| !p.is_empty()),
            db: self.redis_db,
            timeout: self.timeout(),
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.redis_timeout_second.max(1) as u64)
    }
}
