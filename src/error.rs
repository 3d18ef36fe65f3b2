//! Error types for admission control.
//!
//! Every variant here is handled the same way by the decision pipeline: the
//! request proceeds unthrottled and the error is logged.

use std::time::Duration;
use thiserror::Error;

/// Malformed or out-of-range configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("malformed configuration document: {0}")]
    Document(serde_json::Error),

    #[error("limit_resources_json with incorrect json format, {0}")]
    RulesJson(#[from] serde_json::Error),

    #[error("limit_resources_json with empty value")]
    EmptyRuleField,

    #[error("limit_resources_json contains no rules")]
    NoRules,

    #[error("unknown source type '{0}'")]
    UnknownSource(String),
}

/// A host runtime accessor that could not produce a value.
#[derive(Debug, Clone, Error)]
#[error("host accessor failed: {0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure talking to the counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("identity resolution failed: {0}")]
    Identity(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
