//! The per-request admission pipeline.
//!
//! `match rules -> build identity -> count -> allow | deny`. Any failure
//! along the way (bad configuration, identity lookup, store trouble, even a
//! panic) ends in [`Decision::NotLimited`]; only a counted quota breach denies.

use crate::config::{PluginConfig, Policy};
use crate::error::{Error, Result};
use crate::evaluator::evaluate;
use crate::host::{CallerContext, RequestAccessors, ResponseWriter};
use crate::identity::build_identity;
use crate::quota::QuotaCounter;
use crate::store::{CounterStore, RedisStore};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const DENY_STATUS: u16 = 429;
pub const DENY_BODY: &str = "API rate limit exceeded";

/// Outcome of admission control for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not subject to limiting, or limiting could not be evaluated.
    NotLimited,
    Allow {
        limit: u64,
        remaining: u64,
        annotate: bool,
    },
    Deny {
        limit: u64,
        annotate: bool,
    },
}

impl Decision {
    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Deny { .. })
    }

    /// Headers to attach to the response.
    pub fn annotations(&self) -> Vec<(&'static str, String)> {
        match *self {
            Decision::Allow {
                limit,
                remaining,
                annotate: true,
            } => vec![
                (LIMIT_HEADER, limit.to_string()),
                (REMAINING_HEADER, remaining.to_string()),
            ],
            Decision::Deny {
                limit,
                annotate: true,
            } => vec![
                (LIMIT_HEADER, limit.to_string()),
                (REMAINING_HEADER, "0".to_string()),
            ],
            _ => Vec::new(),
        }
    }

    /// Write the decision onto the host response.
    pub fn apply<W>(&self, response: &mut W)
    where
        W: ResponseWriter + ?Sized,
    {
        for (name, value) in self.annotations() {
            if let Err(err) = response.set_header(name, &value) {
                warn!(target: "custom_ratelimit::decision", header = name, error = %err, "failed to set header");
            }
        }
        if self.is_denied() {
            response.exit(DENY_STATUS, DENY_BODY);
        }
    }
}

struct Engine {
    policy: Policy,
    counter: QuotaCounter,
    store: Arc<dyn CounterStore>,
}

/// Admission control for one configured plugin instance.
///
/// Built once from configuration and shared across concurrent requests.
/// An invalid configuration does not fail construction; every request is
/// then let through and the error logged.
pub struct Admission {
    engine: std::result::Result<Engine, Error>,
    clock: fn() -> u64,
}

impl Admission {
    pub fn new(config: &PluginConfig, store: Arc<dyn CounterStore>) -> Self {
        let engine = config
            .policy()
            .map(|policy| Engine {
                counter: QuotaCounter::new(policy.limit, policy.timeout),
                policy,
                store,
            })
            .map_err(Error::from);
        Self::from_engine(engine)
    }

    /// Use a Redis store described by the configuration.
    pub fn connect(config: &PluginConfig) -> Self {
        let store = config
            .store_settings()
            .map_err(Error::from)
            .and_then(|settings| RedisStore::new(&settings).map_err(Error::from));

        match store {
            Ok(store) => Self::new(config, Arc::new(store)),
            Err(err) => Self::from_engine(Err(err)),
        }
    }

    fn from_engine(engine: std::result::Result<Engine, Error>) -> Self {
        if let Err(err) = &engine {
            error!(target: "custom_ratelimit::decision", error = %err, "rate limiting disabled");
        }
        Self {
            engine,
            clock: unix_now,
        }
    }

    /// Replace the source of the current window (unix seconds).
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.engine.as_ref().ok().map(|engine| &engine.policy)
    }

    pub fn store(&self) -> Option<&Arc<dyn CounterStore>> {
        self.engine.as_ref().ok().map(|engine| &engine.store)
    }

    /// Decide using the current second as the window.
    pub async fn check<R>(&self, request: &R) -> Decision
    where
        R: RequestAccessors + CallerContext + Sync + ?Sized,
    {
        self.decide(request, (self.clock)()).await
    }

    /// Decide for the window starting at `window` (unix seconds).
    pub async fn decide<R>(&self, request: &R, window: u64) -> Decision
    where
        R: RequestAccessors + CallerContext + Sync + ?Sized,
    {
        let engine = match &self.engine {
            Ok(engine) => engine,
            Err(err) => {
                warn!(target: "custom_ratelimit::decision", error = %err, "invalid configuration, request not limited");
                return Decision::NotLimited;
            }
        };

        match AssertUnwindSafe(engine.run(request, window))
            .catch_unwind()
            .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                warn!(target: "custom_ratelimit::decision", error = %err, "request not limited");
                Decision::NotLimited
            }
            Err(panic) => {
                error!(
                    target: "custom_ratelimit::decision",
                    panic = %panic_message(panic.as_ref()),
                    "rate limit evaluation panicked, request not limited"
                );
                Decision::NotLimited
            }
        }
    }
}

impl Engine {
    async fn run<R>(&self, request: &R, window: u64) -> Result<Decision>
    where
        R: RequestAccessors + CallerContext + Sync + ?Sized,
    {
        let policy = &self.policy;

        let Some(matched) = evaluate(&policy.rules, policy.condition, request) else {
            debug!(target: "custom_ratelimit::decision", "no rule matched");
            return Ok(Decision::NotLimited);
        };

        let identity = build_identity(request, &matched)?;
        let key = policy.keys.counter_key(&identity, window);
        if policy.verbose {
            info!(target: "custom_ratelimit::decision", key = %key, "rate limit key");
        } else {
            debug!(target: "custom_ratelimit::decision", key = %key, "rate limit key");
        }

        let check = self
            .counter
            .increment_and_check(self.store.as_ref(), &key)
            .await?;
        let annotate = !policy.hide_client_headers;

        if check.exceeded {
            info!(
                target: "custom_ratelimit::decision",
                key = %key,
                limit = check.limit,
                "rate limit exceeded"
            );
            Ok(Decision::Deny {
                limit: check.limit,
                annotate,
            })
        } else {
            Ok(Decision::Allow {
                limit: check.limit,
                remaining: check.reported_remaining(),
                annotate,
            })
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HostError, StoreError};
    use crate::host::{HostResult, RecordedResponse, StaticRequest};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    const WINDOW: u64 = 1600067356;

    fn config(qps: i64) -> PluginConfig {
        PluginConfig {
            qps,
            limit_resources_json: r#"[{"type": "header", "key": "k", "value": "a,b"}]"#
                .to_string(),
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_timeout_second: 2,
            redis_limit_key_prefix: "nicktest".to_string(),
            ..PluginConfig::default()
        }
    }

    fn matching_request() -> StaticRequest {
        StaticRequest::new().with_header("k", "b").with_consumer("c1")
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr_with_first_expiry(
            &self,
            _key: &str,
            _by: i64,
            _ttl: Duration,
        ) -> std::result::Result<Option<i64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl CounterStore for PanickingStore {
        async fn incr_with_first_expiry(
            &self,
            _key: &str,
            _by: i64,
            _ttl: Duration,
        ) -> std::result::Result<Option<i64>, StoreError> {
            panic!("store exploded");
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    struct NoConsumer(StaticRequest);

    impl RequestAccessors for NoConsumer {
        fn header(&self, name: &str) -> HostResult<Option<String>> {
            self.0.header(name)
        }

        fn query_arg(&self, name: &str) -> HostResult<Option<String>> {
            self.0.query_arg(name)
        }

        fn raw_body(&self) -> HostResult<Option<String>> {
            self.0.raw_body()
        }
    }

    impl CallerContext for NoConsumer {
        fn consumer_id(&self) -> HostResult<Option<String>> {
            Err(HostError::new("no consumer object"))
        }

        fn service_id(&self) -> HostResult<Option<String>> {
            Ok(None)
        }

        fn route_id(&self) -> HostResult<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_allow_then_deny() {
        let store = Arc::new(MemoryStore::new());
        let admission = Admission::new(&config(2), store.clone());
        let request = matching_request();

        let first = admission.decide(&request, WINDOW).await;
        assert_eq!(
            first,
            Decision::Allow {
                limit: 2,
                remaining: 1,
                annotate: true
            }
        );
        let second = admission.decide(&request, WINDOW).await;
        assert_eq!(
            second,
            Decision::Allow {
                limit: 2,
                remaining: 0,
                annotate: true
            }
        );
        let third = admission.decide(&request, WINDOW).await;
        assert!(third.is_denied());

        assert_eq!(
            store.value("nicktest:kong:customratelimit:consumer:c1:b:qps:1600067356"),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_new_window_resets() {
        let admission = Admission::new(&config(1), Arc::new(MemoryStore::new()));
        let request = matching_request();

        assert!(!admission.decide(&request, WINDOW).await.is_denied());
        assert!(admission.decide(&request, WINDOW).await.is_denied());
        assert!(!admission.decide(&request, WINDOW + 1).await.is_denied());
    }

    #[tokio::test]
    async fn test_check_uses_clock_window() {
        let store = Arc::new(MemoryStore::new());
        let admission = Admission::new(&config(1), store.clone()).with_clock(|| WINDOW);

        assert!(!admission.check(&matching_request()).await.is_denied());
        assert!(admission.check(&matching_request()).await.is_denied());
        assert_eq!(
            store.value("nicktest:kong:customratelimit:consumer:c1:b:qps:1600067356"),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_unmatched_request_is_not_limited() {
        let admission = Admission::new(&config(1), Arc::new(MemoryStore::new()));
        let request = StaticRequest::new().with_header("k", "z");
        assert_eq!(admission.decide(&request, WINDOW).await, Decision::NotLimited);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_open() {
        let admission = Admission::new(&config(0), Arc::new(MemoryStore::new()));
        assert!(admission.policy().is_none());
        assert_eq!(
            admission.decide(&matching_request(), WINDOW).await,
            Decision::NotLimited
        );
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let admission = Admission::new(&config(1), Arc::new(BrokenStore));
        let decision = admission.decide(&matching_request(), WINDOW).await;
        assert_eq!(decision, Decision::NotLimited);

        let mut response = RecordedResponse::default();
        decision.apply(&mut response);
        assert_eq!(response, RecordedResponse::default());
    }

    #[tokio::test]
    async fn test_identity_failure_fails_open() {
        let store = Arc::new(MemoryStore::new());
        let admission = Admission::new(&config(1), store.clone());
        let request = NoConsumer(StaticRequest::new().with_header("k", "a"));

        assert_eq!(admission.decide(&request, WINDOW).await, Decision::NotLimited);
        assert_eq!(store.value("nicktest:kong:customratelimit:a:qps:1600067356"), None);
    }

    #[tokio::test]
    async fn test_panic_fails_open() {
        let admission = Admission::new(&config(1), Arc::new(PanickingStore));
        assert_eq!(
            admission.decide(&matching_request(), WINDOW).await,
            Decision::NotLimited
        );
    }

    #[tokio::test]
    async fn test_hidden_headers() {
        let mut config = config(1);
        config.hide_client_header = true;
        let admission = Admission::new(&config, Arc::new(MemoryStore::new()));

        let decision = admission.decide(&matching_request(), WINDOW).await;
        assert!(decision.annotations().is_empty());

        let decision = admission.decide(&matching_request(), WINDOW).await;
        let mut response = RecordedResponse::default();
        decision.apply(&mut response);
        assert!(response.headers.is_empty());
        assert_eq!(response.exit, Some((429, DENY_BODY.to_string())));
    }

    #[test]
    fn test_apply_allow() {
        let decision = Decision::Allow {
            limit: 30,
            remaining: 29,
            annotate: true,
        };
        let mut response = RecordedResponse::default();
        decision.apply(&mut response);
        assert_eq!(response.header(LIMIT_HEADER), Some("30"));
        assert_eq!(response.header(REMAINING_HEADER), Some("29"));
        assert_eq!(response.exit, None);
    }

    #[test]
    fn test_connect_with_invalid_port_disables_limiting() {
        let mut config = config(10);
        config.redis_port = 70000;
        let admission = Admission::connect(&config);
        assert!(admission.store().is_none());
    }
}
