//! Rate limit identities and the counter keys derived from them.

use crate::error::HostError;
use crate::host::CallerContext;

/// Namespace every counter key lives under.
pub const NAMESPACE: &str = "kong:customratelimit:";

/// Window unit recorded in the key.
pub const WINDOW_UNIT: &str = "qps";

/// Compose the identity for a matched request.
///
/// Caller segments are added in the order consumer, service, route and only
/// when non-empty. A lookup error aborts the whole build: falling back to a
/// shorter identity would merge distinct callers into one counter.
pub fn build_identity<C>(caller: &C, matched: &str) -> Result<String, HostError>
where
    C: CallerContext + ?Sized,
{
    let consumer = caller.consumer_id()?;
    let service = caller.service_id()?;
    let route = caller.route_id()?;

    let mut parts: Vec<&str> = Vec::with_capacity(7);
    for (label, id) in [
        ("consumer", &consumer),
        ("service", &service),
        ("route", &route),
    ] {
        if let Some(id) = id.as_deref().filter(|id| !id.is_empty()) {
            parts.push(label);
            parts.push(id);
        }
    }
    parts.push(matched);

    Ok(parts.join(":"))
}

/// Builds counter keys under a configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// A configured prefix containing `:` is taken as-is, otherwise `:` is appended.
    pub fn new(configured: &str) -> Self {
        let prefix = if configured.is_empty() {
            NAMESPACE.to_string()
        } else if configured.contains(':') {
            format!("{}{}", configured, NAMESPACE)
        } else {
            format!("{}:{}", configured, NAMESPACE)
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn counter_key(&self, identity: &str, window: u64) -> String {
        format!("{}{}:{}:{}", self.prefix, identity, WINDOW_UNIT, window)
    }
}
