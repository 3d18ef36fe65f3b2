//! Matching a single rule against a request.

use crate::host::RequestAccessors;
use crate::rules::{LimitRule, SourceKind};

/// Result of matching one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    pub value: String,
}

impl MatchOutcome {
    pub fn hit(value: impl Into<String>) -> Self {
        Self {
            matched: true,
            value: value.into(),
        }
    }

    pub fn miss() -> Self {
        Self {
            matched: false,
            value: String::new(),
        }
    }
}

/// Try each source of `rule` in declaration order and stop at the first hit.
///
/// Absent and unreadable attributes are skipped alike.
pub fn match_rule<R>(rule: &LimitRule, request: &R) -> MatchOutcome
where
    R: RequestAccessors + ?Sized,
{
    for source in &rule.sources {
        if let Some(value) = match_source(*source, rule, request) {
            return MatchOutcome::hit(value);
        }
    }
    MatchOutcome::miss()
}

fn match_source<R>(source: SourceKind, rule: &LimitRule, request: &R) -> Option<String>
where
    R: RequestAccessors + ?Sized,
{
    match source {
        SourceKind::Header => request
            .header(&rule.key)
            .ok()
            .flatten()
            .filter(|found| rule.accepts(found)),
        SourceKind::Query => request
            .query_arg(&rule.key)
            .ok()
            .flatten()
            .filter(|found| rule.accepts(found)),
        SourceKind::Body => {
            let body = request.raw_body().ok().flatten()?;
            match_body(rule, &body)
        }
        SourceKind::Cookie | SourceKind::Ip => None,
    }
}

/// Look for any `key=value` pair from the rule in a form-encoded body.
fn match_body(rule: &LimitRule, body: &str) -> Option<String> {
    if !body.contains(&rule.key) {
        return None;
    }
    let tokens: Vec<&str> = body.split('&').collect();
    rule.values
        .iter()
        .find(|value| {
            let pair = format!("{}={}", rule.key, value);
            tokens.iter().any(|token| *token == pair)
        })
        .cloned()
}
