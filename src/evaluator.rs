//! Combining rule matches into a single limiting decision.

use crate::host::RequestAccessors;
use crate::matcher::match_rule;
use crate::rules::{LimitRule, MatchCondition};

/// Evaluate every rule under `condition`.
///
/// Returns the matched identity when the request should be limited, `None`
/// otherwise. AND stops at the first miss, OR stops at the first hit.
pub fn evaluate<R>(rules: &[LimitRule], condition: MatchCondition, request: &R) -> Option<String>
where
    R: RequestAccessors + ?Sized,
{
    match condition {
        MatchCondition::Or => rules.iter().find_map(|rule| {
            let outcome = match_rule(rule, request);
            outcome.matched.then_some(outcome.value)
        }),
        MatchCondition::And => {
            let mut values = Vec::with_capacity(rules.len());
            for rule in rules {
                let outcome = match_rule(rule, request);
                if !outcome.matched {
                    return None;
                }
                values.push(outcome.value);
            }
            (!values.is_empty()).then(|| values.join(":"))
        }
    }
}
