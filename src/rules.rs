//! Declarative limit rules and their JSON form.
//!
//! Rules arrive as a JSON array embedded in the configuration:
//!
//! ```json
//! [{"type": "header,query,body", "key": "keyName", "value": "value1,value2"}]
//! ```
//!
//! `type` and `value` are comma-separated lists.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Where a rule looks for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Header,
    Query,
    Body,
    /// Accepted in configuration, never matched.
    Cookie,
    /// Accepted in configuration, never matched.
    Ip,
}

impl SourceKind {
    pub fn is_supported(self) -> bool {
        !matches!(self, SourceKind::Cookie | SourceKind::Ip)
    }
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "header" => Ok(SourceKind::Header),
            "query" => Ok(SourceKind::Query),
            "body" => Ok(SourceKind::Body),
            "cookie" => Ok(SourceKind::Cookie),
            "ip" => Ok(SourceKind::Ip),
            other => Err(ConfigError::UnknownSource(other.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Header => "header",
            SourceKind::Query => "query",
            SourceKind::Body => "body",
            SourceKind::Cookie => "cookie",
            SourceKind::Ip => "ip",
        };
        f.write_str(name)
    }
}

/// How per-rule outcomes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchCondition {
    /// Every rule must match.
    #[default]
    And,
    /// The first matching rule decides.
    Or,
}

impl MatchCondition {
    /// Parses the configured condition. Empty means the default.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "and" => Some(MatchCondition::And),
            "or" => Some(MatchCondition::Or),
            _ => None,
        }
    }
}

/// Raw rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub value: String,
}

/// A validated rule, immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitRule {
    pub sources: Vec<SourceKind>,
    pub key: String,
    pub values: Vec<String>,
}

impl LimitRule {
    pub fn new(sources: Vec<SourceKind>, key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            sources,
            key: key.into(),
            values,
        }
    }

    pub fn accepts(&self, candidate: &str) -> bool {
        self.values.iter().any(|v| v == candidate)
    }
}

impl TryFrom<RuleSpec> for LimitRule {
    type Error = ConfigError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        if spec.kind.is_empty() || spec.key.is_empty() || spec.value.is_empty() {
            return Err(ConfigError::EmptyRuleField);
        }

        let mut sources = Vec::new();
        for token in spec.kind.split(',') {
            let kind = token.parse::<SourceKind>()?;
            if !sources.contains(&kind) {
                sources.push(kind);
            }
        }

        if !sources.iter().any(|kind| kind.is_supported()) {
            warn!(target: "custom_ratelimit::rules", key = %spec.key, "rule has no supported source and will never match");
        }

        let values = spec.value.split(',').map(str::to_string).collect();

        Ok(LimitRule {
            sources,
            key: spec.key,
            values,
        })
    }
}

/// Parse the configured JSON rule list.
pub fn parse_rules(json: &str) -> Result<Vec<LimitRule>, ConfigError> {
    let specs: Vec<RuleSpec> = serde_json::from_str(json)?;
    if specs.is_empty() {
        return Err(ConfigError::NoRules);
    }
    specs.into_iter().map(LimitRule::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
    [{
        "type": "header,cookie,ip",
        "key": "keyName",
        "value": "value1,value2,value3"
    }, {
        "type": "body",
        "key": "orderId",
        "value": "order1,order2,order3"
    }]
    "#;

    #[test]
    fn test_parse_rules() {
        let rules = parse_rules(RULES).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0].sources,
            vec![SourceKind::Header, SourceKind::Cookie, SourceKind::Ip]
        );
        assert_eq!(rules[0].key, "keyName");
        assert_eq!(rules[0].values, vec!["value1", "value2", "value3"]);
        assert_eq!(rules[1].sources, vec![SourceKind::Body]);
    }

    #[test]
    fn test_source_kind_is_case_insensitive() {
        assert_eq!("HEADER".parse::<SourceKind>().unwrap(), SourceKind::Header);
        assert_eq!(" Query".parse::<SourceKind>().unwrap(), SourceKind::Query);
        assert!(matches!(
            "get".parse::<SourceKind>(),
            Err(ConfigError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_duplicate_sources_collapse() {
        let rules = parse_rules(r#"[{"type": "header,Header,query", "key": "k", "value": "a"}]"#)
            .unwrap();
        assert_eq!(rules[0].sources, vec![SourceKind::Header, SourceKind::Query]);
    }

    #[test]
    fn test_empty_fields_rejected() {
        for json in [
            r#"[{"type": "", "key": "k", "value": "a"}]"#,
            r#"[{"type": "header", "key": "", "value": "a"}]"#,
            r#"[{"type": "header", "key": "k", "value": ""}]"#,
        ] {
            assert!(matches!(parse_rules(json), Err(ConfigError::EmptyRuleField)));
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        let json = r#"[{ type: "header", "key": "k", "value": "a" }]"#;
        assert!(matches!(parse_rules(json), Err(ConfigError::RulesJson(_))));
        assert!(matches!(parse_rules("[]"), Err(ConfigError::NoRules)));
    }

    #[test]
    fn test_empty_value_inside_list_is_kept() {
        let rules = parse_rules(r#"[{"type": "header", "key": "k", "value": "a,"}]"#).unwrap();
        assert!(rules[0].accepts(""));
        assert!(rules[0].accepts("a"));
        assert!(!rules[0].accepts("b"));
    }

    #[test]
    fn test_match_condition_parse() {
        assert_eq!(MatchCondition::parse(""), Some(MatchCondition::And));
        assert_eq!(MatchCondition::parse("and"), Some(MatchCondition::And));
        assert_eq!(MatchCondition::parse("or"), Some(MatchCondition::Or));
        assert_eq!(MatchCondition::parse("test"), None);
    }
}
