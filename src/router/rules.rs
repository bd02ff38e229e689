//! Routing rules: method-name patterns mapped to a preferred target server.
//!
//! Conditions are a closed set evaluated by one exhaustive matcher, so a
//! misspelled condition fails at load time instead of being silently ignored.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{RuleConfig, ServerDescriptor};
use crate::error::GatewayError;

/// Extra constraint a rule's target must satisfy to be a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Target's category must equal this value.
    CategoryEquals(String),
    /// Target's priority must be at least this value.
    MinPriority(i32),
    /// Target's `auth_required` flag must equal this value.
    RequiresAuth(bool),
}

impl RuleCondition {
    pub fn holds(&self, server: &ServerDescriptor) -> bool {
        match self {
            Self::CategoryEquals(category) => server.category == *category,
            Self::MinPriority(min) => server.priority >= *min,
            Self::RequiresAuth(required) => server.auth_required == *required,
        }
    }
}

/// How a rule matches method names.
#[derive(Debug, Clone)]
pub enum RulePattern {
    /// Plain substring match.
    Literal(String),
    Regex(Regex),
}

impl RulePattern {
    pub fn matches(&self, method: &str) -> bool {
        match self {
            Self::Literal(needle) => method.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(method),
        }
    }

    /// The pattern's source text.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(needle) => needle,
            Self::Regex(re) => re.as_str(),
        }
    }
}

/// A compiled routing rule.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub pattern: RulePattern,
    pub target: String,
    pub priority: i32,
    pub conditions: Vec<RuleCondition>,
}

impl RoutingRule {
    /// Compile a config rule, rejecting invalid regexes.
    pub fn compile(config: &RuleConfig) -> crate::Result<Self> {
        let pattern = if config.regex {
            let re = Regex::new(&config.pattern).map_err(|e| {
                GatewayError::Configuration(config.pattern.clone(), e.to_string())
            })?;
            RulePattern::Regex(re)
        } else {
            if config.pattern.is_empty() {
                return Err(GatewayError::Configuration(
                    config.target.clone(),
                    "literal rule pattern must not be empty".to_string(),
                ));
            }
            RulePattern::Literal(config.pattern.clone())
        };

        Ok(Self {
            pattern,
            target: config.target.clone(),
            priority: config.priority,
            conditions: config.conditions.clone(),
        })
    }

    pub fn matches(&self, method: &str) -> bool {
        self.pattern.matches(method)
    }

    /// Whether every condition holds against the target's descriptor.
    pub fn admits(&self, server: &ServerDescriptor) -> bool {
        self.conditions.iter().all(|c| c.holds(server))
    }
}

/// Serializable view of a rule, for listings and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSummary {
    pub pattern: String,
    pub regex: bool,
    pub target: String,
    pub priority: i32,
    pub conditions: Vec<RuleCondition>,
}

impl From<&RoutingRule> for RuleSummary {
    fn from(rule: &RoutingRule) -> Self {
        Self {
            pattern: rule.pattern.as_str().to_string(),
            regex: matches!(rule.pattern, RulePattern::Regex(_)),
            target: rule.target.clone(),
            priority: rule.priority,
            conditions: rule.conditions.clone(),
        }
    }
}

/// Insert `rule` after every rule of equal or higher priority, keeping the
/// list sorted by descending priority with ties in insertion order.
pub(crate) fn insert_sorted(rules: &mut Vec<RoutingRule>, rule: RoutingRule) {
    let idx = rules
        .iter()
        .position(|r| r.priority < rule.priority)
        .unwrap_or(rules.len());
    rules.insert(idx, rule);
}
