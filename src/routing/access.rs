//! Access control rules
//!
//! Rules are loaded once at startup and only read afterwards, so the rule
//! set is shared between connection tasks behind an `Arc` without a lock.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

/// Whether a matching rule admits or rejects
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Admit matching input
    Allow,
    /// Reject matching input
    Deny,
}

/// What a rule is evaluated against
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    /// The client's source IP address
    SourceIp,
    /// The requested destination host (IP literal or domain)
    DestinationHost,
}

/// A single access rule
///
/// The pattern supports a single leading and/or trailing `*`:
/// `*` matches everything, `*x*` matches inputs containing `x`,
/// `*x` matches inputs ending with `x`, `x*` matches inputs starting
/// with `x`, anything else must match exactly. Matching ignores ASCII case.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccessRule {
    /// Allow or deny
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    /// Source or destination
    pub target: RuleTarget,
    /// Glob pattern
    pub pattern: String,
}

impl AccessRule {
    /// Create a new rule
    pub fn new(rule_type: RuleType, target: RuleTarget, pattern: impl Into<String>) -> Self {
        AccessRule {
            rule_type,
            target,
            pattern: pattern.into(),
        }
    }

    /// Check whether this rule's pattern matches the input
    pub fn matches(&self, input: &str) -> bool {
        pattern_matches(&self.pattern, input)
    }
}

/// Match an input against a rule pattern
pub fn pattern_matches(pattern: &str, input: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let input = input.to_ascii_lowercase();

    if pattern == "*" {
        return true;
    }

    let leading = pattern.starts_with('*');
    let trailing = pattern.len() > 1 && pattern.ends_with('*');

    match (leading, trailing) {
        (true, true) => input.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => input.ends_with(&pattern[1..]),
        (false, true) => input.starts_with(&pattern[..pattern.len() - 1]),
        (false, false) => input == pattern,
    }
}

/// Source and destination filtering
///
/// Evaluation is deny-overrides: with no rules for a target everything is
/// permitted, otherwise any matching deny rejects, else any matching allow
/// admits, else the input is rejected.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    source_rules: Vec<AccessRule>,
    destination_rules: Vec<AccessRule>,
}

impl AccessControl {
    /// Build from an ordered rule list
    pub fn new(rules: Vec<AccessRule>) -> Self {
        let (source_rules, destination_rules) = rules
            .into_iter()
            .partition(|rule| rule.target == RuleTarget::SourceIp);

        AccessControl {
            source_rules,
            destination_rules,
        }
    }

    /// A rule set that permits everything
    pub fn allow_all() -> Self {
        AccessControl::default()
    }

    /// Load rules from a JSON file, followed by `extra` rules
    ///
    /// A missing file is treated as an empty rule list.
    pub fn load<P: AsRef<Path>>(path: P, extra: &[AccessRule]) -> Result<Self> {
        let path = path.as_ref();
        let mut rules: Vec<AccessRule> = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read rules file: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse rules file: {:?}", path))?
        } else {
            debug!("No rules file at {:?}", path);
            Vec::new()
        };
        rules.extend_from_slice(extra);

        Ok(AccessControl::new(rules))
    }

    /// Number of loaded rules
    pub fn len(&self) -> usize {
        self.source_rules.len() + self.destination_rules.len()
    }

    /// True when no rules are loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check a client source address
    pub fn is_source_allowed(&self, ip: IpAddr) -> bool {
        evaluate(&self.source_rules, &ip.to_string())
    }

    /// Check a destination host
    pub fn is_destination_allowed(&self, host: &str) -> bool {
        evaluate(&self.destination_rules, host)
    }
}

fn evaluate(rules: &[AccessRule], input: &str) -> bool {
    if rules.is_empty() {
        return true;
    }

    let matching = |rule_type: RuleType| {
        rules
            .iter()
            .any(|rule| rule.rule_type == rule_type && rule.matches(input))
    };

    if matching(RuleType::Deny) {
        return false;
    }
    matching(RuleType::Allow)
}
