//! Predicate evaluation
//!
//! | match_type | Fact value compared as | True when |
//! |------------|------------------------|-----------|
//! | `exact`    | string                 | equal, or match is `*` |
//! | `greater`  | integer                | fact > match |
//! | `lower`    | integer                | fact < match |
//! | `range`    | integer                | low <= fact <= high (`low-high`) |
//! | `regex`    | string                 | pattern found in fact |
//!
//! An absent fact, a non-numeric value under a numeric match type and an
//! invalid pattern all make the predicate false.

use super::RuleGroup;
use crate::facts::FactTable;
use crate::types::{MatchType, Operator};
use regex::Regex;
use tracing::{debug, warn};

/// One field/match/match_type triple of a rule group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    /// Fact key
    pub field: String,
    /// Raw `match` text
    pub pattern: String,
    pub match_type: MatchType,
    /// Custom rules (`custom1`…) compute their fact with this script
    pub script: Option<String>,
}

impl Predicate {
    pub fn new(field: impl Into<String>, pattern: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            field: field.into(),
            pattern: pattern.into(),
            match_type,
            script: None,
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Evaluate against the fact table.
    pub fn matches(&self, facts: &FactTable) -> bool {
        let Some(value) = facts.get(&self.field) else {
            debug!("{}: fact absent, predicate false", self.field);
            return false;
        };

        let result = match self.match_type {
            MatchType::Exact => self.pattern == "*" || value == self.pattern,
            MatchType::Greater => compare_numbers(value, &self.pattern, |v, m| v > m),
            MatchType::Lower => compare_numbers(value, &self.pattern, |v, m| v < m),
            MatchType::Range => in_range(value, &self.pattern),
            MatchType::Regex => match Regex::new(&self.pattern) {
                Ok(re) => re.is_match(value),
                Err(e) => {
                    warn!("{}: invalid regex {:?}: {}", self.field, self.pattern, e);
                    false
                }
            },
        };

        debug!(
            "{} {:?} {} {:?} -> {}",
            self.field, value, self.match_type, self.pattern, result
        );
        result
    }
}

fn parse_number(text: &str) -> Option<i64> {
    text.trim().parse().ok()
}

fn compare_numbers(value: &str, pattern: &str, cmp: impl Fn(i64, i64) -> bool) -> bool {
    match (parse_number(value), parse_number(pattern)) {
        (Some(v), Some(m)) => cmp(v, m),
        _ => false,
    }
}

fn in_range(value: &str, pattern: &str) -> bool {
    let Some((low, high)) = pattern.split_once('-') else {
        warn!("range match {:?} is not of the form low-high", pattern);
        return false;
    };
    match (parse_number(value), parse_number(low), parse_number(high)) {
        (Some(v), Some(lo), Some(hi)) => lo <= v && v <= hi,
        _ => false,
    }
}

/// Evaluate one rule group.
///
/// An empty predicate list never matches, whatever the operator.
pub fn evaluate(group: &RuleGroup, facts: &FactTable) -> bool {
    if group.predicates.is_empty() {
        return false;
    }
    match group.operator {
        Operator::And => group.predicates.iter().all(|p| p.matches(facts)),
        Operator::Or => group.predicates.iter().any(|p| p.matches(facts)),
    }
}
