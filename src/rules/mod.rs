//! Rule sets
//!
//! A rules document is an ordered list of rule groups. Each group tests facts
//! and names a profile fragment to use when it matches:
//!
//! ```text
//! <rules config:type="list">
//!   <rule>
//!     <hostaddress><match>10.69.57.43</match><match_type>exact</match_type></hostaddress>
//!     <mac><match>000c2903d288</match></mac>
//!     <operator>or</operator>
//!     <result>
//!       <profile>machine12.xml</profile>
//!       <continue config:type="boolean">true</continue>
//!     </result>
//!   </rule>
//! </rules>
//! ```
//!
//! Matching is non-exclusive: every matching group contributes its fragment in
//! file order, so later fragments override earlier ones during the merge. A
//! group whose result says `continue=false` stops evaluation once it matches.

pub mod predicate;

pub use predicate::{Predicate, evaluate};

use crate::error::{AutoinstError, Result};
use crate::facts::FactTable;
use crate::fetch::FragmentRef;
use crate::probe::ProbeSource;
use crate::profile::{ProfileDocument, ProfileValue, xml_to_hash};
use crate::types::{MatchType, Operator};
use std::str::FromStr;
use tracing::{debug, info, warn};

const WHAT: &str = "rules document";

/// One rule: predicates, how to combine them, and the fragment to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleGroup {
    pub predicates: Vec<Predicate>,
    pub operator: Operator,
    pub result: FragmentRef,
    /// `false` makes the rule exclusive: evaluation stops after it matches
    pub continue_matching: bool,
}

/// Ordered rule groups parsed from one rules document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    groups: Vec<RuleGroup>,
}

impl RuleSet {
    pub fn new(groups: Vec<RuleGroup>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[RuleGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Parse a rules document from XML text.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let document = xml_to_hash(xml).map_err(|e| match e {
            AutoinstError::Parse { reason, .. } => AutoinstError::parse(WHAT, reason),
            other => other,
        })?;
        Self::from_document(&document)
    }

    /// Build the rule set from an already parsed document.
    pub fn from_document(document: &ProfileDocument) -> Result<Self> {
        let rules = document
            .get("rules")
            .ok_or_else(|| AutoinstError::parse(WHAT, "no <rules> section"))?;
        let entries = rules.as_list().ok_or_else(|| {
            AutoinstError::parse(WHAT, format!("<rules> must be a list, found a {}", rules.kind()))
        })?;

        let groups = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| parse_group(index, entry))
            .collect::<Result<Vec<_>>>()?;

        debug!("Parsed {} rule groups", groups.len());
        Ok(Self { groups })
    }

    /// `(field, script)` of every custom rule predicate, first occurrence only.
    pub fn custom_scripts(&self) -> Vec<(&str, &str)> {
        let mut scripts: Vec<(&str, &str)> = Vec::new();
        for predicate in self.groups.iter().flat_map(|g| g.predicates.iter()) {
            if let Some(script) = predicate.script.as_deref() {
                if !scripts.iter().any(|(field, _)| *field == predicate.field) {
                    scripts.push((predicate.field.as_str(), script));
                }
            }
        }
        scripts
    }

    /// Run custom rule scripts and return a fact table extended with their
    /// output. Failing scripts leave their fact absent.
    pub fn with_custom_facts(&self, facts: &FactTable, probe: &dyn ProbeSource) -> FactTable {
        let mut extended = facts.clone();
        for (field, script) in self.custom_scripts() {
            match probe.run_script(script) {
                Ok(Some(value)) => {
                    debug!("custom fact {} = {}", field, value);
                    extended = extended.with_fact(field, value);
                }
                Ok(None) => debug!("custom rule {} produced no value", field),
                Err(e) => warn!("custom rule {} failed: {}", field, e),
            }
        }
        extended
    }

    /// Fragment references of the matching groups, in file order.
    pub fn resolve(&self, facts: &FactTable) -> Vec<FragmentRef> {
        let mut matched: Vec<FragmentRef> = Vec::new();
        for (index, group) in self.groups.iter().enumerate() {
            if !evaluate(group, facts) {
                debug!("rule {} did not match", index);
                continue;
            }
            info!("rule {} matched, using {}", index, group.result);
            if !matched.contains(&group.result) {
                matched.push(group.result.clone());
            }
            if !group.continue_matching {
                debug!("rule {} is exclusive, stopping", index);
                break;
            }
        }
        matched
    }
}

fn parse_group(index: usize, entry: &ProfileValue) -> Result<RuleGroup> {
    let rule = entry.as_map().ok_or_else(|| {
        AutoinstError::parse(WHAT, format!("rule {} must be a map, found a {}", index, entry.kind()))
    })?;

    let mut predicates = Vec::new();
    let mut operator = Operator::default();
    let mut result = None;
    let mut continue_matching = true;

    for (key, value) in rule {
        match key.as_str() {
            "operator" => {
                let text = value.as_str().unwrap_or_default().trim();
                operator = Operator::from_str(text).map_err(|_| {
                    AutoinstError::parse(WHAT, format!("rule {}: unknown operator {:?}", index, text))
                })?;
            }
            "result" => {
                let (fragment, cont) = parse_result(index, value)?;
                result = Some(fragment);
                continue_matching = cont;
            }
            // Interactive confirmation belongs to the installer UI
            "dialog" => debug!("rule {}: ignoring <dialog>", index),
            field => predicates.push(parse_predicate(index, field, value)?),
        }
    }

    let result = result
        .ok_or_else(|| AutoinstError::parse(WHAT, format!("rule {} has no <result>", index)))?;

    Ok(RuleGroup {
        predicates,
        operator,
        result,
        continue_matching,
    })
}

fn parse_result(index: usize, value: &ProfileValue) -> Result<(FragmentRef, bool)> {
    match value {
        ProfileValue::String(profile) if !profile.trim().is_empty() => {
            Ok((FragmentRef::new(profile.trim()), true))
        }
        ProfileValue::Map(result) => {
            let profile = result
                .get("profile")
                .and_then(ProfileValue::as_str)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    AutoinstError::parse(WHAT, format!("rule {}: <result> has no <profile>", index))
                })?;
            let cont = match result.get("continue") {
                None => true,
                Some(flag) => flag.as_bool().ok_or_else(|| {
                    AutoinstError::parse(WHAT, format!("rule {}: <continue> is not a boolean", index))
                })?,
            };
            Ok((FragmentRef::new(profile), cont))
        }
        other => Err(AutoinstError::parse(
            WHAT,
            format!("rule {}: unusable <result> ({})", index, other.kind()),
        )),
    }
}

fn parse_predicate(index: usize, field: &str, value: &ProfileValue) -> Result<Predicate> {
    let body = match value {
        // Shorthand: <hostname>node12</hostname>
        scalar if scalar.is_scalar() => {
            let pattern = scalar.to_scalar_string().unwrap_or_default();
            return Ok(Predicate::new(field, pattern.trim(), MatchType::Exact));
        }
        ProfileValue::Map(body) => body,
        other => {
            return Err(AutoinstError::parse(
                WHAT,
                format!("rule {}: <{}> must be a map, found a {}", index, field, other.kind()),
            ));
        }
    };

    let pattern = body
        .get("match")
        .and_then(ProfileValue::to_scalar_string)
        .ok_or_else(|| {
            AutoinstError::parse(WHAT, format!("rule {}: <{}> has no <match>", index, field))
        })?;

    let match_type = match body.get("match_type").and_then(ProfileValue::as_str) {
        None => MatchType::default(),
        Some(text) => MatchType::from_str(text.trim()).map_err(|_| {
            AutoinstError::parse(
                WHAT,
                format!("rule {}: <{}> has unknown match_type {:?}", index, field, text),
            )
        })?,
    };

    let mut predicate = Predicate::new(field, pattern.trim(), match_type);
    if let Some(script) = body.get("script").and_then(ProfileValue::as_str) {
        predicate = predicate.with_script(script);
    }
    Ok(predicate)
}
