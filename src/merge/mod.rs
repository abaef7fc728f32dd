//! Profile merging
//!
//! Combines a base document with an overlay. For every key present in either
//! document, at any depth:
//!
//! 1. Excluded key (`dont_merge`) → base value kept, overlay value dropped
//! 2. `list` merge type → base entries then overlay entries, structural
//!    duplicates removed
//! 3. `map` merge type → recursive merge, overlay wins on scalar conflicts
//! 4. No merge type → two maps merge recursively, two lists concatenate,
//!    anything else is replaced by the overlay
//!
//! Two engines implement [`MergeEngine`]: [`InMemoryMerger`] and the
//! external-transform [`xslt::XsltMerger`]. Both report through
//! [`MergeResult`] so a failing step never unwinds across the pipeline.

pub mod xslt;

pub use xslt::XsltMerger;

use crate::profile::{ProfileDocument, ProfileValue};
use crate::types::MergeType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Merge policy for one element name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub merge_type: MergeType,
}

impl MergeSpec {
    pub fn list(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            merge_type: MergeType::List,
        }
    }

    pub fn map(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            merge_type: MergeType::Map,
        }
    }
}

/// Outcome of one merge step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Merged document; empty when the step failed
    pub document: ProfileDocument,
    pub exit_code: i32,
    /// Diagnostics of an external transform
    pub stderr: String,
}

impl MergeResult {
    pub fn success(document: ProfileDocument) -> Self {
        Self {
            document,
            exit_code: 0,
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            document: ProfileDocument::new(),
            // A failure must never look like success
            exit_code: if exit_code == 0 { 1 } else { exit_code },
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert into the document, or a merge error carrying the diagnostics.
    pub fn into_result(self) -> crate::error::Result<ProfileDocument> {
        if self.is_success() {
            Ok(self.document)
        } else {
            Err(crate::error::AutoinstError::merge(self.exit_code, self.stderr))
        }
    }
}

/// Executes one merge step.
pub trait MergeEngine {
    fn merge(
        &self,
        base: &ProfileDocument,
        overlay: &ProfileDocument,
        specs: &[MergeSpec],
        exclusions: &BTreeSet<String>,
    ) -> MergeResult;
}

/// Pure in-memory merge engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryMerger;

impl MergeEngine for InMemoryMerger {
    fn merge(
        &self,
        base: &ProfileDocument,
        overlay: &ProfileDocument,
        specs: &[MergeSpec],
        exclusions: &BTreeSet<String>,
    ) -> MergeResult {
        MergeResult::success(merge_documents(base, overlay, specs, exclusions))
    }
}

/// Merge `overlay` over `base`, producing a new document.
pub fn merge_documents(
    base: &ProfileDocument,
    overlay: &ProfileDocument,
    specs: &[MergeSpec],
    exclusions: &BTreeSet<String>,
) -> ProfileDocument {
    let mut merged = base.clone();

    for (key, overlay_value) in overlay {
        if exclusions.contains(key) {
            tracing::debug!("<{}> is excluded from merging, keeping base", key);
            continue;
        }

        let value = match base.get(key) {
            None => overlay_value.clone(),
            Some(base_value) => merge_values(key, base_value, overlay_value, specs, exclusions),
        };
        merged.insert(key.clone(), value);
    }

    merged
}

fn merge_type_for(key: &str, specs: &[MergeSpec]) -> Option<MergeType> {
    specs.iter().find(|s| s.key == key).map(|s| s.merge_type)
}

fn merge_values(
    key: &str,
    base: &ProfileValue,
    overlay: &ProfileValue,
    specs: &[MergeSpec],
    exclusions: &BTreeSet<String>,
) -> ProfileValue {
    match (merge_type_for(key, specs), base, overlay) {
        (Some(MergeType::List) | None, ProfileValue::List(b), ProfileValue::List(o)) => {
            ProfileValue::List(concat_dedup(b, o))
        }
        (Some(MergeType::Map) | None, ProfileValue::Map(b), ProfileValue::Map(o)) => {
            ProfileValue::Map(merge_documents(b, o, specs, exclusions))
        }
        (Some(merge_type), b, o) => {
            tracing::debug!(
                "<{}> declared as {} but holds {} and {}, overlay replaces base",
                key,
                merge_type,
                b.kind(),
                o.kind()
            );
            overlay.clone()
        }
        (None, _, _) => overlay.clone(),
    }
}

fn concat_dedup(base: &[ProfileValue], overlay: &[ProfileValue]) -> Vec<ProfileValue> {
    let mut out: Vec<ProfileValue> = Vec::with_capacity(base.len() + overlay.len());
    for item in base.iter().chain(overlay) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
