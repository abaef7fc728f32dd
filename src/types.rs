//! Type-safe vocabulary shared by the rules, fetch and merge layers
//!
//! These enums replace the string constants found in rules documents and
//! profile locations, so typos are caught when a document is parsed rather
//! than silently evaluating to "no match".

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How a predicate compares the fact value with its `match` string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// String equality (`*` accepts any present value)
    #[default]
    Exact,
    /// Fact value is numerically greater than the match
    Greater,
    /// Fact value is numerically lower than the match
    Lower,
    /// Match is `low-high`, inclusive
    Range,
    /// Match is a regular expression searched in the fact value
    Regex,
}

/// How the predicates of one rule group are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    And,
    Or,
}

/// Per-key merge policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MergeType {
    /// Concatenate base then overlay, dropping structural duplicates
    List,
    /// Recursive overlay, overlay wins on scalar conflicts
    Map,
}

/// Retrieval scheme of a profile location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    File,
    Http,
    Https,
    Ftp,
    Tftp,
    /// Relative to the active profile's own location
    Relurl,
    /// Local removable media (first configured media root holding the path)
    Floppy,
    Usb,
    /// Service discovery; resolves to another location
    Slp,
}

/// Which implementation performs merge steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MergeEngineKind {
    /// Pure in-memory merge
    #[default]
    InMemory,
    /// External `xsltproc` transform with the merge stylesheet
    Xslt,
}
