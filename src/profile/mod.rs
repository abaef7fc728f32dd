//! Profile document model
//!
//! A profile is an arbitrarily nested, string-keyed tree. Instead of
//! duck-typed dictionaries, every node is a [`ProfileValue`] so merge code can
//! dispatch exhaustively on the shape of both sides.
//!
//! Maps are `BTreeMap`s: key order is deterministic, which keeps serialized
//! output stable and structural equality cheap to reason about.

pub mod xml;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use xml::{CONFIG_NS, YAST_NS, hash_to_xml, xml_to_hash};

/// A profile (or profile fragment): top-level map of section name to value.
pub type ProfileDocument = BTreeMap<String, ProfileValue>;

/// One node of a profile tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileValue {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<ProfileValue>),
    Map(ProfileDocument),
}

impl ProfileValue {
    /// Short name of the variant, used in log and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::String(s) => match s.trim() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ProfileValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ProfileDocument> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Render a scalar as the string a rule predicate compares against.
    ///
    /// Lists and maps have no scalar form.
    pub fn to_scalar_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::List(_) | Self::Map(_) => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::List(_) | Self::Map(_))
    }
}

impl fmt::Display for ProfileValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::String(s) => write!(f, "{}", s),
            Self::List(items) => write!(f, "[{} entries]", items.len()),
            Self::Map(map) => write!(f, "{{{} keys}}", map.len()),
        }
    }
}

impl From<&str> for ProfileValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ProfileValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for ProfileValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for ProfileValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<ProfileValue>> for ProfileValue {
    fn from(items: Vec<ProfileValue>) -> Self {
        Self::List(items)
    }
}

impl From<ProfileDocument> for ProfileValue {
    fn from(map: ProfileDocument) -> Self {
        Self::Map(map)
    }
}

/// Remove rule-only metadata so a rules document or rule result can be
/// treated as a plain profile.
pub fn cleanup(document: &ProfileDocument) -> ProfileDocument {
    document
        .iter()
        .filter(|(key, _)| key.as_str() != "rules")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Build a map from `(key, value)` pairs.
///
/// Mostly a convenience for tests and for callers assembling small documents.
pub fn map<K, V, I>(entries: I) -> ProfileDocument
where
    K: Into<String>,
    V: Into<ProfileValue>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
