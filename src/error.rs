//! Error handling module for the rules/classes engine
//!
//! Provides the error taxonomy shared by every stage of profile construction.
//! Probe failures are absorbed into "fact absent" by the fact table and only
//! surface in logs; fetch and parse failures travel back to the orchestrator
//! as values so it can decide between retry, abort and fallback.

use crate::pipeline::{PipelineStage, PipelineTransitionError};
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum AutoinstError {
    /// A fact could not be probed (missing hardware, failed command)
    #[error("Probe error: {0}")]
    Probe(String),

    /// A rules file, fragment or class could not be retrieved
    #[error("Could not fetch {location}: {reason}")]
    Fetch { location: String, reason: String },

    /// A rules, classes or profile document is malformed
    #[error("Could not parse {what}: {reason}")]
    Parse { what: String, reason: String },

    /// A merge step failed (external transform exited non-zero)
    #[error("Could not build the configuration (exit code {exit_code}): {stderr}")]
    Merge { exit_code: i32, stderr: String },

    /// Configuration errors (loading, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A profile key cannot be written as an XML element
    #[error("Cannot serialize profile: {0:?} is not a valid XML element name")]
    InvalidElementName(String),

    /// The operator confirmed an abort at a pipeline checkpoint
    #[error("Aborted by user at stage: {stage}")]
    Aborted { stage: PipelineStage },

    /// The pipeline attempted an invalid stage transition
    #[error(transparent)]
    Transition(#[from] PipelineTransitionError),

    /// IO errors (file operations, spawning commands)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, AutoinstError>;

impl AutoinstError {
    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a fetch error for the given location
    pub fn fetch(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Create a parse error for the named document
    pub fn parse(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Create a merge error from an external transform outcome
    pub fn merge(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::Merge {
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller may retry with a corrected profile location.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::Parse { .. })
    }

    /// Message shown to the operator for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Fetch { .. } | Self::Parse { .. } => {
                format!("{}\nPlease enter a corrected profile location.", self)
            }
            Self::Merge { stderr, .. } => {
                format!("Could not build the configuration.\n{}", stderr.trim())
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutoinstError::fetch("http://10.0.0.1/rules/rules.xml", "404 Not Found");
        assert_eq!(
            err.to_string(),
            "Could not fetch http://10.0.0.1/rules/rules.xml: 404 Not Found"
        );

        let err = AutoinstError::merge(6, "xsltproc: no such file");
        assert_eq!(
            err.to_string(),
            "Could not build the configuration (exit code 6): xsltproc: no such file"
        );
    }

    #[test]
    fn test_invalid_element_name_is_not_retryable() {
        let err = AutoinstError::InvalidElementName("two words".to_string());
        assert_eq!(
            err.to_string(),
            "Cannot serialize profile: \"two words\" is not a valid XML element name"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AutoinstError = io_err.into();
        assert!(matches!(err, AutoinstError::Io(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AutoinstError::fetch("x", "y").is_retryable());
        assert!(AutoinstError::parse("rules", "unexpected end").is_retryable());
        assert!(!AutoinstError::merge(1, "boom").is_retryable());
        assert!(!AutoinstError::probe("no ip").is_retryable());
        assert!(
            !AutoinstError::Aborted {
                stage: PipelineStage::EvaluateRules
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_user_message_asks_for_location_on_fetch_failure() {
        let msg = AutoinstError::fetch("file:///x.xml", "missing").user_message();
        assert!(msg.contains("corrected profile location"));

        let msg = AutoinstError::merge(2, "  parser error  \n").user_message();
        assert!(msg.starts_with("Could not build the configuration."));
        assert!(msg.ends_with("parser error"));
    }
}
