//! autoinst - rules and classes resolution for unattended installation
//!
//! Probes the machine into a fact table, evaluates a rules document to pick
//! profile fragments, merges them with any declared classes and yields one
//! final profile.

pub mod classes;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod error;
pub mod facts;
pub mod fetch;
pub mod merge;
pub mod pipeline;
pub mod probe;
pub mod process_guard;
pub mod profile;
pub mod rules;
pub mod types;

// Re-export main types for convenience
pub use classes::{ClassDefinition, ClassResolver, ClassSection};
pub use config::{PipelineConfig, XsltConfig};
pub use error::{AutoinstError, Result};
pub use facts::FactTable;
pub use fetch::{DefaultFetcher, FragmentFetcher, FragmentRef, Location, MemoryFetcher};
pub use merge::{InMemoryMerger, MergeEngine, MergeResult, MergeSpec, XsltMerger, merge_documents};
pub use pipeline::{
    AbortCheck, LocationPrompt, NeverAbort, NoRetry, PipelineContext, PipelineOutcome, PipelineStage,
    PipelineTransitionError, ProfileLocationPipeline,
};
pub use probe::{Fact, ProbeSource, StaticProbe, SystemProbe};
pub use process_guard::{AbortFlag, ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use profile::{ProfileDocument, ProfileValue, hash_to_xml, xml_to_hash};
pub use rules::{Predicate, RuleGroup, RuleSet};
pub use types::{MatchType, MergeEngineKind, MergeType, Operator, Scheme};
