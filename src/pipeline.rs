//! Profile location pipeline
//!
//! Orchestrates one unattended-installation profile build. All intermediate
//! state lives in a [`PipelineContext`] owned by the run; collaborators are
//! injected as trait objects so every step can be driven from tests.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! ProbeHardware          (abort checkpoint)
//!     ↓
//! FetchRules ──────────→ Failed (retryable with a corrected location)
//!     ↓
//! EvaluateRules          (abort checkpoint)
//!     ↓
//! MergeMatchedFragments
//!     ↓
//! ResolveClasses         (abort checkpoint)
//!     ↓         ↘
//! MergeClasses    │      (skipped without classes or on a failed class fetch)
//!     ↓         ↙
//! Finalize
//!     ↓
//! Completed
//!
//! (Any stage can transition to Failed)
//! ```

use crate::classes::{ClassResolver, ClassSection};
use crate::config::PipelineConfig;
use crate::error::{AutoinstError, Result};
use crate::facts::FactTable;
use crate::fetch::{FragmentFetcher, FragmentRef, Location};
use crate::merge::MergeEngine;
use crate::probe::ProbeSource;
use crate::process_guard::AbortFlag;
use crate::profile::xml::bytes_to_hash;
use crate::profile::{ProfileDocument, cleanup};
use crate::rules::RuleSet;
use std::collections::BTreeSet;
use std::fmt;
use strum::EnumIter;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Stages
// ============================================================================

/// Pipeline stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
#[repr(u8)]
pub enum PipelineStage {
    NotStarted = 0,
    /// Build the fact table
    ProbeHardware = 1,
    /// Retrieve and parse the rules document
    FetchRules = 2,
    /// Run custom rule scripts and select fragments
    EvaluateRules = 3,
    /// Fetch, clean and merge the selected fragments
    MergeMatchedFragments = 4,
    /// Read the `classes` section and fetch class fragments
    ResolveClasses = 5,
    /// Merge class fragments in declaration order
    MergeClasses = 6,
    Finalize = 7,
    /// Terminal: the final profile is available
    Completed = 8,
    /// Terminal: the run stopped with an error
    Failed = 255,
}

impl PipelineStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Next stage on the regular path, `None` at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::ProbeHardware),
            Self::ProbeHardware => Some(Self::FetchRules),
            Self::FetchRules => Some(Self::EvaluateRules),
            Self::EvaluateRules => Some(Self::MergeMatchedFragments),
            Self::MergeMatchedFragments => Some(Self::ResolveClasses),
            Self::ResolveClasses => Some(Self::MergeClasses),
            Self::MergeClasses => Some(Self::Finalize),
            Self::Finalize => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Stages that may be skipped on the way to `self`
    const fn may_skip_to(self, to: Self) -> bool {
        matches!((self, to), (Self::ResolveClasses, Self::Finalize))
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::ProbeHardware => "probing hardware",
            Self::FetchRules => "fetching rules",
            Self::EvaluateRules => "evaluating rules",
            Self::MergeMatchedFragments => "merging matched profiles",
            Self::ResolveClasses => "resolving classes",
            Self::MergeClasses => "merging classes",
            Self::Finalize => "finalizing profile",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineTransitionError {
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage { from: PipelineStage, to: PipelineStage },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: PipelineStage, to: PipelineStage },

    #[error("Cannot leave terminal stage {from}")]
    FromTerminalState { from: PipelineStage },
}

// ============================================================================
// Context
// ============================================================================

/// State of one pipeline run.
///
/// Constructed fresh for every attempt; nothing in here outlives the run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    current: PipelineStage,
    failed_at: Option<PipelineStage>,
    stage_history: Vec<PipelineStage>,

    /// Profile location (directory) of this attempt
    pub location: Location,
    /// 1-based number of the rules fetch attempt this run represents
    pub rules_attempts: u32,
    /// Fact table, extended with custom rule output after evaluation
    pub facts: FactTable,
    /// Fragment references selected by the rules
    pub matched: Vec<FragmentRef>,
    /// Every `dont_merge` key declared by a class during this run
    pub exclusions: BTreeSet<String>,
    /// Problems that degraded, but did not fail, the run
    pub warnings: Vec<String>,
}

impl PipelineContext {
    pub fn new(location: Location) -> Self {
        Self {
            current: PipelineStage::NotStarted,
            failed_at: None,
            stage_history: Vec::new(),
            location: location.as_dir(),
            rules_attempts: 0,
            facts: FactTable::default(),
            matched: Vec::new(),
            exclusions: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    #[inline]
    pub fn current_stage(&self) -> PipelineStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<PipelineStage> {
        self.failed_at
    }

    /// Stages entered so far, in order
    pub fn stage_history(&self) -> &[PipelineStage] {
        &self.stage_history
    }

    pub fn reached(&self, stage: PipelineStage) -> bool {
        self.stage_history.contains(&stage)
    }

    /// Move forward to `to`.
    ///
    /// Only the next stage is accepted, except that `ResolveClasses` may go
    /// straight to `Finalize`.
    pub fn transition_to(&mut self, to: PipelineStage) -> std::result::Result<(), PipelineTransitionError> {
        let from = self.current;
        if from.is_terminal() {
            return Err(PipelineTransitionError::FromTerminalState { from });
        }
        if to.order() <= from.order() {
            return Err(PipelineTransitionError::BackwardTransition { from, to });
        }
        if from.next() != Some(to) && !from.may_skip_to(to) {
            return Err(PipelineTransitionError::SkippedStage { from, to });
        }

        debug!("Pipeline stage: {} -> {}", from, to);
        self.stage_history.push(to);
        self.current = to;
        Ok(())
    }

    /// Enter `Failed`, remembering where the run stopped.
    pub fn fail(&mut self) -> PipelineStage {
        let at = self.current;
        if !at.is_terminal() {
            self.failed_at = Some(at);
            self.stage_history.push(PipelineStage::Failed);
            self.current = PipelineStage::Failed;
        }
        self.failed_at.unwrap_or(at)
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Asked at each checkpoint whether the operator wants to abort.
pub trait AbortCheck {
    fn should_abort(&self, stage: PipelineStage) -> bool;
}

/// Never aborts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAbort;

impl AbortCheck for NeverAbort {
    fn should_abort(&self, _stage: PipelineStage) -> bool {
        false
    }
}

impl AbortCheck for AbortFlag {
    fn should_abort(&self, _stage: PipelineStage) -> bool {
        self.is_raised()
    }
}

/// Supplies a corrected profile location after a failed rules fetch.
pub trait LocationPrompt {
    /// `None` gives up.
    fn corrected_location(&mut self, failed: &Location, error: &AutoinstError) -> Option<Location>;
}

/// Never offers a correction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl LocationPrompt for NoRetry {
    fn corrected_location(&mut self, _failed: &Location, _error: &AutoinstError) -> Option<Location> {
        None
    }
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug)]
pub enum PipelineOutcome {
    Success {
        document: ProfileDocument,
        context: PipelineContext,
    },
    Failed {
        /// Stage that was running when the error occurred
        stage: PipelineStage,
        error: AutoinstError,
        context: PipelineContext,
    },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn document(&self) -> Option<&ProfileDocument> {
        match self {
            Self::Success { document, .. } => Some(document),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&AutoinstError> {
        match self {
            Self::Success { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        match self {
            Self::Success { context, .. } | Self::Failed { context, .. } => context,
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.context().warnings
    }

    pub fn into_result(self) -> Result<ProfileDocument> {
        match self {
            Self::Success { document, .. } => Ok(document),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct ProfileLocationPipeline {
    config: PipelineConfig,
    probe_source: Box<dyn ProbeSource>,
    fetcher: Box<dyn FragmentFetcher>,
    merger: Box<dyn MergeEngine>,
    abort: Box<dyn AbortCheck>,
}

impl ProfileLocationPipeline {
    pub fn new(
        config: PipelineConfig,
        probe_source: Box<dyn ProbeSource>,
        fetcher: Box<dyn FragmentFetcher>,
        merger: Box<dyn MergeEngine>,
    ) -> Self {
        Self {
            config,
            probe_source,
            fetcher,
            merger,
            abort: Box::new(NeverAbort),
        }
    }

    pub fn with_abort_check(mut self, abort: Box<dyn AbortCheck>) -> Self {
        self.abort = abort;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build the fact table from the probe source.
    pub fn probe(&self) -> FactTable {
        FactTable::build(self.probe_source.as_ref())
    }

    /// Location of the rules document below a profile location.
    pub fn rules_location(&self, location: &Location) -> Result<Location> {
        FragmentRef::new(self.config.rules_file.as_str()).resolve(&location.as_dir())
    }

    /// Run once; a failed rules fetch is final.
    pub fn run(&self, location: &Location) -> PipelineOutcome {
        self.run_with_retry(location, &mut NoRetry)
    }

    /// Run, asking `prompt` for a corrected location whenever the rules
    /// document cannot be fetched or parsed.
    ///
    /// Facts are probed once; every attempt starts from a fresh context.
    pub fn run_with_retry(&self, location: &Location, prompt: &mut dyn LocationPrompt) -> PipelineOutcome {
        let facts = self.probe();
        let mut location = location.clone();
        let mut attempt: u32 = 1;

        loop {
            let outcome = self.run_attempt(&location, facts.clone(), attempt);

            let correction = match &outcome {
                PipelineOutcome::Failed {
                    stage: PipelineStage::FetchRules,
                    error,
                    ..
                } if error.is_retryable() => {
                    if attempt > self.config.max_location_retries {
                        warn!("Giving up after {} attempts to fetch the rules", attempt);
                        None
                    } else {
                        prompt.corrected_location(&location, error)
                    }
                }
                _ => None,
            };

            match correction {
                Some(corrected) => {
                    info!("Retrying with corrected location {}", corrected);
                    location = corrected;
                    attempt += 1;
                }
                None => return outcome,
            }
        }
    }

    fn run_attempt(&self, location: &Location, facts: FactTable, attempt: u32) -> PipelineOutcome {
        self.fetcher.set_profile_location(location);
        let mut context = PipelineContext::new(location.clone());
        context.rules_attempts = attempt;
        context.facts = facts;

        match self.execute(&mut context) {
            Ok(document) => match context.transition_to(PipelineStage::Completed) {
                Ok(()) => {
                    info!("Profile ready ({} top-level sections)", document.len());
                    PipelineOutcome::Success { document, context }
                }
                Err(e) => {
                    let stage = context.fail();
                    PipelineOutcome::Failed {
                        stage,
                        error: e.into(),
                        context,
                    }
                }
            },
            Err(error) => {
                let stage = context.fail();
                warn!("Pipeline failed while {}: {}", stage, error);
                PipelineOutcome::Failed { stage, error, context }
            }
        }
    }

    fn checkpoint(&self, context: &PipelineContext) -> Result<()> {
        let stage = context.current_stage();
        if self.abort.should_abort(stage) {
            warn!("Abort requested after {}", stage);
            return Err(AutoinstError::Aborted { stage });
        }
        Ok(())
    }

    fn execute(&self, context: &mut PipelineContext) -> Result<ProfileDocument> {
        context.transition_to(PipelineStage::ProbeHardware)?;
        self.checkpoint(context)?;

        context.transition_to(PipelineStage::FetchRules)?;
        let rules_location = self.rules_location(&context.location)?;
        info!("Fetching rules from {} (attempt {})", rules_location, context.rules_attempts);
        let bytes = self.fetcher.fetch(&rules_location)?;
        let rules_document = bytes_to_hash(&bytes, "rules document")?;
        let rules = RuleSet::from_document(&rules_document)?;

        context.transition_to(PipelineStage::EvaluateRules)?;
        context.facts = rules.with_custom_facts(&context.facts, self.probe_source.as_ref());
        context.matched = rules.resolve(&context.facts);
        info!("{} of {} rules selected a profile", context.matched.len(), rules.groups().len());
        self.checkpoint(context)?;

        context.transition_to(PipelineStage::MergeMatchedFragments)?;
        let profile = self.merge_fragments(context, &rules_location.dir(), &rules_document)?;

        context.transition_to(PipelineStage::ResolveClasses)?;
        let resolver = ClassResolver::new(self.config.classes_dir.as_str());
        let classes = match resolver.resolve(&profile) {
            Ok(ClassSection::Classes(classes)) => classes,
            Ok(section) => {
                debug!("No classes to merge ({:?})", section);
                Vec::new()
            }
            Err(e) => {
                context.warn(format!("Ignoring classes section: {}", e));
                Vec::new()
            }
        };

        let fragments = if classes.is_empty() {
            Vec::new()
        } else {
            match resolver.fetch(&classes, self.fetcher.as_ref(), &context.location) {
                Ok(fragments) => fragments,
                Err(e) => {
                    context.warn(format!("Classes not merged: {}", e));
                    Vec::new()
                }
            }
        };
        self.checkpoint(context)?;

        if fragments.is_empty() {
            context.transition_to(PipelineStage::Finalize)?;
            return Ok(profile);
        }

        context.transition_to(PipelineStage::MergeClasses)?;
        let mut document = profile;
        for (class, fragment) in fragments {
            context.exclusions.extend(class.dont_merge.iter().cloned());
            let mut exclusions = self.config.exclusions();
            exclusions.extend(class.dont_merge.iter().cloned());

            info!("Merging class {}", class.class_name);
            document = self
                .merger
                .merge(&document, &cleanup(&fragment), &self.config.merge_specs, &exclusions)
                .into_result()?;
        }

        context.transition_to(PipelineStage::Finalize)?;
        Ok(document)
    }

    /// 0 matches → the cleaned rules document, 1 → the cleaned fragment,
    /// more → cleaned fragments merged left to right.
    fn merge_fragments(
        &self,
        context: &PipelineContext,
        base: &Location,
        rules_document: &ProfileDocument,
    ) -> Result<ProfileDocument> {
        let mut fragments = context.matched.iter().map(|reference| -> Result<ProfileDocument> {
            let location = reference.resolve(base)?;
            debug!("Fetching {} from {}", reference, location);
            let bytes = self.fetcher.fetch(&location)?;
            Ok(cleanup(&bytes_to_hash(&bytes, reference.as_str())?))
        });

        let Some(first) = fragments.next() else {
            info!("No rule matched, using the rules document as profile");
            return Ok(cleanup(rules_document));
        };

        let exclusions = self.config.exclusions();
        let mut document = first?;
        for fragment in fragments {
            document = self
                .merger
                .merge(&document, &fragment?, &self.config.merge_specs, &exclusions)
                .into_result()?;
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use crate::merge::InMemoryMerger;
    use crate::probe::StaticProbe;
    use crate::profile::ProfileValue;

    const RULES: &str = r#"<?xml version="1.0"?>
<autoinstall xmlns="http://www.suse.com/1.0/yast2ns" xmlns:config="http://www.suse.com/1.0/configns">
  <rules config:type="list">
    <rule>
      <memsize><match>1024</match><match_type>greater</match_type></memsize>
      <result><profile>big.xml</profile></result>
    </rule>
  </rules>
</autoinstall>"#;

    fn pipeline(fetcher: MemoryFetcher) -> ProfileLocationPipeline {
        ProfileLocationPipeline::new(
            PipelineConfig::default(),
            Box::new(StaticProbe::new([("memsize", "4096")])),
            Box::new(fetcher),
            Box::new(InMemoryMerger),
        )
    }

    fn location() -> Location {
        Location::parse("http://server/profiles").unwrap()
    }

    #[test]
    fn test_stage_sequence() {
        let mut stage = PipelineStage::NotStarted;
        let mut count = 0;
        while let Some(next) = stage.next() {
            assert!(next.order() > stage.order());
            stage = next;
            count += 1;
        }
        assert_eq!(stage, PipelineStage::Completed);
        assert_eq!(count, 8);
    }

    #[test]
    fn test_transitions_are_validated() {
        let mut context = PipelineContext::new(location());
        assert!(context.transition_to(PipelineStage::ProbeHardware).is_ok());
        assert_eq!(
            context.transition_to(PipelineStage::EvaluateRules),
            Err(PipelineTransitionError::SkippedStage {
                from: PipelineStage::ProbeHardware,
                to: PipelineStage::EvaluateRules
            })
        );
        assert!(matches!(
            context.transition_to(PipelineStage::NotStarted),
            Err(PipelineTransitionError::BackwardTransition { .. })
        ));

        assert_eq!(context.fail(), PipelineStage::ProbeHardware);
        assert!(matches!(
            context.transition_to(PipelineStage::FetchRules),
            Err(PipelineTransitionError::FromTerminalState { .. })
        ));
    }

    #[test]
    fn test_classes_may_be_skipped() {
        let mut context = PipelineContext::new(location());
        for stage in [
            PipelineStage::ProbeHardware,
            PipelineStage::FetchRules,
            PipelineStage::EvaluateRules,
            PipelineStage::MergeMatchedFragments,
            PipelineStage::ResolveClasses,
            PipelineStage::Finalize,
        ] {
            context.transition_to(stage).unwrap();
        }
        assert!(!context.reached(PipelineStage::MergeClasses));
    }

    #[test]
    fn test_single_match_uses_cleaned_fragment() {
        let fetcher = MemoryFetcher::new()
            .with("http://server/profiles/rules/rules.xml", RULES)
            .with(
                "http://server/profiles/rules/big.xml",
                "<profile><keyboard>de</keyboard><rules config:type=\"list\" xmlns:config=\"http://www.suse.com/1.0/configns\"/></profile>",
            );
        let outcome = pipeline(fetcher).run(&location());

        let document = outcome.document().unwrap();
        assert_eq!(document.get("keyboard"), Some(&ProfileValue::from("de")));
        assert!(!document.contains_key("rules"));
        assert_eq!(outcome.context().current_stage(), PipelineStage::Completed);
        assert_eq!(outcome.context().rules_attempts, 1);
    }

    #[test]
    fn test_no_match_uses_cleaned_rules_document() {
        let rules = RULES.replace("<match>1024</match>", "<match>999999</match>");
        let fetcher = MemoryFetcher::new().with("http://server/profiles/rules/rules.xml", rules);
        let outcome = pipeline(fetcher).run(&location());

        assert!(outcome.is_success());
        assert!(outcome.document().unwrap().is_empty());
        assert!(outcome.context().matched.is_empty());
    }

    #[test]
    fn test_missing_rules_fails_at_fetch() {
        let outcome = pipeline(MemoryFetcher::new()).run(&location());
        match outcome {
            PipelineOutcome::Failed { stage, error, context } => {
                assert_eq!(stage, PipelineStage::FetchRules);
                assert!(error.is_retryable());
                assert_eq!(context.failed_at(), Some(PipelineStage::FetchRules));
                assert!(!context.reached(PipelineStage::EvaluateRules));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_fragment_fails_at_merge() {
        let fetcher = MemoryFetcher::new().with("http://server/profiles/rules/rules.xml", RULES);
        let outcome = pipeline(fetcher).run(&location());
        match outcome {
            PipelineOutcome::Failed { stage, error, .. } => {
                assert_eq!(stage, PipelineStage::MergeMatchedFragments);
                assert!(matches!(error, AutoinstError::Fetch { .. }));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    struct AbortAt(PipelineStage);

    impl AbortCheck for AbortAt {
        fn should_abort(&self, stage: PipelineStage) -> bool {
            stage == self.0
        }
    }

    #[test]
    fn test_abort_after_rule_evaluation() {
        let fetcher = MemoryFetcher::new().with("http://server/profiles/rules/rules.xml", RULES);
        let outcome = pipeline(fetcher)
            .with_abort_check(Box::new(AbortAt(PipelineStage::EvaluateRules)))
            .run(&location());
        match outcome {
            PipelineOutcome::Failed { stage, error, .. } => {
                assert_eq!(stage, PipelineStage::EvaluateRules);
                assert!(matches!(
                    error,
                    AutoinstError::Aborted {
                        stage: PipelineStage::EvaluateRules
                    }
                ));
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_raised_abort_flag_stops_after_probe() {
        let flag = AbortFlag::new();
        flag.raise();
        let outcome = pipeline(MemoryFetcher::new())
            .with_abort_check(Box::new(flag))
            .run(&location());
        assert!(matches!(
            outcome,
            PipelineOutcome::Failed {
                stage: PipelineStage::ProbeHardware,
                ..
            }
        ));
    }
}
