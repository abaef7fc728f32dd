//! Pipeline configuration
//!
//! Everything a run needs besides the profile location: where the rules file
//! and classes live relative to it, merge policy, the merge engine and the
//! filesystem roots probes and fetchers look under. Stored as JSON; every
//! field has a default so partial files are accepted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::classes::DEFAULT_CLASSES_DIR;
use crate::merge::xslt::{DEFAULT_PROGRAM, DEFAULT_STYLESHEET};
use crate::merge::{InMemoryMerger, MergeEngine, MergeSpec, XsltMerger};
use crate::types::MergeEngineKind;

pub const DEFAULT_RULES_FILE: &str = "rules/rules.xml";

/// Settings of the external merge program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XsltConfig {
    pub program: PathBuf,
    pub stylesheet: PathBuf,
}

impl Default for XsltConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            stylesheet: PathBuf::from(DEFAULT_STYLESHEET),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rules document, relative to the profile location
    pub rules_file: String,
    /// Class directory, relative to the profile location
    pub classes_dir: String,
    pub merge_specs: Vec<MergeSpec>,
    /// Keys excluded from every merge step
    pub dont_merge: Vec<String>,
    pub merge_engine: MergeEngineKind,
    pub xslt: XsltConfig,
    /// Scratch directory for the external merge
    pub work_dir: PathBuf,
    /// Mount points searched for `floppy://` and `usb://` locations
    pub removable_media_roots: Vec<PathBuf>,
    /// Root the system probe reads `/proc`, `/sys` and `/etc` below
    pub sysroot: PathBuf,
    /// Corrected locations asked for after a failed rules fetch
    pub max_location_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rules_file: DEFAULT_RULES_FILE.to_string(),
            classes_dir: DEFAULT_CLASSES_DIR.to_string(),
            merge_specs: Vec::new(),
            dont_merge: Vec::new(),
            merge_engine: MergeEngineKind::InMemory,
            xslt: XsltConfig::default(),
            work_dir: std::env::temp_dir().join("autoinst"),
            removable_media_roots: vec![PathBuf::from("/media/floppy"), PathBuf::from("/media/usb")],
            sysroot: PathBuf::from("/"),
            max_location_retries: 3,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.rules_file.trim().is_empty() {
            anyhow::bail!("Rules file must be specified");
        }
        if self.classes_dir.trim().is_empty() {
            anyhow::bail!("Classes directory must be specified");
        }

        let mut seen = BTreeSet::new();
        for spec in &self.merge_specs {
            if spec.key.trim().is_empty() {
                anyhow::bail!("Merge spec keys cannot be empty");
            }
            if !seen.insert(spec.key.as_str()) {
                anyhow::bail!("Merge spec for <{}> is declared more than once", spec.key);
            }
        }

        if self.dont_merge.iter().any(|k| k.trim().is_empty()) {
            anyhow::bail!("dont_merge entries cannot be empty");
        }

        if self.merge_engine == MergeEngineKind::Xslt {
            if self.xslt.program.as_os_str().is_empty() {
                anyhow::bail!("xslt merge engine needs a program");
            }
            if self.xslt.stylesheet.as_os_str().is_empty() {
                anyhow::bail!("xslt merge engine needs a stylesheet");
            }
            if self.work_dir.as_os_str().is_empty() {
                anyhow::bail!("xslt merge engine needs a work directory");
            }
        }

        Ok(())
    }

    /// Keys excluded from every merge step.
    pub fn exclusions(&self) -> BTreeSet<String> {
        self.dont_merge.iter().cloned().collect()
    }

    /// Instantiate the configured merge engine.
    pub fn build_merge_engine(&self) -> Box<dyn MergeEngine> {
        match self.merge_engine {
            MergeEngineKind::InMemory => Box::new(InMemoryMerger),
            MergeEngineKind::Xslt => Box::new(XsltMerger::new(
                &self.xslt.program,
                &self.xslt.stylesheet,
                &self.work_dir,
            )),
        }
    }
}
