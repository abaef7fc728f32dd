//! External merge through `xsltproc`
//!
//! Both documents are serialized to a work directory, the stylesheet is run
//! over the base with the overlay path passed as the `with` parameter, and
//! the output is parsed back. List/map behaviour comes from the
//! `config:type` attributes the stylesheet reads, so the merge specs are not
//! forwarded.

use super::{MergeEngine, MergeResult, MergeSpec};
use crate::command_runner::run_command;
use crate::error::Result;
use crate::profile::xml::bytes_to_hash;
use crate::profile::{ProfileDocument, hash_to_xml};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const DEFAULT_PROGRAM: &str = "/usr/bin/xsltproc";
pub const DEFAULT_STYLESHEET: &str = "/usr/share/autoinstall/xslt/merge.xslt";

/// Exit code reported when the work files could not be prepared or read.
const SETUP_FAILURE: i32 = 1;
/// Exit code reported when the program could not be spawned.
const SPAWN_FAILURE: i32 = 127;

#[derive(Debug, Clone)]
pub struct XsltMerger {
    program: PathBuf,
    stylesheet: PathBuf,
    work_dir: PathBuf,
}

impl XsltMerger {
    pub fn new(
        program: impl Into<PathBuf>,
        stylesheet: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            stylesheet: stylesheet.into(),
            work_dir: work_dir.into(),
        }
    }

    fn base_path(&self) -> PathBuf {
        self.work_dir.join("base_profile.xml")
    }

    fn overlay_path(&self) -> PathBuf {
        self.work_dir.join("overlay_profile.xml")
    }

    fn result_path(&self) -> PathBuf {
        self.work_dir.join("result.xml")
    }

    /// Command line for one merge, program excluded.
    pub fn build_args(&self, exclusions: &BTreeSet<String>) -> Vec<String> {
        let mut args = vec![
            "--novalid".to_string(),
            "--maxdepth".to_string(),
            "10000".to_string(),
            "--param".to_string(),
            "replace".to_string(),
            "'false'".to_string(),
        ];

        for (index, key) in exclusions.iter().enumerate() {
            args.push("--stringparam".to_string());
            args.push(format!("dontmerge{}", index + 1));
            args.push(key.clone());
        }

        args.push("--param".to_string());
        args.push("with".to_string());
        args.push(format!("'{}'", self.overlay_path().display()));
        args.push("--output".to_string());
        args.push(self.result_path().display().to_string());
        args.push(self.stylesheet.display().to_string());
        args.push(self.base_path().display().to_string());
        args
    }

    fn write_inputs(&self, base: &ProfileDocument, overlay: &ProfileDocument) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::write(self.base_path(), hash_to_xml(base, "profile")?)?;
        std::fs::write(self.overlay_path(), hash_to_xml(overlay, "profile")?)?;
        // Stale output from a previous step must not be mistaken for ours
        match std::fs::remove_file(self.result_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_result(&self) -> MergeResult {
        let path = self.result_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                return MergeResult::failure(
                    SETUP_FAILURE,
                    format!("Could not read {}: {}", path.display(), e),
                );
            }
        };
        match bytes_to_hash(&bytes, "merged profile") {
            Ok(document) => MergeResult::success(document),
            Err(e) => MergeResult::failure(SETUP_FAILURE, e.to_string()),
        }
    }
}

impl MergeEngine for XsltMerger {
    fn merge(
        &self,
        base: &ProfileDocument,
        overlay: &ProfileDocument,
        _specs: &[MergeSpec],
        exclusions: &BTreeSet<String>,
    ) -> MergeResult {
        if let Err(e) = self.write_inputs(base, overlay) {
            warn!("Could not prepare merge inputs in {}: {}", self.work_dir.display(), e);
            return MergeResult::failure(SETUP_FAILURE, e.to_string());
        }

        let args = self.build_args(exclusions);
        let program = self.program.display().to_string();
        debug!("Merging with {} {}", program, args.join(" "));

        let output = match run_command(&program, &args) {
            Ok(output) => output,
            Err(e) => {
                warn!("{:#}", e);
                return MergeResult::failure(SPAWN_FAILURE, format!("{:#}", e));
            }
        };

        if !output.success {
            warn!("{} exited with {}", program, output.code());
            return MergeResult::failure(output.code(), output.stderr.trim());
        }

        self.read_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::map;
    use tempfile::TempDir;

    fn exclusions(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_args_carry_numbered_dontmerge_params() {
        let merger = XsltMerger::new("xsltproc", "/tmp/merge.xslt", "/tmp/work");
        let args = merger.build_args(&exclusions(&["partition", "software"]));

        let joined = args.join(" ");
        assert!(joined.starts_with("--novalid"));
        assert!(joined.contains("--stringparam dontmerge1 partition"));
        assert!(joined.contains("--stringparam dontmerge2 software"));
        assert!(joined.contains("--param with '/tmp/work/overlay_profile.xml'"));
        assert!(joined.contains("--output /tmp/work/result.xml"));
        assert_eq!(args[args.len() - 2], "/tmp/merge.xslt");
        assert_eq!(args[args.len() - 1], "/tmp/work/base_profile.xml");
    }

    #[test]
    fn test_args_without_exclusions() {
        let merger = XsltMerger::new("xsltproc", "merge.xslt", "/w");
        let args = merger.build_args(&BTreeSet::new());
        assert!(!args.iter().any(|a| a == "--stringparam"));
    }

    #[test]
    fn test_failing_program_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let merger = XsltMerger::new("false", "merge.xslt", dir.path());
        let result = merger.merge(
            &map([("keyboard", "us")]),
            &map([("keyboard", "de")]),
            &[],
            &BTreeSet::new(),
        );
        assert!(!result.is_success());
        assert_ne!(result.exit_code, 0);
        assert!(result.document.is_empty());
        // Inputs were still written
        assert!(dir.path().join("base_profile.xml").exists());
        assert!(dir.path().join("overlay_profile.xml").exists());
    }

    #[test]
    fn test_unserializable_input_is_setup_failure() {
        let dir = TempDir::new().unwrap();
        let merger = XsltMerger::new("true", "merge.xslt", dir.path());
        let base = map([("bad key", "x")]);
        let result = merger.merge(&base, &ProfileDocument::new(), &[], &BTreeSet::new());
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("bad key"));
    }

    #[test]
    fn test_missing_program_reports_failure() {
        let dir = TempDir::new().unwrap();
        let merger = XsltMerger::new("/nonexistent/xsltproc", "merge.xslt", dir.path());
        let result = merger.merge(&ProfileDocument::new(), &ProfileDocument::new(), &[], &BTreeSet::new());
        assert_eq!(result.exit_code, SPAWN_FAILURE);
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn test_successful_program_without_output_is_failure() {
        let dir = TempDir::new().unwrap();
        let merger = XsltMerger::new("true", "merge.xslt", dir.path());
        let result = merger.merge(&ProfileDocument::new(), &ProfileDocument::new(), &[], &BTreeSet::new());
        assert!(!result.is_success());
        assert!(result.stderr.contains("result.xml"));
    }
}
