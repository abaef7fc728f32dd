use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// autoinst - Resolve rules and classes into one installation profile
#[derive(Parser)]
#[command(name = "autoinst")]
#[command(about = "Evaluate AutoYaST-style rules and classes against this machine")]
#[command(version)]
pub struct Cli {
    /// Pipeline configuration file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the final profile for this machine
    Run {
        /// Profile location holding the rules file and classes
        /// (e.g. http://10.0.0.1/profiles/, file:///srv/autoinst/)
        #[arg(short, long)]
        location: String,

        /// Use facts from a JSON object instead of probing the system
        #[arg(short, long)]
        facts: Option<PathBuf>,

        /// Write the profile here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Ask for a corrected location when the rules cannot be fetched
        #[arg(short, long)]
        interactive: bool,
    },
    /// Print the probed fact table as JSON
    Facts {
        /// Use facts from a JSON object instead of probing the system
        #[arg(short, long)]
        facts: Option<PathBuf>,
    },
    /// Print the profiles the rules select for this machine
    Match {
        /// Profile location holding the rules file
        #[arg(short, long)]
        location: String,

        /// Use facts from a JSON object instead of probing the system
        #[arg(short, long)]
        facts: Option<PathBuf>,
    },
    /// Merge two profile files with the configured engine
    Merge {
        /// Base profile
        base: PathBuf,

        /// Profile merged over the base
        overlay: PathBuf,

        /// Additional keys whose base value must be kept
        #[arg(short, long = "dont-merge")]
        dont_merge: Vec<String>,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["autoinst"]).is_err());
    }

    #[test]
    fn test_cli_run_with_options() {
        let cli = Cli::try_parse_from([
            "autoinst",
            "--config",
            "/etc/autoinst.json",
            "run",
            "--location",
            "http://10.0.0.1/profiles/",
            "--output",
            "/tmp/profile.xml",
            "--interactive",
        ])
        .unwrap();

        assert_eq!(cli.config.unwrap().to_str().unwrap(), "/etc/autoinst.json");
        match cli.command {
            Commands::Run {
                location,
                facts,
                output,
                interactive,
            } => {
                assert_eq!(location, "http://10.0.0.1/profiles/");
                assert!(facts.is_none());
                assert_eq!(output.unwrap().to_str().unwrap(), "/tmp/profile.xml");
                assert!(interactive);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_config_is_global() {
        let cli = Cli::try_parse_from(["autoinst", "facts", "-c", "cfg.json"]).unwrap();
        assert!(cli.config.is_some());
        assert!(matches!(cli.command, Commands::Facts { facts: None }));
    }

    #[test]
    fn test_cli_merge_collects_dont_merge() {
        let cli = Cli::try_parse_from([
            "autoinst",
            "merge",
            "base.xml",
            "overlay.xml",
            "--dont-merge",
            "partition",
            "-d",
            "software",
        ])
        .unwrap();
        match cli.command {
            Commands::Merge { dont_merge, .. } => assert_eq!(dont_merge, vec!["partition", "software"]),
            _ => panic!("Expected Merge command"),
        }
    }

    #[test]
    fn test_cli_validate_config() {
        let cli = Cli::try_parse_from(["autoinst", "validate-config", "cfg.json"]).unwrap();
        assert!(matches!(cli.command, Commands::ValidateConfig { .. }));
    }
}
