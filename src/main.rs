//! autoinst - Main entry point
//!
//! Operator tooling around the rules/classes engine: build the final profile,
//! inspect facts and rule matches, merge two profiles by hand.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use autoinst::cli::{Cli, Commands};
use autoinst::config::PipelineConfig;
use autoinst::error::AutoinstError;
use autoinst::facts::FactTable;
use autoinst::fetch::{DefaultFetcher, FragmentFetcher, FragmentRef, Location};
use autoinst::pipeline::{LocationPrompt, NoRetry, PipelineOutcome, ProfileLocationPipeline};
use autoinst::probe::{ProbeSource, StaticProbe, SystemProbe};
use autoinst::process_guard::{self, AbortFlag, ProcessGuard};
use autoinst::profile::xml::bytes_to_hash;
use autoinst::profile::{ProfileDocument, hash_to_xml, xml_to_hash};
use autoinst::rules::RuleSet;

/// Initialize tracing; `RUST_LOG` overrides the default `info` level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    debug!("autoinst starting up");

    let abort = AbortFlag::new();
    if let Err(e) = process_guard::init_signal_handlers(abort.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    // Helpers still running when we leave are terminated
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("Validating configuration file: {:?}", config);
            match PipelineConfig::load_from_file(&config).and_then(|c| c.validate()) {
                Ok(()) => println!("✓ Configuration file is valid: {:?}", config),
                Err(e) => {
                    error!("Configuration validation failed: {:#}", e);
                    eprintln!("✗ Configuration validation failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Facts { facts } => {
            let probe = build_probe(&load_config(cli.config.as_deref())?, facts.as_deref())?;
            let table = FactTable::build(probe.as_ref());
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Commands::Match { location, facts } => {
            let config = load_config(cli.config.as_deref())?;
            run_match(config, &location, facts.as_deref())?;
        }
        Commands::Merge {
            base,
            overlay,
            dont_merge,
            output,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_merge(&config, &base, &overlay, dont_merge, output.as_deref())?;
        }
        Commands::Run {
            location,
            facts,
            output,
            interactive,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let location = Location::parse(&location)?;
            let probe = build_probe(&config, facts.as_deref())?;
            // The pipeline points relurl resolution at each attempt's location
            let fetcher = DefaultFetcher::new(config.removable_media_roots.clone());
            let merger = config.build_merge_engine();

            let pipeline = ProfileLocationPipeline::new(config, probe, Box::new(fetcher), merger)
                .with_abort_check(Box::new(abort));

            let outcome = if interactive {
                pipeline.run_with_retry(&location, &mut StdinPrompt)
            } else {
                pipeline.run_with_retry(&location, &mut NoRetry)
            };
            finish(outcome, output.as_deref())?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        debug!("No configuration file given, using defaults");
        return Ok(PipelineConfig::default());
    };
    let config = PipelineConfig::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", path))?;
    info!("Loaded configuration from {:?}", path);
    Ok(config)
}

/// Probe the system, or answer from a JSON object of facts.
fn build_probe(config: &PipelineConfig, facts: Option<&Path>) -> Result<Box<dyn ProbeSource>> {
    let Some(path) = facts else {
        return Ok(Box::new(SystemProbe::new(&config.sysroot)));
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read facts from {:?}", path))?;
    let facts: BTreeMap<String, String> =
        serde_json::from_str(&content).context("Failed to parse facts JSON")?;
    info!("Using {} facts from {:?}", facts.len(), path);
    Ok(Box::new(StaticProbe::new(facts)))
}

fn write_profile(document: &ProfileDocument, output: Option<&Path>) -> Result<()> {
    let xml = hash_to_xml(document, "profile")?;
    match output {
        Some(path) => {
            std::fs::write(path, xml).with_context(|| format!("Failed to write profile to {:?}", path))?;
            info!("Profile written to {:?}", path);
        }
        None => print!("{}", xml),
    }
    Ok(())
}

fn finish(outcome: PipelineOutcome, output: Option<&Path>) -> Result<()> {
    for warning in outcome.warnings() {
        eprintln!("⚠ {}", warning);
    }
    match outcome {
        PipelineOutcome::Success { document, .. } => write_profile(&document, output),
        PipelineOutcome::Failed { stage, error, .. } => {
            error!("Pipeline failed while {}: {}", stage, error);
            eprintln!("✗ {}", error.user_message());
            std::process::exit(1);
        }
    }
}

fn run_match(config: PipelineConfig, location: &str, facts: Option<&Path>) -> Result<()> {
    let location = Location::parse(location)?.as_dir();
    let probe = build_probe(&config, facts)?;
    let fetcher = DefaultFetcher::new(config.removable_media_roots.clone()).with_relurl_base(location.clone());

    let rules_location = FragmentRef::new(config.rules_file.as_str()).resolve(&location)?;
    let bytes = fetcher.fetch(&rules_location)?;
    let rules = RuleSet::from_document(&bytes_to_hash(&bytes, "rules document")?)?;

    let facts = FactTable::build(probe.as_ref());
    let facts = rules.with_custom_facts(&facts, probe.as_ref());
    for reference in rules.resolve(&facts) {
        println!("{}", reference);
    }
    Ok(())
}

fn run_merge(
    config: &PipelineConfig,
    base: &Path,
    overlay: &Path,
    dont_merge: Vec<String>,
    output: Option<&Path>,
) -> Result<()> {
    let read = |path: &Path| -> Result<ProfileDocument> {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(xml_to_hash(&content)?)
    };
    let base = read(base)?;
    let overlay = read(overlay)?;

    let mut exclusions = config.exclusions();
    exclusions.extend(dont_merge);

    let result = config
        .build_merge_engine()
        .merge(&base, &overlay, &config.merge_specs, &exclusions);
    match result.into_result() {
        Ok(document) => write_profile(&document, output),
        Err(e) => {
            eprintln!("✗ {}", e.user_message());
            std::process::exit(1);
        }
    }
}

/// Asks on the terminal for a corrected profile location.
struct StdinPrompt;

impl LocationPrompt for StdinPrompt {
    fn corrected_location(&mut self, failed: &Location, error: &AutoinstError) -> Option<Location> {
        eprintln!("✗ {}", error.user_message());
        eprint!("Profile location [{}] (empty to give up): ", failed);
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).ok()? == 0 {
            return None;
        }
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match Location::parse(line) {
            Ok(location) => Some(location),
            Err(e) => {
                eprintln!("✗ {}", e);
                None
            }
        }
    }
}
