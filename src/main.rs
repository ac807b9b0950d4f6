use anyhow::{Context, Result};
use clap::Parser;
use racetrap::cli::{Cli, Command, OutputFormat};
use racetrap::persistence::{self, LocationPair};
use racetrap::{RuntimeConfig, TrapAlgorithm, TrapPlanStore};
use serde::Serialize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

#[derive(Serialize)]
struct GroupSummary<'a> {
    name: &'a str,
    is_static: bool,
    write_apis: usize,
    read_apis: usize,
}

#[derive(Serialize)]
struct ConfigSummary<'a> {
    valid: bool,
    algorithm: &'static str,
    raise_on_race: bool,
    groups: Vec<GroupSummary<'a>>,
    configured_plans: usize,
}

fn run_check(path: &Path, format: OutputFormat) -> Result<()> {
    let config = RuntimeConfig::from_toml_file(path)
        .with_context(|| format!("Invalid configuration: {}", path.display()))?;

    let summary = ConfigSummary {
        valid: true,
        algorithm: config.algorithm.as_str(),
        raise_on_race: config.raise_on_race,
        groups: config
            .groups
            .iter()
            .map(|g| GroupSummary {
                name: &g.name,
                is_static: g.is_static,
                write_apis: g.write_apis.len(),
                read_apis: g.read_apis.len(),
            })
            .collect(),
        configured_plans: match config.algorithm {
            TrapAlgorithm::LearnedHistory => config.learned.as_ref().map_or(0, |l| l.plans.len()),
            _ => 0,
        },
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!("Configuration OK: {}", path.display());
            println!("Algorithm: {}", summary.algorithm);
            println!("Raise on race: {}", summary.raise_on_race);
            println!("Groups: {}", summary.groups.len());
            for group in &summary.groups {
                println!(
                    "  {} ({}): {} write, {} read",
                    group.name,
                    if group.is_static { "static" } else { "instance" },
                    group.write_apis,
                    group.read_apis
                );
            }
            if config.algorithm == TrapAlgorithm::LearnedHistory {
                println!("Configured plans: {}", summary.configured_plans);
            }
        }
    }
    Ok(())
}

fn run_plans(path: &Path, delay_ms: u64, format: OutputFormat) -> Result<()> {
    let plans = persistence::read_plan_file_strict(path, delay_ms)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
    let mut store = TrapPlanStore::new();
    store.extend(plans)?;
    let merged = store.plans();

    match format {
        OutputFormat::Json => {
            let plans: Vec<_> = merged.iter().map(|p| p.as_ref()).collect();
            println!("{}", serde_json::to_string_pretty(&plans)?);
        }
        OutputFormat::Text => {
            println!("Plans: {}", merged.len());
            for plan in &merged {
                let hits: Vec<String> = plan
                    .hit_counts
                    .iter()
                    .map(|h| format!("local={} global={}", h.local, h.global))
                    .collect();
                println!(
                    "  {}|{}|{}  repeat={}  delay={}ms  hits=[{}]",
                    plan.callee,
                    plan.caller.as_deref().unwrap_or("*"),
                    plan.offset,
                    plan.repeat,
                    plan.fixed_delay_ms.unwrap_or(0),
                    hits.join(", ")
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct BugEntry<'a> {
    first: &'a str,
    second: &'a str,
}

fn run_bugs(path: &Path, format: OutputFormat) -> Result<()> {
    let pairs: Vec<LocationPair> = persistence::read_bug_file_strict(path)
        .with_context(|| format!("Failed to read bug file: {}", path.display()))?;

    match format {
        OutputFormat::Json => {
            let entries: Vec<_> = pairs
                .iter()
                .map(|p| BugEntry {
                    first: p.first(),
                    second: p.second(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Text => {
            println!("Confirmed races: {}", pairs.len());
            for pair in &pairs {
                println!("  {} <-> {}", pair.first(), pair.second());
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match &args.command {
        Command::Check { config } => run_check(config, args.format),
        Command::Plans { file, delay_ms } => run_plans(file, *delay_ms, args.format),
        Command::Bugs { file } => run_bugs(file, args.format),
    }
}
