//! CLI argument parsing for Racetrap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for inspection commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "racetrap")]
#[command(version)]
#[command(about = "Inspect racetrap configurations, plan files and bug files", long_about = None)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a runtime configuration and summarize it
    Check {
        /// Path to the TOML configuration
        config: PathBuf,
    },
    /// Print the merged plans a plan file would produce
    Plans {
        /// Path to the plan file
        file: PathBuf,

        /// Fixed delay assigned to replayed plans
        #[arg(long = "delay-ms", default_value = "100")]
        delay_ms: u64,
    },
    /// Print the confirmed races in a bug file
    Bugs {
        /// Path to the bug file
        file: PathBuf,
    },
}
