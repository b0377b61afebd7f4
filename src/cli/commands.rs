//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cumulus - Declarative AWS infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "cumulus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CUMULUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Skip confirmation prompts.
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example deployment file.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the deployment configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the changes an apply would make.
    Plan {
        /// Read tracked resources from the provider first.
        #[arg(long)]
        refresh: bool,

        /// Exit with 1 when changes are pending.
        #[arg(long)]
        detailed_exitcode: bool,
    },

    /// Apply the configuration.
    Apply {
        /// Read tracked resources from the provider first.
        #[arg(long)]
        refresh: bool,

        /// Maximum concurrent provider calls.
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Destroy every tracked resource.
    Destroy {
        /// Maximum concurrent provider calls.
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Check for drift between recorded and live resources.
    Drift,

    /// Show the stack outputs.
    Outputs,

    /// Run the configured endpoint health checks.
    Health,

    /// Show the resource dependency graph.
    Graph {
        /// Print Graphviz DOT instead of layers.
        #[arg(long)]
        dot: bool,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
