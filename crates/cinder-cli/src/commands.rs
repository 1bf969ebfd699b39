//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow file
    Validate {
        /// Path to workflow file
        #[arg(default_value = "cinder.yaml")]
        path: PathBuf,
    },

    /// Show the job instances a workflow expands to, in dispatch waves
    Plan {
        #[arg(default_value = "cinder.yaml")]
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = PlanFormat::Text)]
        format: PlanFormat,
    },

    /// Run a workflow locally
    Run(RunArgs),

    /// Print the JSON schema of the workflow format
    Schema,

    /// Inspect stored run records
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },

    /// Manage the local build cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    #[arg(default_value = "cinder.yaml")]
    pub path: PathBuf,

    /// Event kind to simulate
    #[arg(short, long, value_enum, default_value_t = EventKind::Manual)]
    pub event: EventKind,

    /// Git ref the event refers to
    #[arg(short = 'r', long = "ref", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Dispatch input, repeatable
    #[arg(short, long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// Changed path carried by the event, repeatable
    #[arg(long = "changed", value_name = "PATH")]
    pub changed_paths: Vec<String>,

    /// Target branch of a pull request event
    #[arg(long)]
    pub base_ref: Option<String>,

    /// Upper bound on concurrently running jobs
    #[arg(short = 'j', long)]
    pub max_parallel: Option<usize>,

    /// Print what would run without executing anything
    #[arg(long)]
    pub dry_run: bool,

    /// YAML or JSON secrets file
    #[arg(long)]
    pub secrets_file: Option<PathBuf>,

    /// Workspace root for job directories
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Keep job workspaces after the run
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Stream step output while jobs run
    #[arg(long)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
    Manual,
    WorkflowCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlanFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum RunsCommands {
    /// List stored runs, newest first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one run with its jobs and steps
    Show {
        /// Run ID, as printed by `runs list`
        run_id: String,

        /// Print step logs
        #[arg(long)]
        logs: bool,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cache entries
    List {
        /// Cache key prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Remove cache entries
    Clear {
        /// Cache key prefix
        #[arg(short, long)]
        prefix: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Apply the size and age limits now
    Evict,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
