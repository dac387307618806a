//! Clap derive structures for the `fleetsync` CLI.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// fleetsync -- reconcile one device fleet across several backend accounts
#[derive(Debug, Parser)]
#[command(
    name = "fleetsync",
    version,
    about = "Reconcile device fleets across backend accounts",
    long_about = "Loads every account of a profile, merges devices listed by more than\n\
        one account into a single directory, replays push messages through\n\
        the router and plans strategy-routed device commands.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (overrides the platform default location)
    #[arg(long, env = "FLEETSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Profile to use
    #[arg(long, short = 'p', env = "FLEETSYNC_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "FLEETSYNC_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Refresh every source and list the merged directory
    #[command(alias = "ls")]
    Devices(DevicesArgs),

    /// Show one merged device record
    #[command(alias = "dev")]
    Device(DeviceArgs),

    /// Route a JSON-lines file of push messages, then list the directory
    Replay(ReplayArgs),

    /// Plan (and send) device commands
    Plan(PlanArgs),

    /// Inspect configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Devices ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DevicesArgs {
    /// Only list devices of this category
    #[arg(long)]
    pub category: Option<String>,

    /// Only list online devices
    #[arg(long)]
    pub online: bool,
}

#[derive(Debug, Args)]
pub struct DeviceArgs {
    /// Device id
    pub id: String,
}

// ── Replay ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// File with one `{"source": ..., "message": {...}}` object per line
    pub file: PathBuf,
}

// ── Plan ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Device id
    pub id: String,

    /// Commands as `code=value`; values are parsed as JSON, else taken as strings
    #[arg(required = true, value_name = "CODE=VALUE")]
    pub commands: Vec<String>,

    /// Print the batches without sending them
    #[arg(long, short = 'n')]
    pub dry_run: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,
    /// Print the active profile with secrets masked
    Show,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
