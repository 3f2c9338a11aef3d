use crate::config::Scope;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// capcheck CLI options.
#[derive(Debug, Parser)]
#[command(
    name = "capcheck",
    version,
    about = "Check that declared capabilities (locks, tokens) are held where the code requires them",
    args_conflicts_with_subcommands = true,
    subcommand_precedence_over_arg = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub check: CheckArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check program files.
    Check(CheckArgs),

    /// Record the current diagnostics as a baseline.
    Baseline(BaselineArgs),

    /// List diagnostic kinds.
    ListKinds,

    /// Explain a diagnostic kind.
    Explain {
        /// Diagnostic kind name.
        kind: String,
    },
}

#[derive(Debug, Clone, ClapArgs)]
pub struct CheckArgs {
    /// Program JSON files. Defaults to stdin when absent.
    #[arg(value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub format: OutputFormat,

    /// Config file; otherwise `capcheck.toml` is searched upwards.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Report analysis violations as errors.
    #[arg(long)]
    pub treat_as_fatal: bool,

    /// Which translation units to analyze.
    #[arg(long, value_enum)]
    pub scope: Option<Scope>,

    /// Worker threads (0 = available parallelism).
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Ignore diagnostics recorded in this baseline file.
    #[arg(long)]
    pub baseline: Option<PathBuf>,

    /// Exit with code 1 if any diagnostics are emitted.
    #[arg(long)]
    pub deny_warnings: bool,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct BaselineArgs {
    #[command(flatten)]
    pub check: CheckArgs,

    /// Where to write the baseline; defaults to the configured one.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
    Github,
}
