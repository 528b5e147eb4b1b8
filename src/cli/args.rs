use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::MountStrategy;
use crate::engine::OutputSpec;

#[derive(Parser, Debug)]
#[clap(name = "execbox")]
#[clap(version, about = "Run untrusted code in ephemeral containers")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "EXECBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a source file or snippet in a fresh unit
    Run(RunArgs),

    /// List the registered languages
    Languages,

    /// Check that the container runtime is reachable
    Check,

    /// Initialize a new execbox configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Language id (e.g. python, javascript)
    pub language: String,

    /// Read the source code from this file
    #[clap(long, short = 'f', conflicts_with = "code", required_unless_present = "code")]
    pub file: Option<PathBuf>,

    /// Source code given inline
    #[clap(long)]
    pub code: Option<String>,

    /// Input file made available next to the code
    #[clap(long, short = 'i')]
    pub input: Option<PathBuf>,

    /// "void" to stream the logs, or the extension of the file the code writes
    #[clap(long, short = 'o', default_value = "void")]
    pub output: OutputSpec,

    /// Where to write the produced file (default: output.<ext>)
    #[clap(long)]
    pub dest: Option<PathBuf>,

    /// How code and input reach the unit (default: from config)
    #[clap(long, value_enum)]
    pub strategy: Option<MountStrategy>,

    /// Deadline in seconds, 0 disables it (default: from config)
    #[clap(long)]
    pub timeout: Option<u64>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
