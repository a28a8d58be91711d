mod diff;
mod migrate;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use quire_migrate::{read_config, QuireConfig};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Quire schema migration toolkit.
#[derive(Parser)]
#[command(name = "quire", version, about = "Quire schema migration toolkit")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log debug output to stderr (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Path to a quire.toml configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff two schema JSON files
    Diff {
        /// Path to the current schema
        old: PathBuf,
        /// Path to the requested schema
        new: PathBuf,
    },

    /// Apply a change list to a schema and show the result with its transform rules
    Apply {
        /// Path to the schema JSON file
        schema: PathBuf,
        /// Path to a JSON array of schema changes
        changes: PathBuf,
    },

    /// Run a schema migration over a fixture on an in-memory store
    Migrate {
        /// Path to the fixture JSON file (schema, target or changes, nodes)
        fixture: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Diff { old, new } => {
            diff::cmd_diff(&old, &new, cli.output, cli.quiet);
        }
        Commands::Apply { schema, changes } => {
            diff::cmd_apply(&schema, &changes, cli.output, cli.quiet);
        }
        Commands::Migrate { fixture } => {
            let config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            migrate::cmd_migrate(&fixture, config, cli.output, cli.quiet);
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>, output: OutputFormat, quiet: bool) -> QuireConfig {
    let Some(path) = path else {
        return QuireConfig::default();
    };
    match read_config(path) {
        Ok(config) => {
            tracing::debug!(path = %path.display(), "configuration loaded");
            config
        }
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(1);
        }
    }
}

/// Read and parse a JSON file, exiting with an error report on failure.
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path, output: OutputFormat, quiet: bool) -> T {
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error reading '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            let msg = format!("error parsing JSON in '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value)
            .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e))
    );
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => eprintln!("{}", serde_json::json!({ "error": msg })),
    }
}
