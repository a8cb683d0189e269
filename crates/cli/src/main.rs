mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{KindArg, StoreArgs};
use output::OutputFormat;

/// cairn - content-addressed package store
#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[command(flatten)]
  store: StoreArgs,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value_t, global = true)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build packages of a resolved graph, reusing published artifacts
  Build {
    /// Path to the graph document (JSON)
    graph: PathBuf,

    /// Package ids to build (default: the document's roots)
    packages: Vec<String>,
  },

  /// Download the sources of a graph without building
  Fetch {
    /// Path to the graph document (JSON)
    graph: PathBuf,

    /// Package ids whose closure to fetch (default: the document's roots)
    packages: Vec<String>,

    /// Skip packages whose artifact is already published
    #[arg(long)]
    missing_only: bool,
  },

  /// Materialize a venv and run a command inside it
  Venv {
    /// Path to the graph document (JSON)
    graph: PathBuf,

    /// Path to the venv manifest (JSON)
    manifest: PathBuf,

    /// Print the launch plan instead of entering the venv
    #[arg(long)]
    print: bool,

    /// Command to run (default: /bin/sh)
    #[arg(last = true)]
    command: Vec<String>,
  },

  /// Remove store entries that have not been used recently
  Cleanup {
    /// Only clean entries of this kind (default: all)
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Remove entries unused for at least this long (e.g. "12h", "30d")
    #[arg(long, default_value = "30d", value_parser = humantime::parse_duration)]
    max_age: Duration,

    /// Report what would be removed without removing anything
    #[arg(long)]
    dry_run: bool,
  },

  /// List store locks and their state
  Locks {
    /// Only list locks of this kind (default: all)
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
  },
}

fn init_tracing(verbose: u8) {
  let directive = match verbose {
    0 => "warn",
    1 => "warn,cairn_lib=info,cairn=info",
    _ => "info,cairn_lib=debug,cairn=debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match cli.command {
    Commands::Build { graph, packages } => cmd::cmd_build(&cli.store, &graph, &packages, cli.output),
    Commands::Fetch {
      graph,
      packages,
      missing_only,
    } => cmd::cmd_fetch(&cli.store, &graph, &packages, missing_only, cli.output),
    Commands::Venv {
      graph,
      manifest,
      print,
      command,
    } => cmd::cmd_venv(&cli.store, &graph, &manifest, print, &command, cli.output),
    Commands::Cleanup { kind, max_age, dry_run } => cmd::cmd_cleanup(&cli.store, kind, max_age, dry_run, cli.output),
    Commands::Locks { kind } => cmd::cmd_locks(&cli.store, kind, cli.output),
  }
}
