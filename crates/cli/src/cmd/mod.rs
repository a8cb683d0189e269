//! Command implementations and the store options they share.

mod build;
mod cleanup;
mod fetch;
mod locks;
mod venv;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use tracing::{info, warn};

use cairn_lib::build::sandbox::{BwrapSandbox, HostSandbox, Sandbox};
use cairn_lib::config::StoreConfig;
use cairn_lib::execute::{Coordinator, ExecuteConfig};
use cairn_lib::fetch::DefaultTransport;
use cairn_lib::package::{GraphDocument, PackageGraph, PackageId};
use cairn_lib::store::{EntryKind, Store};

pub use build::cmd_build;
pub use cleanup::cmd_cleanup;
pub use fetch::cmd_fetch;
pub use locks::cmd_locks;
pub use venv::cmd_venv;

/// How build scripts are isolated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SandboxChoice {
  /// bubblewrap when available, the host shell otherwise
  #[default]
  Auto,
  /// Run scripts with the host shell against the build root
  Host,
  /// Require bubblewrap
  Bwrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
  Package,
  Fetch,
  Venv,
}

impl From<KindArg> for EntryKind {
  fn from(kind: KindArg) -> Self {
    match kind {
      KindArg::Package => EntryKind::Package,
      KindArg::Fetch => EntryKind::Fetch,
      KindArg::Venv => EntryKind::Venv,
    }
  }
}

/// The selected kind, or every kind with dependents before their inputs.
pub fn kinds(kind: Option<KindArg>) -> Vec<EntryKind> {
  match kind {
    Some(kind) => vec![kind.into()],
    None => vec![EntryKind::Venv, EntryKind::Package, EntryKind::Fetch],
  }
}

#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
  /// Store root (default: $CAIRN_STORE or the user data directory)
  #[arg(long, global = true, value_name = "DIR")]
  store: Option<PathBuf>,

  /// Maximum number of concurrent builds
  #[arg(short, long, global = true)]
  jobs: Option<usize>,

  /// Parallelism advertised to build scripts (default: $BUILD_PARALLELISM or CPU count)
  #[arg(long, global = true)]
  parallelism: Option<usize>,

  /// Build script isolation
  #[arg(long, value_enum, default_value_t, global = true)]
  sandbox: SandboxChoice,
}

impl StoreArgs {
  pub fn store_config(&self) -> StoreConfig {
    match &self.store {
      Some(root) => StoreConfig::at(root),
      None => StoreConfig::from_env(),
    }
  }

  pub fn open_store(&self) -> Result<Store> {
    let config = self.store_config();
    let root = config.root.clone();
    Store::open(config).with_context(|| format!("Failed to open store at {}", root.display()))
  }

  pub fn execute_config(&self) -> ExecuteConfig {
    let mut config = ExecuteConfig::from_env();
    if let Some(jobs) = self.jobs {
      config = config.with_jobs(jobs);
    }
    if let Some(parallelism) = self.parallelism {
      config = config.with_parallelism(parallelism);
    }
    config
  }

  pub fn sandbox(&self) -> Result<Arc<dyn Sandbox>> {
    match (self.sandbox, BwrapSandbox::detect()) {
      (SandboxChoice::Host, _) => Ok(Arc::new(HostSandbox)),
      (SandboxChoice::Bwrap | SandboxChoice::Auto, Some(bwrap)) => Ok(Arc::new(bwrap)),
      (SandboxChoice::Bwrap, None) => bail!("bwrap not found on PATH"),
      (SandboxChoice::Auto, None) => {
        warn!("bwrap not found on PATH, running build scripts on the host");
        Ok(Arc::new(HostSandbox))
      }
    }
  }

  pub fn coordinator(&self) -> Result<Coordinator> {
    let store = self.open_store()?;
    let config = self.execute_config();
    info!(root = ?store.layout().root(), jobs = config.jobs, parallelism = config.parallelism, "store opened");
    Ok(Coordinator::new(
      store,
      Arc::new(DefaultTransport::default()),
      self.sandbox()?,
      config,
    ))
  }
}

/// A graph document together with the graph built from it.
pub struct LoadedGraph {
  pub document: GraphDocument,
  pub graph: Arc<PackageGraph>,
  pub roots: Vec<PackageId>,
}

impl LoadedGraph {
  /// Document id of a package.
  pub fn label(&self, id: PackageId) -> &str {
    self.document.packages.get(id.0).map(|p| p.id.as_str()).unwrap_or("?")
  }
}

/// Read a graph document, selecting `packages` as roots when given.
pub fn load_graph(path: &Path, packages: &[String]) -> Result<LoadedGraph> {
  let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read graph {}", path.display()))?;
  let document = GraphDocument::from_json(&text).with_context(|| format!("Invalid graph document {}", path.display()))?;

  let selected = if packages.is_empty() {
    None
  } else {
    Some(PackageGraph::resolve_ids(&document, packages)?)
  };
  let (graph, default_roots) =
    PackageGraph::from_document(document.clone()).with_context(|| format!("Invalid graph {}", path.display()))?;

  Ok(LoadedGraph {
    document,
    graph: Arc::new(graph),
    roots: selected.unwrap_or(default_roots),
  })
}
