//! Types for package graph resolution.
//!
//! This module defines the error types, report types, and configuration
//! for resolving a package graph against the store.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::address::{AddressError, ContentAddress};
use crate::build::BuildError;
use crate::consts::PARALLELISM_ENV;
use crate::error::FailureKind;
use crate::lock::EntryLock;
use crate::package::PackageId;
use crate::store::{Origin, Publication, StoreError};

/// Identifies the failed dependency that caused a package to be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDependency {
  pub address: ContentAddress,
  pub name: String,
}

impl std::fmt::Display for FailedDependency {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} ({})", self.name, self.address)
  }
}

/// Why one address could not be realized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
  pub kind: FailureKind,
  pub message: String,
}

impl From<&BuildError> for NodeFailure {
  fn from(e: &BuildError) -> Self {
    Self {
      kind: e.kind(),
      message: e.to_string(),
    }
  }
}

/// Errors that stop a resolution before or outside individual builds.
///
/// Build failures are not errors at this level; they are recorded per
/// address in the [`ResolveReport`].
#[derive(Debug, Error)]
pub enum ExecuteError {
  /// The graph is malformed (invalid spec, unknown dependency, cycle).
  #[error(transparent)]
  Input(#[from] AddressError),

  /// A requested root does not belong to the graph.
  #[error("unknown root package {0}")]
  UnknownRoot(PackageId),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to unpack {path} into {dest}: {source}")]
  Unpack {
    path: PathBuf,
    dest: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl ExecuteError {
  pub fn kind(&self) -> FailureKind {
    match self {
      ExecuteError::Input(_) | ExecuteError::UnknownRoot(_) => FailureKind::Input,
      ExecuteError::Store(_) | ExecuteError::Unpack { .. } => FailureKind::Storage,
    }
  }
}

/// Final state of one requested package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RootStatus {
  /// The package and its run-time closure are published.
  Succeeded { path: PathBuf, origin: Origin },
  /// The package's own build failed.
  Failed(NodeFailure),
  /// Something the package needs failed, so it was never attempted or is unusable.
  DependencyFailed { dependency: FailedDependency },
}

/// Outcome for one requested package.
#[derive(Debug, Clone, Serialize)]
pub struct RootReport {
  pub id: PackageId,
  pub name: String,
  pub address: ContentAddress,
  #[serde(flatten)]
  pub status: RootStatus,
}

/// Result of resolving a package graph.
#[derive(Debug, Default)]
pub struct ResolveReport {
  /// Published addresses, whether found in the store or built now.
  pub realized: HashMap<ContentAddress, Publication>,

  /// Addresses whose own build failed.
  pub failed: HashMap<ContentAddress, NodeFailure>,

  /// Addresses skipped because a build dependency failed.
  pub skipped: HashMap<ContentAddress, FailedDependency>,

  /// Addresses built by this resolution, in completion order.
  pub built: Vec<ContentAddress>,

  /// Per-root outcome, in request order.
  pub roots: Vec<RootReport>,

  /// Shared locks on every realized address, released with the report.
  pub(crate) pins: Vec<EntryLock>,
}

impl ResolveReport {
  /// Returns true if every requested package succeeded.
  pub fn is_success(&self) -> bool {
    self.roots.iter().all(|r| matches!(r.status, RootStatus::Succeeded { .. }))
  }

  /// Returns the number of addresses processed.
  pub fn total(&self) -> usize {
    self.realized.len() + self.failed.len() + self.skipped.len()
  }

  /// Number of addresses that were already published.
  pub fn cached(&self) -> usize {
    self.realized.values().filter(|p| p.origin == Origin::Cached).count()
  }

  /// Published path of `address`, if it was realized.
  pub fn artifact(&self, address: &ContentAddress) -> Option<&PathBuf> {
    self.realized.get(address).map(|p| &p.path)
  }
}

/// A fetch that failed during prefetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
  pub filename: String,
  pub sha256: String,
  #[serde(flatten)]
  pub failure: NodeFailure,
}

/// Result of prefetching the sources of a package graph.
#[derive(Debug, Default, Serialize)]
pub struct PrefetchReport {
  /// Checksums downloaded by this call.
  pub fetched: Vec<String>,
  /// Checksums already present in the store.
  pub cached: usize,
  /// Packages skipped because their artifact is already published.
  pub skipped_packages: usize,
  pub failures: Vec<FetchFailure>,
}

impl PrefetchReport {
  pub fn is_success(&self) -> bool {
    self.failures.is_empty()
  }
}

/// Configuration for resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteConfig {
  /// Maximum number of builds to execute concurrently.
  pub jobs: usize,

  /// Parallelism advertised to each build script.
  pub parallelism: usize,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      jobs: num_cpus(),
      parallelism: num_cpus(),
    }
  }
}

impl ExecuteConfig {
  /// Defaults, with the per-build parallelism taken from the environment when set.
  pub fn from_env() -> Self {
    let mut config = Self::default();
    if let Some(n) = std::env::var(PARALLELISM_ENV)
      .ok()
      .and_then(|v| v.trim().parse::<usize>().ok())
      .filter(|&n| n > 0)
    {
      config.parallelism = n;
    }
    config
  }

  pub fn with_jobs(mut self, jobs: usize) -> Self {
    self.jobs = jobs.max(1);
    self
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
