//! Dependency scheduler.
//!
//! This module provides the main entry points for resolving a package graph:
//! - DAG-based ordering by content address
//! - Parallel builds of independent addresses
//! - Failure propagation and skip tracking
//! - Source prefetch and run-time closure export
//!
//! Coordination between processes happens entirely in the store; the
//! scheduler only orders work inside one resolution.

pub mod dag;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::address::{AddressMap, ContentAddress};
use crate::build::archive::unpack_into;
use crate::build::sandbox::Sandbox;
use crate::build::{BuildExecutor, BuildJob};
use crate::error::FailureKind;
use crate::fetch::{FetchCache, FetchError, Transport};
use crate::lock::EntryLock;
use crate::package::{FetchSpec, PackageGraph, PackageId};
use crate::store::{EntryKind, Publication, Store};

pub use dag::{DagNode, ExecutionDag};
pub use types::{
  ExecuteConfig, ExecuteError, FailedDependency, FetchFailure, NodeFailure, PrefetchReport, ResolveReport, RootReport,
  RootStatus,
};

/// Result of one build task; the lock pins the published artifact.
type BuildOutcome = Result<(Publication, EntryLock), NodeFailure>;

/// Resolves package graphs against one store.
#[derive(Clone)]
pub struct Coordinator {
  store: Store,
  fetcher: FetchCache,
  executor: BuildExecutor,
  config: ExecuteConfig,
}

impl Coordinator {
  pub fn new(store: Store, transport: Arc<dyn Transport>, sandbox: Arc<dyn Sandbox>, config: ExecuteConfig) -> Self {
    let fetcher = FetchCache::new(store.layout().clone(), transport);
    let executor = BuildExecutor::new(store.clone(), fetcher.clone(), sandbox, config.parallelism);
    Self {
      store,
      fetcher,
      executor,
      config,
    }
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn fetcher(&self) -> &FetchCache {
    &self.fetcher
  }

  pub fn config(&self) -> &ExecuteConfig {
    &self.config
  }

  /// Resolve `roots` and everything they depend on.
  ///
  /// Each distinct address is realized at most once: from the store when it
  /// is already published, otherwise by building it. Realized addresses stay
  /// pinned until the returned report is dropped. A malformed graph is an
  /// error before anything touches the store; build failures are reported
  /// per address and per root, and independent branches still complete.
  pub async fn resolve(&self, graph: Arc<PackageGraph>, roots: &[PackageId]) -> Result<ResolveReport, ExecuteError> {
    check_roots(&graph, roots)?;
    let addresses = Arc::new(AddressMap::compute(&graph)?);
    let dag = ExecutionDag::from_graph(&graph, &addresses, roots);
    let waves = dag.waves();

    info!(
      roots = roots.len(),
      addresses = dag.len(),
      waves = waves.len(),
      "starting resolution"
    );

    let mut report = ResolveReport::default();
    let mut failed: HashMap<ContentAddress, FailedDependency> = HashMap::new();
    let semaphore = Arc::new(Semaphore::new(self.config.jobs.max(1)));

    for (wave_idx, wave) in waves.into_iter().enumerate() {
      debug!(wave = wave_idx, nodes = wave.len(), "executing wave");

      let mut ready = Vec::new();
      for node in wave {
        let failed_dep = dag.dependencies(&node.address).into_iter().find_map(|dep| failed.get(&dep).cloned());
        match failed_dep {
          Some(dependency) => {
            warn!(
              package = %graph.spec(node.package).display_name(),
              address = %node.address,
              failed_dep = %dependency,
              "skipping package due to failed dependency"
            );
            failed.insert(node.address.clone(), dependency.clone());
            report.skipped.insert(node.address, dependency);
          }
          None => ready.push(node),
        }
      }

      if ready.is_empty() {
        continue;
      }

      for (node, result) in self.execute_wave(ready, &graph, &addresses, &semaphore).await {
        let name = graph.spec(node.package).display_name().to_string();
        match result {
          Ok((publication, pin)) => {
            if publication.origin == crate::store::Origin::Built {
              report.built.push(node.address.clone());
            }
            report.pins.push(pin);
            report.realized.insert(node.address, publication);
          }
          Err(failure) => {
            error!(package = %name, address = %node.address, error = %failure.message, "package failed");
            failed.insert(
              node.address.clone(),
              FailedDependency {
                address: node.address.clone(),
                name,
              },
            );
            report.failed.insert(node.address, failure);
          }
        }
      }
    }

    report.roots = roots
      .iter()
      .map(|&id| root_report(&graph, &addresses, &report, id))
      .collect();

    info!(
      realized = report.realized.len(),
      built = report.built.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      "resolution complete"
    );

    Ok(report)
  }

  async fn execute_wave(
    &self,
    nodes: Vec<DagNode>,
    graph: &Arc<PackageGraph>,
    addresses: &Arc<AddressMap>,
    semaphore: &Arc<Semaphore>,
  ) -> Vec<(DagNode, BuildOutcome)> {
    let mut join_set = JoinSet::new();
    let mut tasks = HashMap::new();

    for node in nodes {
      let Ok(permit) = semaphore.clone().acquire_owned().await else {
        break;
      };
      let executor = self.executor.clone();
      let graph = graph.clone();
      let addresses = addresses.clone();
      let task_node = node.clone();

      let handle = join_set.spawn_blocking(move || {
        let _permit = permit;
        let id = task_node.package;
        let job = BuildJob {
          address: &task_node.address,
          spec: graph.spec(id),
          build_closure: closure_addresses(&addresses, graph.build_closure(id)),
          run_closure: closure_addresses(&addresses, graph.run_closure(id)),
        };
        let result = executor.build(&job).map_err(|e| NodeFailure::from(&e));
        (task_node, result)
      });
      tasks.insert(handle.id(), node);
    }

    collect_join_results(join_set, tasks).await
  }

  /// Fetch the sources of every package reachable from `roots` without building.
  ///
  /// With `missing_only`, packages whose artifact is already published are
  /// skipped. Fetch failures are collected rather than returned.
  pub async fn prefetch(
    &self,
    graph: Arc<PackageGraph>,
    roots: &[PackageId],
    missing_only: bool,
  ) -> Result<PrefetchReport, ExecuteError> {
    check_roots(&graph, roots)?;
    let addresses = AddressMap::compute(&graph)?;

    let mut report = PrefetchReport::default();
    let mut wanted: Vec<FetchSpec> = Vec::new();
    let mut seen = HashSet::new();

    for id in graph.requested_closure(roots) {
      if missing_only && self.store.is_published(EntryKind::Package, addresses.get(id).as_str()) {
        report.skipped_packages += 1;
        continue;
      }
      for fetch in &graph.spec(id).fetch {
        if !seen.insert(fetch.sha256.clone()) {
          continue;
        }
        if self.fetcher.is_cached(&fetch.sha256) {
          report.cached += 1;
        } else {
          wanted.push(fetch.clone());
        }
      }
    }

    info!(count = wanted.len(), cached = report.cached, "prefetching sources");

    let semaphore = Arc::new(Semaphore::new(self.config.jobs.max(1)));
    let mut join_set = JoinSet::new();
    for fetch in wanted {
      let Ok(permit) = semaphore.clone().acquire_owned().await else {
        break;
      };
      let fetcher = self.fetcher.clone();
      join_set.spawn_blocking(move || {
        let _permit = permit;
        let result = fetcher.fetch(&fetch);
        (fetch, result)
      });
    }

    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok((fetch, Ok(_))) => report.fetched.push(fetch.sha256),
        Ok((fetch, Err(e))) => {
          error!(filename = %fetch.filename, error = %e, "prefetch failed");
          report.failures.push(fetch_failure(&fetch, &e));
        }
        Err(e) => error!(error = %e, "fetch task panicked"),
      }
    }
    report.fetched.sort();

    Ok(report)
  }

  /// Unpack the run-time closure of `roots` into `dest`, dependencies first.
  ///
  /// Every package in the closure must already be published; each stays
  /// pinned while it is unpacked. Returns the closure's addresses.
  pub fn export_closure(
    &self,
    graph: &PackageGraph,
    roots: &[PackageId],
    dest: &Path,
  ) -> Result<Vec<ContentAddress>, ExecuteError> {
    check_roots(graph, roots)?;
    let addresses = AddressMap::compute(graph)?;
    let closure = closure_addresses(&addresses, graph.runtime_closure_of(roots));

    let pins = closure
      .iter()
      .map(|address| self.store.pin(EntryKind::Package, address.as_str(), "export closure"))
      .collect::<Result<Vec<EntryLock>, _>>()?;

    for address in &closure {
      let artifact = self.store.layout().package_artifact(address.as_str());
      debug!(address = %address, dest = ?dest, "exporting");
      unpack_into(&artifact, dest).map_err(|source| ExecuteError::Unpack {
        path: artifact.clone(),
        dest: dest.to_path_buf(),
        source,
      })?;
    }

    drop(pins);
    info!(packages = closure.len(), dest = ?dest, "exported run-time closure");
    Ok(closure)
  }
}

fn check_roots(graph: &PackageGraph, roots: &[PackageId]) -> Result<(), ExecuteError> {
  match roots.iter().find(|id| graph.get(**id).is_none()) {
    Some(&id) => Err(ExecuteError::UnknownRoot(id)),
    None => Ok(()),
  }
}

/// Map package ids to addresses, keeping the first occurrence of each address.
pub(crate) fn closure_addresses(addresses: &AddressMap, ids: Vec<PackageId>) -> Vec<ContentAddress> {
  let mut seen = HashSet::new();
  ids
    .into_iter()
    .map(|id| addresses.get(id).clone())
    .filter(|address| seen.insert(address.clone()))
    .collect()
}

fn fetch_failure(fetch: &FetchSpec, e: &FetchError) -> FetchFailure {
  FetchFailure {
    filename: fetch.filename.clone(),
    sha256: fetch.sha256.clone(),
    failure: NodeFailure {
      kind: e.kind(),
      message: e.to_string(),
    },
  }
}

/// Collect results from a JoinSet of build tasks.
///
/// A task that panicked is reported as a build failure of its node.
async fn collect_join_results(
  mut join_set: JoinSet<(DagNode, BuildOutcome)>,
  mut tasks: HashMap<tokio::task::Id, DagNode>,
) -> Vec<(DagNode, BuildOutcome)> {
  let mut results = Vec::new();

  while let Some(join_result) = join_set.join_next().await {
    match join_result {
      Ok(result) => results.push(result),
      Err(e) => {
        let Some(node) = tasks.remove(&e.id()) else {
          error!(error = %e, "unknown build task failed");
          continue;
        };
        error!(address = %node.address, error = %e, "build task panicked");
        let failure = NodeFailure {
          kind: FailureKind::Build,
          message: format!("build of {} panicked: {}", node.address, panic_message(e)),
        };
        results.push((node, Err(failure)));
      }
    }
  }

  results
}

fn panic_message(e: JoinError) -> String {
  match e.try_into_panic() {
    Ok(payload) => payload
      .downcast_ref::<&str>()
      .map(|s| s.to_string())
      .or_else(|| payload.downcast_ref::<String>().cloned())
      .unwrap_or_else(|| "unknown panic payload".to_string()),
    Err(e) => e.to_string(),
  }
}

/// Final status of one root: its own outcome, then the first failure in its
/// run-time closure.
fn root_report(graph: &PackageGraph, addresses: &AddressMap, report: &ResolveReport, id: PackageId) -> RootReport {
  let address = addresses.get(id).clone();
  let name = graph.spec(id).display_name().to_string();

  let status = if let Some(failure) = report.failed.get(&address) {
    RootStatus::Failed(failure.clone())
  } else if let Some(dependency) = report.skipped.get(&address) {
    RootStatus::DependencyFailed {
      dependency: dependency.clone(),
    }
  } else if let Some(dependency) = graph.run_closure(id).into_iter().find_map(|dep| {
    let dep_address = addresses.get(dep);
    let unusable = report.failed.contains_key(dep_address) || report.skipped.contains_key(dep_address);
    unusable.then(|| FailedDependency {
      address: dep_address.clone(),
      name: graph.spec(dep).display_name().to_string(),
    })
  }) {
    RootStatus::DependencyFailed { dependency }
  } else if let Some(publication) = report.realized.get(&address) {
    RootStatus::Succeeded {
      path: publication.path.clone(),
      origin: publication.origin,
    }
  } else {
    RootStatus::Failed(NodeFailure {
      kind: FailureKind::Build,
      message: "package build did not complete".to_string(),
    })
  };

  RootReport {
    id,
    name,
    address,
    status,
  }
}
