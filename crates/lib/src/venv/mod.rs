//! Virtual environments.
//!
//! A venv is the merged run-time closure of some packages plus declared
//! filesystem entries, published unpacked under `venvs/<address>/rootfs` so a
//! launcher can mount it read-only without extracting anything per use.
//! Materializing a venv never runs a build script.

pub mod launch;
pub mod manifest;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::address::{AddressMap, ContentAddress, Hashable};
use crate::error::FailureKind;
use crate::execute::{Coordinator, ExecuteError, RootStatus, closure_addresses};
use crate::lock::EntryLock;
use crate::package::{PackageGraph, PackageId, SpecError};
use crate::store::layout::ROOTFS_DIR;
use crate::store::{EntryKind, EntryRecord, Origin, Staging, StoreError};
use crate::util::fs::remove_path;

pub use launch::LaunchPlan;
pub use manifest::{FsEntry, Mount, MountKind, VenvManifest};

const VENV_SCHEME: &str = "cairn-venv/1";

// Cleanup may remove an unpinned venv between publish and pin.
const MAX_OPEN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum VenvError {
  #[error("invalid venv manifest: {0}")]
  Manifest(String),

  #[error(transparent)]
  Spec(#[from] SpecError),

  #[error(transparent)]
  Resolve(#[from] ExecuteError),

  #[error("venv packages failed: {}", .failed.join(", "))]
  Packages { failed: Vec<String> },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to materialize {path}: {source}")]
  FsEntry {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to compute venv address: {0}")]
  Address(#[from] serde_json::Error),

  #[error("venv {address} was removed while being opened")]
  Vanished { address: ContentAddress },

  #[error("venv task failed: {0}")]
  Task(String),
}

impl VenvError {
  pub fn kind(&self) -> FailureKind {
    match self {
      VenvError::Manifest(_) | VenvError::Spec(_) => FailureKind::Input,
      VenvError::Resolve(e) => e.kind(),
      VenvError::Packages { .. } => FailureKind::Dependency,
      VenvError::Store(_)
      | VenvError::FsEntry { .. }
      | VenvError::Address(_)
      | VenvError::Vanished { .. }
      | VenvError::Task(_) => FailureKind::Storage,
    }
  }
}

// Package ids are left out: only the resolved closure and the environment
// configuration decide what the venv contains.
#[derive(Serialize)]
struct VenvKey<'a> {
  scheme: &'static str,
  packages: BTreeSet<&'a ContentAddress>,
  fs_entries: &'a [FsEntry],
  mount_defaults: bool,
  mounts: &'a [Mount],
  env_keep: BTreeSet<&'a str>,
  env_set: &'a BTreeMap<String, String>,
}

impl Hashable for VenvKey<'_> {}

/// Address of a venv over the given closure.
///
/// Closure order and duplicates do not matter.
pub fn venv_address(closure: &[ContentAddress], manifest: &VenvManifest) -> Result<ContentAddress, serde_json::Error> {
  VenvKey {
    scheme: VENV_SCHEME,
    packages: closure.iter().collect(),
    fs_entries: &manifest.fs_entries,
    mount_defaults: manifest.mount_defaults,
    mounts: &manifest.mounts,
    env_keep: manifest.env_keep.iter().map(String::as_str).collect(),
    env_set: &manifest.env_set,
  }
  .content_address()
}

/// An opened venv. The entry stays pinned, so cleanup skips it, until the
/// session is dropped.
#[derive(Debug)]
pub struct VenvSession {
  address: ContentAddress,
  rootfs: PathBuf,
  origin: Origin,
  closure: Vec<ContentAddress>,
  _pin: EntryLock,
}

impl VenvSession {
  pub fn address(&self) -> &ContentAddress {
    &self.address
  }

  pub fn rootfs(&self) -> &Path {
    &self.rootfs
  }

  pub fn origin(&self) -> Origin {
    self.origin
  }

  /// Package addresses exposed in the venv, dependencies first.
  pub fn closure(&self) -> &[ContentAddress] {
    &self.closure
  }

  /// Plan a launch with the host's environment and working directory.
  pub fn launch_plan(&self, manifest: &VenvManifest) -> LaunchPlan {
    LaunchPlan::from_host(&self.rootfs, manifest)
  }
}

/// Builds venvs on top of a [`Coordinator`].
#[derive(Clone)]
pub struct VenvMaterializer {
  coordinator: Coordinator,
}

impl VenvMaterializer {
  pub fn new(coordinator: Coordinator) -> Self {
    Self { coordinator }
  }

  /// Resolve the manifest's packages, then publish and pin the venv.
  pub async fn open(
    &self,
    graph: Arc<PackageGraph>,
    roots: Vec<PackageId>,
    manifest: VenvManifest,
  ) -> Result<VenvSession, VenvError> {
    manifest.validate()?;
    let report = self.coordinator.resolve(graph.clone(), &roots).await?;

    let failed: Vec<String> = report
      .roots
      .iter()
      .filter(|r| !matches!(r.status, RootStatus::Succeeded { .. }))
      .map(|r| format!("{} ({})", r.name, r.address))
      .collect();
    if !failed.is_empty() {
      return Err(VenvError::Packages { failed });
    }

    let this = self.clone();
    let session = tokio::task::spawn_blocking(move || this.materialize(&graph, &roots, &manifest))
      .await
      .map_err(|e| VenvError::Task(e.to_string()))?;
    // The report pins the packages until the venv is published from them.
    drop(report);
    session
  }

  /// Publish and pin the venv for `roots`, whose closures must already be
  /// published.
  pub fn materialize(
    &self,
    graph: &PackageGraph,
    roots: &[PackageId],
    manifest: &VenvManifest,
  ) -> Result<VenvSession, VenvError> {
    let addresses = AddressMap::compute(graph).map_err(ExecuteError::from)?;
    let closure = closure_addresses(&addresses, graph.runtime_closure_of(roots));
    let address = venv_address(&closure, manifest)?;
    let store = self.coordinator.store();

    for attempt in 1..=MAX_OPEN_ATTEMPTS {
      let publication = store.realize(EntryKind::Venv, address.as_str(), "materialize venv", |staging| {
        self.produce(graph, roots, manifest, &address, &closure, staging)
      })?;

      match store.pin(EntryKind::Venv, address.as_str(), "venv session") {
        Ok(pin) => {
          info!(address = %address, origin = ?publication.origin, "venv ready");
          return Ok(VenvSession {
            rootfs: store.layout().venv_rootfs(address.as_str()),
            address,
            origin: publication.origin,
            closure,
            _pin: pin,
          });
        }
        Err(StoreError::NotPublished { .. }) => {
          warn!(address = %address, attempt, "venv removed before it could be pinned, retrying");
        }
        Err(e) => return Err(e.into()),
      }
    }

    Err(VenvError::Vanished { address })
  }

  fn produce(
    &self,
    graph: &PackageGraph,
    roots: &[PackageId],
    manifest: &VenvManifest,
    address: &ContentAddress,
    closure: &[ContentAddress],
    staging: &Staging,
  ) -> Result<(), VenvError> {
    let output = staging.output();
    let rootfs = output.join(ROOTFS_DIR);
    fs::create_dir_all(&rootfs).map_err(|source| VenvError::FsEntry {
      path: rootfs.clone(),
      source,
    })?;

    self.coordinator.export_closure(graph, roots, &rootfs)?;
    apply_fs_entries(&rootfs, &manifest.fs_entries)?;

    let mut record = EntryRecord::new(EntryKind::Venv, address.clone());
    record.run_closure = closure.to_vec();
    record.write_to(&output)?;
    Ok(())
  }
}

/// Write `entries` into `rootfs`, in order, replacing whatever is there.
pub fn apply_fs_entries(rootfs: &Path, entries: &[FsEntry]) -> Result<(), VenvError> {
  for entry in entries {
    let relative = entry.relative_path()?;
    let target = rootfs.join(&relative);
    let fail = |source: io::Error| VenvError::FsEntry {
      path: target.clone(),
      source,
    };

    check_ancestors(rootfs, &relative).map_err(fail)?;
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).map_err(fail)?;
    }
    debug!(path = ?relative, "writing fs entry");

    match entry {
      FsEntry::Directory { mode, .. } => {
        if fs::symlink_metadata(&target).is_ok_and(|m| !m.is_dir()) {
          remove_path(&target).map_err(fail)?;
        }
        fs::create_dir_all(&target).map_err(fail)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(*mode)).map_err(fail)?;
      }
      FsEntry::File { content, mode, .. } => {
        remove_path(&target).map_err(fail)?;
        fs::write(&target, content).map_err(fail)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(*mode)).map_err(fail)?;
      }
      FsEntry::Symlink { target: link, .. } => {
        remove_path(&target).map_err(fail)?;
        std::os::unix::fs::symlink(link, &target).map_err(fail)?;
      }
    }
  }
  Ok(())
}

// Symlinks inside the rootfs point into the venv, not the host; following
// one while writing would escape the rootfs.
fn check_ancestors(rootfs: &Path, relative: &Path) -> io::Result<()> {
  let mut current = rootfs.to_path_buf();
  let parents = relative.parent().map(|p| p.components().collect::<Vec<_>>()).unwrap_or_default();
  for component in parents {
    current.push(component);
    if fs::symlink_metadata(&current).is_ok_and(|m| m.file_type().is_symlink()) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} is a symlink", current.display()),
      ));
    }
  }
  Ok(())
}
