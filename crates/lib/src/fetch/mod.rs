//! Checksum-keyed cache of fetched source files.
//!
//! A verified file lives at `fetch/<sha256>` and is shared by every package
//! that declares the same checksum, whatever filename it uses. Downloads go to
//! a private temp file next to the entry and are renamed into place only after
//! the checksum matches, so a published file is always verified.

pub mod transport;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::FailureKind;
use crate::lock::{EntryLock, LockError, LockMode};
use crate::package::FetchSpec;
use crate::store::layout::{EntryKind, StoreLayout, TEMP_SUFFIX};
use crate::util::fs::{sync_dir, touch};
use crate::util::hash::{HashError, hash_file};

pub use transport::{DefaultTransport, Transport, TransportError};

/// Why a single source did not deliver.
#[derive(Debug)]
pub enum SourceFailure {
  Transport(TransportError),
  Mismatch { url: String, actual: String },
}

impl std::fmt::Display for SourceFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SourceFailure::Transport(e) => write!(f, "{e}"),
      SourceFailure::Mismatch { url, actual } => write!(f, "{url} delivered sha256 {actual}"),
    }
  }
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("no sources given for {filename} ({sha256})")]
  NoSources { filename: String, sha256: String },

  #[error("failed to fetch {filename} ({sha256}): {}", summarize(.failures))]
  Exhausted {
    filename: String,
    sha256: String,
    /// Set when a checksum mismatch decided the outcome.
    integrity: bool,
    failures: Vec<SourceFailure>,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("failed to prepare download of {filename} in {dir}: {source}")]
  Prepare {
    filename: String,
    dir: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to verify download of {filename}: {source}")]
  Verify {
    filename: String,
    #[source]
    source: HashError,
  },

  #[error("failed to publish {filename} to {path}: {source}")]
  Publish {
    filename: String,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

fn summarize(failures: &[SourceFailure]) -> String {
  failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

impl FetchError {
  pub fn kind(&self) -> FailureKind {
    match self {
      FetchError::NoSources { .. } => FailureKind::Input,
      FetchError::Exhausted { integrity: true, .. } => FailureKind::Integrity,
      FetchError::Exhausted { .. } => FailureKind::Fetch,
      FetchError::Lock(_) | FetchError::Prepare { .. } | FetchError::Verify { .. } | FetchError::Publish { .. } => {
        FailureKind::Storage
      }
    }
  }
}

/// The fetch half of a store.
#[derive(Clone)]
pub struct FetchCache {
  layout: StoreLayout,
  transport: Arc<dyn Transport>,
}

impl FetchCache {
  pub fn new(layout: StoreLayout, transport: Arc<dyn Transport>) -> Self {
    Self { layout, transport }
  }

  pub fn entry_path(&self, sha256: &str) -> PathBuf {
    self.layout.published(EntryKind::Fetch, sha256)
  }

  pub fn is_cached(&self, sha256: &str) -> bool {
    self.entry_path(sha256).is_file()
  }

  /// Return the path of the verified file for `spec`, downloading it if needed.
  ///
  /// Concurrent callers for the same checksum wait for one download.
  pub fn fetch(&self, spec: &FetchSpec) -> Result<PathBuf, FetchError> {
    let dest = self.entry_path(&spec.sha256);
    if self.lookup(&dest) {
      debug!(filename = %spec.filename, sha256 = %spec.sha256, "fetch cache hit");
      return Ok(dest);
    }

    if spec.sources.is_empty() {
      return Err(FetchError::NoSources {
        filename: spec.filename.clone(),
        sha256: spec.sha256.clone(),
      });
    }

    let purpose = format!("fetch {}", spec.filename);
    let _lock = EntryLock::acquire(&self.layout.lock(EntryKind::Fetch, &spec.sha256), LockMode::Exclusive, &purpose)?;

    if self.lookup(&dest) {
      debug!(filename = %spec.filename, "fetched by another process while waiting");
      return Ok(dest);
    }

    let dir = self.layout.kind_dir(EntryKind::Fetch);
    let mut failures = Vec::new();

    for source in &spec.sources {
      let mut temp = tempfile::Builder::new()
        .prefix(&format!("{}.", spec.sha256))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(&dir)
        .map_err(|source| FetchError::Prepare {
          filename: spec.filename.clone(),
          dir: dir.clone(),
          source,
        })?;

      info!(filename = %spec.filename, url = %source.url, "downloading");
      let failure = match self.transport.fetch(&source.url, temp.as_file_mut()) {
        Err(e) => SourceFailure::Transport(e),
        Ok(bytes) => {
          let actual = hash_file(temp.path()).map_err(|source| FetchError::Verify {
            filename: spec.filename.clone(),
            source,
          })?;
          if actual.0 == spec.sha256 {
            return self.publish(spec, temp, &dest).map(|()| {
              info!(filename = %spec.filename, sha256 = %spec.sha256, bytes, "fetch complete");
              dest
            });
          }
          SourceFailure::Mismatch {
            url: source.url.clone(),
            actual: actual.0,
          }
        }
      };

      if source.best_effort {
        debug!(url = %source.url, error = %failure, "best-effort source failed");
      } else {
        warn!(url = %source.url, error = %failure, "source failed");
      }
      failures.push((source.best_effort, failure));
    }

    Err(exhausted(spec, failures))
  }

  fn lookup(&self, dest: &std::path::Path) -> bool {
    if !dest.is_file() {
      return false;
    }
    if let Err(e) = touch(dest) {
      debug!(path = ?dest, error = %e, "failed to record fetch use");
    }
    true
  }

  fn publish(&self, spec: &FetchSpec, temp: tempfile::NamedTempFile, dest: &std::path::Path) -> Result<(), FetchError> {
    let publish_err = |source| FetchError::Publish {
      filename: spec.filename.clone(),
      path: dest.to_path_buf(),
      source,
    };
    temp.as_file().sync_all().map_err(publish_err)?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o444)).map_err(publish_err)?;
    temp.persist(dest).map_err(|e| publish_err(e.error))?;
    if let Some(parent) = dest.parent()
      && let Err(e) = sync_dir(parent)
    {
      warn!(path = ?parent, error = %e, "failed to sync fetch directory");
    }
    Ok(())
  }
}

// Best-effort failures only count when no regular source was tried.
fn exhausted(spec: &FetchSpec, failures: Vec<(bool, SourceFailure)>) -> FetchError {
  let any_regular = failures.iter().any(|(best_effort, _)| !best_effort);
  let failures: Vec<SourceFailure> = failures
    .into_iter()
    .filter(|(best_effort, _)| !any_regular || !best_effort)
    .map(|(_, f)| f)
    .collect();
  let integrity = failures.iter().any(|f| matches!(f, SourceFailure::Mismatch { .. }));
  FetchError::Exhausted {
    filename: spec.filename.clone(),
    sha256: spec.sha256.clone(),
    integrity,
    failures,
  }
}
