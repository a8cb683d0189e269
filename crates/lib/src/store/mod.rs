//! Store layout and the publish protocol.
//!
//! Every transition of an entry into the published state goes through
//! [`Store::realize`]:
//!
//! 1. Fast path: if the entry is published, return it without locking.
//! 2. Take the entry's exclusive lock, waiting if another process holds it.
//! 3. Check again; whoever held the lock may have published meanwhile.
//! 4. Produce the entry inside a private `<key>.build/` directory.
//! 5. Atomically rename the produced output to the published path.
//!
//! Published entries are never modified afterwards. Readers need no lock, but
//! a reader that uses an entry for longer than a lookup takes a shared lock
//! through [`Store::pin`] so the cleanup service leaves it alone.

pub mod layout;
pub mod record;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::lock::{EntryLock, LockError, LockMode, LockState};
use crate::util::fs::{remove_path, sync_dir, touch};

pub use layout::{EntryFile, EntryKind, StoreLayout};
pub use record::EntryRecord;

// A sweep may remove an unpinned entry between its publication and the pin.
const PIN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("failed to prepare {path}: {source}")]
  Prepare {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to publish {key} to {path}: {source}")]
  Publish {
    key: String,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("nothing was produced at {path}")]
  MissingOutput { path: PathBuf },

  #[error("{kind} entry {key} is not published")]
  NotPublished { kind: EntryKind, key: String },

  #[error("failed to access entry record {path}: {message}")]
  Record { path: PathBuf, message: String },
}

/// How a published entry was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
  Cached,
  Built,
}

/// A published entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
  pub kind: EntryKind,
  pub key: String,
  pub path: PathBuf,
  pub origin: Origin,
}

/// Private working area of one in-progress entry.
#[derive(Debug)]
pub struct Staging {
  dir: PathBuf,
}

impl Staging {
  /// The `<key>.build` directory itself.
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Scratch space for the producer.
  pub fn work_dir(&self) -> PathBuf {
    self.dir.join("work")
  }

  /// What the producer leaves here is renamed into the published path.
  pub fn output(&self) -> PathBuf {
    self.dir.join("publish")
  }
}

/// Handle on one store root.
#[derive(Debug, Clone)]
pub struct Store {
  layout: StoreLayout,
  config: StoreConfig,
}

impl Store {
  /// Open (and create if needed) the store described by `config`.
  pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
    let layout = StoreLayout::new(&config.root);
    layout.ensure().map_err(|source| StoreError::Prepare {
      path: config.root.clone(),
      source,
    })?;
    Ok(Self { layout, config })
  }

  pub fn layout(&self) -> &StoreLayout {
    &self.layout
  }

  pub fn config(&self) -> &StoreConfig {
    &self.config
  }

  /// Return the published path of an entry and record the use.
  pub fn lookup(&self, kind: EntryKind, key: &str) -> Option<PathBuf> {
    let path = self.layout.published(kind, key);
    if fs::symlink_metadata(&path).is_err() {
      return None;
    }
    if let Err(e) = touch(&path) {
      debug!(path = ?path, error = %e, "failed to record entry use");
    }
    Some(path)
  }

  pub fn is_published(&self, kind: EntryKind, key: &str) -> bool {
    fs::symlink_metadata(self.layout.published(kind, key)).is_ok()
  }

  /// Publish an entry at most once across all cooperating processes.
  ///
  /// `produce` runs only when the entry is absent, while this process holds
  /// the entry's exclusive lock. It must leave its result at
  /// [`Staging::output`]. On failure nothing is published and the build
  /// directory is kept or removed according to [`StoreConfig::keep_failed`].
  pub fn realize<E, F>(&self, kind: EntryKind, key: &str, purpose: &str, produce: F) -> Result<Publication, E>
  where
    E: From<StoreError>,
    F: FnOnce(&Staging) -> Result<(), E>,
  {
    if let Some(path) = self.lookup(kind, key) {
      debug!(%kind, key, "already published");
      return Ok(self.publication(kind, key, path, Origin::Cached));
    }

    let lock = EntryLock::acquire(&self.layout.lock(kind, key), LockMode::Exclusive, purpose).map_err(StoreError::from)?;
    if let Some(previous) = lock.reclaimed() {
      warn!(%kind, key, previous = %previous, "previous producer abandoned this entry");
    }

    if let Some(path) = self.lookup(kind, key) {
      debug!(%kind, key, "published while waiting for lock");
      return Ok(self.publication(kind, key, path, Origin::Cached));
    }

    let staging = self.prepare_staging(kind, key)?;
    debug!(%kind, key, dir = ?staging.dir(), "producing entry");

    if let Err(e) = produce(&staging) {
      if self.config.keep_failed {
        warn!(%kind, key, dir = ?staging.dir(), "production failed, keeping build directory");
      } else if let Err(rm) = remove_path(staging.dir()) {
        warn!(%kind, key, error = %rm, "failed to remove build directory");
      }
      return Err(e);
    }

    let path = self.promote(kind, key, &staging)?;
    info!(%kind, key, "published");
    drop(lock);
    Ok(self.publication(kind, key, path, Origin::Built))
  }

  /// [`Store::realize`], returning the entry pinned.
  ///
  /// The pin is taken after publication; an entry swept in between is
  /// realized again.
  pub fn realize_pinned<E, F>(
    &self,
    kind: EntryKind,
    key: &str,
    purpose: &str,
    mut produce: F,
  ) -> Result<(Publication, EntryLock), E>
  where
    E: From<StoreError>,
    F: FnMut(&Staging) -> Result<(), E>,
  {
    self.pin_after(kind, key, purpose, || self.realize(kind, key, purpose, &mut produce))
  }

  /// Run `ensure`, which publishes the entry, then pin the entry.
  ///
  /// `ensure` runs again when the entry is gone by the time the pin is taken,
  /// up to [`PIN_ATTEMPTS`] times.
  pub fn pin_after<T, E, F>(&self, kind: EntryKind, key: &str, purpose: &str, mut ensure: F) -> Result<(T, EntryLock), E>
  where
    E: From<StoreError>,
    F: FnMut() -> Result<T, E>,
  {
    let mut attempt = 1;
    loop {
      let value = ensure()?;
      match self.pin(kind, key, purpose) {
        Ok(lock) => return Ok((value, lock)),
        Err(StoreError::NotPublished { .. }) if attempt < PIN_ATTEMPTS => {
          warn!(%kind, key, attempt, "entry removed before it could be pinned, realizing again");
          attempt += 1;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  /// Take a shared lock on a published entry for the duration of a use.
  ///
  /// Returns `NotPublished` when the entry is absent.
  pub fn pin(&self, kind: EntryKind, key: &str, purpose: &str) -> Result<EntryLock, StoreError> {
    let lock = EntryLock::acquire(&self.layout.lock(kind, key), LockMode::Shared, purpose)?;
    if !self.is_published(kind, key) {
      return Err(StoreError::NotPublished {
        kind,
        key: key.to_string(),
      });
    }
    Ok(lock)
  }

  /// State of every lock file of `kind`, sorted by key.
  pub fn locks(&self, kind: EntryKind) -> Result<Vec<(String, LockState)>, StoreError> {
    let dir = self.layout.kind_dir(kind);
    let entries = fs::read_dir(&dir).map_err(|source| StoreError::Prepare {
      path: dir.clone(),
      source,
    })?;

    let mut locks = Vec::new();
    for entry in entries.flatten() {
      let name = entry.file_name();
      let Some(EntryFile::Lock(key)) = name.to_str().and_then(EntryFile::classify) else {
        continue;
      };
      match EntryLock::inspect(&entry.path()) {
        Ok(state) => locks.push((key, state)),
        Err(e) => debug!(path = ?entry.path(), error = %e, "failed to inspect lock"),
      }
    }
    locks.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(locks)
  }

  fn prepare_staging(&self, kind: EntryKind, key: &str) -> Result<Staging, StoreError> {
    let dir = self.layout.build_dir(kind, key);
    let prepare = |source| StoreError::Prepare {
      path: dir.clone(),
      source,
    };
    // Leftovers belong to an earlier failed or abandoned attempt.
    remove_path(&dir).map_err(prepare)?;
    fs::create_dir_all(&dir).map_err(prepare)?;
    let staging = Staging { dir: dir.clone() };
    fs::create_dir_all(staging.work_dir()).map_err(prepare)?;
    Ok(staging)
  }

  fn promote(&self, kind: EntryKind, key: &str, staging: &Staging) -> Result<PathBuf, StoreError> {
    let output = staging.output();
    if fs::symlink_metadata(&output).is_err() {
      return Err(StoreError::MissingOutput { path: output });
    }

    let published = self.layout.published(kind, key);
    fs::rename(&output, &published).map_err(|source| StoreError::Publish {
      key: key.to_string(),
      path: published.clone(),
      source,
    })?;
    if let Err(e) = sync_dir(&self.layout.kind_dir(kind)) {
      warn!(%kind, key, error = %e, "failed to sync store directory");
    }
    if let Err(e) = remove_path(staging.dir()) {
      warn!(%kind, key, error = %e, "failed to remove build directory");
    }
    Ok(published)
  }

  fn publication(&self, kind: EntryKind, key: &str, path: PathBuf, origin: Origin) -> Publication {
    Publication {
      kind,
      key: key.to_string(),
      path,
      origin,
    }
  }
}
