//! Best-effort eviction of unused store entries.
//!
//! An entry is a candidate when its last use is older than the requested
//! age. Candidates are only removed while holding their exclusive lock,
//! taken without waiting, so anything being built, fetched or pinned by a
//! running session is skipped rather than waited for.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lock::{EntryLock, LockMode, LockState};
use crate::store::StoreLayout;
use crate::store::layout::{EntryFile, EntryKind};
use crate::util::fs::{age, dir_size, remove_path};

#[derive(Debug, Error)]
pub enum CleanupError {
  #[error("failed to read store directory {path}: {source}")]
  ReadStore {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
  /// Published entries examined.
  pub scanned: usize,
  /// Published entries removed.
  pub removed: usize,
  /// Expired entries left alone because their lock was held.
  pub skipped_in_use: usize,
  pub build_dirs_removed: usize,
  pub partials_removed: usize,
  pub locks_removed: usize,
  pub bytes_freed: u64,
}

#[derive(Debug, Serialize)]
pub struct CleanupResult {
  pub kind: EntryKind,
  pub dry_run: bool,
  pub stats: CleanupStats,
  pub deleted_paths: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct EntryGroup {
  published: Option<PathBuf>,
  lock: Option<PathBuf>,
  leftovers: Vec<(EntryFile, PathBuf)>,
}

/// Remove entries of `kind` unused for at least `max_age`.
///
/// Besides published entries this removes abandoned build directories,
/// partial downloads and orphaned lock files of the same age. With
/// `dry_run`, reports what would be removed without touching anything.
pub fn sweep(layout: &StoreLayout, kind: EntryKind, max_age: Duration, dry_run: bool) -> Result<CleanupResult, CleanupError> {
  let mut result = CleanupResult {
    kind,
    dry_run,
    stats: CleanupStats::default(),
    deleted_paths: Vec::new(),
  };

  let dir = layout.kind_dir(kind);
  let groups = match group_entries(&dir) {
    Ok(groups) => groups,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(result),
    Err(source) => return Err(CleanupError::ReadStore { path: dir, source }),
  };

  for (key, group) in groups {
    if group.published.is_some() {
      result.stats.scanned += 1;
    }

    let published_expired = group.published.as_deref().is_some_and(|p| is_expired(p, max_age));
    let leftovers_expired = group.leftovers.iter().any(|(_, p)| is_expired(p, max_age));
    let orphan_lock_expired = group.published.is_none()
      && group.leftovers.is_empty()
      && group.lock.as_deref().is_some_and(|p| is_expired(p, max_age));

    if !published_expired && !leftovers_expired && !orphan_lock_expired {
      continue;
    }

    let lock_path = layout.lock(kind, &key);
    if dry_run {
      if matches!(EntryLock::inspect(&lock_path), Ok(LockState::Held(_))) {
        skip_in_use(&mut result.stats, published_expired, kind, &key);
        continue;
      }
      plan_removals(&group, max_age, &mut result);
      continue;
    }

    let lock = match EntryLock::try_acquire(&lock_path, LockMode::Exclusive, "cleanup") {
      Ok(Some(lock)) => lock,
      Ok(None) => {
        skip_in_use(&mut result.stats, published_expired, kind, &key);
        continue;
      }
      Err(e) => {
        warn!(%kind, key = %key, error = %e, "failed to lock entry, skipping");
        continue;
      }
    };

    // Re-check under the lock: a user may have touched the entry meanwhile.
    if let Some(published) = &group.published
      && is_expired(published, max_age)
    {
      debug!(%kind, key = %key, "removing expired entry");
      if remove(published, &mut result) {
        result.stats.removed += 1;
      }
    }

    for (file, path) in &group.leftovers {
      if !is_expired(path, max_age) {
        continue;
      }
      debug!(%kind, key = %key, path = ?path, "removing leftover");
      if remove(path, &mut result) {
        match file {
          EntryFile::Build(_) => result.stats.build_dirs_removed += 1,
          _ => result.stats.partials_removed += 1,
        }
      }
    }

    let nothing_left = !exists(&layout.published(kind, &key))
      && group.leftovers.iter().all(|(_, p)| !exists(p));
    if nothing_left {
      match lock.remove_file() {
        Ok(()) => {
          result.stats.locks_removed += 1;
          result.deleted_paths.push(lock_path);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?lock_path, error = %e, "failed to delete lock file"),
      }
    }
  }

  info!(
    %kind,
    scanned = result.stats.scanned,
    removed = result.stats.removed,
    skipped_in_use = result.stats.skipped_in_use,
    bytes_freed = result.stats.bytes_freed,
    dry_run,
    "cleanup complete"
  );

  Ok(result)
}

fn group_entries(dir: &Path) -> io::Result<BTreeMap<String, EntryGroup>> {
  let mut groups: BTreeMap<String, EntryGroup> = BTreeMap::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
      continue;
    };
    let Some(file) = EntryFile::classify(&name) else {
      continue;
    };
    let group = groups.entry(file.key().to_string()).or_default();
    let path = entry.path();
    match file {
      EntryFile::Published(_) => group.published = Some(path),
      EntryFile::Lock(_) => group.lock = Some(path),
      EntryFile::Build(_) | EntryFile::Partial(_) => group.leftovers.push((file, path)),
    }
  }
  Ok(groups)
}

fn skip_in_use(stats: &mut CleanupStats, published_expired: bool, kind: EntryKind, key: &str) {
  debug!(%kind, key, "entry in use, skipping");
  if published_expired {
    stats.skipped_in_use += 1;
  }
}

fn plan_removals(group: &EntryGroup, max_age: Duration, result: &mut CleanupResult) {
  if let Some(published) = &group.published
    && is_expired(published, max_age)
  {
    result.stats.removed += 1;
    result.stats.bytes_freed += dir_size(published);
    result.deleted_paths.push(published.clone());
  }
  for (file, path) in &group.leftovers {
    if is_expired(path, max_age) {
      match file {
        EntryFile::Build(_) => result.stats.build_dirs_removed += 1,
        _ => result.stats.partials_removed += 1,
      }
      result.stats.bytes_freed += dir_size(path);
      result.deleted_paths.push(path.clone());
    }
  }
}

fn remove(path: &Path, result: &mut CleanupResult) -> bool {
  let size = dir_size(path);
  match remove_path(path) {
    Ok(()) => {
      result.stats.bytes_freed += size;
      result.deleted_paths.push(path.to_path_buf());
      true
    }
    Err(e) => {
      warn!(path = ?path, error = %e, "failed to delete store path");
      false
    }
  }
}

fn is_expired(path: &Path, max_age: Duration) -> bool {
  matches!(age(path), Ok(Some(a)) if a >= max_age)
}

fn exists(path: &Path) -> bool {
  fs::symlink_metadata(path).is_ok()
}
