//! File-based advisory locks for store entries.
//!
//! Every store entry (package address, fetch checksum, venv address) has a
//! sibling `.lock` file. Mutual exclusion comes from `flock(2)`, which the
//! kernel releases when the holding process exits for any reason. On top of
//! the flock, an exclusive holder writes an owner record into the lock file
//! and clears it again on release.
//!
//! That gives three observable states:
//!
//! - `Free`: the flock is acquirable and no owner record is present.
//! - `Held`: another process holds the flock.
//! - `Stale`: the flock is acquirable but an owner record is left behind,
//!   which proves the previous holder died without releasing cleanly.
//!
//! A stale lock is reclaimed by the next exclusive acquirer, which is told
//! about it through [`EntryLock::reclaimed`] so it can discard the abandoned
//! holder's partial work.
//!
//! Lock files may be unlinked by the cleanup service while it holds them.
//! Acquirers therefore check after locking that the file they locked is still
//! the one linked at the lock path, and retry otherwise.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};

use rustix::fs::{FlockOperation, flock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::RECORD_VERSION;
use crate::util::fs::now_unix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Owner record written by exclusive holders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
  pub version: u32,
  pub pid: u32,
  pub hostname: String,
  pub started_at_unix: u64,
  pub purpose: String,
}

impl LockOwner {
  fn current(purpose: &str) -> Self {
    Self {
      version: RECORD_VERSION,
      pid: std::process::id(),
      hostname: hostname(),
      started_at_unix: now_unix(),
      purpose: purpose.to_string(),
    }
  }

  /// Whether the owning process is known to be gone.
  ///
  /// Only answerable for owners on this host; remote owners are never
  /// reported dead.
  pub fn is_dead(&self) -> bool {
    if self.hostname != hostname() {
      return false;
    }
    let Some(pid) = rustix::process::Pid::from_raw(self.pid as i32) else {
      return true;
    };
    match rustix::process::test_kill_process(pid) {
      Ok(()) => false,
      Err(e) => e == rustix::io::Errno::SRCH,
    }
  }
}

impl std::fmt::Display for LockOwner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} (pid {}@{})", self.purpose, self.pid, self.hostname)
  }
}

/// Observed state of a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
  Free,
  /// Held by a live process. Shared holders write no owner record.
  Held(Option<LockOwner>),
  Stale(LockOwner),
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("failed to create lock directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file {path}: {source}")]
  OpenFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock owner record {path}: {source}")]
  WriteOwner {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to acquire lock {path}: {source}")]
  LockFailed {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A held lock on one store entry. Released on drop.
#[derive(Debug)]
pub struct EntryLock {
  file: File,
  path: PathBuf,
  mode: LockMode,
  reclaimed: Option<LockOwner>,
}

impl EntryLock {
  /// Acquire the lock, waiting for other holders to release it.
  pub fn acquire(path: &Path, mode: LockMode, purpose: &str) -> Result<Self, LockError> {
    loop {
      let file = open_lock_file(path)?;
      match lock_file(&file, mode, false) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
          match read_owner(&file) {
            Some(owner) => info!(lock = %path.display(), holder = %owner, "waiting for lock"),
            None => info!(lock = %path.display(), "waiting for lock"),
          }
          lock_file(&file, mode, true).map_err(|source| LockError::LockFailed {
            path: path.to_path_buf(),
            source,
          })?;
        }
        Err(source) => {
          return Err(LockError::LockFailed {
            path: path.to_path_buf(),
            source,
          });
        }
      }

      if still_linked(&file, path) {
        return Self::claim(file, path, mode, purpose);
      }
      debug!(lock = %path.display(), "lock file replaced while waiting, retrying");
    }
  }

  /// Acquire the lock only if nobody holds it.
  ///
  /// Returns `Ok(None)` on contention.
  pub fn try_acquire(path: &Path, mode: LockMode, purpose: &str) -> Result<Option<Self>, LockError> {
    loop {
      let file = open_lock_file(path)?;
      match lock_file(&file, mode, false) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(source) => {
          return Err(LockError::LockFailed {
            path: path.to_path_buf(),
            source,
          });
        }
      }
      if still_linked(&file, path) {
        return Self::claim(file, path, mode, purpose).map(Some);
      }
    }
  }

  /// Inspect a lock file without keeping it locked.
  pub fn inspect(path: &Path) -> Result<LockState, LockError> {
    let file = match File::open(path) {
      Ok(f) => f,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockState::Free),
      Err(source) => {
        return Err(LockError::OpenFile {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    match lock_file(&file, LockMode::Exclusive, false) {
      Ok(()) => {
        let state = match read_owner(&file) {
          Some(owner) => LockState::Stale(owner),
          None => LockState::Free,
        };
        let _ = flock(file.as_fd(), FlockOperation::Unlock);
        Ok(state)
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(LockState::Held(read_owner(&file))),
      Err(source) => Err(LockError::LockFailed {
        path: path.to_path_buf(),
        source,
      }),
    }
  }

  fn claim(file: File, path: &Path, mode: LockMode, purpose: &str) -> Result<Self, LockError> {
    let mut lock = EntryLock {
      file,
      path: path.to_path_buf(),
      mode,
      reclaimed: None,
    };

    if mode == LockMode::Exclusive {
      if let Some(previous) = read_owner(&lock.file) {
        warn!(lock = %path.display(), previous = %previous, "reclaiming stale lock");
        lock.reclaimed = Some(previous);
      }
      lock.write_owner(purpose)?;
    }

    Ok(lock)
  }

  fn write_owner(&mut self, purpose: &str) -> Result<(), LockError> {
    let map_err = |source: io::Error| LockError::WriteOwner {
      path: self.path.clone(),
      source,
    };
    let owner = LockOwner::current(purpose);
    self.file.set_len(0).map_err(map_err)?;
    self.file.seek(SeekFrom::Start(0)).map_err(map_err)?;
    let mut writer = io::BufWriter::new(&self.file);
    serde_json::to_writer_pretty(&mut writer, &owner).map_err(|e| map_err(io::Error::other(e)))?;
    writer.flush().map_err(map_err)?;
    Ok(())
  }

  /// Owner record of a previous holder that died while holding this lock.
  pub fn reclaimed(&self) -> Option<&LockOwner> {
    self.reclaimed.as_ref()
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  /// Reads the owner record through the held file handle.
  pub fn read_owner(&self) -> Option<LockOwner> {
    read_owner(&self.file)
  }

  /// Unlink the lock file while still holding it.
  ///
  /// Waiters that locked the old file notice and retry on a fresh one.
  pub fn remove_file(&self) -> io::Result<()> {
    fs::remove_file(&self.path)
  }
}

impl Drop for EntryLock {
  fn drop(&mut self) {
    if self.mode == LockMode::Exclusive
      && let Err(e) = self.file.set_len(0)
    {
      warn!(lock = %self.path.display(), error = %e, "failed to clear lock owner record");
    }
    let _ = flock(self.file.as_fd(), FlockOperation::Unlock);
  }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
  if let Some(parent) = path.parent()
    && !parent.exists()
  {
    fs::create_dir_all(parent).map_err(|source| LockError::CreateDir {
      path: parent.to_path_buf(),
      source,
    })?;
  }

  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(path)
    .map_err(|source| LockError::OpenFile {
      path: path.to_path_buf(),
      source,
    })
}

fn lock_file(file: &File, mode: LockMode, blocking: bool) -> io::Result<()> {
  let operation = match (mode, blocking) {
    (LockMode::Shared, false) => FlockOperation::NonBlockingLockShared,
    (LockMode::Exclusive, false) => FlockOperation::NonBlockingLockExclusive,
    (LockMode::Shared, true) => FlockOperation::LockShared,
    (LockMode::Exclusive, true) => FlockOperation::LockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

fn still_linked(file: &File, path: &Path) -> bool {
  match (file.metadata(), fs::metadata(path)) {
    (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
    _ => false,
  }
}

fn read_owner(file: &File) -> Option<LockOwner> {
  let mut file = file;
  file.seek(SeekFrom::Start(0)).ok()?;
  let mut contents = String::new();
  file.read_to_string(&mut contents).ok()?;
  if contents.trim().is_empty() {
    return None;
  }
  serde_json::from_str(&contents).ok()
}

fn hostname() -> String {
  rustix::system::uname().nodename().to_string_lossy().into_owned()
}
