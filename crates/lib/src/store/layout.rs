//! On-disk layout of a store.
//!
//! ```text
//! <root>/
//!   pkgs/<address>/{artifact.tar.gz,entry.json}   published package
//!   pkgs/<address>.lock                           per-address lock
//!   pkgs/<address>.build/                         private build dir
//!   fetch/<sha256>                                verified source file
//!   fetch/<sha256>.lock
//!   fetch/<sha256>.<random>.tmp                   partial download
//!   venvs/<address>/{rootfs/,entry.json}          published venv
//!   venvs/<address>.lock                          "in use" lock
//!   venvs/<address>.build/
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const ARTIFACT_FILE: &str = "artifact.tar.gz";
pub const RECORD_FILE: &str = "entry.json";
pub const ROOTFS_DIR: &str = "rootfs";
pub const LOCK_SUFFIX: &str = ".lock";
pub const BUILD_SUFFIX: &str = ".build";
pub const TEMP_SUFFIX: &str = ".tmp";

/// The kinds of entries a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
  Package,
  Fetch,
  Venv,
}

impl EntryKind {
  pub const ALL: [EntryKind; 3] = [EntryKind::Package, EntryKind::Fetch, EntryKind::Venv];

  pub fn dir_name(self) -> &'static str {
    match self {
      EntryKind::Package => "pkgs",
      EntryKind::Fetch => "fetch",
      EntryKind::Venv => "venvs",
    }
  }
}

impl std::fmt::Display for EntryKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      EntryKind::Package => "package",
      EntryKind::Fetch => "fetch",
      EntryKind::Venv => "venv",
    };
    f.write_str(name)
  }
}

/// What a file name inside a kind directory refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryFile {
  Published(String),
  Lock(String),
  Build(String),
  Partial(String),
}

impl EntryFile {
  /// Classify a directory entry name. Unrelated names yield `None`.
  pub fn classify(name: &str) -> Option<Self> {
    if let Some(key) = name.strip_suffix(LOCK_SUFFIX) {
      return Some(EntryFile::Lock(key.to_string()));
    }
    if let Some(key) = name.strip_suffix(BUILD_SUFFIX) {
      return Some(EntryFile::Build(key.to_string()));
    }
    if let Some(rest) = name.strip_suffix(TEMP_SUFFIX) {
      let key = rest.split('.').next().unwrap_or(rest);
      return Some(EntryFile::Partial(key.to_string()));
    }
    if name.starts_with('.') || name.contains('.') {
      return None;
    }
    Some(EntryFile::Published(name.to_string()))
  }

  pub fn key(&self) -> &str {
    match self {
      EntryFile::Published(k) | EntryFile::Lock(k) | EntryFile::Build(k) | EntryFile::Partial(k) => k,
    }
  }
}

/// Path arithmetic for one store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
  root: PathBuf,
}

impl StoreLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn kind_dir(&self, kind: EntryKind) -> PathBuf {
    self.root.join(kind.dir_name())
  }

  /// Published location of the entry `key` (address or checksum).
  pub fn published(&self, kind: EntryKind, key: &str) -> PathBuf {
    self.kind_dir(kind).join(key)
  }

  pub fn lock(&self, kind: EntryKind, key: &str) -> PathBuf {
    self.kind_dir(kind).join(format!("{key}{LOCK_SUFFIX}"))
  }

  pub fn build_dir(&self, kind: EntryKind, key: &str) -> PathBuf {
    self.kind_dir(kind).join(format!("{key}{BUILD_SUFFIX}"))
  }

  pub fn package_artifact(&self, address: &str) -> PathBuf {
    self.published(EntryKind::Package, address).join(ARTIFACT_FILE)
  }

  pub fn venv_rootfs(&self, address: &str) -> PathBuf {
    self.published(EntryKind::Venv, address).join(ROOTFS_DIR)
  }

  /// Create the kind directories.
  pub fn ensure(&self) -> std::io::Result<()> {
    for kind in EntryKind::ALL {
      std::fs::create_dir_all(self.kind_dir(kind))?;
    }
    Ok(())
  }
}
