//! Store configuration.
//!
//! Values come from explicit construction first, then environment variables,
//! then platform defaults.

use std::path::PathBuf;

use crate::consts::{KEEP_FAILED_ENV, STORE_ENV};
use crate::platform::paths::default_store_dir;

/// Configuration shared by every component operating on one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
  /// Root directory of the store.
  pub root: PathBuf,

  /// Keep the private build directory of a failed build for inspection.
  pub keep_failed: bool,
}

impl StoreConfig {
  /// Configuration for an explicit root, other settings from the environment.
  pub fn at(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      keep_failed: keep_failed_from_env(),
    }
  }

  /// Configuration resolved from the environment alone.
  pub fn from_env() -> Self {
    let root = std::env::var_os(STORE_ENV)
      .filter(|v| !v.is_empty())
      .map(PathBuf::from)
      .unwrap_or_else(default_store_dir);
    Self::at(root)
  }

  pub fn with_keep_failed(mut self, keep_failed: bool) -> Self {
    self.keep_failed = keep_failed;
    self
  }
}

fn keep_failed_from_env() -> bool {
  match std::env::var(KEEP_FAILED_ENV) {
    Ok(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"),
    Err(_) => true,
  }
}
