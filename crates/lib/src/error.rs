//! Failure classification shared by all components.

use serde::Serialize;

/// Coarse class of a failure, reported per node by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
  /// Malformed package input or manifest.
  Input,
  /// No source could deliver a file.
  Fetch,
  /// Delivered bytes did not match the expected checksum.
  Integrity,
  /// The build script failed or produced nothing.
  Build,
  /// A dependency failed, so this node was never attempted.
  Dependency,
  /// The store itself could not be read or written.
  Storage,
}

impl std::fmt::Display for FailureKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      FailureKind::Input => "input error",
      FailureKind::Fetch => "fetch failed",
      FailureKind::Integrity => "integrity error",
      FailureKind::Build => "build failed",
      FailureKind::Dependency => "dependency failed",
      FailureKind::Storage => "storage error",
    };
    f.write_str(s)
  }
}
