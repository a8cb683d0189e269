//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Two packages where `app` copies a file out of its build dependency.
pub const CHAIN_GRAPH: &str = r#"{
  "packages": [
    {"id": "base", "name": "base", "build": "mkdir -p \"$out/share\" && echo base > \"$out/share/base.txt\""},
    {"id": "app", "name": "app", "build": "cp \"$root/share/base.txt\" \"$out/app.txt\"", "buildDeps": ["base"]}
  ],
  "roots": ["app"]
}"#;

/// A failing package, a package depending on it and an independent one.
pub const FAILING_GRAPH: &str = r#"{
  "packages": [
    {"id": "broken", "build": "echo nope >&2; exit 3"},
    {"id": "user", "build": "touch \"$out/user\"", "buildDeps": ["broken"]},
    {"id": "fine", "build": "touch \"$out/fine\""}
  ],
  "roots": ["user", "fine"]
}"#;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the store and any
/// graph or manifest files it writes.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Write a file relative to the temp directory and return its path.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Store root (isolated per test).
  pub fn store_path(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  /// Published package directories.
  pub fn published_packages(&self) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(self.store_path().join("pkgs")) else {
      return Vec::new();
    };
    entries
      .flatten()
      .map(|e| e.path())
      .filter(|p| p.is_dir() && p.extension().is_none())
      .collect()
  }

  /// Get a pre-configured Command for the cairn binary.
  ///
  /// - `CAIRN_STORE`: isolated store root
  /// - `CAIRN_KEEP_FAILED=0`: failed build directories are removed
  /// - `--sandbox host`: scripts run without bubblewrap
  pub fn cairn_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("cairn");
    cmd.env("CAIRN_STORE", self.store_path());
    cmd.env("CAIRN_KEEP_FAILED", "0");
    cmd.env_remove("RUST_LOG");
    cmd.args(["--sandbox", "host"]);
    cmd
  }
}
