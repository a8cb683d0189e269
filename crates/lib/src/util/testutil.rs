//! Test helpers shared by the store components.

use std::fs;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::build::sandbox::{HostSandbox, Sandbox, SandboxRequest};
use crate::config::StoreConfig;
use crate::package::FetchSpec;
use crate::store::Store;
use crate::util::hash::hash_bytes;

/// Runs scripts with [`HostSandbox`] and records each invocation.
#[derive(Debug, Default)]
pub struct RecordingSandbox {
  runs: AtomicUsize,
  labels: Mutex<Vec<String>>,
}

impl RecordingSandbox {
  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }

  /// Package labels in invocation order.
  pub fn labels(&self) -> Vec<String> {
    self.labels.lock().map(|l| l.clone()).unwrap_or_default()
  }
}

impl Sandbox for RecordingSandbox {
  fn run(&self, request: &SandboxRequest<'_>) -> io::Result<ExitStatus> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut labels) = self.labels.lock() {
      labels.push(request.label.to_string());
    }
    HostSandbox.run(request)
  }
}

/// Open a store at `root`.
pub fn open_store(root: &Path, keep_failed: bool) -> Store {
  Store::open(StoreConfig::at(root).with_keep_failed(keep_failed)).unwrap()
}

/// Write `content` under `dir` and describe it as a fetch from that path.
pub fn local_fetch(dir: &Path, filename: &str, content: &[u8]) -> FetchSpec {
  fs::create_dir_all(dir).unwrap();
  let path = dir.join(filename);
  fs::write(&path, content).unwrap();
  FetchSpec::new(filename, hash_bytes(content).0).with_url(path.to_string_lossy())
}
