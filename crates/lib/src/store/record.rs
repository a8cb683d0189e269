//! Metadata stored next to every published package and venv.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::StoreError;
use super::layout::{EntryKind, RECORD_FILE};
use crate::address::ContentAddress;
use crate::consts::RECORD_VERSION;
use crate::util::fs::now_unix;

/// Entry metadata, written as `entry.json` inside the published directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
  pub version: u32,
  pub kind: EntryKind,
  pub address: ContentAddress,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub created_at_unix: u64,
  /// Full sha256 over the output tree before archiving.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output_hash: Option<String>,
  /// Addresses that had to be published before this entry was produced.
  #[serde(default)]
  pub build_closure: Vec<ContentAddress>,
  /// Addresses that must be present wherever this entry is used.
  #[serde(default)]
  pub run_closure: Vec<ContentAddress>,
}

impl EntryRecord {
  pub fn new(kind: EntryKind, address: ContentAddress) -> Self {
    Self {
      version: RECORD_VERSION,
      kind,
      address,
      name: None,
      created_at_unix: now_unix(),
      output_hash: None,
      build_closure: Vec::new(),
      run_closure: Vec::new(),
    }
  }

  /// Write the record into `dir`.
  pub fn write_to(&self, dir: &Path) -> Result<(), StoreError> {
    let path = dir.join(RECORD_FILE);
    let content = serde_json::to_string_pretty(self).map_err(|e| StoreError::Record {
      path: path.clone(),
      message: e.to_string(),
    })?;
    std::fs::write(&path, format!("{content}\n")).map_err(|e| StoreError::Record {
      path,
      message: e.to_string(),
    })
  }

  /// Read the record of a published entry directory.
  pub fn read_from(dir: &Path) -> Result<Self, StoreError> {
    let path = dir.join(RECORD_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| StoreError::Record {
      path: path.clone(),
      message: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| StoreError::Record {
      path,
      message: e.to_string(),
    })
  }
}
