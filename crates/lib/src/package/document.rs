use serde::{Deserialize, Serialize};

use super::FetchSpec;

/// JSON form of a resolved graph, as produced by an external resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDocument {
  pub packages: Vec<PackageNode>,
  #[serde(default)]
  pub roots: Vec<String>,
}

/// One package in a [`GraphDocument`]. Dependencies refer to other nodes by `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageNode {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub build: String,
  #[serde(default)]
  pub fetch: Vec<FetchSpec>,
  #[serde(default)]
  pub build_deps: Vec<String>,
  #[serde(default)]
  pub run_deps: Vec<String>,
}

impl GraphDocument {
  pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(text)
  }
}
