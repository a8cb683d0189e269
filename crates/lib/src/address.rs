//! Content addressing for packages and virtual environments.
//!
//! An address is a truncated sha256 over a canonical JSON rendering of the
//! inputs that determine an artifact. Package addresses fold in the addresses
//! of their dependencies, so a change anywhere below a package changes its
//! address too. Addressing never touches the filesystem or network.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::consts::ADDRESS_LEN;
use crate::package::{PackageGraph, PackageId, PackageSpec, SpecError, validate_spec};

/// Identity of a store entry.
///
/// # Format
///
/// Lowercase hexadecimal, `ADDRESS_LEN` characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentAddress(pub String);

impl ContentAddress {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Accept a string that has the syntax of an address.
  pub fn parse(value: &str) -> Option<Self> {
    (value.len() == ADDRESS_LEN && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
      .then(|| ContentAddress(value.to_string()))
  }
}

impl std::fmt::Display for ContentAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error)]
pub enum AddressError {
  #[error(transparent)]
  InvalidSpec(#[from] SpecError),

  #[error("failed to serialize address input: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// Types whose canonical JSON rendering determines a content address.
pub trait Hashable: Serialize {
  fn content_address(&self) -> Result<ContentAddress, serde_json::Error> {
    let serialized = serde_json::to_string(self)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    Ok(ContentAddress(full[..ADDRESS_LEN].to_string()))
  }
}

// Only filename and checksum participate; sources are excluded because the
// same bytes fetched from a different mirror yield the same build.
#[derive(Serialize)]
struct PackageKey<'a> {
  scheme: &'static str,
  script: &'a str,
  fetch: Vec<(&'a str, &'a str)>,
  build_deps: BTreeSet<&'a ContentAddress>,
  run_deps: BTreeSet<&'a ContentAddress>,
}

impl Hashable for PackageKey<'_> {}

const PACKAGE_SCHEME: &str = "cairn-package/1";

/// Address of a single spec given the addresses of its dependencies.
///
/// Dependency order and duplicates do not matter. The package name is not
/// part of the address.
pub fn package_address<'a>(
  spec: &'a PackageSpec,
  build_deps: impl IntoIterator<Item = &'a ContentAddress>,
  run_deps: impl IntoIterator<Item = &'a ContentAddress>,
) -> Result<ContentAddress, AddressError> {
  validate_spec(spec)?;
  let key = PackageKey {
    scheme: PACKAGE_SCHEME,
    script: &spec.build,
    fetch: spec
      .fetch
      .iter()
      .map(|f| (f.filename.as_str(), f.sha256.as_str()))
      .collect(),
    build_deps: build_deps.into_iter().collect(),
    run_deps: run_deps.into_iter().collect(),
  };
  Ok(key.content_address()?)
}

/// Addresses of every package in a graph, computed once per package.
#[derive(Debug, Clone)]
pub struct AddressMap {
  addresses: Vec<ContentAddress>,
}

impl AddressMap {
  /// Validate `graph` and address every package in dependency order.
  pub fn compute(graph: &PackageGraph) -> Result<Self, AddressError> {
    let order = graph.validate()?;
    let mut addresses: Vec<Option<ContentAddress>> = vec![None; graph.len()];

    for id in order {
      let spec = graph.spec(id);
      // Dependencies precede `id` in the order, so their slots are filled.
      let dep = |d: &PackageId| addresses[d.0].as_ref();
      let build: Vec<&ContentAddress> = spec.build_deps.iter().filter_map(dep).collect();
      let run: Vec<&ContentAddress> = spec.run_deps.iter().filter_map(dep).collect();
      let address = package_address(spec, build, run)?;
      addresses[id.0] = Some(address);
    }

    Ok(Self {
      addresses: addresses.into_iter().flatten().collect(),
    })
  }

  /// # Panics
  ///
  /// Panics if `id` does not belong to the graph this map was computed from.
  pub fn get(&self, id: PackageId) -> &ContentAddress {
    &self.addresses[id.0]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::package::FetchSpec;

  const SHA_A: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
  const SHA_B: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

  fn two_dep_graph(first_dep_listed: usize) -> (PackageGraph, PackageId) {
    let mut graph = PackageGraph::new();
    let x = graph.add(PackageSpec::new("make x"));
    let y = graph.add(PackageSpec::new("make y"));
    let deps = if first_dep_listed == 0 { vec![x, y] } else { vec![y, x] };
    let top = graph.add(PackageSpec {
      build: "make top".into(),
      build_deps: deps,
      ..Default::default()
    });
    (graph, top)
  }

  #[test]
  fn address_is_deterministic() {
    let (graph, top) = two_dep_graph(0);
    let a1 = AddressMap::compute(&graph).unwrap();
    let a2 = AddressMap::compute(&graph).unwrap();
    assert_eq!(a1.get(top), a2.get(top));
    assert_eq!(a1.get(top).as_str().len(), ADDRESS_LEN);
  }

  #[test]
  fn address_ignores_dependency_order() {
    let (g1, t1) = two_dep_graph(0);
    let (g2, t2) = two_dep_graph(1);
    assert_eq!(
      AddressMap::compute(&g1).unwrap().get(t1),
      AddressMap::compute(&g2).unwrap().get(t2)
    );
  }

  #[test]
  fn address_changes_with_script() {
    let a = package_address(&PackageSpec::new("echo 1"), [], []).unwrap();
    let b = package_address(&PackageSpec::new("echo 2"), [], []).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn address_changes_with_fetch_checksum_not_url() {
    let base = PackageSpec::new("build").fetch(FetchSpec::new("src.tar", SHA_A).with_url("https://a/src.tar"));
    let mirrored = PackageSpec::new("build").fetch(FetchSpec::new("src.tar", SHA_A).with_url("https://b/src.tar"));
    let changed = PackageSpec::new("build").fetch(FetchSpec::new("src.tar", SHA_B).with_url("https://a/src.tar"));
    let renamed = PackageSpec::new("build").fetch(FetchSpec::new("other.tar", SHA_A));

    let addr = |s: &PackageSpec| package_address(s, [], []).unwrap();
    assert_eq!(addr(&base), addr(&mirrored));
    assert_ne!(addr(&base), addr(&changed));
    assert_ne!(addr(&base), addr(&renamed));
  }

  #[test]
  fn address_ignores_name() {
    let a = package_address(&PackageSpec::new("x").named("one"), [], []).unwrap();
    let b = package_address(&PackageSpec::new("x").named("two"), [], []).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn build_and_run_deps_are_partitioned() {
    let dep = ContentAddress("0".repeat(ADDRESS_LEN));
    let spec = PackageSpec::new("x");
    let as_build = package_address(&spec, [&dep], []).unwrap();
    let as_run = package_address(&spec, [], [&dep]).unwrap();
    assert_ne!(as_build, as_run);
  }

  #[test]
  fn change_propagates_through_dependents() {
    let build = |script: &str| {
      let mut graph = PackageGraph::new();
      let leaf = graph.add(PackageSpec::new(script));
      let mid = graph.add(PackageSpec::new("mid").run_dep(leaf));
      let top = graph.add(PackageSpec::new("top").build_dep(mid));
      AddressMap::compute(&graph).unwrap().get(top).clone()
    };
    assert_ne!(build("leaf v1"), build("leaf v2"));
  }

  #[test]
  fn invalid_spec_fails_synchronously() {
    let spec = PackageSpec::new("x").named("bad/name");
    assert!(matches!(
      package_address(&spec, [], []),
      Err(AddressError::InvalidSpec(SpecError::InvalidName { .. }))
    ));
  }

  #[test]
  fn parse_accepts_only_address_syntax() {
    let addr = package_address(&PackageSpec::new("x"), [], []).unwrap();
    assert_eq!(ContentAddress::parse(addr.as_str()), Some(addr.clone()));
    assert!(ContentAddress::parse("xyz").is_none());
  }
}
