//! Package specifications and the resolved package graph.
//!
//! A [`PackageGraph`] is an arena of [`PackageSpec`] nodes. Dependencies are
//! [`PackageId`] references into the same arena, so a graph is always
//! self-contained. Graphs arrive already resolved; this module only validates
//! them and answers closure queries.

mod document;

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::is_sha256_hex;

pub use document::{GraphDocument, PackageNode};

/// Index of a package inside its [`PackageGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageId(pub usize);

impl std::fmt::Display for PackageId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// One candidate location for a fetched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSource")]
pub struct FetchSource {
  pub url: String,
  /// Failures of best-effort sources are logged but never reported.
  #[serde(rename = "bestEffort")]
  pub best_effort: bool,
}

impl FetchSource {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      best_effort: false,
    }
  }

  pub fn best_effort(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      best_effort: true,
    }
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSource {
  Url(String),
  Detailed {
    url: String,
    #[serde(default, rename = "bestEffort")]
    best_effort: bool,
  },
}

impl From<RawSource> for FetchSource {
  fn from(raw: RawSource) -> Self {
    match raw {
      RawSource::Url(url) => FetchSource::new(url),
      RawSource::Detailed { url, best_effort } => FetchSource { url, best_effort },
    }
  }
}

/// A source file a build needs, identified by its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSpec {
  /// Name the file is exposed under inside the build root.
  pub filename: String,
  /// Lowercase sha256 hex digest of the file contents.
  pub sha256: String,
  /// Candidate locations, tried in order.
  #[serde(default, rename = "urls")]
  pub sources: Vec<FetchSource>,
}

impl FetchSpec {
  pub fn new(filename: impl Into<String>, sha256: impl Into<String>) -> Self {
    Self {
      filename: filename.into(),
      sha256: sha256.into(),
      sources: Vec::new(),
    }
  }

  pub fn with_source(mut self, source: FetchSource) -> Self {
    self.sources.push(source);
    self
  }

  pub fn with_url(self, url: impl Into<String>) -> Self {
    self.with_source(FetchSource::new(url))
  }
}

/// A package as handed over by the graph resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSpec {
  pub name: Option<String>,
  /// Build script text. Empty for meta packages, `untar` for the unpack builtin.
  pub build: String,
  pub fetch: Vec<FetchSpec>,
  /// Packages that must be published before this one builds.
  pub build_deps: Vec<PackageId>,
  /// Packages that must be present wherever this one is used.
  pub run_deps: Vec<PackageId>,
}

impl PackageSpec {
  pub fn new(build: impl Into<String>) -> Self {
    Self {
      build: build.into(),
      ..Default::default()
    }
  }

  pub fn named(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn fetch(mut self, spec: FetchSpec) -> Self {
    self.fetch.push(spec);
    self
  }

  pub fn build_dep(mut self, id: PackageId) -> Self {
    self.build_deps.push(id);
    self
  }

  pub fn run_dep(mut self, id: PackageId) -> Self {
    self.run_deps.push(id);
    self
  }

  /// Name used in logs and reports.
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or("<unnamed>")
  }
}

/// Malformed package input. Always detected before the store is touched.
#[derive(Debug, Error)]
pub enum SpecError {
  #[error("invalid package name {name:?}: {reason}")]
  InvalidName { name: String, reason: &'static str },

  #[error("package {package}: invalid checksum {value:?} for {filename} (expected 64 lowercase hex characters)")]
  InvalidChecksum {
    package: String,
    filename: String,
    value: String,
  },

  #[error("package {package}: invalid fetch filename {filename:?}")]
  InvalidFilename { package: String, filename: String },

  #[error("package {package}: fetch filename {filename} declared twice")]
  DuplicateFetch { package: String, filename: String },

  #[error("package {package}: dependency {dependency} does not exist")]
  UnknownDependency { package: String, dependency: PackageId },

  #[error("dependency cycle detected at package {package}")]
  Cycle { package: String },

  #[error("unknown package id {0:?}")]
  UnknownPackage(String),

  #[error("package id {0:?} declared twice")]
  DuplicateId(String),
}

/// Validate an optional package name.
pub fn validate_name(name: &str) -> Result<(), SpecError> {
  let reason = if name.is_empty() {
    Some("name must not be empty")
  } else if name.contains('/') {
    Some("name must not contain '/'")
  } else if name.contains(['\n', '\r']) {
    Some("name must not contain newlines")
  } else if name.contains('\0') {
    Some("name must not contain NUL")
  } else {
    None
  };
  match reason {
    Some(reason) => Err(SpecError::InvalidName {
      name: name.to_string(),
      reason,
    }),
    None => Ok(()),
  }
}

fn validate_filename(filename: &str) -> bool {
  !filename.is_empty() && filename != "." && filename != ".." && !filename.contains(['/', '\0'])
}

/// Validate the parts of a spec that do not depend on the rest of the graph.
pub fn validate_spec(spec: &PackageSpec) -> Result<(), SpecError> {
  if let Some(name) = &spec.name {
    validate_name(name)?;
  }
  let package = spec.display_name();
  let mut seen = HashSet::new();
  for fetch in &spec.fetch {
    if !validate_filename(&fetch.filename) {
      return Err(SpecError::InvalidFilename {
        package: package.to_string(),
        filename: fetch.filename.clone(),
      });
    }
    if !is_sha256_hex(&fetch.sha256) {
      return Err(SpecError::InvalidChecksum {
        package: package.to_string(),
        filename: fetch.filename.clone(),
        value: fetch.sha256.clone(),
      });
    }
    if !seen.insert(fetch.filename.as_str()) {
      return Err(SpecError::DuplicateFetch {
        package: package.to_string(),
        filename: fetch.filename.clone(),
      });
    }
  }
  Ok(())
}

/// An already-resolved package graph.
#[derive(Debug, Clone, Default)]
pub struct PackageGraph {
  nodes: Vec<PackageSpec>,
}

impl PackageGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a package. Dependencies may only be validated once the graph is complete.
  pub fn add(&mut self, spec: PackageSpec) -> PackageId {
    self.nodes.push(spec);
    PackageId(self.nodes.len() - 1)
  }

  pub fn get(&self, id: PackageId) -> Option<&PackageSpec> {
    self.nodes.get(id.0)
  }

  /// Access a package by id.
  ///
  /// # Panics
  ///
  /// Panics if `id` does not belong to this graph. Ids produced by
  /// [`PackageGraph::add`] or returned from a validated graph are always valid.
  pub fn spec(&self, id: PackageId) -> &PackageSpec {
    &self.nodes[id.0]
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = PackageId> + '_ {
    (0..self.nodes.len()).map(PackageId)
  }

  /// Validate every node and return the packages in dependency order.
  ///
  /// Dependencies always come before their dependents in the returned order.
  pub fn validate(&self) -> Result<Vec<PackageId>, SpecError> {
    let mut graph: DiGraph<PackageId, ()> = DiGraph::new();
    let indices: Vec<NodeIndex> = self.ids().map(|id| graph.add_node(id)).collect();

    for id in self.ids() {
      let spec = self.spec(id);
      validate_spec(spec)?;
      for &dep in spec.build_deps.iter().chain(&spec.run_deps) {
        if dep.0 >= self.nodes.len() {
          return Err(SpecError::UnknownDependency {
            package: spec.display_name().to_string(),
            dependency: dep,
          });
        }
        graph.update_edge(indices[dep.0], indices[id.0], ());
      }
    }

    toposort(&graph, None)
      .map(|order| order.into_iter().map(|idx| graph[idx]).collect())
      .map_err(|cycle| SpecError::Cycle {
        package: self.spec(graph[cycle.node_id()]).display_name().to_string(),
      })
  }

  /// Transitive run-time dependencies of `id`, excluding `id`, dependencies first.
  pub fn run_closure(&self, id: PackageId) -> Vec<PackageId> {
    let mut visited = HashSet::from([id]);
    let mut order = Vec::new();
    for &dep in &self.spec(id).run_deps {
      self.visit_run(dep, &mut visited, &mut order);
    }
    order
  }

  /// Everything that must be published before `id` can build: its build deps
  /// plus their run-time closures, dependencies first.
  pub fn build_closure(&self, id: PackageId) -> Vec<PackageId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for &dep in &self.spec(id).build_deps {
      self.visit_run(dep, &mut visited, &mut order);
    }
    order
  }

  /// Run-time closure of several roots, roots included, dependencies first.
  pub fn runtime_closure_of(&self, roots: &[PackageId]) -> Vec<PackageId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for &root in roots {
      self.visit_run(root, &mut visited, &mut order);
    }
    order
  }

  /// Every package reachable from `roots` through build or run edges,
  /// roots included, dependencies first.
  pub fn requested_closure(&self, roots: &[PackageId]) -> Vec<PackageId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(PackageId, bool)> = roots.iter().rev().map(|&id| (id, false)).collect();
    while let Some((id, expanded)) = stack.pop() {
      if expanded {
        order.push(id);
        continue;
      }
      if !visited.insert(id) {
        continue;
      }
      stack.push((id, true));
      let spec = self.spec(id);
      for &dep in spec.build_deps.iter().chain(&spec.run_deps).rev() {
        if !visited.contains(&dep) {
          stack.push((dep, false));
        }
      }
    }
    order
  }

  fn visit_run(&self, id: PackageId, visited: &mut HashSet<PackageId>, order: &mut Vec<PackageId>) {
    if !visited.insert(id) {
      return;
    }
    for &dep in &self.spec(id).run_deps {
      self.visit_run(dep, visited, order);
    }
    order.push(id);
  }

  /// Build a graph from a parsed document, returning it with the requested roots.
  ///
  /// When the document names no roots, every package is requested.
  pub fn from_document(doc: GraphDocument) -> Result<(Self, Vec<PackageId>), SpecError> {
    let mut ids: HashMap<String, PackageId> = HashMap::new();
    for (index, node) in doc.packages.iter().enumerate() {
      if ids.insert(node.id.clone(), PackageId(index)).is_some() {
        return Err(SpecError::DuplicateId(node.id.clone()));
      }
    }

    let lookup = |id: &String| ids.get(id).copied().ok_or_else(|| SpecError::UnknownPackage(id.clone()));

    let mut graph = PackageGraph::new();
    for node in &doc.packages {
      let spec = PackageSpec {
        name: node.name.clone(),
        build: node.build.clone(),
        fetch: node
          .fetch
          .iter()
          .cloned()
          .map(|mut f| {
            f.sha256 = f.sha256.to_ascii_lowercase();
            f
          })
          .collect(),
        build_deps: node.build_deps.iter().map(lookup).collect::<Result<_, _>>()?,
        run_deps: node.run_deps.iter().map(lookup).collect::<Result<_, _>>()?,
      };
      graph.add(spec);
    }

    let roots = if doc.roots.is_empty() {
      graph.ids().collect()
    } else {
      doc.roots.iter().map(lookup).collect::<Result<_, _>>()?
    };

    graph.validate()?;
    Ok((graph, roots))
  }

  /// Look up package ids by document id, for callers holding the original document.
  pub fn resolve_ids(doc: &GraphDocument, wanted: &[String]) -> Result<Vec<PackageId>, SpecError> {
    wanted
      .iter()
      .map(|w| {
        doc
          .packages
          .iter()
          .position(|p| &p.id == w)
          .map(PackageId)
          .ok_or_else(|| SpecError::UnknownPackage(w.clone()))
      })
      .collect()
  }
}
