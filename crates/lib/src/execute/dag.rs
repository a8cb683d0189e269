//! Execution DAG over content addresses.
//!
//! Packages that share an address collapse into one node, so every distinct
//! address is scheduled exactly once per resolution. Edges run from each
//! address in a package's build closure to the package: only build-time
//! dependencies gate a build step.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::address::{AddressMap, ContentAddress};
use crate::package::{PackageGraph, PackageId};

/// A node in the execution DAG: one address and the package chosen to build it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DagNode {
  pub address: ContentAddress,
  /// First package (in request order) with this address.
  pub package: PackageId,
}

pub struct ExecutionDag {
  graph: DiGraph<DagNode, ()>,
  nodes: HashMap<ContentAddress, NodeIndex>,
}

impl ExecutionDag {
  /// Build the DAG for everything reachable from `roots`.
  ///
  /// The graph must already be validated (see [`AddressMap::compute`]), so
  /// it is acyclic.
  pub fn from_graph(graph: &PackageGraph, addresses: &AddressMap, roots: &[PackageId]) -> Self {
    let mut dag = DiGraph::new();
    let mut nodes = HashMap::new();
    let requested = graph.requested_closure(roots);

    for &id in &requested {
      let address = addresses.get(id);
      nodes.entry(address.clone()).or_insert_with(|| {
        dag.add_node(DagNode {
          address: address.clone(),
          package: id,
        })
      });
    }

    for &id in &requested {
      let dependent = nodes[addresses.get(id)];
      for dep in graph.build_closure(id) {
        let dependency = nodes[addresses.get(dep)];
        if dependency != dependent {
          dag.update_edge(dependency, dependent, ());
        }
      }
    }

    Self { graph: dag, nodes }
  }

  /// Nodes organized into waves: every node's dependencies are in earlier waves.
  ///
  /// Within a wave, nodes are ordered by address so runs are reproducible.
  pub fn waves(&self) -> Vec<Vec<DagNode>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let mut ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[*idx] == 0).copied().collect();
      if ready.is_empty() {
        // Unreachable for a validated graph.
        break;
      }
      ready.sort_by(|a, b| self.graph[*a].address.cmp(&self.graph[*b].address));

      for &idx in &ready {
        remaining.remove(&idx);
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }
      waves.push(ready.into_iter().map(|idx| self.graph[idx].clone()).collect());
    }

    waves
  }

  /// Direct build-time dependencies of `address`.
  pub fn dependencies(&self, address: &ContentAddress) -> Vec<ContentAddress> {
    let Some(&idx) = self.nodes.get(address) else {
      return Vec::new();
    };
    self
      .graph
      .neighbors_directed(idx, Direction::Incoming)
      .map(|dep| self.graph[dep].address.clone())
      .collect()
  }

  /// Get the number of distinct addresses in the DAG.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::package::PackageSpec;

  fn dag(graph: &PackageGraph, roots: &[PackageId]) -> (ExecutionDag, AddressMap) {
    let addresses = AddressMap::compute(graph).unwrap();
    (ExecutionDag::from_graph(graph, &addresses, roots), addresses)
  }

  #[test]
  fn diamond_produces_three_waves() {
    let mut graph = PackageGraph::new();
    let base = graph.add(PackageSpec::new("base"));
    let left = graph.add(PackageSpec::new("left").build_dep(base));
    let right = graph.add(PackageSpec::new("right").build_dep(base));
    let top = graph.add(PackageSpec::new("top").build_dep(left).build_dep(right));

    let (dag, addresses) = dag(&graph, &[top]);
    let waves = dag.waves();

    assert_eq!(waves.len(), 3);
    assert_eq!(waves[0].len(), 1);
    assert_eq!(&waves[0][0].address, addresses.get(base));
    assert_eq!(waves[1].len(), 2);
    assert_eq!(&waves[2][0].address, addresses.get(top));
  }

  #[test]
  fn identical_specs_share_a_node() {
    let mut graph = PackageGraph::new();
    let a = graph.add(PackageSpec::new("same").named("first"));
    let b = graph.add(PackageSpec::new("same").named("second"));
    let top = graph.add(PackageSpec::new("top").build_dep(a).build_dep(b));

    let (dag, _) = dag(&graph, &[top]);

    assert_eq!(dag.len(), 2);
    assert_eq!(dag.waves()[0][0].package, a);
  }

  #[test]
  fn run_deps_of_build_deps_gate_the_build() {
    let mut graph = PackageGraph::new();
    let lib = graph.add(PackageSpec::new("lib"));
    let tool = graph.add(PackageSpec::new("tool").run_dep(lib));
    let app = graph.add(PackageSpec::new("app").build_dep(tool));

    let (dag, addresses) = dag(&graph, &[app]);
    let deps = dag.dependencies(addresses.get(app));

    assert!(deps.contains(addresses.get(lib)));
    assert!(deps.contains(addresses.get(tool)));
    assert_eq!(dag.waves().last().map(|w| &w[0].address), Some(addresses.get(app)));
  }

  #[test]
  fn own_run_deps_do_not_gate_the_build() {
    let mut graph = PackageGraph::new();
    let lib = graph.add(PackageSpec::new("lib"));
    let app = graph.add(PackageSpec::new("app").run_dep(lib));

    let (dag, addresses) = dag(&graph, &[app]);

    assert_eq!(dag.len(), 2);
    assert!(dag.dependencies(addresses.get(app)).is_empty());
    assert_eq!(dag.waves().len(), 1);
  }

  #[test]
  fn unrequested_packages_are_left_out() {
    let mut graph = PackageGraph::new();
    let a = graph.add(PackageSpec::new("a"));
    graph.add(PackageSpec::new("unrelated"));

    let (dag, _) = dag(&graph, &[a]);
    assert_eq!(dag.len(), 1);
  }
}
