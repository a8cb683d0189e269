//! Implementation of the `cairn build` command.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use cairn_lib::execute::{RootReport, RootStatus};

use super::{StoreArgs, load_graph};
use crate::output::{OutputFormat, format_duration, print_json, print_resolve_summary, print_root, print_stat};

#[derive(Serialize)]
struct BuildOutput<'a> {
  success: bool,
  built: usize,
  cached: usize,
  failed: usize,
  skipped: usize,
  packages: Vec<PackageOutput<'a>>,
}

#[derive(Serialize)]
struct PackageOutput<'a> {
  package: &'a str,
  #[serde(flatten)]
  report: &'a RootReport,
}

/// Build the requested packages of a graph document.
///
/// Exits with an error when any requested package failed or depends on
/// something that failed; the report is printed either way.
pub fn cmd_build(args: &StoreArgs, graph: &Path, packages: &[String], output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let loaded = load_graph(graph, packages)?;
  let coordinator = args.coordinator()?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(coordinator.resolve(loaded.graph.clone(), &loaded.roots))
    .context("Build failed")?;

  if output.is_json() {
    print_json(&BuildOutput {
      success: report.is_success(),
      built: report.built.len(),
      cached: report.cached(),
      failed: report.failed.len(),
      skipped: report.skipped.len(),
      packages: report
        .roots
        .iter()
        .map(|root| PackageOutput {
          package: loaded.label(root.id),
          report: root,
        })
        .collect(),
    })?;
  } else {
    for root in &report.roots {
      print_root(loaded.label(root.id), root);
    }
    println!();
    print_resolve_summary(&report);
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if !report.is_success() {
    let failed = report.roots.iter().filter(|r| !matches!(r.status, RootStatus::Succeeded { .. })).count();
    bail!("{} of {} requested package(s) failed", failed, report.roots.len());
  }
  Ok(())
}
