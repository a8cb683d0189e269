//! Implementation of the `cairn fetch` command.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};

use super::{StoreArgs, load_graph};
use crate::output::{
  OutputFormat, format_duration, print_fetch_failure, print_json, print_prefetch_summary, print_stat, print_success,
};

/// Download every source in the closure of the requested packages.
pub fn cmd_fetch(
  args: &StoreArgs,
  graph: &Path,
  packages: &[String],
  missing_only: bool,
  output: OutputFormat,
) -> Result<()> {
  let start = Instant::now();
  let loaded = load_graph(graph, packages)?;
  let coordinator = args.coordinator()?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(coordinator.prefetch(loaded.graph.clone(), &loaded.roots, missing_only))
    .context("Fetch failed")?;

  if output.is_json() {
    print_json(&report)?;
  } else {
    for failure in &report.failures {
      print_fetch_failure(failure);
    }
    if report.is_success() {
      print_success("Sources fetched");
    }
    print_prefetch_summary(&report, missing_only);
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if !report.is_success() {
    bail!("{} source(s) could not be fetched", report.failures.len());
  }
  Ok(())
}
