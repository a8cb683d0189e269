//! Implementation of the `cairn venv` command.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use cairn_lib::address::ContentAddress;
use cairn_lib::store::Origin;
use cairn_lib::venv::{LaunchPlan, VenvManifest, VenvMaterializer};

use super::{StoreArgs, load_graph};
use crate::output::{OutputFormat, print_json, print_stat, print_success, short_key};

#[derive(Serialize)]
struct VenvOutput<'a> {
  address: &'a ContentAddress,
  origin: Origin,
  closure: &'a [ContentAddress],
  plan: &'a LaunchPlan,
}

/// Materialize the venv described by `manifest` and run `command` in it.
///
/// The venv stays pinned while the command runs. With `print`, the launch
/// plan is printed instead and nothing is run.
pub fn cmd_venv(
  args: &StoreArgs,
  graph: &Path,
  manifest: &Path,
  print: bool,
  command: &[String],
  output: OutputFormat,
) -> Result<()> {
  let text =
    std::fs::read_to_string(manifest).with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
  let manifest = VenvManifest::from_json(&text).with_context(|| format!("Invalid manifest {}", manifest.display()))?;
  let loaded = load_graph(graph, &manifest.packages)?;
  let materializer = VenvMaterializer::new(args.coordinator()?);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let session = rt
    .block_on(materializer.open(loaded.graph.clone(), loaded.roots.clone(), manifest.clone()))
    .context("Failed to materialize venv")?;
  let plan = session.launch_plan(&manifest);

  if print {
    if output.is_json() {
      print_json(&VenvOutput {
        address: session.address(),
        origin: session.origin(),
        closure: session.closure(),
        plan: &plan,
      })?;
    } else {
      print_success(&format!("Venv {}", short_key(session.address().as_str())));
      print_stat("Rootfs", &session.rootfs().display().to_string());
      print_stat("Packages", &session.closure().len().to_string());
      print_stat("Working directory", &plan.chdir.display().to_string());
      for (key, value) in &plan.env {
        print_stat(key, value);
      }
    }
    return Ok(());
  }

  info!(address = %session.address(), "entering venv");
  let status = Command::new("bwrap")
    .args(plan.bwrap_args(command))
    .status()
    .context("Failed to run bwrap")?;
  drop(session);

  if !status.success() {
    std::process::exit(status.code().unwrap_or(1));
  }
  Ok(())
}
