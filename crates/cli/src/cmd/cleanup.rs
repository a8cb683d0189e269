//! Implementation of the `cairn cleanup` command.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use cairn_lib::cleanup::sweep;

use super::{KindArg, StoreArgs, kinds};
use crate::output::{
  OutputFormat, format_bytes, format_duration, print_cleanup, print_info, print_json, print_stat, print_success,
};

pub fn cmd_cleanup(
  args: &StoreArgs,
  kind: Option<KindArg>,
  max_age: Duration,
  dry_run: bool,
  output: OutputFormat,
) -> Result<()> {
  let start = Instant::now();
  let store = args.open_store()?;

  let mut results = Vec::new();
  for kind in kinds(kind) {
    let result = sweep(store.layout(), kind, max_age, dry_run).with_context(|| format!("Failed to clean {kind} entries"))?;
    results.push(result);
  }

  if output.is_json() {
    print_json(&results)?;
    return Ok(());
  }

  if dry_run {
    print_info("Dry run - no changes made");
  } else {
    print_success("Cleanup complete!");
  }
  for result in &results {
    println!();
    print_cleanup(result);
  }
  println!();
  let freed: u64 = results.iter().map(|r| r.stats.bytes_freed).sum();
  print_stat("Space freed", &format_bytes(freed));
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
