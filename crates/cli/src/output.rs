//! Rendering of command results.
//!
//! Text mode prints one colored status line per package, source or lock and
//! indented `label: value` stats; `--output json` prints the serialized
//! result instead.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use cairn_lib::cleanup::CleanupResult;
use cairn_lib::execute::{FetchFailure, NodeFailure, PrefetchReport, ResolveReport, RootReport, RootStatus};
use cairn_lib::lock::LockState;
use cairn_lib::store::{EntryKind, Origin};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
}

/// Characters of an address or checksum shown in text output.
const SHORT_KEY_LEN: usize = 12;

pub fn short_key(key: &str) -> &str {
  key.get(..SHORT_KEY_LEN).unwrap_or(key)
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
  if bytes < 1024 {
    return format!("{bytes} B");
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{value:.1} {}", UNITS[unit])
}

/// Elapsed time to millisecond precision, e.g. `1s 500ms`.
pub fn format_duration(duration: Duration) -> String {
  let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
  humantime::format_duration(Duration::from_millis(millis)).to_string()
}

pub fn describe_failure(failure: &NodeFailure) -> String {
  format!("{}: {}", failure.kind, failure.message)
}

fn origin_label(origin: Origin) -> &'static str {
  match origin {
    Origin::Cached => "cached",
    Origin::Built => "built",
  }
}

pub fn lock_state_name(state: &LockState) -> &'static str {
  match state {
    LockState::Free => "free",
    LockState::Held(_) => "held",
    LockState::Stale(_) => "stale",
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// Status line of one requested package, labelled with its graph id.
pub fn print_root(label: &str, root: &RootReport) {
  let address = short_key(root.address.as_str());
  match &root.status {
    RootStatus::Succeeded { path, origin } => print_success(&format!(
      "{label} {address} {} {} ({})",
      symbols::ARROW,
      path.display(),
      origin_label(*origin)
    )),
    RootStatus::Failed(failure) => print_error(&format!("{label} {address}: {}", describe_failure(failure))),
    RootStatus::DependencyFailed { dependency } => {
      print_warning(&format!("{label} {address}: dependency {dependency} failed"))
    }
  }
}

pub fn print_resolve_summary(report: &ResolveReport) {
  print_stat("Built", &report.built.len().to_string());
  print_stat("Cached", &report.cached().to_string());
  if !report.failed.is_empty() {
    print_stat("Failed", &report.failed.len().to_string());
  }
  if !report.skipped.is_empty() {
    print_stat("Skipped", &report.skipped.len().to_string());
  }
}

pub fn print_fetch_failure(failure: &FetchFailure) {
  print_error(&format!(
    "{} {}: {}",
    failure.filename,
    short_key(&failure.sha256),
    describe_failure(&failure.failure)
  ));
}

pub fn print_prefetch_summary(report: &PrefetchReport, missing_only: bool) {
  print_stat("Downloaded", &report.fetched.len().to_string());
  print_stat("Cached", &report.cached.to_string());
  if missing_only {
    print_stat("Packages skipped", &report.skipped_packages.to_string());
  }
}

/// Per-kind counters of one sweep; zero counters other than `Removed` are omitted.
pub fn print_cleanup(result: &CleanupResult) {
  let stats = &result.stats;
  println!("{}:", result.kind);
  print_stat("Removed", &format!("{} of {}", stats.removed, stats.scanned));
  for (label, count) in [
    ("In use", stats.skipped_in_use),
    ("Build dirs", stats.build_dirs_removed),
    ("Partials", stats.partials_removed),
    ("Locks", stats.locks_removed),
  ] {
    if count > 0 {
      print_stat(label, &count.to_string());
    }
  }
}

/// One row of `cairn locks`. A held lock whose exclusive owner exited on
/// this host is still held by a process it spawned.
pub fn print_lock(kind: EntryKind, key: &str, state: &LockState) {
  let name = lock_state_name(state);
  let painted = match state {
    LockState::Held(_) => name.if_supports_color(Stream::Stdout, |s| s.yellow()).to_string(),
    LockState::Stale(_) => name.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
    LockState::Free => name.if_supports_color(Stream::Stdout, |s| s.dimmed()).to_string(),
  };
  let row = format!("  {:<8} {:<12} {}", kind.to_string(), short_key(key), painted);
  match state {
    LockState::Held(Some(owner)) if owner.is_dead() => {
      let marker = "(owner exited)".if_supports_color(Stream::Stdout, |s| s.red()).to_string();
      println!("{row} {owner} {marker}");
    }
    LockState::Held(Some(owner)) | LockState::Stale(owner) => println!("{row} {owner}"),
    LockState::Held(None) | LockState::Free => println!("{row}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use cairn_lib::error::FailureKind;

  #[test]
  fn short_key_keeps_a_prefix() {
    assert_eq!(short_key("0f1e2d3c4b5a69788796a5b4c3d2e1f0"), "0f1e2d3c4b5a");
    assert_eq!(short_key("abc"), "abc");
  }

  #[test]
  fn bytes_scale_to_the_largest_unit() {
    assert_eq!(format_bytes(0), "0 B");
    assert_eq!(format_bytes(1023), "1023 B");
    assert_eq!(format_bytes(1536), "1.5 KB");
    assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 * 1024 * 1024), "3072.0 TB");
  }

  #[test]
  fn durations_drop_sub_millisecond_noise() {
    assert_eq!(format_duration(Duration::from_micros(1_500_700)), "1s 500ms");
    assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
  }

  #[test]
  fn failures_name_their_class() {
    let failure = NodeFailure {
      kind: FailureKind::Integrity,
      message: "checksum mismatch".to_string(),
    };
    assert_eq!(describe_failure(&failure), "integrity error: checksum mismatch");
  }

  #[test]
  fn lock_states_have_stable_names() {
    assert_eq!(lock_state_name(&LockState::Free), "free");
    assert_eq!(lock_state_name(&LockState::Held(None)), "held");
  }
}
