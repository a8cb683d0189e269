use predicates::prelude::*;

use super::common::{CHAIN_GRAPH, TestEnv};

#[test]
fn cleanup_keeps_recent_entries() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  env.cairn_cmd().arg("build").arg(&graph).assert().success();

  env
    .cairn_cmd()
    .args(["cleanup", "--max-age", "1h"])
    .assert()
    .success();

  assert_eq!(env.published_packages().len(), 2);
}

#[test]
fn cleanup_removes_expired_entries() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  env.cairn_cmd().arg("build").arg(&graph).assert().success();

  env
    .cairn_cmd()
    .args(["cleanup", "--kind", "package", "--max-age", "0s"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Removed: 2 of 2"));

  assert!(env.published_packages().is_empty());
}

#[test]
fn cleanup_dry_run_changes_nothing() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  env.cairn_cmd().arg("build").arg(&graph).assert().success();

  env
    .cairn_cmd()
    .args(["cleanup", "--max-age", "0s", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));

  assert_eq!(env.published_packages().len(), 2);
}

#[test]
fn cleanup_json_output_is_valid() {
  let env = TestEnv::new();

  let output = env
    .cairn_cmd()
    .args(["-o", "json", "cleanup"])
    .assert()
    .success()
    .get_output()
    .stdout
    .clone();

  let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
  let kinds: Vec<_> = json.as_array().unwrap().iter().map(|r| r["kind"].clone()).collect();
  assert_eq!(kinds, ["venv", "package", "fetch"]);
  assert!(json[0]["stats"]["bytes_freed"].is_u64());
  assert!(json[0]["deleted_paths"].is_array());
}

#[test]
fn locks_lists_entries_after_build() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  env.cairn_cmd().arg("build").arg(&graph).assert().success();

  env
    .cairn_cmd()
    .args(["locks", "--kind", "package"])
    .assert()
    .success()
    .stdout(predicate::str::contains("package"))
    .stdout(predicate::str::contains("free"));
}

#[test]
fn locks_flag_owners_that_exited() {
  let env = TestEnv::new();
  let local_host = std::fs::read_to_string("/proc/sys/kernel/hostname").unwrap();
  let owner = |pid: u32, hostname: &str| {
    serde_json::json!({
      "version": 1,
      "pid": pid,
      "hostname": hostname,
      "started_at_unix": 1,
      "purpose": "build crashed",
    })
    .to_string()
  };
  env.write_file("store/pkgs/aaaa.lock", &owner(999_999, local_host.trim()));
  env.write_file("store/pkgs/bbbb.lock", &owner(999_999, "elsewhere"));

  let output = env
    .cairn_cmd()
    .args(["-o", "json", "locks", "--kind", "package"])
    .assert()
    .success()
    .get_output()
    .stdout
    .clone();

  let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(json[0]["key"], "aaaa");
  assert_eq!(json[0]["state"], "stale");
  assert_eq!(json[0]["owner_dead"], true);
  assert_eq!(json[1]["key"], "bbbb");
  assert_eq!(json[1]["owner_dead"], false);
}
