use predicates::prelude::*;

use super::common::TestEnv;

/// sha256 of "hello\n".
const HELLO_SHA: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

fn graph_with_source(env: &TestEnv, sha: &str) -> std::path::PathBuf {
  let source = env.write_file("mirror/hello.txt", "hello\n");
  env.write_file(
    "graph.json",
    &format!(
      r#"{{"packages": [{{"id": "greeting", "build": "cp \"$fetch/hello.txt\" \"$out/\"",
           "fetch": [{{"filename": "hello.txt", "sha256": "{sha}", "urls": ["{}"]}}]}}]}}"#,
      source.display()
    ),
  )
}

#[test]
fn fetch_populates_cache() {
  let env = TestEnv::new();
  let graph = graph_with_source(&env, HELLO_SHA);

  env
    .cairn_cmd()
    .arg("fetch")
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("Downloaded: 1"));

  assert!(env.store_path().join("fetch").join(HELLO_SHA).is_file());

  env
    .cairn_cmd()
    .arg("fetch")
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("Cached: 1"));
}

#[test]
fn missing_only_skips_built_packages() {
  let env = TestEnv::new();
  let graph = graph_with_source(&env, HELLO_SHA);

  env.cairn_cmd().arg("build").arg(&graph).assert().success();
  env
    .cairn_cmd()
    .args(["fetch", "--missing-only"])
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("Packages skipped: 1"));
}

#[test]
fn checksum_mismatch_fails() {
  let env = TestEnv::new();
  let wrong = "0".repeat(64);
  let graph = graph_with_source(&env, &wrong);

  env
    .cairn_cmd()
    .arg("fetch")
    .arg(&graph)
    .assert()
    .failure()
    .stderr(predicate::str::contains("could not be fetched"));

  assert!(!env.store_path().join("fetch").join(&wrong).exists());
}
