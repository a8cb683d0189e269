use predicates::prelude::*;

use super::common::{CHAIN_GRAPH, FAILING_GRAPH, TestEnv};

const MANIFEST: &str = r#"{
  "packages": ["app"],
  "envSet": {"GREETING": "hi"},
  "fsEntries": [{"type": "file", "path": "/etc/motd", "content": "welcome\n"}]
}"#;

#[test]
fn venv_print_materializes_rootfs() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  let manifest = env.write_file("venv.json", MANIFEST);

  let output = env
    .cairn_cmd()
    .args(["-o", "json", "venv", "--print"])
    .arg(&graph)
    .arg(&manifest)
    .assert()
    .success()
    .get_output()
    .stdout
    .clone();

  let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(json["origin"], "built");
  assert_eq!(json["plan"]["env"]["GREETING"], "hi");

  // Only the run closure of `app` is exposed; `base` was a build dependency.
  assert_eq!(json["closure"].as_array().unwrap().len(), 1);

  let rootfs = std::path::PathBuf::from(json["plan"]["rootfs"].as_str().unwrap());
  assert_eq!(std::fs::read_to_string(rootfs.join("app.txt")).unwrap(), "base\n");
  assert_eq!(std::fs::read_to_string(rootfs.join("etc/motd")).unwrap(), "welcome\n");
  assert!(!rootfs.join("share/base.txt").exists());
}

#[test]
fn venv_is_reused() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  let manifest = env.write_file("venv.json", MANIFEST);

  env.cairn_cmd().args(["venv", "--print"]).arg(&graph).arg(&manifest).assert().success();
  env
    .cairn_cmd()
    .args(["-o", "json", "venv", "--print"])
    .arg(&graph)
    .arg(&manifest)
    .assert()
    .success()
    .stdout(predicate::str::contains(r#""origin": "cached""#));
}

#[test]
fn venv_with_failed_package_fails() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", FAILING_GRAPH);
  let manifest = env.write_file("venv.json", r#"{"packages": ["user"]}"#);

  env
    .cairn_cmd()
    .args(["venv", "--print"])
    .arg(&graph)
    .arg(&manifest)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to materialize venv"));
}

#[test]
fn venv_rejects_invalid_manifest() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  let manifest = env.write_file("venv.json", r#"{"packages": []}"#);

  env
    .cairn_cmd()
    .args(["venv", "--print"])
    .arg(&graph)
    .arg(&manifest)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid manifest"));
}
