use predicates::prelude::*;

use super::common::{CHAIN_GRAPH, FAILING_GRAPH, TestEnv};

#[test]
fn build_publishes_closure() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);

  env
    .cairn_cmd()
    .arg("build")
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("app"))
    .stdout(predicate::str::contains("Built: 2"));

  assert_eq!(env.published_packages().len(), 2);
}

#[test]
fn second_build_is_cached() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);

  env.cairn_cmd().arg("build").arg(&graph).assert().success();
  env
    .cairn_cmd()
    .arg("build")
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("Built: 0"))
    .stdout(predicate::str::contains("Cached: 2"));
}

#[test]
fn build_selected_package_only() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);

  env.cairn_cmd().arg("build").arg(&graph).arg("base").assert().success();

  assert_eq!(env.published_packages().len(), 1);
}

#[test]
fn failure_exits_nonzero_and_reports_dependents() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", FAILING_GRAPH);

  env
    .cairn_cmd()
    .arg("build")
    .arg(&graph)
    .assert()
    .failure()
    .stderr(predicate::str::contains("dependency"))
    .stderr(predicate::str::contains("1 of 2 requested package(s) failed"))
    .stdout(predicate::str::contains("fine"));

  // The independent branch still publishes; the failed one leaves nothing behind.
  assert_eq!(env.published_packages().len(), 1);
  let leftovers: Vec<_> = std::fs::read_dir(env.store_path().join("pkgs"))
    .unwrap()
    .flatten()
    .filter(|e| e.file_name().to_string_lossy().ends_with(".build"))
    .collect();
  assert!(leftovers.is_empty());
}

#[test]
fn build_json_output() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", FAILING_GRAPH);

  let output = env
    .cairn_cmd()
    .args(["-o", "json", "build"])
    .arg(&graph)
    .assert()
    .failure()
    .get_output()
    .stdout
    .clone();

  let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(json["success"], false);
  assert_eq!(json["failed"], 1);
  assert_eq!(json["skipped"], 1);

  let packages = json["packages"].as_array().unwrap();
  assert_eq!(packages[0]["package"], "user");
  assert_eq!(packages[0]["status"], "dependency_failed");
  assert_eq!(packages[1]["package"], "fine");
  assert_eq!(packages[1]["status"], "succeeded");
}

#[test]
fn cycle_is_rejected() {
  let env = TestEnv::new();
  let graph = env.write_file(
    "graph.json",
    r#"{"packages": [
      {"id": "a", "build": "true", "buildDeps": ["b"]},
      {"id": "b", "build": "true", "runDeps": ["a"]}
    ]}"#,
  );

  env
    .cairn_cmd()
    .arg("build")
    .arg(&graph)
    .assert()
    .failure()
    .stderr(predicate::str::contains("cycle"));

  assert!(env.published_packages().is_empty());
}

#[test]
fn concurrent_processes_build_once() {
  let env = TestEnv::new();
  let counter = env.temp.path().join("runs");
  let graph = env.write_file(
    "graph.json",
    &format!(
      r#"{{"packages": [{{"id": "slow", "build": "echo run >> {}; sleep 1; touch \"$out/done\""}}]}}"#,
      counter.display()
    ),
  );

  let children: Vec<_> = (0..3)
    .map(|_| {
      std::process::Command::new(assert_cmd::cargo::cargo_bin!("cairn"))
        .env("CAIRN_STORE", env.store_path())
        .args(["--sandbox", "host", "build"])
        .arg(&graph)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap()
    })
    .collect();

  for mut child in children {
    assert!(child.wait().unwrap().success());
  }

  assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 1);
  assert_eq!(env.published_packages().len(), 1);
}
