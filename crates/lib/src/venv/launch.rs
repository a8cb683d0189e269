//! Launch plans for materialized venvs.
//!
//! The launcher itself is external; this module only decides what it
//! should see: the rootfs, the environment and the mounts.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::manifest::{Mount, MountKind, VenvManifest};

/// `PATH` inside the venv when neither the host nor the manifest sets one.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Library search path inside the venv when not otherwise set.
pub const DEFAULT_LIBRARY_PATH: &str = "/usr/local/lib:/usr/lib:/lib";

const DEFAULT_COMMAND: &str = "/bin/sh";

/// Everything an external launcher needs to enter a venv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
  /// Published rootfs, mounted read-only at `/`.
  pub rootfs: PathBuf,
  pub env: BTreeMap<String, String>,
  pub mounts: Vec<Mount>,
  /// Working directory inside the venv.
  pub chdir: PathBuf,
}

impl LaunchPlan {
  /// Plan a launch of `rootfs` for `manifest`.
  ///
  /// `host_env` looks up host variables for `envKeep`; `cwd` is kept as the
  /// working directory when a bind mount makes it visible inside the venv.
  pub fn new(
    rootfs: &Path,
    manifest: &VenvManifest,
    host_env: impl Fn(&str) -> Option<String>,
    cwd: Option<&Path>,
  ) -> Self {
    let mut env = BTreeMap::new();
    for key in &manifest.env_keep {
      if let Some(value) = host_env(key) {
        env.insert(key.clone(), value);
      }
    }
    for (key, value) in &manifest.env_set {
      env.insert(key.clone(), value.clone());
    }
    env.entry("PATH".to_string()).or_insert_with(|| DEFAULT_PATH.to_string());
    env
      .entry("LD_LIBRARY_PATH".to_string())
      .or_insert_with(|| DEFAULT_LIBRARY_PATH.to_string());

    let mut mounts = if manifest.mount_defaults {
      Mount::defaults()
    } else {
      Vec::new()
    };
    mounts.extend(manifest.mounts.iter().cloned());

    let chdir = cwd
      .filter(|cwd| visible_through_bind(&mounts, cwd))
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("/"));

    Self {
      rootfs: rootfs.to_path_buf(),
      env,
      mounts,
      chdir,
    }
  }

  /// Plan with the current process environment and working directory.
  pub fn from_host(rootfs: &Path, manifest: &VenvManifest) -> Self {
    let cwd = std::env::current_dir().ok();
    Self::new(rootfs, manifest, |key| std::env::var(key).ok(), cwd.as_deref())
  }

  /// bubblewrap arguments entering the venv and running `command`
  /// (`/bin/sh` when empty).
  pub fn bwrap_args(&self, command: &[String]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--ro-bind".into(), self.rootfs.clone().into(), "/".into()];

    for mount in &self.mounts {
      let source = mount.source.as_deref().unwrap_or_default();
      match (mount.kind, mount.optional) {
        (MountKind::Bind, false) => args.extend(["--bind".into(), source.into(), mount.target.as_str().into()]),
        (MountKind::Bind, true) => args.extend(["--bind-try".into(), source.into(), mount.target.as_str().into()]),
        (MountKind::RoBind, false) => args.extend(["--ro-bind".into(), source.into(), mount.target.as_str().into()]),
        (MountKind::RoBind, true) => {
          args.extend(["--ro-bind-try".into(), source.into(), mount.target.as_str().into()])
        }
        (MountKind::DevBind, false) => args.extend(["--dev-bind".into(), source.into(), mount.target.as_str().into()]),
        (MountKind::DevBind, true) => {
          args.extend(["--dev-bind-try".into(), source.into(), mount.target.as_str().into()])
        }
        (MountKind::Tmpfs, _) => args.extend(["--tmpfs".into(), mount.target.as_str().into()]),
        (MountKind::Proc, _) => args.extend(["--proc".into(), mount.target.as_str().into()]),
      }
    }

    args.push("--clearenv".into());
    for (key, value) in &self.env {
      args.extend(["--setenv".into(), key.into(), value.into()]);
    }
    args.extend(["--chdir".into(), self.chdir.clone().into(), "--".into()]);

    if command.is_empty() {
      args.push(DEFAULT_COMMAND.into());
    } else {
      args.extend(command.iter().map(OsString::from));
    }
    args
  }
}

fn visible_through_bind(mounts: &[Mount], cwd: &Path) -> bool {
  mounts.iter().any(|m| {
    matches!(m.kind, MountKind::Bind | MountKind::RoBind)
      && m.source.as_deref() == Some(m.target.as_str())
      && cwd.starts_with(&m.target)
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manifest(json: &str) -> VenvManifest {
    VenvManifest::from_json(json).unwrap()
  }

  fn host(key: &str) -> Option<String> {
    match key {
      "TERM" => Some("xterm".to_string()),
      "PATH" => Some("/host/bin".to_string()),
      _ => None,
    }
  }

  #[test]
  fn env_keep_set_and_defaults() {
    let m = manifest(r#"{"packages": ["a"], "envKeep": ["TERM", "MISSING"], "envSet": {"LD_LIBRARY_PATH": "/opt/lib"}}"#);
    let plan = LaunchPlan::new(Path::new("/store/venvs/x/rootfs"), &m, host, None);

    assert_eq!(plan.env.get("TERM").map(String::as_str), Some("xterm"));
    assert!(!plan.env.contains_key("MISSING"));
    assert_eq!(plan.env["PATH"], DEFAULT_PATH);
    assert_eq!(plan.env["LD_LIBRARY_PATH"], "/opt/lib");
  }

  #[test]
  fn kept_path_wins_over_default() {
    let m = manifest(r#"{"packages": ["a"], "envKeep": ["PATH"]}"#);
    let plan = LaunchPlan::new(Path::new("/r"), &m, host, None);
    assert_eq!(plan.env["PATH"], "/host/bin");
  }

  #[test]
  fn default_mounts_can_be_disabled() {
    let with = LaunchPlan::new(Path::new("/r"), &manifest(r#"{"packages": ["a"]}"#), host, None);
    let without = LaunchPlan::new(
      Path::new("/r"),
      &manifest(r#"{"packages": ["a"], "mountDefaults": false, "mounts": ["/opt"]}"#),
      host,
      None,
    );

    assert_eq!(with.mounts.len(), Mount::defaults().len());
    assert_eq!(without.mounts, vec![Mount::new(MountKind::Bind, Some("/opt"), "/opt")]);
  }

  #[test]
  fn cwd_is_kept_only_when_visible() {
    let m = manifest(r#"{"packages": ["a"]}"#);
    let inside = LaunchPlan::new(Path::new("/r"), &m, host, Some(Path::new("/home/user/project")));
    let outside = LaunchPlan::new(Path::new("/r"), &m, host, Some(Path::new("/etc")));

    assert_eq!(inside.chdir, Path::new("/home/user/project"));
    assert_eq!(outside.chdir, Path::new("/"));
  }

  #[test]
  fn bwrap_arguments() {
    let m = manifest(r#"{"packages": ["a"], "mounts": ["/srv:/data:ro"]}"#);
    let plan = LaunchPlan::new(Path::new("/store/venvs/x/rootfs"), &m, host, Some(Path::new("/tmp/work")));
    let args: Vec<String> = plan
      .bwrap_args(&["python3".to_string(), "-V".to_string()])
      .into_iter()
      .map(|a| a.to_string_lossy().into_owned())
      .collect();
    let joined = args.join(" ");

    assert!(joined.starts_with("--ro-bind /store/venvs/x/rootfs /"));
    assert!(joined.contains("--dev-bind /dev /dev"));
    assert!(joined.contains("--proc /proc"));
    assert!(joined.contains("--bind-try /home /home"));
    assert!(joined.contains("--ro-bind /srv /data"));
    assert!(joined.contains("--clearenv"));
    assert!(joined.ends_with("--chdir /tmp/work -- python3 -V"));
  }

  #[test]
  fn empty_command_runs_a_shell() {
    let plan = LaunchPlan::new(Path::new("/r"), &manifest(r#"{"packages": ["a"]}"#), host, None);
    assert_eq!(plan.bwrap_args(&[]).last().map(OsString::as_os_str), Some(std::ffi::OsStr::new(DEFAULT_COMMAND)));
  }
}
