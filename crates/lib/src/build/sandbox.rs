//! Sandboxes that run a build script against an assembled build root.
//!
//! The build root has a fixed shape:
//!
//! ```text
//! <rootfs>/
//!   <merged dependency closure>
//!   store/<address>/   one directory per dependency in the closure
//!   fetch/<filename>   fetched sources, read-only
//!   out/               empty; the script writes its result here
//!   build/             working directory and HOME
//!   tmp/
//! ```
//!
//! Scripts find these through environment variables (`$out`, `$fetch`,
//! `$store`, `$root`), which point at container paths under bwrap and at the
//! host paths under [`HostSandbox`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, info};

use crate::consts::SOURCE_DATE_EPOCH;

pub const OUT_DIR: &str = "out";
pub const FETCH_DIR: &str = "fetch";
pub const STORE_DIR: &str = "store";
pub const BUILD_DIR: &str = "build";
pub const TMP_DIR: &str = "tmp";

const CONTAINER_PATH: &str = "/usr/bin:/bin:/store/bin:/store/sbin:/usr/sbin:/sbin";
const SCRIPT_CONTAINER_PATH: &str = "/tmp/.cairn-build-script";

/// One script execution.
#[derive(Debug, Clone)]
pub struct SandboxRequest<'a> {
  /// Human-readable package label for logs.
  pub label: &'a str,
  pub rootfs: &'a Path,
  pub script: &'a str,
  pub parallelism: usize,
  /// File receiving the script's stdout and stderr.
  pub log: &'a Path,
}

/// Runs build scripts in isolation.
pub trait Sandbox: Send + Sync {
  fn run(&self, request: &SandboxRequest<'_>) -> io::Result<ExitStatus>;
}

/// Environment seen by the script. `locate` maps a root directory name to
/// the path the script sees for it.
pub fn build_environment(request: &SandboxRequest<'_>, locate: impl Fn(&str) -> String) -> BTreeMap<String, String> {
  let mut env = BTreeMap::new();
  env.insert("out".to_string(), locate(OUT_DIR));
  env.insert("fetch".to_string(), locate(FETCH_DIR));
  env.insert("store".to_string(), locate(STORE_DIR));
  env.insert("root".to_string(), locate(""));
  env.insert("HOME".to_string(), locate(BUILD_DIR));
  env.insert("TMPDIR".to_string(), locate(TMP_DIR));
  env.insert("SHELL".to_string(), "/bin/sh".to_string());
  env.insert("CONFIG_SHELL".to_string(), "/bin/sh".to_string());
  env.insert("BUILD_PARALLELISM".to_string(), request.parallelism.to_string());
  env.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());
  env.insert("LANG".to_string(), "C".to_string());
  env.insert("LC_ALL".to_string(), "C".to_string());
  env
}

fn open_log(path: &Path) -> io::Result<(File, File)> {
  let log = OpenOptions::new().create(true).append(true).open(path)?;
  let err = log.try_clone()?;
  Ok((log, err))
}

/// Runs the script with the host's `/bin/sh`, confined only by a cleared
/// environment. For hosts without bubblewrap and for tests.
#[derive(Debug, Clone, Default)]
pub struct HostSandbox;

impl Sandbox for HostSandbox {
  fn run(&self, request: &SandboxRequest<'_>) -> io::Result<ExitStatus> {
    let rootfs = request.rootfs;
    let mut env = build_environment(request, |dir| {
      if dir.is_empty() {
        rootfs.display().to_string()
      } else {
        rootfs.join(dir).display().to_string()
      }
    });
    let path = ["usr/bin", "bin", "store/bin"]
      .iter()
      .map(|p| rootfs.join(p).display().to_string())
      .chain(["/usr/bin".to_string(), "/bin".to_string()])
      .collect::<Vec<_>>()
      .join(":");
    env.insert("PATH".to_string(), path);

    let (stdout, stderr) = open_log(request.log)?;
    info!(package = request.label, "running build script on host");
    debug!(rootfs = ?rootfs, "host sandbox");

    Command::new("/bin/sh")
      .arg("-c")
      .arg(request.script)
      .current_dir(rootfs.join(BUILD_DIR))
      .env_clear()
      .envs(&env)
      .stdin(Stdio::null())
      .stdout(stdout)
      .stderr(stderr)
      .status()
  }
}

/// Runs the script under bubblewrap with the build root mounted at `/` and
/// no network.
#[derive(Debug, Clone)]
pub struct BwrapSandbox {
  program: PathBuf,
}

impl Default for BwrapSandbox {
  fn default() -> Self {
    Self {
      program: PathBuf::from("bwrap"),
    }
  }
}

impl BwrapSandbox {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self { program: program.into() }
  }

  /// Locate `bwrap` on `PATH`.
  pub fn detect() -> Option<Self> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
      .map(|dir| dir.join("bwrap"))
      .find(|candidate| {
        fs::metadata(candidate)
          .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
          .unwrap_or(false)
      })
      .map(Self::new)
  }

  /// Arguments passed to bwrap for `request`, with the script staged at `script_host_path`.
  pub fn arguments(&self, request: &SandboxRequest<'_>, script_host_path: &Path) -> Vec<OsString> {
    let fetch_host = request.rootfs.join(FETCH_DIR);
    let mut args: Vec<OsString> = vec![
      "--unshare-net".into(),
      "--bind".into(),
      request.rootfs.into(),
      "/".into(),
      "--dev-bind".into(),
      "/dev".into(),
      "/dev".into(),
      "--proc".into(),
      "/proc".into(),
      "--ro-bind".into(),
      fetch_host.into(),
      "/fetch".into(),
      "--clearenv".into(),
      "--ro-bind".into(),
      script_host_path.into(),
      SCRIPT_CONTAINER_PATH.into(),
    ];

    let mut env = build_environment(request, |dir| format!("/{dir}"));
    env.insert("PATH".to_string(), CONTAINER_PATH.to_string());
    if let Ok(term) = std::env::var("TERM") {
      env.insert("TERM".to_string(), term);
    }
    for (key, value) in env {
      args.extend(["--setenv".into(), key.into(), value.into()]);
    }

    args.extend(["--chdir".into(), "/build".into(), "/bin/sh".into(), SCRIPT_CONTAINER_PATH.into()]);
    args
  }

  fn stage_script(request: &SandboxRequest<'_>) -> io::Result<PathBuf> {
    let dir = request.rootfs.parent().unwrap_or(request.rootfs);
    let path = dir.join(format!(".cairn-build-script-{}", std::process::id()));
    let mut file = File::create(&path)?;
    file.write_all(request.script.as_bytes())?;
    if !request.script.ends_with('\n') {
      file.write_all(b"\n")?;
    }
    file.sync_all()?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;
    Ok(path)
  }
}

impl Sandbox for BwrapSandbox {
  fn run(&self, request: &SandboxRequest<'_>) -> io::Result<ExitStatus> {
    let script = Self::stage_script(request)?;
    let (stdout, stderr) = open_log(request.log)?;
    info!(package = request.label, "running build script under bwrap");

    let status = Command::new(&self.program)
      .args(self.arguments(request, &script))
      .stdin(Stdio::null())
      .stdout(stdout)
      .stderr(stderr)
      .status();

    let _ = fs::remove_file(&script);
    status
  }
}
