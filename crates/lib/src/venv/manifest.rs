//! Venv manifest: which packages to expose and how the environment is set up.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use super::VenvError;

/// Description of an interactive environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenvManifest {
  /// Package ids from the graph document whose run-time closures are exposed.
  pub packages: Vec<String>,

  /// Host variables passed through when set.
  #[serde(default)]
  pub env_keep: Vec<String>,

  /// Variables set unconditionally, applied after `env_keep`.
  #[serde(default)]
  pub env_set: BTreeMap<String, String>,

  /// Add the standard `/dev`, `/proc`, `/run`, `/tmp` and `/home` mounts.
  #[serde(default = "default_true")]
  pub mount_defaults: bool,

  #[serde(default)]
  pub mounts: Vec<Mount>,

  /// Extra filesystem entries materialized into the rootfs.
  #[serde(default)]
  pub fs_entries: Vec<FsEntry>,
}

fn default_true() -> bool {
  true
}

impl VenvManifest {
  pub fn from_json(text: &str) -> Result<Self, VenvError> {
    let manifest: Self = serde_json::from_str(text).map_err(|e| VenvError::Manifest(e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
  }

  pub fn validate(&self) -> Result<(), VenvError> {
    if self.packages.is_empty() {
      return Err(VenvError::Manifest("packages must not be empty".to_string()));
    }
    for entry in &self.fs_entries {
      entry.relative_path()?;
    }
    for mount in &self.mounts {
      if !mount.target.starts_with('/') {
        return Err(VenvError::Manifest(format!(
          "mount target {:?} must be absolute",
          mount.target
        )));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountKind {
  Bind,
  RoBind,
  DevBind,
  Tmpfs,
  Proc,
}

/// A mount inside the launched environment.
///
/// Written either as a string (`"/src"`, `"/src:/dst"`, `"/src:/dst:ro"`) or
/// as `{type, source, target, optional}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMount")]
pub struct Mount {
  #[serde(rename = "type")]
  pub kind: MountKind,
  pub source: Option<String>,
  pub target: String,
  /// Skip silently when the source does not exist.
  pub optional: bool,
}

impl Mount {
  pub fn new(kind: MountKind, source: Option<&str>, target: &str) -> Self {
    Self {
      kind,
      source: source.map(str::to_string),
      target: target.to_string(),
      optional: false,
    }
  }

  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }

  /// Mounts added when `mountDefaults` is set.
  pub fn defaults() -> Vec<Mount> {
    vec![
      Mount::new(MountKind::DevBind, Some("/dev"), "/dev"),
      Mount::new(MountKind::Proc, None, "/proc"),
      Mount::new(MountKind::Tmpfs, None, "/run"),
      Mount::new(MountKind::Bind, Some("/tmp"), "/tmp"),
      Mount::new(MountKind::Bind, Some("/home"), "/home").optional(),
    ]
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMount {
  Short(String),
  Full {
    #[serde(rename = "type", default = "default_kind")]
    kind: MountKind,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    optional: bool,
  },
}

fn default_kind() -> MountKind {
  MountKind::Bind
}

impl TryFrom<RawMount> for Mount {
  type Error = String;

  fn try_from(raw: RawMount) -> Result<Self, Self::Error> {
    match raw {
      RawMount::Short(text) => {
        let mut parts = text.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        if source.is_empty() {
          return Err(format!("empty mount source in {text:?}"));
        }
        let target = parts.next().filter(|t| !t.is_empty()).unwrap_or(source);
        let kind = match parts.next() {
          None | Some("rw") => MountKind::Bind,
          Some("ro") => MountKind::RoBind,
          Some(other) => return Err(format!("unknown mount flag {other:?} in {text:?}")),
        };
        Ok(Mount::new(kind, Some(source), target))
      }
      RawMount::Full {
        kind,
        source,
        target,
        optional,
      } => {
        let needs_source = matches!(kind, MountKind::Bind | MountKind::RoBind | MountKind::DevBind);
        if needs_source && source.is_none() {
          return Err(format!("{kind:?} mount needs a source"));
        }
        let Some(target) = target.or_else(|| source.clone()) else {
          return Err("mount needs a target".to_string());
        };
        Ok(Mount {
          kind,
          source,
          target,
          optional,
        })
      }
    }
  }
}

/// A filesystem entry written into the venv rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FsEntry {
  Directory {
    path: String,
    #[serde(default = "dir_mode", deserialize_with = "deserialize_mode")]
    mode: u32,
  },
  File {
    path: String,
    #[serde(default)]
    content: String,
    #[serde(default = "file_mode", deserialize_with = "deserialize_mode")]
    mode: u32,
  },
  Symlink {
    path: String,
    target: String,
  },
}

fn dir_mode() -> u32 {
  0o755
}

fn file_mode() -> u32 {
  0o644
}

// Modes are accepted as numbers or octal strings ("0755").
fn deserialize_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum RawMode {
    Number(u32),
    Octal(String),
  }

  let mode = match RawMode::deserialize(deserializer)? {
    RawMode::Number(n) => n,
    RawMode::Octal(s) => u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(serde::de::Error::custom)?,
  };
  if mode > 0o7777 {
    return Err(serde::de::Error::custom(format!("mode {mode:o} out of range")));
  }
  Ok(mode)
}

impl FsEntry {
  pub fn path(&self) -> &str {
    match self {
      FsEntry::Directory { path, .. } | FsEntry::File { path, .. } | FsEntry::Symlink { path, .. } => path,
    }
  }

  /// The entry's path relative to the rootfs.
  ///
  /// A leading `/` is allowed; `..` components and empty paths are rejected.
  pub fn relative_path(&self) -> Result<PathBuf, VenvError> {
    let raw = self.path();
    let mut relative = PathBuf::new();
    for component in Path::new(raw).components() {
      match component {
        Component::RootDir | Component::CurDir => {}
        Component::Normal(part) => relative.push(part),
        Component::ParentDir | Component::Prefix(_) => {
          return Err(VenvError::Manifest(format!("fs entry path {raw:?} escapes the rootfs")));
        }
      }
    }
    if relative.as_os_str().is_empty() {
      return Err(VenvError::Manifest(format!("fs entry path {raw:?} is empty")));
    }
    Ok(relative)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_full_manifest() {
    let manifest = VenvManifest::from_json(
      r#"{
        "packages": ["python"],
        "envKeep": ["TERM"],
        "envSet": {"LANG": "C.UTF-8"},
        "mountDefaults": false,
        "mounts": ["/srv/data:/data:ro", {"type": "tmpfs", "target": "/scratch"}],
        "fsEntries": [
          {"type": "directory", "path": "/etc/app"},
          {"type": "file", "path": "etc/app/config", "content": "x=1", "mode": "0600"},
          {"type": "symlink", "path": "/usr/bin/py", "target": "python3"}
        ]
      }"#,
    )
    .unwrap();

    assert!(!manifest.mount_defaults);
    assert_eq!(manifest.mounts[0], Mount::new(MountKind::RoBind, Some("/srv/data"), "/data"));
    assert_eq!(manifest.mounts[1].kind, MountKind::Tmpfs);
    assert_eq!(manifest.fs_entries[0], FsEntry::Directory {
      path: "/etc/app".to_string(),
      mode: 0o755
    });
    assert!(matches!(manifest.fs_entries[1], FsEntry::File { mode: 0o600, .. }));
  }

  #[test]
  fn defaults_apply() {
    let manifest = VenvManifest::from_json(r#"{"packages": ["a"], "mounts": ["/opt"]}"#).unwrap();
    assert!(manifest.mount_defaults);
    assert!(manifest.env_keep.is_empty());
    assert_eq!(manifest.mounts[0], Mount::new(MountKind::Bind, Some("/opt"), "/opt"));
  }

  #[test]
  fn rejects_escaping_fs_entries() {
    let err = VenvManifest::from_json(
      r#"{"packages": ["a"], "fsEntries": [{"type": "file", "path": "../etc/passwd", "content": ""}]}"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("escapes"));
  }

  #[test]
  fn rejects_bad_mounts() {
    assert!(VenvManifest::from_json(r#"{"packages": ["a"], "mounts": [{"type": "bind", "target": "/x"}]}"#).is_err());
    assert!(VenvManifest::from_json(r#"{"packages": ["a"], "mounts": ["/x:/y:weird"]}"#).is_err());
    assert!(VenvManifest::from_json(r#"{"packages": ["a"], "mounts": ["/x:relative"]}"#).is_err());
  }

  #[test]
  fn requires_packages() {
    assert!(VenvManifest::from_json(r#"{"packages": []}"#).is_err());
    assert!(VenvManifest::from_json(r#"{}"#).is_err());
  }
}
