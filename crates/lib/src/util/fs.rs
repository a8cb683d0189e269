//! Filesystem helpers shared by the store components.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use walkdir::WalkDir;

/// Seconds since the unix epoch.
pub fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

/// Refresh the modification time of `path` to now.
///
/// Used to record the last use of a published entry.
pub fn touch(path: &Path) -> io::Result<()> {
  filetime::set_symlink_file_times(path, FileTime::now(), FileTime::now())
}

/// Time elapsed since `path` was last modified. Missing paths have no age.
pub fn age(path: &Path) -> io::Result<Option<Duration>> {
  let metadata = match fs::symlink_metadata(path) {
    Ok(m) => m,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(e),
  };
  let modified = metadata.modified()?;
  Ok(Some(SystemTime::now().duration_since(modified).unwrap_or_default()))
}

/// Remove a file, symlink or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
  let metadata = match fs::symlink_metadata(path) {
    Ok(m) => m,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e),
  };
  let result = if metadata.is_dir() {
    make_tree_writable(path);
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  };
  match result {
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    other => other,
  }
}

// Read-only directories (e.g. fetched sources in a kept build root) block
// removal of their children.
fn make_tree_writable(path: &Path) {
  use std::os::unix::fs::PermissionsExt;
  for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
    if entry.file_type().is_dir()
      && let Ok(metadata) = entry.metadata()
    {
      let mode = metadata.permissions().mode();
      if mode & 0o700 != 0o700 {
        let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700));
      }
    }
  }
}

/// Total size of regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Flush directory metadata so a preceding rename survives a crash.
pub fn sync_dir(path: &Path) -> io::Result<()> {
  fs::File::open(path)?.sync_all()
}
