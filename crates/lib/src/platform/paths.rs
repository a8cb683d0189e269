use crate::consts::APP_NAME;
use std::path::PathBuf;

/// Returns the user's home directory
///
/// Falls back to `/` when `HOME` is unset, which only happens in stripped
/// service environments.
pub fn home_dir() -> PathBuf {
  std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

/// Returns the directory for data files for the application
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Default store root when no override is configured.
pub fn default_store_dir() -> PathBuf {
  data_dir().join("store")
}
