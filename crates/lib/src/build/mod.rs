//! Build executor.
//!
//! Turns one package spec into a published artifact: fetch its sources,
//! assemble a build root from the already-published dependency closure, run
//! the script in a sandbox and archive the output directory. Everything
//! happens inside the store's private build directory for the address, so a
//! failure never leaves a partial artifact behind.

pub mod archive;
pub mod sandbox;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::address::ContentAddress;
use crate::error::FailureKind;
use crate::fetch::{FetchCache, FetchError};
use crate::lock::EntryLock;
use crate::package::PackageSpec;
use crate::store::layout::ARTIFACT_FILE;
use crate::store::{EntryKind, EntryRecord, Publication, Staging, Store, StoreError};
use crate::util::hash::{HashError, hash_directory};

use sandbox::{BUILD_DIR, FETCH_DIR, OUT_DIR, STORE_DIR, Sandbox, SandboxRequest, TMP_DIR};

/// Build script that unpacks every fetched archive into the output instead
/// of running a sandbox.
pub const UNTAR_BUILTIN: &str = "untar";

const LOG_FILE: &str = "build.log";

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("failed to assemble build root at {path}: {source}")]
  Assemble {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to start sandbox for {package}: {source}")]
  Spawn {
    package: String,
    #[source]
    source: io::Error,
  },

  #[error("build script of {package} failed ({status}); log: {log}")]
  ScriptFailed {
    package: String,
    status: String,
    log: PathBuf,
  },

  #[error("build script of {package} left the output directory empty")]
  EmptyOutput { package: String },

  #[error("untar build of {package} needs at least one fetched archive")]
  UntarWithoutSources { package: String },

  #[error("failed to unpack {path}: {source}")]
  Unpack {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to archive output of {package}: {source}")]
  Archive {
    package: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to hash output of {package}: {source}")]
  Hash {
    package: String,
    #[source]
    source: HashError,
  },
}

impl BuildError {
  pub fn kind(&self) -> FailureKind {
    match self {
      BuildError::Fetch(e) => e.kind(),
      BuildError::Store(_) | BuildError::Assemble { .. } | BuildError::Archive { .. } | BuildError::Hash { .. } => {
        FailureKind::Storage
      }
      BuildError::UntarWithoutSources { .. } => FailureKind::Input,
      BuildError::Spawn { .. }
      | BuildError::ScriptFailed { .. }
      | BuildError::EmptyOutput { .. }
      | BuildError::Unpack { .. } => FailureKind::Build,
    }
  }
}

/// Everything needed to build one address.
#[derive(Debug, Clone)]
pub struct BuildJob<'a> {
  pub address: &'a ContentAddress,
  pub spec: &'a PackageSpec,
  /// Build deps and their run-time closures, dependencies first.
  pub build_closure: Vec<ContentAddress>,
  /// Run-time closure, dependencies first.
  pub run_closure: Vec<ContentAddress>,
}

/// Builds packages into one store.
#[derive(Clone)]
pub struct BuildExecutor {
  store: Store,
  fetcher: FetchCache,
  sandbox: Arc<dyn Sandbox>,
  parallelism: usize,
}

impl BuildExecutor {
  pub fn new(store: Store, fetcher: FetchCache, sandbox: Arc<dyn Sandbox>, parallelism: usize) -> Self {
    Self {
      store,
      fetcher,
      sandbox,
      parallelism: parallelism.max(1),
    }
  }

  /// Publish the artifact for `job`, building it only if no process has yet.
  ///
  /// The artifact comes back pinned; it stays safe from cleanup until the
  /// returned lock is dropped.
  pub fn build(&self, job: &BuildJob<'_>) -> Result<(Publication, EntryLock), BuildError> {
    let purpose = format!("build {}", job.spec.display_name());
    self
      .store
      .realize_pinned(EntryKind::Package, job.address.as_str(), &purpose, |staging| {
        self.produce(job, staging)
      })
  }

  fn produce(&self, job: &BuildJob<'_>, staging: &Staging) -> Result<(), BuildError> {
    let package = format!("{} ({})", job.spec.display_name(), job.address);
    info!(package = %package, "building");

    let mut fetched = Vec::with_capacity(job.spec.fetch.len());
    let mut pins: Vec<EntryLock> = Vec::new();
    for fetch in &job.spec.fetch {
      let (path, pin) = self
        .store
        .pin_after(EntryKind::Fetch, &fetch.sha256, &format!("use {}", fetch.filename), || {
          self.fetcher.fetch(fetch).map_err(BuildError::from)
        })?;
      pins.push(pin);
      fetched.push((fetch.filename.as_str(), path));
    }

    let script = job.spec.build.as_str();
    let out_dir = if script.trim() == UNTAR_BUILTIN {
      self.untar(&package, staging, &fetched)?
    } else if script.trim().is_empty() {
      let out = staging.work_dir().join(OUT_DIR);
      create_dir(&out)?;
      out
    } else {
      for dep in &job.build_closure {
        pins.push(self.store.pin(EntryKind::Package, dep.as_str(), &format!("build {package}"))?);
      }
      let rootfs = self.assemble(job, staging, &fetched)?;
      self.run_script(&package, script, staging, &rootfs)?;
      rootfs.join(OUT_DIR)
    };

    self.archive(job, &package, &out_dir, staging)?;
    drop(pins);
    info!(package = %package, "build succeeded");
    Ok(())
  }

  fn untar(&self, package: &str, staging: &Staging, fetched: &[(&str, PathBuf)]) -> Result<PathBuf, BuildError> {
    if fetched.is_empty() {
      return Err(BuildError::UntarWithoutSources {
        package: package.to_string(),
      });
    }
    let out = staging.work_dir().join(OUT_DIR);
    create_dir(&out)?;
    for (filename, path) in fetched {
      debug!(package, filename, "unpacking source");
      // The cached file is named by checksum; the extension comes from the declared filename.
      let named = staging.work_dir().join(filename);
      link_or_copy(path, &named)?;
      archive::unpack_source(&named, &out).map_err(|source| BuildError::Unpack { path: named.clone(), source })?;
    }
    Ok(out)
  }

  fn assemble(&self, job: &BuildJob<'_>, staging: &Staging, fetched: &[(&str, PathBuf)]) -> Result<PathBuf, BuildError> {
    let rootfs = staging.work_dir().join("rootfs");
    create_dir(&rootfs)?;

    for dep in &job.build_closure {
      let artifact = self.store.layout().package_artifact(dep.as_str());
      let unpack = |dest: &Path| {
        archive::unpack_into(&artifact, dest).map_err(|source| BuildError::Unpack {
          path: artifact.clone(),
          source,
        })
      };
      unpack(&rootfs)?;
      unpack(&rootfs.join(STORE_DIR).join(dep.as_str()))?;
    }

    for dir in ["dev", "proc", "sys", TMP_DIR, OUT_DIR, BUILD_DIR, FETCH_DIR, STORE_DIR] {
      create_dir(&rootfs.join(dir))?;
    }

    let fetch_dir = rootfs.join(FETCH_DIR);
    for (filename, path) in fetched {
      // Copied rather than linked: under the host sandbox a root script could
      // otherwise write through to the cache.
      let dest = fetch_dir.join(filename);
      fs::copy(path, &dest).map_err(|source| BuildError::Assemble {
        path: dest.clone(),
        source,
      })?;
      set_mode(&dest, 0o444)?;
    }
    set_mode(&fetch_dir, 0o555)?;

    Ok(rootfs)
  }

  fn run_script(&self, package: &str, script: &str, staging: &Staging, rootfs: &Path) -> Result<(), BuildError> {
    let log = staging.dir().join(LOG_FILE);
    let request = SandboxRequest {
      label: package,
      rootfs,
      script,
      parallelism: self.parallelism,
      log: &log,
    };

    let status = self.sandbox.run(&request).map_err(|source| BuildError::Spawn {
      package: package.to_string(),
      source,
    })?;

    if !status.success() {
      return Err(BuildError::ScriptFailed {
        package: package.to_string(),
        status: status.to_string(),
        log,
      });
    }

    let out = rootfs.join(OUT_DIR);
    let empty = fs::read_dir(&out)
      .map(|mut entries| entries.next().is_none())
      .unwrap_or(true);
    if empty {
      return Err(BuildError::EmptyOutput {
        package: package.to_string(),
      });
    }
    Ok(())
  }

  fn archive(&self, job: &BuildJob<'_>, package: &str, out_dir: &Path, staging: &Staging) -> Result<(), BuildError> {
    let output_hash = hash_directory(out_dir).map_err(|source| BuildError::Hash {
      package: package.to_string(),
      source,
    })?;

    let publish = staging.output();
    create_dir(&publish)?;
    archive::pack_dir(out_dir, &publish.join(ARTIFACT_FILE)).map_err(|source| BuildError::Archive {
      package: package.to_string(),
      source,
    })?;

    let mut record = EntryRecord::new(EntryKind::Package, job.address.clone());
    record.name = job.spec.name.clone();
    record.output_hash = Some(output_hash.0);
    record.build_closure = job.build_closure.clone();
    record.run_closure = job.run_closure.clone();
    record.write_to(&publish)?;
    Ok(())
  }
}

fn create_dir(path: &Path) -> Result<(), BuildError> {
  fs::create_dir_all(path).map_err(|source| BuildError::Assemble {
    path: path.to_path_buf(),
    source,
  })
}

fn set_mode(path: &Path, mode: u32) -> Result<(), BuildError> {
  fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| BuildError::Assemble {
    path: path.to_path_buf(),
    source,
  })
}

// Falls back to a copy when the build dir sits on another filesystem.
fn link_or_copy(src: &Path, dest: &Path) -> Result<(), BuildError> {
  if fs::hard_link(src, dest).is_ok() {
    return Ok(());
  }
  fs::copy(src, dest).map(|_| ()).map_err(|source| BuildError::Assemble {
    path: dest.to_path_buf(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::address::package_address;
  use crate::config::StoreConfig;
  use crate::fetch::DefaultTransport;
  use crate::package::FetchSpec;
  use crate::util::hash::hash_bytes;
  use sandbox::HostSandbox;
  use tempfile::TempDir;

  struct Fixture {
    temp: TempDir,
    store: Store,
    executor: BuildExecutor,
  }

  fn fixture(keep_failed: bool) -> Fixture {
    let temp = TempDir::new().unwrap();
    let store = Store::open(StoreConfig::at(temp.path().join("store")).with_keep_failed(keep_failed)).unwrap();
    let fetcher = FetchCache::new(store.layout().clone(), Arc::new(DefaultTransport::default()));
    let executor = BuildExecutor::new(store.clone(), fetcher, Arc::new(HostSandbox), 2);
    Fixture { temp, store, executor }
  }

  fn job<'a>(address: &'a ContentAddress, spec: &'a PackageSpec, build_closure: Vec<ContentAddress>) -> BuildJob<'a> {
    BuildJob {
      address,
      spec,
      build_closure,
      run_closure: Vec::new(),
    }
  }

  fn unpacked(f: &Fixture, address: &ContentAddress) -> PathBuf {
    let dest = f.temp.path().join(format!("unpacked-{address}"));
    archive::unpack_into(&f.store.layout().package_artifact(address.as_str()), &dest).unwrap();
    dest
  }

  #[test]
  fn builds_and_records_metadata() {
    let f = fixture(true);
    let spec = PackageSpec::new("echo hi > \"$out/hello.txt\"").named("hello");
    let address = package_address(&spec, [], []).unwrap();

    let (publication, _pin) = f.executor.build(&job(&address, &spec, vec![])).unwrap();

    assert_eq!(publication.origin, crate::store::Origin::Built);
    let record = EntryRecord::read_from(&publication.path).unwrap();
    assert_eq!(record.name.as_deref(), Some("hello"));
    assert_eq!(record.address, address);
    assert!(record.output_hash.is_some());
    assert_eq!(fs::read_to_string(unpacked(&f, &address).join("hello.txt")).unwrap(), "hi\n");
  }

  #[test]
  fn dependency_closure_is_visible_to_the_script() {
    let f = fixture(true);
    let dep_spec = PackageSpec::new("mkdir -p \"$out/share\" && echo dep > \"$out/share/dep.txt\"");
    let dep = package_address(&dep_spec, [], []).unwrap();
    f.executor.build(&job(&dep, &dep_spec, vec![])).unwrap();

    let spec = PackageSpec::new(format!(
      "cp \"$root/share/dep.txt\" \"$out/merged.txt\" && cp \"$store/{dep}/share/dep.txt\" \"$out/scoped.txt\""
    ));
    let address = package_address(&spec, [&dep], []).unwrap();
    f.executor.build(&job(&address, &spec, vec![dep.clone()])).unwrap();

    let out = unpacked(&f, &address);
    assert_eq!(fs::read_to_string(out.join("merged.txt")).unwrap(), "dep\n");
    assert_eq!(fs::read_to_string(out.join("scoped.txt")).unwrap(), "dep\n");
  }

  #[test]
  fn fetched_sources_are_read_only_in_the_root() {
    let f = fixture(true);
    let src = f.temp.path().join("input.txt");
    fs::write(&src, "source bytes").unwrap();
    let fetch = FetchSpec::new("input.txt", hash_bytes(b"source bytes").0).with_url(src.to_str().unwrap());
    let spec = PackageSpec::new("cat \"$fetch/input.txt\" > \"$out/copy\"; echo x >> \"$fetch/input.txt\" || echo denied > \"$out/write\"")
      .fetch(fetch);
    let address = package_address(&spec, [], []).unwrap();

    f.executor.build(&job(&address, &spec, vec![])).unwrap();

    let out = unpacked(&f, &address);
    assert_eq!(fs::read_to_string(out.join("copy")).unwrap(), "source bytes");
    if !rustix::process::geteuid().is_root() {
      assert!(out.join("write").exists());
    }
  }

  #[test]
  fn failing_script_publishes_nothing() {
    let f = fixture(true);
    let spec = PackageSpec::new("echo partial > \"$out/x\"; echo oops >&2; exit 3");
    let address = package_address(&spec, [], []).unwrap();

    let err = f.executor.build(&job(&address, &spec, vec![])).unwrap_err();

    assert_eq!(err.kind(), FailureKind::Build);
    assert!(!f.store.is_published(EntryKind::Package, address.as_str()));
    let log = f.store.layout().build_dir(EntryKind::Package, address.as_str()).join(LOG_FILE);
    assert!(fs::read_to_string(log).unwrap().contains("oops"));
  }

  #[test]
  fn empty_output_is_a_failure_but_empty_script_is_not() {
    let f = fixture(false);
    let silent = PackageSpec::new("true");
    let address = package_address(&silent, [], []).unwrap();
    assert!(matches!(
      f.executor.build(&job(&address, &silent, vec![])),
      Err(BuildError::EmptyOutput { .. })
    ));

    let meta = PackageSpec::new("").named("meta");
    let address = package_address(&meta, [], []).unwrap();
    f.executor.build(&job(&address, &meta, vec![])).unwrap();
    assert!(f.store.is_published(EntryKind::Package, address.as_str()));
  }

  #[test]
  fn untar_builtin_unpacks_sources() {
    let f = fixture(true);
    let tree = f.temp.path().join("tree");
    fs::create_dir_all(tree.join("pkg")).unwrap();
    fs::write(tree.join("pkg/file"), "inside").unwrap();
    let tarball = f.temp.path().join("src.tar.gz");
    archive::pack_dir(&tree, &tarball).unwrap();
    let sha = crate::util::hash::hash_file(&tarball).unwrap().0;

    let spec = PackageSpec::new(UNTAR_BUILTIN).fetch(FetchSpec::new("src.tar.gz", sha).with_url(tarball.to_str().unwrap()));
    let address = package_address(&spec, [], []).unwrap();
    f.executor.build(&job(&address, &spec, vec![])).unwrap();

    assert_eq!(fs::read_to_string(unpacked(&f, &address).join("pkg/file")).unwrap(), "inside");
  }

  #[test]
  fn untar_builtin_unpacks_zstd_sources() {
    let f = fixture(true);
    let tarball = f.temp.path().join("src.tar.zst");
    let encoder = zstd::stream::write::Encoder::new(fs::File::create(&tarball).unwrap(), 0).unwrap();
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(6);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "pkg/readme", &b"zstd!\n"[..]).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
    let sha = crate::util::hash::hash_file(&tarball).unwrap().0;

    let spec =
      PackageSpec::new(UNTAR_BUILTIN).fetch(FetchSpec::new("src.tar.zst", sha).with_url(tarball.to_str().unwrap()));
    let address = package_address(&spec, [], []).unwrap();
    f.executor.build(&job(&address, &spec, vec![])).unwrap();

    assert_eq!(fs::read_to_string(unpacked(&f, &address).join("pkg/readme")).unwrap(), "zstd!\n");
  }

  #[test]
  fn untar_without_sources_is_rejected() {
    let f = fixture(false);
    let spec = PackageSpec::new(UNTAR_BUILTIN);
    let address = package_address(&spec, [], []).unwrap();
    assert_eq!(
      f.executor.build(&job(&address, &spec, vec![])).unwrap_err().kind(),
      FailureKind::Input
    );
  }
}
