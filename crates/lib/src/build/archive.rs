//! Deterministic tar.gz archives of build outputs.
//!
//! Entries are written in file-name order with normalized metadata (fixed
//! timestamp, uid/gid 0, 0644/0755 permissions) and the gzip header carries no
//! timestamp or file name, so the same tree always yields the same bytes.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path};

use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;
use tar::{Archive, Builder, EntryType, HeaderMode};
use walkdir::WalkDir;

/// Pack the contents of `src` (not `src` itself) into `dest`.
pub fn pack_dir(src: &Path, dest: &Path) -> io::Result<()> {
  let file = File::create(dest)?;
  let encoder = GzBuilder::new()
    .mtime(0)
    .write(BufWriter::new(file), Compression::default());

  let mut builder = Builder::new(encoder);
  builder.mode(HeaderMode::Deterministic);
  builder.follow_symlinks(false);

  for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    if entry.file_type().is_dir() {
      builder.append_dir(rel, entry.path())?;
    } else {
      builder.append_path_with_name(entry.path(), rel)?;
    }
  }

  let encoder = builder.into_inner()?;
  let mut writer = encoder.finish()?;
  writer.flush()?;
  let file = writer.into_inner().map_err(|e| e.into_error())?;
  file.sync_all()
}

/// Unpack a package artifact into `dest`, replacing conflicting paths.
///
/// Used both for per-package directories and for merging several
/// artifacts into one root, where later artifacts win.
pub fn unpack_into(archive: &Path, dest: &Path) -> io::Result<()> {
  let file = File::open(archive)?;
  unpack_reader(GzDecoder::new(BufReader::new(file)), dest)
}

/// Unpack a fetched source archive, chosen by file extension.
///
/// Supports `.tar`, `.tar.gz`, `.tgz`, `.tar.zst` and `.tzst`.
pub fn unpack_source(archive: &Path, dest: &Path) -> io::Result<()> {
  let name = archive.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
  let file = BufReader::new(File::open(archive)?);
  if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
    unpack_reader(GzDecoder::new(file), dest)
  } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
    unpack_reader(zstd::stream::read::Decoder::with_buffer(file)?, dest)
  } else if name.ends_with(".tar") {
    unpack_reader(file, dest)
  } else {
    Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("unsupported archive format for {}", archive.display()),
    ))
  }
}

fn unpack_reader<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
  fs::create_dir_all(dest)?;
  let mut archive = Archive::new(reader);
  archive.set_preserve_permissions(true);
  archive.set_overwrite(true);

  for entry in archive.entries()? {
    let mut entry = entry?;
    let rel = entry.path()?.into_owned();
    prepare_target(dest, &rel, entry.header().entry_type())?;
    entry.unpack_in(dest)?;
  }
  Ok(())
}

// A file may replace a directory from an earlier artifact and vice versa.
fn prepare_target(dest: &Path, rel: &Path, entry_type: EntryType) -> io::Result<()> {
  if rel.components().next().is_none() || rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
    return Ok(());
  }

  let target = dest.join(rel);
  let metadata = match fs::symlink_metadata(&target) {
    Ok(m) => m,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e),
  };

  let is_dir = metadata.file_type().is_dir();
  match (entry_type.is_dir(), is_dir) {
    (true, true) => Ok(()),
    (true, false) | (false, false) => fs::remove_file(&target),
    (false, true) => fs::remove_dir_all(&target),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::unix::fs::PermissionsExt;
  use tempfile::TempDir;

  fn sample_tree(root: &Path) {
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::write(root.join("bin/tool"), "#!/bin/sh\necho hi\n").unwrap();
    fs::set_permissions(root.join("bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(root.join("README"), "docs").unwrap();
    std::os::unix::fs::symlink("bin/tool", root.join("tool")).unwrap();
  }

  #[test]
  fn packing_is_byte_stable() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    sample_tree(&tree);

    pack_dir(&tree, &temp.path().join("a.tar.gz")).unwrap();
    filetime::set_file_mtime(tree.join("README"), filetime::FileTime::from_unix_time(42, 0)).unwrap();
    pack_dir(&tree, &temp.path().join("b.tar.gz")).unwrap();

    assert_eq!(
      fs::read(temp.path().join("a.tar.gz")).unwrap(),
      fs::read(temp.path().join("b.tar.gz")).unwrap()
    );
  }

  #[test]
  fn unpack_restores_tree() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    sample_tree(&tree);
    let archive = temp.path().join("out.tar.gz");
    pack_dir(&tree, &archive).unwrap();

    let dest = temp.path().join("dest");
    unpack_into(&archive, &dest).unwrap();

    assert_eq!(fs::read_to_string(dest.join("README")).unwrap(), "docs");
    let mode = fs::metadata(dest.join("bin/tool")).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0);
    assert_eq!(fs::read_link(dest.join("tool")).unwrap(), Path::new("bin/tool"));
  }

  #[test]
  fn later_artifact_replaces_conflicting_paths() {
    let temp = TempDir::new().unwrap();
    let first = temp.path().join("first");
    fs::create_dir_all(first.join("share")).unwrap();
    fs::write(first.join("share/x"), "dir version").unwrap();
    let second = temp.path().join("second");
    fs::create_dir_all(&second).unwrap();
    fs::write(second.join("share"), "file version").unwrap();

    pack_dir(&first, &temp.path().join("1.tar.gz")).unwrap();
    pack_dir(&second, &temp.path().join("2.tar.gz")).unwrap();

    let dest = temp.path().join("dest");
    unpack_into(&temp.path().join("1.tar.gz"), &dest).unwrap();
    unpack_into(&temp.path().join("2.tar.gz"), &dest).unwrap();

    assert_eq!(fs::read_to_string(dest.join("share")).unwrap(), "file version");
  }

  #[test]
  fn source_archives_by_extension() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    sample_tree(&tree);
    let tgz = temp.path().join("src.tgz");
    pack_dir(&tree, &tgz).unwrap();

    let dest = temp.path().join("dest");
    unpack_source(&tgz, &dest).unwrap();
    assert!(dest.join("bin/tool").exists());

    let zst = temp.path().join("src.tar.zst");
    let mut builder = Builder::new(zstd::stream::write::Encoder::new(File::create(&zst).unwrap(), 3).unwrap());
    builder.append_dir_all("zst", &tree).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
    unpack_source(&zst, &dest).unwrap();
    assert_eq!(fs::read_to_string(dest.join("zst/README")).unwrap(), "docs");

    let zip = temp.path().join("src.zip");
    fs::write(&zip, "PK").unwrap();
    assert_eq!(
      unpack_source(&zip, &dest).unwrap_err().kind(),
      io::ErrorKind::InvalidInput
    );
  }
}
