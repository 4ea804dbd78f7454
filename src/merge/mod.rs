//! Tree merger: grafts vendor library trees onto a CUDA installation.
//!
//! `merge_directory` is the primitive (overlay copy, last writer wins, never
//! deletes). `install_library` locates the payload inside the vendor
//! installer's `<cuda>/<library>/<version>` layout and merges each top-level
//! entry under its mapped name. `policy` holds the per-platform name maps.

mod library;
mod policy;

pub use library::{install_library, single_child, ChildLookup, InstallOutcome, LibraryInstallSpec};
pub use policy::{install_all, library_names, name_map};

use anyhow::{Context, Result};
use std::fs::{self, File, FileTimes};
use std::io;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Merge every file under `src_dir` into `dst_dir`.
///
/// Relative paths are preserved, destination directories are created only if
/// absent, and existing destination files are overwritten. Nothing at the
/// destination is ever removed, so repeated merges converge. Symlinks are
/// recreated as symlinks.
pub fn merge_directory(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    merge_tree(src_dir, dst_dir, false)
}

/// Like [`merge_directory`], but copies what symlinks point at.
///
/// Used to stage trees that are mounted elsewhere (e.g. at `/work` in a
/// container), where links out of the tree would dangle.
pub fn copy_tree(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    merge_tree(src_dir, dst_dir, true)
}

fn merge_tree(src_dir: &Path, dst_dir: &Path, follow_links: bool) -> Result<()> {
    for entry in WalkDir::new(src_dir)
        .follow_links(follow_links)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("walking '{}'", src_dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let dest = dst_dir.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !dest.is_dir() {
                debug!("creating directory: {}", dest.display());
                fs::create_dir_all(&dest)
                    .with_context(|| format!("creating directory '{}'", dest.display()))?;
            }
        } else if file_type.is_symlink() {
            debug!("linking: {} <- {}", dest.display(), entry.path().display());
            copy_symlink(entry.path(), &dest)?;
        } else {
            debug!("copying: {} <- {}", dest.display(), entry.path().display());
            copy_file(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Copy one regular file, keeping its permissions and timestamps.
///
/// A symlink or read-only file already sitting at `dst` is replaced rather
/// than written through.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    let meta =
        fs::metadata(src).with_context(|| format!("reading metadata of '{}'", src.display()))?;
    if let Ok(existing) = fs::symlink_metadata(dst) {
        if existing.file_type().is_symlink() || existing.permissions().readonly() {
            fs::remove_file(dst).with_context(|| format!("replacing '{}'", dst.display()))?;
        }
    }

    let mut reader = File::open(src).with_context(|| format!("opening '{}'", src.display()))?;
    let mut writer = File::create(dst).with_context(|| format!("creating '{}'", dst.display()))?;
    io::copy(&mut reader, &mut writer)
        .with_context(|| format!("copying '{}' to '{}'", src.display(), dst.display()))?;

    let mut times = FileTimes::new();
    if let Ok(modified) = meta.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = meta.accessed() {
        times = times.set_accessed(accessed);
    }
    writer
        .set_times(times)
        .with_context(|| format!("setting timestamps on '{}'", dst.display()))?;
    drop(writer);

    fs::set_permissions(dst, meta.permissions())
        .with_context(|| format!("setting permissions on '{}'", dst.display()))?;
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).with_context(|| format!("reading link '{}'", src.display()))?;
    if dst.is_dir() && !dst.is_symlink() {
        debug!("skipping link {}: destination is a directory", src.display());
        return Ok(());
    }
    if dst.is_symlink() || dst.is_file() {
        fs::remove_file(dst).with_context(|| format!("replacing '{}'", dst.display()))?;
    }
    std::os::unix::fs::symlink(&target, dst)
        .with_context(|| format!("creating symlink '{}'", dst.display()))?;
    Ok(())
}

// Symlinks are rare in Windows vendor archives; copy what they point at.
#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        return merge_directory(src, dst);
    }
    copy_file(src, dst)
}
