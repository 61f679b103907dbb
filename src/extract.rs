//! Unpacks the cached tar+xz archive into the runtime directory.
//!
//! Extraction follows the same stage-then-rename discipline as the fetcher:
//! each entry is materialised in a staging directory created inside the
//! destination (so the final rename never crosses filesystems) and then
//! atomically renamed into place. Concurrent extractions of the same
//! archive therefore converge on identical content instead of corrupting
//! each other.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Component, Path};

use camino::Utf8Path;
use tar::EntryType;
use tracing::debug;
use xz2::read::XzDecoder;

use crate::error::{Error, Result};
use crate::fs::rename_or_ignore;
use crate::observability::EXTRACT;

/// Streams `archive` (tar+xz) into `destination`.
///
/// Regular files keep their archive modes, symlinks are recreated, and
/// directories are created with the header mode. Entries that would escape
/// the destination are rejected. Other entry types are ignored.
pub(crate) fn extract_archive(archive: &Utf8Path, destination: &Utf8Path) -> Result<()> {
    fs::create_dir_all(destination.as_std_path()).map_err(extract_error)?;

    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(destination.as_std_path())
        .map_err(extract_error)?;

    let file = File::open(archive.as_std_path()).map_err(extract_error)?;
    let decoder = XzDecoder::new(BufReader::new(file));
    let mut tarball = tar::Archive::new(decoder);

    for entry in tarball.entries().map_err(extract_error)? {
        let mut entry = entry.map_err(extract_error)?;
        let relative = entry.path().map_err(extract_error)?.into_owned();
        reject_traversal(&relative)?;

        let final_path = destination.as_std_path().join(&relative);
        let staged_path = staging.path().join(&relative);
        ensure_parents(&staged_path)?;
        ensure_parents(&final_path)?;

        match entry.header().entry_type() {
            EntryType::Regular => {
                let mode = entry.header().mode().map_err(extract_error)?;
                write_staged_file(&mut entry, &staged_path, mode)?;
                rename_or_ignore(&staged_path, &final_path).map_err(extract_error)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(extract_error)?
                    .ok_or_else(|| extract_error(io::Error::other("symlink without target")))?
                    .into_owned();
                write_staged_symlink(&target, &staged_path)?;
                rename_or_ignore(&staged_path, &final_path).map_err(extract_error)?;
            }
            EntryType::Directory => {
                let mode = entry.header().mode().map_err(extract_error)?;
                create_directory(&final_path, mode)?;
            }
            other => {
                debug!(
                    target: EXTRACT,
                    entry = %relative.display(),
                    kind = ?other,
                    "ignoring unsupported archive entry"
                );
            }
        }
    }

    debug!(target: EXTRACT, archive = %archive, destination = %destination, "archive extracted");
    Ok(())
}

/// Refuses entries that would climb out of the destination tree.
fn reject_traversal(relative: &Path) -> Result<()> {
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|component| matches!(component, Component::ParentDir));
    if escapes {
        return Err(Error::ExtractGeneric(format!(
            "archive entry {} escapes the destination directory",
            relative.display()
        )));
    }
    Ok(())
}

fn ensure_parents(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(extract_error)?;
        // An inherited umask could leave a non-traversable parent; the
        // runtime tree needs 0755 regardless.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o755))
                .map_err(extract_error)?;
        }
    }
    Ok(())
}

fn write_staged_file(entry: &mut impl io::Read, staged: &Path, mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut out = options.open(staged).map_err(extract_error)?;
    io::copy(entry, &mut out).map_err(extract_error)?;
    Ok(())
}

#[cfg(unix)]
fn write_staged_symlink(target: &Path, staged: &Path) -> Result<()> {
    match fs::remove_file(staged) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(extract_error(err)),
    }
    std::os::unix::fs::symlink(target, staged).map_err(extract_error)
}

#[cfg(not(unix))]
fn write_staged_symlink(_target: &Path, _staged: &Path) -> Result<()> {
    // The Windows archives ship without symlinks; creating one would need
    // elevated privileges, so any stray entry is skipped at the rename step.
    Ok(())
}

fn create_directory(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).map_err(extract_error)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(extract_error)?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

fn extract_error(err: impl std::fmt::Display) -> Error {
    Error::ExtractGeneric(err.to_string())
}
