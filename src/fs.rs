//! Shared filesystem helpers for staging and installing artefacts.
//!
//! Everything that lands in the cache or the runtime tree goes through
//! [`rename_or_ignore`] so concurrent controllers — possibly in different
//! processes — converge on identical content without observing partial files.

use std::fs;
use std::io;
use std::path::Path;

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::observability::EXTRACT;

/// Moves `src` into place at `dst`, tolerating a concurrent winner.
///
/// On POSIX platforms `rename(2)` is atomic and replaces the destination. On
/// Windows the rename is performed with `MOVEFILE_REPLACE_EXISTING`
/// semantics; when it fails because another process holds the destination
/// open, the failure is swallowed on the assumption that the peer is
/// installing the same bytes. That assumption is load-bearing: callers must
/// only race on content derived from the same archive.
pub(crate) fn rename_or_ignore(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if is_concurrent_install(&err) => {
            warn!(
                target: EXTRACT,
                src = %src.display(),
                dst = %dst.display(),
                error = %err,
                "rename lost to a concurrent installer, keeping existing file"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Recognises the rename failures produced when another process won the race.
#[cfg(windows)]
fn is_concurrent_install(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION: the destination is open in another process.
    const SHARING_VIOLATION: i32 = 32;
    err.kind() == io::ErrorKind::AlreadyExists || err.raw_os_error() == Some(SHARING_VIOLATION)
}

#[cfg(not(windows))]
fn is_concurrent_install(err: &io::Error) -> bool {
    // POSIX rename replaces the destination, so EEXIST only surfaces when the
    // destination is a directory populated by a concurrent extraction.
    err.kind() == io::ErrorKind::AlreadyExists
}

/// Ensures the provided directory exists, creating intermediate directories
/// when required.
pub(crate) fn ensure_dir_exists(path: &Utf8Path) -> io::Result<()> {
    fs::create_dir_all(path.as_std_path())?;
    debug!(target: EXTRACT, path = %path, "ensured directory exists");
    Ok(())
}

/// Removes a directory tree, treating an already-absent tree as success.
pub(crate) fn remove_dir_tree(path: &Utf8Path) -> io::Result<()> {
    match fs::remove_dir_all(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
