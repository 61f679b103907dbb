//! Locates the user-wide archive cache for downloaded binaries.
//!
//! Archives are cached per `(os, arch, version)` triple so multiple
//! controllers — and multiple processes — share one download. The cache
//! directory lives in the user's home directory unless the configuration
//! pins an explicit archive path.

use camino::{Utf8Path, Utf8PathBuf};

use crate::platform::PlatformTriple;

/// Directory under the user's home that holds cached archives.
const CACHE_DIR_NAME: &str = ".embedded-postgres-go";

/// Resolves where a triple's archive is cached and whether it is present.
pub(crate) trait CacheSource: Send + Sync {
    /// Returns the cache path for `triple` and whether a complete archive
    /// already exists there. Existence requires a regular file; a directory
    /// at the path counts as absent.
    fn locate(&self, triple: &PlatformTriple) -> (Utf8PathBuf, bool);
}

/// The default cache rooted in the user's home directory.
#[derive(Debug, Default)]
pub(crate) struct DiskCache {
    /// Explicit archive location overriding the home-directory layout.
    override_path: Option<Utf8PathBuf>,
}

impl DiskCache {
    pub(crate) fn new(override_path: Option<Utf8PathBuf>) -> Self {
        Self { override_path }
    }
}

impl CacheSource for DiskCache {
    fn locate(&self, triple: &PlatformTriple) -> (Utf8PathBuf, bool) {
        let path = self
            .override_path
            .clone()
            .unwrap_or_else(|| cache_dir().join(triple.archive_name()));
        let exists = path
            .as_std_path()
            .metadata()
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        (path, exists)
    }
}

/// The cache directory, falling back to a relative directory when no home
/// directory resolves (mirrors running in a stripped-down container).
fn cache_dir() -> Utf8PathBuf {
    home_dir().map_or_else(
        || Utf8PathBuf::from(CACHE_DIR_NAME),
        |home| home.join(CACHE_DIR_NAME),
    )
}

/// Best-effort home directory lookup from the platform's conventional
/// environment variable.
fn home_dir() -> Option<Utf8PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .map(Utf8PathBuf::from)
}

/// Parent directory of an archive path; staging files are created here so
/// the final rename never crosses a filesystem boundary.
pub(crate) fn parent_dir(path: &Utf8Path) -> Utf8PathBuf {
    path.parent()
        .map_or_else(Utf8PathBuf::new, Utf8Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform;
    use std::fs;
    use tempfile::tempdir;

    fn triple() -> PlatformTriple {
        platform::resolve("linux", "amd64", "15.8.0", "x86_64", false)
    }

    #[test]
    fn locate_names_the_archive_after_the_triple() {
        let (path, _) = DiskCache::default().locate(&triple());
        assert!(
            path.as_str()
                .ends_with("embedded-postgres-binaries-linux-amd64-15.8.0.txz"),
            "unexpected cache path: {path}"
        );
        assert!(path.as_str().contains(CACHE_DIR_NAME));
    }

    #[test]
    fn locate_reports_existing_regular_files() {
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("archive.txz");
        fs::write(&archive, b"bytes").expect("write archive");
        let override_path =
            Utf8PathBuf::from_path_buf(archive).expect("utf8 archive path");

        let cache = DiskCache::new(Some(override_path.clone()));
        let (path, exists) = cache.locate(&triple());

        assert_eq!(path, override_path);
        assert!(exists);
    }

    #[test]
    fn locate_treats_directories_as_absent() {
        let temp = tempdir().expect("tempdir");
        let dir_path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("utf8 tempdir path");

        let cache = DiskCache::new(Some(dir_path));
        let (_, exists) = cache.locate(&triple());

        assert!(!exists, "a directory at the cache path is not an archive");
    }

    #[test]
    fn locate_treats_missing_files_as_absent() {
        let temp = tempdir().expect("tempdir");
        let missing = Utf8PathBuf::from_path_buf(temp.path().join("missing.txz"))
            .expect("utf8 path");

        let cache = DiskCache::new(Some(missing));
        let (_, exists) = cache.locate(&triple());

        assert!(!exists);
    }
}
