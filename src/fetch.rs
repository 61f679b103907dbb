//! Downloads versioned binary archives into the shared cache.
//!
//! The binary repository publishes a Jar (outer Zip) per triple containing a
//! single tar+xz member. The fetcher downloads the Jar, verifies the
//! optional `.sha256` sidecar, and installs the inner archive into the
//! cache through a same-directory temp file and an atomic rename, so a
//! concurrent fetch of the same triple can never expose a partial file.

use std::io::{self, Cursor};

use async_trait::async_trait;
use camino::Utf8Path;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::parent_dir;
use crate::error::{Error, Result};
use crate::fs::rename_or_ignore;
use crate::observability::FETCH;
use crate::platform::PlatformTriple;

/// Capability that makes a triple's archive available at a cache path.
///
/// Held as a trait object by the controller so tests can substitute stubs
/// without touching the network.
#[async_trait]
pub(crate) trait RemoteFetch: Send + Sync {
    /// Downloads the archive for `triple` and installs it at `cache_path`.
    async fn fetch(&self, triple: &PlatformTriple, cache_path: &Utf8Path) -> Result<()>;
}

/// Fetches archives over HTTPS from a Maven-style repository root.
#[derive(Debug)]
pub(crate) struct HttpFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub(crate) fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// URL of the outer Jar for a triple, following the zonky coordinates.
    fn jar_url(&self, triple: &PlatformTriple) -> String {
        format!(
            "{base}/io/zonky/test/postgres/embedded-postgres-binaries-{os}-{arch}/{version}\
             /embedded-postgres-binaries-{os}-{arch}-{version}.jar",
            base = self.base_url,
            os = triple.os,
            arch = triple.arch,
            version = triple.version,
        )
    }

    /// Verifies the Jar against its `.sha256` sidecar when one is published.
    ///
    /// Legacy artefacts lack the sidecar, so an absent or unreadable
    /// checksum is tolerated; only an explicit mismatch is fatal.
    async fn verify_checksum(&self, jar_url: &str, body: &[u8]) -> Result<()> {
        let sha_url = format!("{jar_url}.sha256");
        let Ok(response) = self.client.get(&sha_url).send().await else {
            return Ok(());
        };
        if response.status() != reqwest::StatusCode::OK {
            return Ok(());
        }
        let Ok(expected) = response.bytes().await else {
            return Ok(());
        };

        let digest = format!("{:x}", Sha256::digest(body));
        let expected = String::from_utf8_lossy(&expected);
        if expected.trim() != digest {
            return Err(Error::FetchChecksum);
        }

        debug!(target: FETCH, url = %sha_url, "checksum verified");
        Ok(())
    }
}

#[async_trait]
impl RemoteFetch for HttpFetcher {
    async fn fetch(&self, triple: &PlatformTriple, cache_path: &Utf8Path) -> Result<()> {
        let url = self.jar_url(triple);
        info!(target: FETCH, url = %url, triple = %triple, "fetching postgres binaries");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|_| Error::FetchConnect(self.base_url.clone()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::FetchVersion(triple.version.clone()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| Error::FetchGeneric(err.to_string()))?;

        self.verify_checksum(&url, &body).await?;
        install_inner_archive(&body, &url, cache_path)
    }
}

/// Extracts the first `.txz` member of the Jar and installs it at
/// `cache_path` through a temp file in the same directory.
///
/// The temp file is removed automatically when any step fails before the
/// final rename.
fn install_inner_archive(jar: &[u8], url: &str, cache_path: &Utf8Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(jar))
        .map_err(|err| Error::FetchGeneric(err.to_string()))?;

    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|err| Error::FetchGeneric(err.to_string()))?;
        if member.is_dir() || !member.name().ends_with(".txz") {
            continue;
        }

        let cache_dir = parent_dir(cache_path);
        std::fs::create_dir_all(cache_dir.as_std_path())
            .map_err(|err| Error::ExtractGeneric(err.to_string()))?;

        let mut staged = tempfile::NamedTempFile::new_in(cache_dir.as_std_path())
            .map_err(|err| Error::ExtractGeneric(err.to_string()))?;
        io::copy(&mut member, staged.as_file_mut())
            .map_err(|err| Error::ExtractGeneric(err.to_string()))?;

        rename_or_ignore(staged.path(), cache_path.as_std_path())
            .map_err(|err| Error::ExtractGeneric(err.to_string()))?;

        info!(target: FETCH, cache = %cache_path, "archive installed into cache");
        return Ok(());
    }

    Err(Error::FetchNoBinary(url.to_owned()))
}
