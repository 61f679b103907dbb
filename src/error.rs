//! Domain error types for the embedded PostgreSQL lifecycle controller.
//!
//! The taxonomy is closed and the user-visible wording is stable: callers
//! (including this crate's own tests) match on the rendered messages, so new
//! failure modes get new variants rather than reworded existing ones.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Result alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the lifecycle controller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// `start` was called while the server was already running.
    #[error("server is already started")]
    AlreadyStarted,

    /// `stop` was called without a preceding successful `start`.
    #[error("server has not been started")]
    NotStarted,

    /// The configured TCP port is occupied by another process.
    #[error("process already listening on port {0}")]
    PortInUse(u16),

    /// The binary repository could not be reached at the transport level.
    #[error("unable to connect to {0}")]
    FetchConnect(String),

    /// The repository answered, but no artefact exists for the version.
    #[error("no version found matching {0}")]
    FetchVersion(String),

    /// The `.sha256` sidecar disagrees with the downloaded archive.
    #[error("downloaded checksums do not match")]
    FetchChecksum,

    /// The downloaded Jar contains no `.txz` member.
    #[error("error fetching postgres: cannot find binary in archive retrieved from {0}")]
    FetchNoBinary(String),

    /// Any other failure while fetching the binary archive.
    #[error("error fetching postgres: {0}")]
    FetchGeneric(String),

    /// Any failure while unpacking the cached archive.
    #[error("unable to extract postgres archive: {0}")]
    ExtractGeneric(String),

    /// A runtime or data directory could not be put in place.
    #[error("unable to prepare {path}: {cause}")]
    PathPreparation {
        /// Directory that could not be created or cleared.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        cause: String,
    },

    /// `initdb` exited non-zero or could not be spawned.
    #[error("unable to init database using '{command}': {output}")]
    InitFailed {
        /// The full command line that was executed.
        command: String,
        /// Tail of the captured initdb output.
        output: String,
    },

    /// `CREATE DATABASE` failed for a non-default database name.
    #[error(
        "unable to connect to create database with custom name {database} \
         with the following error: {cause}"
    )]
    CreateFailed {
        /// The database name that could not be created.
        database: String,
        /// Error reported by the probe connection.
        cause: String,
    },

    /// The `postgres` executable could not be spawned.
    #[error("could not start postgres using {0}")]
    StartFailed(String),

    /// The postmaster exited while the controller was waiting for readiness.
    #[error("postgres exited with {status}: {log_tail}")]
    Exited {
        /// Rendered exit status of the child process.
        status: String,
        /// Tail of the server log at the time of death.
        log_tail: String,
    },

    /// `pg_ctl status` reported a postmaster that is not our child.
    #[error("pg_ctl reported server running as PID {actual}, expected PID {expected}")]
    WrongProcess {
        /// PID of the child this controller spawned.
        expected: u32,
        /// PID reported by `pg_ctl status`.
        actual: u32,
    },

    /// Neither readiness nor the health probe succeeded in time.
    #[error("timed out waiting for database to become available")]
    Timeout,

    /// The log pump failed to buffer or forward server output.
    #[error("unable to process postgres logs: {0}")]
    LogFailed(String),

    /// The blocking facade could not build its Tokio runtime.
    #[error("unable to create runtime for embedded postgres: {0}")]
    RuntimeSetup(String),
}
