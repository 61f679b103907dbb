//! Blocking facade over the asynchronous controller.
//!
//! Integration tests written without an async runtime get the same
//! lifecycle through a controller that owns a current-thread Tokio runtime
//! and blocks on each operation.

use tokio::runtime::{Builder, Runtime};
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::observability::SERVER;
use crate::server::EmbeddedPostgres;

/// Blocking wrapper around [`EmbeddedPostgres`].
///
/// Dropping a running instance stops the server on a best-effort basis;
/// call [`BlockingPostgres::stop`] explicitly to observe shutdown errors.
///
/// # Examples
/// ```no_run
/// use embedded_pg::{BlockingPostgres, Config};
///
/// # fn main() -> embedded_pg::Result<()> {
/// let mut server = BlockingPostgres::new(Config::default())?;
/// server.start()?;
/// // Connect via server.connection_url() and do some work.
/// server.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct BlockingPostgres {
    runtime: Runtime,
    server: EmbeddedPostgres,
}

impl BlockingPostgres {
    /// Creates a blocking controller with its own runtime.
    ///
    /// # Errors
    /// Fails when the Tokio runtime cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            runtime: build_runtime()?,
            server: EmbeddedPostgres::new(config),
        })
    }

    /// Blocking equivalent of [`EmbeddedPostgres::start`].
    ///
    /// # Errors
    /// Propagates every startup error of the asynchronous controller.
    pub fn start(&mut self) -> Result<()> {
        self.runtime.block_on(self.server.start())
    }

    /// Blocking equivalent of [`EmbeddedPostgres::stop`].
    ///
    /// # Errors
    /// Propagates every shutdown error of the asynchronous controller.
    pub fn stop(&mut self) -> Result<()> {
        self.runtime.block_on(self.server.stop())
    }

    /// Builds the connection URL for the configured database.
    #[must_use]
    pub fn connection_url(&self) -> String {
        self.server.connection_url()
    }
}

impl Drop for BlockingPostgres {
    fn drop(&mut self) {
        match self.runtime.block_on(self.server.stop()) {
            Ok(()) | Err(Error::NotStarted) => {}
            Err(err) => {
                warn!(
                    target: SERVER,
                    error = %err,
                    "failed to stop embedded postgres while dropping the controller"
                );
            }
        }
    }
}

fn build_runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| Error::RuntimeSetup(err.to_string()))
}
