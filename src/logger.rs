//! File-backed buffering of the server's stdout and stderr.
//!
//! PostgreSQL child processes write into a temporary file; [`LogBuffer`]
//! remembers how far it has forwarded that file to the caller's sink and
//! copies only the tail on each flush. Flushing happens at well-defined
//! points (after spawn, between readiness polls, before `start`/`stop`
//! return) rather than from a background task, so ordering follows the
//! orchestrator's state machine.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::process::Stdio;

use tempfile::NamedTempFile;

use crate::config::LoggerSink;
use crate::error::{Error, Result};

/// Upper bound on log excerpts embedded in error messages.
const TAIL_CHAR_LIMIT: usize = 2_048;

/// Buffered log sink shared by every child process of one controller.
pub(crate) struct LogBuffer {
    file: NamedTempFile,
    offset: u64,
    sink: Option<LoggerSink>,
}

impl LogBuffer {
    /// Creates the backing file for a new server instance.
    pub(crate) fn new(sink: Option<LoggerSink>) -> Result<Self> {
        let file = NamedTempFile::new().map_err(|err| Error::LogFailed(err.to_string()))?;
        Ok(Self {
            file,
            offset: 0,
            sink,
        })
    }

    /// Opens an append-mode handle suitable for a child's stdout or stderr.
    ///
    /// Append mode keeps sequential children (initdb, then postgres) from
    /// clobbering each other's output.
    pub(crate) fn stdio(&self) -> Result<Stdio> {
        let file = OpenOptions::new()
            .append(true)
            .open(self.file.path())
            .map_err(|err| Error::LogFailed(err.to_string()))?;
        Ok(Stdio::from(file))
    }

    /// Forwards everything written since the previous flush to the sink.
    ///
    /// Without a configured sink this is a no-op. The offset never
    /// decreases, and calling this after the child has exited is safe.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };

        let mut file = self.open_for_read()?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|err| Error::LogFailed(err.to_string()))?;

        let mut pending = Vec::new();
        file.read_to_end(&mut pending)
            .map_err(|err| Error::LogFailed(err.to_string()))?;

        if !pending.is_empty() {
            sink.write_all(&pending)
                .map_err(|err| Error::LogFailed(err.to_string()))?;
            self.offset += pending.len() as u64;
        }

        Ok(())
    }

    /// Returns the tail of the log for embedding in error messages.
    ///
    /// Best effort: an unreadable log yields an empty excerpt rather than
    /// masking the error being decorated.
    pub(crate) fn read_tail(&self) -> String {
        let Ok(mut file) = self.open_for_read() else {
            return String::new();
        };
        let mut contents = String::new();
        if file.read_to_string(&mut contents).is_err() {
            return String::new();
        }

        let total = contents.chars().count();
        if total <= TAIL_CHAR_LIMIT {
            return contents.trim_end().to_owned();
        }
        let skipped = total - TAIL_CHAR_LIMIT;
        contents
            .chars()
            .skip(skipped)
            .collect::<String>()
            .trim_end()
            .to_owned()
    }

    fn open_for_read(&self) -> Result<File> {
        File::open(self.file.path()).map_err(|err| Error::LogFailed(err.to_string()))
    }
}
