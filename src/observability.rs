//! Shared tracing configuration for observability instrumentation.
//!
//! Centralises the log targets used by the crate so subscribers can filter
//! individual pipeline stages without pulling in unrelated application logs.

/// Target used by lifecycle orchestration logs.
pub(crate) const SERVER: &str = "embedded_pg::server";

/// Target used by binary fetch operations.
pub(crate) const FETCH: &str = "embedded_pg::fetch";

/// Target used by archive extraction.
pub(crate) const EXTRACT: &str = "embedded_pg::extract";

/// Target used by cluster initialisation and database creation.
pub(crate) const PREPARE: &str = "embedded_pg::prepare";

/// Target used by the postmaster supervisor.
pub(crate) const PROCESS: &str = "embedded_pg::process";
