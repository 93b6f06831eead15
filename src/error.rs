//! Error types for the build pipeline.
//!
//! Every fatal condition maps to one [`BuildError`] variant so the caller
//! (normally the CLI) can turn it into an exit code and a message without
//! string matching. All variants halt the pipeline; nothing here is
//! retried except the single diagnostic playbook rerun, which is driven by
//! the customization stage itself.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// All fatal errors the pipeline can produce.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Required descriptor fields missing or malformed. Raised before any
    /// external process is launched.
    #[error("invalid build configuration: {0}")]
    Configuration(String),

    /// An external tool could not be started at all.
    #[error("failed to launch {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    /// An external tool ran and exited unsuccessfully.
    #[error("{tool} failed with {status}")]
    ToolFailed { tool: String, status: ExitStatus },

    /// One or more playbook tasks failed. Raised after the diagnostic rerun.
    #[error("playbook reported {failed} failed task(s)")]
    PlaybookFailed { failed: u64 },

    /// The playbook run produced output we could not obtain recap counts
    /// from, so the run cannot be trusted.
    #[error("unusable playbook report: {0}")]
    Report(String),

    /// Reading, writing or extracting a cache archive failed. Fatal: a
    /// half-written entry must never be mistaken for a valid hit later.
    #[error("cache {op} failed for '{path}': {source}")]
    CacheIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Ordinary filesystem failure outside the cache, with call-site context.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// Attach call-site context to `io::Result` values.
pub(crate) trait IoContext<T> {
    fn io_context<F: FnOnce() -> String>(self, context: F) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F: FnOnce() -> String>(self, context: F) -> Result<T> {
        self.map_err(|source| BuildError::Io {
            context: context(),
            source,
        })
    }
}
