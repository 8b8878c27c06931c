//! The closed error taxonomy shared by every component in this crate.
//!
//! Individual modules return `Result<T, SysrootError>` (or wrap it with
//! `anyhow::Context` at call sites that want path/ref annotations); the
//! CLI and daemon boundary convert into `anyhow::Error` /
//! human-readable messages.

use camino::Utf8PathBuf;

/// Error kinds. These are kinds, not one-to-one with call sites: many I/O
/// failures collapse into `Io`.
#[derive(thiserror::Error, Debug)]
pub enum SysrootError {
    /// A lookup (ref, deployment, boot directory) found nothing, and the
    /// caller did not ask for an empty-set fallback.
    #[error("not found: {0}")]
    NotFound(String),

    /// A checksum, deployment name, or boot directory name failed to parse.
    #[error("invalid: {0}")]
    Invalid(String),

    /// `Apply` was invoked while the state machine was not in
    /// `UPDATE_READY`.
    #[error("wrong state: {0}")]
    WrongState(String),

    /// A cancellation token fired mid-operation.
    #[error("cancelled")]
    Cancelled,

    /// An OS-level I/O error, annotated with the path it was operating on.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path the failing operation was scoped to.
        path: Utf8PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A repository ref-update transaction failed to commit.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// `prune` aborted partway through.
    #[error("prune aborted: {0}")]
    Prune(String),

    /// An invariant the engine depends on was violated. Callers that see
    /// this should treat it as fatal: the relevant in-memory or on-disk
    /// state is no longer trustworthy.
    #[error("invariant violated: {0}")]
    Assert(String),
}

impl SysrootError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SysrootError>;
