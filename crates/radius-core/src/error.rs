//! Crate-wide error type.
//!
//! Every fallible core operation except dispatch (which returns an [`crate::types::Rcode`],
//! never an exception — see §7 of the design) surfaces one variant of [`CoreError`].
//! Setup-time variants (`Config`, `Load`, `Instantiate` outside HUP) are meant to be
//! returned from `bootstrap`/`init` and fail the process; live-request errors never
//! reach here except via [`CoreError::WorkerFailure`], which only ever cancels the one
//! worker that hit it.

use std::path::PathBuf;

use thiserror::Error;

/// Which ABI sub-field mismatched on module load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiMismatchKind {
    Prefix,
    Version,
    Commit,
}

impl std::fmt::Display for AbiMismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbiMismatchKind::Prefix => "prefix",
            AbiMismatchKind::Version => "version",
            AbiMismatchKind::Commit => "commit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("duplicate instance name {name:?} (previously defined at {first_location})")]
    DuplicateInstance { name: String, first_location: String },

    #[error("instance name {name:?} collides with a reserved word")]
    ReservedName { name: String },

    #[error("cycle detected resolving sibling section {section:?}")]
    SiblingCycle { section: String },

    #[error("module library not found: {name}")]
    LibraryNotFound { name: String },

    #[error("symbol {symbol:?} not found in library {library:?}")]
    SymbolNotFound { library: String, symbol: String },

    #[error("ABI {kind} mismatch loading {name:?}: host={host:#x} module={module:#x}")]
    AbiMismatch {
        name: String,
        kind: AbiMismatchKind,
        host: u64,
        module: u64,
    },

    #[error("failed to load dynamic library {path:?}: {source}")]
    DlOpen {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("bootstrap failed for instance {name:?}: {message}")]
    BootstrapFailed { name: String, message: String },

    #[error("instantiate failed for instance {name:?}: {message}")]
    InstantiateFailed { name: String, message: String },

    #[error("worker {worker_id} failed: {message}")]
    WorkerFailure { worker_id: u64, message: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
