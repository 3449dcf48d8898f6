use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Which part of a store entry a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Entry,
    Sidecar,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Entry => write!(f, "entry"),
            Missing::Sidecar => write!(f, "validation info"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RepoError {
    #[error("invalid accession identifier: {0}")]
    InvalidIdentifier(String),

    #[error("{missing} not found for {id}")]
    NotFound { id: String, missing: Missing },

    #[error("timed out waiting for lock on {0}")]
    Timeout(String),

    #[error("{0} is not a sra-repo storage root")]
    #[diagnostic(help("run `sra-repo init --rootfs <dir>` to create one"))]
    NotARepository(PathBuf),

    #[error("accession {id} not available from {source_label}: {message}")]
    RemoteNotFound {
        id: String,
        source_label: String,
        message: String,
    },

    #[error("{source_label} returned status {status} for {id}: {message}")]
    RemoteError {
        id: String,
        source_label: String,
        status: u16,
        message: String,
    },

    #[error("{source_label} request failed: {message}")]
    RemoteHttp {
        source_label: String,
        message: String,
    },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("fatal storage error: {0}")]
    FatalStorage(String),

    #[error("validation mismatch: {0}")]
    ValidationMismatch(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("external tool failed: {0}")]
    Tool(String),
}

impl RepoError {
    pub fn not_found(id: impl Into<String>, missing: Missing) -> Self {
        RepoError::NotFound {
            id: id.into(),
            missing,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RepoError::FatalStorage(_))
    }
}
