//! Error taxonomy for localization, upload, and configuration failures.
//!
//! Every failure aborts the unit of work that triggered it. Nothing in this
//! crate retries; transport retry belongs to the storage client.

use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalizeError {
    /// The referenced object does not exist in the store.
    #[error("object `{uri}` not found")]
    NotFound { uri: String },

    /// Network, authentication, or permission failure talking to the store.
    #[error("transport failure for `{uri}`: {source}")]
    Transport {
        uri: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Cache root or client setup is unusable; raised before any unit runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid remote reference `{uri}`: {reason}")]
    InvalidReference { uri: String, reason: String },

    #[error("[{unit}] {role} path expected instead of a bare bucket: {uri}")]
    BareBucket {
        unit: String,
        role: &'static str,
        uri: String,
    },

    #[error("[{unit}] Input path not exists: {uri}")]
    InputMissing { unit: String, uri: String },

    #[error("local I/O failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("[{unit}] unit of work failed with {status}")]
    UnitFailed { unit: String, status: String },
}

pub type LocalizeResult<T> = Result<T, LocalizeError>;

impl LocalizeError {
    /// Map a storage client error for `uri` onto the taxonomy.
    pub fn from_store(uri: impl Into<String>, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => LocalizeError::NotFound { uri: uri.into() },
            other => LocalizeError::Transport {
                uri: uri.into(),
                source: Box::new(other),
            },
        }
    }

    /// Any other failure while moving bytes to or from `uri`.
    pub fn transport(
        uri: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        LocalizeError::Transport {
            uri: uri.into(),
            source: source.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LocalizeError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LocalizeError::NotFound { .. })
    }
}
