//! Crate error types.

use bard_eid::EidError;
use bard_fname::FnameError;

/// Errors surfaced by the daemon, the storage controllers and the stores.
#[derive(Debug, thiserror::Error)]
pub enum BardError {
    #[error("eid error: {0}")]
    Eid(#[from] EidError),

    #[error("name codec error: {0}")]
    Fname(#[from] FnameError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("record codec error: {0}")]
    Codec(#[from] binrw::Error),

    #[error("durable store: key exists: {0}")]
    StoreKeyExists(String),

    #[error("durable store: key not found: {0}")]
    StoreKeyNotFound(String),

    #[error("storage path is not a mount point: {0}")]
    NotAMountPoint(String),

    #[error("restage link is shut down")]
    LinkShutdown,

    #[error("bundle sink rejected the bundle: {0}")]
    SinkRejected(String),

    #[error("{0}")]
    Other(String),
}

impl BardError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        BardError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BardError>;
