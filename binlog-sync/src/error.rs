//! Errors surfaced by the synchronisation core.
use std::path::PathBuf;

use thiserror::Error;

/// Error type returned by the public operations of this crate.
///
/// Only [`SyncError::Interrupted`] crosses component boundaries as a hard
/// stop. Handler failures of any other kind are logged where they happen
/// and never show up here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// A handler asked for the whole pipeline to halt.
    #[error("handler `{handler}` interrupted the binlog stream: {source:#}")]
    Interrupted {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    /// The initial log position could not be fetched or parsed.
    #[error("log position unavailable: {0}")]
    DataUnavailable(String),

    /// Writing the log position to durable storage failed.
    #[error("failed to persist log position {name}:{position}: {source:#}")]
    PersistFailure {
        name: String,
        position: u32,
        /// Set when the saver writes to a file.
        path: Option<PathBuf>,
        #[source]
        source: anyhow::Error,
    },

    /// The log-reading collaborator failed.
    #[error("upstream binlog error: {0:#}")]
    Upstream(#[source] anyhow::Error),

    /// A decoded event violates the rows event contract.
    #[error("malformed rows event: {0}")]
    MalformedEvent(String),

    /// The canal was asked to start while it is not stopped.
    #[error("canal is already running")]
    AlreadyRunning,

    /// A required builder field was not provided.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// The configuration could not be applied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SyncError::Interrupted { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
