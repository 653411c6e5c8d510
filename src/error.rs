use std::error::Error as StdError;

use thiserror::Error;

/// Spindle's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Spindle's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The sink has no playlist back-reference (detach on a detached sink).
    #[error("sink is not attached to a playlist")]
    NotAttached,

    /// The sink already has a playlist back-reference.
    #[error("sink is already attached to a playlist")]
    AlreadyAttached,

    /// The playlist item was removed (or never existed).
    #[error("playlist item no longer exists")]
    InvalidItem,

    /// The container had no track we can decode.
    #[error("no decodable audio track found")]
    NoAudioTrack,

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
