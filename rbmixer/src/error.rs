//! Error taxonomy for the mixer control channel.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mixer unreachable: {0}")]
    Unreachable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
