//! Error taxonomy for the playlist planner.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("queue position out of range: {0}")]
    PositionOutOfRange(usize),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
