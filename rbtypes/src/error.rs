//! Shared domain-level error taxonomy.
//!
//! Each crate that owns a SQLite connection or TCP socket defines its own
//! `Error` enum for that boundary (matching the teacher's per-crate
//! `error.rs` convention); this enum covers failures that are meaningful at
//! the domain level, above any one component's transport.

/// Domain error shared across component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mixer unreachable: {0}")]
    MixerUnreachable(String),

    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("track not found: {0}")]
    TrackNotFound(String),

    #[error("queue position out of range: {0}")]
    QueuePositionOutOfRange(usize),

    #[error("malformed trigger: {0}")]
    MalformedTrigger(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Specialized `Result` for radiobridge components.
pub type Result<T> = std::result::Result<T, Error>;
