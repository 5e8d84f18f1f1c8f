//! Store error taxonomy
//!
//! State consumption failures are deliberately distinct variants: the broker
//! maps each one to its own response kind so an operator can tell a replayed
//! callback (`StateAlreadyUsed`) apart from a stale one (`StateExpired`).

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Duplicate primary key on insert (e.g. two flows hashing to the same
    /// state, which in practice means a re-submitted init).
    #[error("row already exists")]
    Conflict,

    /// No authorization state with this hash.
    #[error("unknown or forged state")]
    InvalidState,

    /// The state row exists but was already consumed.
    #[error("state already used")]
    StateAlreadyUsed,

    /// The state row exists but its TTL elapsed.
    #[error("state expired")]
    StateExpired,

    /// No row for the requested seller.
    #[error("not found")]
    NotFound,

    /// A write was rejected before reaching the database.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
