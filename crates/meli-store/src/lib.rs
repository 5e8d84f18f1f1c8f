//! Persistence for the token broker
//!
//! Three narrow traits (states, tokens, sellers) plus a [`BrokerStore`]
//! supertrait the broker is generic over. Two backends: [`MemoryStore`] for
//! tests and [`MySqlStore`] for production.
//!
//! The two operations with real concurrency stakes are `pop_state` (a state
//! must be consumable exactly once, even under concurrent callbacks) and
//! `lock_tokens` (refreshes for one seller must serialize so only one caller
//! hits the upstream). MySQL enforces both with `SELECT ... FOR UPDATE`
//! inside a transaction; the memory backend with mutexes.

use async_trait::async_trait;

mod error;
mod memory;
mod mysql;
mod types;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use types::{AuthorizationState, SellerProfile, TokenRecord, TokenUpdate};

/// Pending-authorization state rows.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new flow. `Conflict` if the hash already exists.
    async fn save_state(
        &self,
        state_hash: &str,
        code_verifier: &str,
        expires_at: i64,
        requester: Option<&str>,
    ) -> Result<()>;

    /// Atomically consume a state, returning its verifier. Exactly one of
    /// any set of concurrent callers succeeds; the rest see
    /// `StateAlreadyUsed`. Unknown hashes are `InvalidState`, lapsed ones
    /// `StateExpired`.
    async fn pop_state(&self, state_hash: &str) -> Result<String>;

    /// Delete rows consumed or expired more than `max_age_secs` ago.
    /// Returns the number of rows removed.
    async fn cleanup_states(&self, max_age_secs: i64) -> Result<u64>;
}

/// An exclusive hold on one seller's token row. While a lease is alive no
/// other caller can read-for-refresh the same row. Dropping a lease without
/// committing rolls back.
#[async_trait]
pub trait TokenLease: Send {
    /// The row as it was when the lease was taken.
    fn record(&self) -> &TokenRecord;

    /// Write new credentials and release the lease.
    async fn commit_update(self: Box<Self>, update: TokenUpdate) -> Result<TokenRecord>;

    /// Release without changes (the cached token was still fresh).
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Token rows, keyed by seller.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Create or replace the seller's token bundle.
    async fn upsert_tokens(&self, seller_id: &str, update: TokenUpdate) -> Result<TokenRecord>;

    /// Take an exclusive lease on the seller's row, or `None` when the
    /// seller has never connected.
    async fn lock_tokens(&self, seller_id: &str) -> Result<Option<Box<dyn TokenLease>>>;
}

/// Seller identity snapshots.
#[async_trait]
pub trait SellerStore: Send + Sync {
    async fn upsert_seller(&self, profile: SellerProfile) -> Result<()>;
}

/// Everything the broker needs from persistence.
pub trait BrokerStore: StateStore + TokenStore + SellerStore {}

impl<T: StateStore + TokenStore + SellerStore> BrokerStore for T {}
