//! MySQL backend
//!
//! Plain runtime-checked queries (no compile-time macros, no live database
//! needed at build time). The concurrency-sensitive paths run inside
//! transactions with `SELECT ... FOR UPDATE`; an error anywhere drops the
//! transaction, which rolls back.

use async_trait::async_trait;
use common::unix_now;
use sqlx::mysql::MySqlPool;
use sqlx::{MySql, Transaction};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{AuthorizationState, SellerProfile, TokenRecord, TokenUpdate};
use crate::{SellerStore, StateStore, TokenLease, TokenStore};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meli_oauth_states (
        state_hash CHAR(64) NOT NULL PRIMARY KEY,
        code_verifier VARCHAR(128) NOT NULL,
        expires_at BIGINT NOT NULL,
        used_at BIGINT NULL,
        requester VARCHAR(255) NULL
    )",
    "CREATE TABLE IF NOT EXISTS meli_tokens (
        seller_id VARCHAR(32) NOT NULL PRIMARY KEY,
        access_token TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        token_type VARCHAR(32) NULL,
        scope VARCHAR(255) NULL,
        obtained_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL,
        last_refresh_at BIGINT NULL,
        revoked_at BIGINT NULL
    )",
    "CREATE TABLE IF NOT EXISTS meli_sellers (
        seller_id VARCHAR(32) NOT NULL PRIMARY KEY,
        nickname VARCHAR(255) NULL,
        site_id VARCHAR(8) NULL,
        email VARCHAR(255) NULL,
        raw_payload TEXT NULL,
        updated_at BIGINT NOT NULL
    )",
];

const TOKEN_COLUMNS: &str = "seller_id, access_token, refresh_token, token_type, scope, \
     obtained_at, expires_at, last_refresh_at, revoked_at";

/// Store backed by a shared `MySqlPool`.
#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create the three broker tables if they do not exist yet. Run once at
    /// startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        info!("broker schema ensured");
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[async_trait]
impl StateStore for MySqlStore {
    async fn save_state(
        &self,
        state_hash: &str,
        code_verifier: &str,
        expires_at: i64,
        requester: Option<&str>,
    ) -> Result<()> {
        let outcome = sqlx::query(
            "INSERT INTO meli_oauth_states \
             (state_hash, code_verifier, expires_at, used_at, requester) \
             VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(state_hash)
        .bind(code_verifier)
        .bind(expires_at)
        .bind(requester)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn pop_state(&self, state_hash: &str) -> Result<String> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        let state: Option<AuthorizationState> = sqlx::query_as(
            "SELECT state_hash, code_verifier, expires_at, used_at, requester \
             FROM meli_oauth_states WHERE state_hash = ? FOR UPDATE",
        )
        .bind(state_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let state = state.ok_or(Error::InvalidState)?;
        if state.used_at.is_some() {
            return Err(Error::StateAlreadyUsed);
        }
        if state.expires_at <= now {
            return Err(Error::StateExpired);
        }

        sqlx::query("UPDATE meli_oauth_states SET used_at = ? WHERE state_hash = ?")
            .bind(now)
            .bind(state_hash)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(state.code_verifier)
    }

    async fn cleanup_states(&self, max_age_secs: i64) -> Result<u64> {
        let cutoff = unix_now() - max_age_secs;
        let result = sqlx::query(
            "DELETE FROM meli_oauth_states \
             WHERE (used_at IS NOT NULL AND used_at < ?) OR expires_at < ?",
        )
        .bind(cutoff)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "cleaned up stale authorization states");
        }
        Ok(removed)
    }
}

/// Lease over one seller's row: the open transaction holds the `FOR UPDATE`
/// row lock until commit or drop.
struct MySqlLease {
    tx: Transaction<'static, MySql>,
    record: TokenRecord,
}

#[async_trait]
impl TokenLease for MySqlLease {
    fn record(&self) -> &TokenRecord {
        &self.record
    }

    async fn commit_update(self: Box<Self>, update: TokenUpdate) -> Result<TokenRecord> {
        update.validate()?;
        let Self { mut tx, mut record } = *self;
        let now = unix_now();

        sqlx::query(
            "UPDATE meli_tokens SET access_token = ?, refresh_token = ?, \
             token_type = ?, scope = ?, expires_at = ?, last_refresh_at = ? \
             WHERE seller_id = ?",
        )
        .bind(&update.access_token)
        .bind(&update.refresh_token)
        .bind(&update.token_type)
        .bind(&update.scope)
        .bind(update.expires_at)
        .bind(now)
        .bind(&record.seller_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        record.access_token = update.access_token;
        record.refresh_token = update.refresh_token;
        record.token_type = update.token_type;
        record.scope = update.scope;
        record.expires_at = update.expires_at;
        record.last_refresh_at = Some(now);
        Ok(record)
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MySqlStore {
    async fn upsert_tokens(&self, seller_id: &str, update: TokenUpdate) -> Result<TokenRecord> {
        update.validate()?;
        let now = unix_now();

        // A fresh authorization resets the row: new obtained_at, refresh
        // history and any revocation cleared.
        sqlx::query(
            "INSERT INTO meli_tokens \
             (seller_id, access_token, refresh_token, token_type, scope, \
              obtained_at, expires_at, last_refresh_at, revoked_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL) \
             ON DUPLICATE KEY UPDATE \
             access_token = VALUES(access_token), \
             refresh_token = VALUES(refresh_token), \
             token_type = VALUES(token_type), \
             scope = VALUES(scope), \
             obtained_at = VALUES(obtained_at), \
             expires_at = VALUES(expires_at), \
             last_refresh_at = NULL, \
             revoked_at = NULL",
        )
        .bind(seller_id)
        .bind(&update.access_token)
        .bind(&update.refresh_token)
        .bind(&update.token_type)
        .bind(&update.scope)
        .bind(now)
        .bind(update.expires_at)
        .execute(&self.pool)
        .await?;

        let record: TokenRecord = sqlx::query_as(&format!(
            "SELECT {TOKEN_COLUMNS} FROM meli_tokens WHERE seller_id = ?"
        ))
        .bind(seller_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn lock_tokens(&self, seller_id: &str) -> Result<Option<Box<dyn TokenLease>>> {
        let mut tx = self.pool.begin().await?;
        let record: Option<TokenRecord> = sqlx::query_as(&format!(
            "SELECT {TOKEN_COLUMNS} FROM meli_tokens WHERE seller_id = ? FOR UPDATE"
        ))
        .bind(seller_id)
        .fetch_optional(&mut *tx)
        .await?;

        match record {
            None => {
                tx.commit().await?;
                Ok(None)
            }
            Some(record) => Ok(Some(Box::new(MySqlLease { tx, record }) as Box<dyn TokenLease>)),
        }
    }
}

#[async_trait]
impl SellerStore for MySqlStore {
    async fn upsert_seller(&self, profile: SellerProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO meli_sellers \
             (seller_id, nickname, site_id, email, raw_payload, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
             nickname = VALUES(nickname), \
             site_id = VALUES(site_id), \
             email = VALUES(email), \
             raw_payload = VALUES(raw_payload), \
             updated_at = VALUES(updated_at)",
        )
        .bind(&profile.seller_id)
        .bind(&profile.nickname)
        .bind(&profile.site_id)
        .bind(&profile.email)
        .bind(profile.raw_payload.to_string())
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
