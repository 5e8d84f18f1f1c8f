//! In-memory backend
//!
//! Mutex-guarded maps with the same semantics as the MySQL backend:
//! `pop_state` is atomic under the map lock, and `lock_tokens` hands out a
//! per-seller owned mutex guard so refreshes serialize. Backs every broker
//! test; never used in production.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::unix_now;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::types::{AuthorizationState, SellerProfile, TokenRecord, TokenUpdate};
use crate::{SellerStore, StateStore, TokenLease, TokenStore};

type TokenMap = Arc<Mutex<HashMap<String, TokenRecord>>>;

#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, AuthorizationState>>,
    tokens: TokenMap,
    sellers: Mutex<HashMap<String, SellerProfile>>,
    token_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: read a seller profile back.
    pub async fn seller(&self, seller_id: &str) -> Option<SellerProfile> {
        self.sellers.lock().await.get(seller_id).cloned()
    }

    /// Test hook: read a token row without taking a lease.
    pub async fn token_record(&self, seller_id: &str) -> Option<TokenRecord> {
        self.tokens.lock().await.get(seller_id).cloned()
    }

    /// Test hook: mark a seller's tokens revoked.
    pub async fn revoke(&self, seller_id: &str) {
        if let Some(record) = self.tokens.lock().await.get_mut(seller_id) {
            record.revoked_at = Some(unix_now());
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_state(
        &self,
        state_hash: &str,
        code_verifier: &str,
        expires_at: i64,
        requester: Option<&str>,
    ) -> Result<()> {
        let mut states = self.states.lock().await;
        if states.contains_key(state_hash) {
            return Err(Error::Conflict);
        }
        states.insert(
            state_hash.to_owned(),
            AuthorizationState {
                state_hash: state_hash.to_owned(),
                code_verifier: code_verifier.to_owned(),
                expires_at,
                used_at: None,
                requester: requester.map(str::to_owned),
            },
        );
        Ok(())
    }

    async fn pop_state(&self, state_hash: &str) -> Result<String> {
        let now = unix_now();
        let mut states = self.states.lock().await;
        let state = states.get_mut(state_hash).ok_or(Error::InvalidState)?;
        if state.used_at.is_some() {
            return Err(Error::StateAlreadyUsed);
        }
        if state.expires_at <= now {
            return Err(Error::StateExpired);
        }
        state.used_at = Some(now);
        Ok(state.code_verifier.clone())
    }

    async fn cleanup_states(&self, max_age_secs: i64) -> Result<u64> {
        let cutoff = unix_now() - max_age_secs;
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, s| {
            let consumed_long_ago = s.used_at.is_some_and(|t| t < cutoff);
            let lapsed_long_ago = s.expires_at < cutoff;
            !(consumed_long_ago || lapsed_long_ago)
        });
        Ok((before - states.len()) as u64)
    }
}

struct MemoryLease {
    _guard: OwnedMutexGuard<()>,
    tokens: TokenMap,
    record: TokenRecord,
}

#[async_trait]
impl TokenLease for MemoryLease {
    fn record(&self) -> &TokenRecord {
        &self.record
    }

    async fn commit_update(self: Box<Self>, update: TokenUpdate) -> Result<TokenRecord> {
        update.validate()?;
        let mut tokens = self.tokens.lock().await;
        let record = tokens
            .get_mut(&self.record.seller_id)
            .ok_or(Error::NotFound)?;
        record.access_token = update.access_token;
        record.refresh_token = update.refresh_token;
        record.token_type = update.token_type;
        record.scope = update.scope;
        record.expires_at = update.expires_at;
        record.last_refresh_at = Some(unix_now());
        Ok(record.clone())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn upsert_tokens(&self, seller_id: &str, update: TokenUpdate) -> Result<TokenRecord> {
        update.validate()?;
        let now = unix_now();
        let mut tokens = self.tokens.lock().await;
        let record = TokenRecord {
            seller_id: seller_id.to_owned(),
            access_token: update.access_token,
            refresh_token: update.refresh_token,
            token_type: update.token_type,
            scope: update.scope,
            obtained_at: now,
            expires_at: update.expires_at,
            last_refresh_at: None,
            revoked_at: None,
        };
        tokens.insert(seller_id.to_owned(), record.clone());
        Ok(record)
    }

    async fn lock_tokens(&self, seller_id: &str) -> Result<Option<Box<dyn TokenLease>>> {
        let lock = {
            let mut locks = self.token_locks.lock().await;
            locks.entry(seller_id.to_owned()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        let record = self.tokens.lock().await.get(seller_id).cloned();
        Ok(record.map(|record| {
            Box::new(MemoryLease {
                _guard: guard,
                tokens: self.tokens.clone(),
                record,
            }) as Box<dyn TokenLease>
        }))
    }
}

#[async_trait]
impl SellerStore for MemoryStore {
    async fn upsert_seller(&self, profile: SellerProfile) -> Result<()> {
        self.sellers
            .lock()
            .await
            .insert(profile.seller_id.clone(), profile);
        Ok(())
    }
}
