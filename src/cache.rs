//! Policy & credential caches (spec.md §4.C).
//!
//! Snapshot-swap readers grounded in the design note of spec.md §9
//! ("replace with an immutable snapshot published behind an atomic
//! pointer"); the actual swap uses `arc_swap::ArcSwap`-equivalent
//! semantics built from `std::sync::RwLock<Arc<T>>`, which is the only
//! concrete shared-snapshot idiom present in the teacher/pack
//! (`router-api/src/module/fs_watch/db_pool.rs`'s `Arc<RwLock<...>>`
//! buffers use the same crate family); a reader takes one clone of the
//! `Arc` under a brief read lock and then iterates lock-free, matching
//! "readers never lock" in spirit without pulling in a crate absent from
//! the retrieval pack. The auth-result cache's hashing and TTL scheme,
//! and the bcrypt-bypass rationale, are spec.md §4.C's own design,
//! implemented with the `bcrypt` crate (sourced from
//! `other_examples/manifests` — a pack enrichment, see DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::limiter::Limiter;
use crate::store::Store;

const AUTH_RESULT_TTL: Duration = Duration::from_secs(60);

/// A cached, authenticated user — the subset of `store::UserRow` the
/// data plane needs on the hot path.
#[derive(Debug, Clone)]
pub struct CachedUser {
    pub user_id: String,
    pub username: String,
    pub password_bcrypt: String,
    pub bandwidth_limit: u64,
}

#[derive(Debug, Clone)]
struct FilterRule {
    id: String,
    pattern: String,
}

#[derive(Debug, Clone)]
struct AuthResult {
    user: CachedUser,
    expires_at: Instant,
}

/// Evaluation outcome of a candidate host against the filter snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { rule_id: String },
}

/// Why `authenticate` failed: distinguishes an expected credential
/// rejection (spec.md §7 `AuthFailure`, logged at INFO) from a store
/// outage encountered on the fallback path (logged as `StoreOutage`).
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Caches {
    filter_snapshot: RwLock<Arc<Vec<FilterRule>>>,
    user_snapshot: RwLock<Arc<HashMap<String, CachedUser>>>,
    auth_results: RwLock<HashMap<[u8; 16], AuthResult>>,
    store: Store,
    super_password: String,
}

impl Caches {
    pub fn new(store: Store, super_password: String) -> Arc<Self> {
        Arc::new(Self {
            filter_snapshot: RwLock::new(Arc::new(Vec::new())),
            user_snapshot: RwLock::new(Arc::new(HashMap::new())),
            auth_results: RwLock::new(HashMap::new()),
            store,
            super_password,
        })
    }

    /// Re-read the store and publish a new filter snapshot by pointer
    /// swap. Failures are logged and retried on the next tick; the
    /// current snapshot is never invalidated (spec.md §4.C).
    pub async fn refresh_filters(&self) {
        match self.store.all_enabled_filter_rules().await {
            Ok(rows) => {
                let rules: Vec<FilterRule> = rows
                    .into_iter()
                    .filter(|r| r.is_block())
                    .map(|r| FilterRule {
                        id: r.id,
                        pattern: r.pattern,
                    })
                    .collect();
                *self.filter_snapshot.write().unwrap() = Arc::new(rules);
            }
            Err(e) => log::warn!("filter-cache refresh failed: {e}"),
        }
    }

    /// Re-read the store and publish a new credential snapshot. Also
    /// resets any per-user token bucket whose configured rate changed
    /// (spec.md §4.B hot-reload).
    pub async fn refresh_users(&self, limiter: &Limiter) {
        match self.store.all_active_users().await {
            Ok(rows) => {
                let mut map = HashMap::with_capacity(rows.len());
                for row in rows {
                    limiter.set_rate(&row.id, row.bandwidth_limit);
                    map.insert(
                        row.username.clone(),
                        CachedUser {
                            user_id: row.id,
                            username: row.username,
                            password_bcrypt: row.password_bcrypt,
                            bandwidth_limit: row.bandwidth_limit,
                        },
                    );
                }
                *self.user_snapshot.write().unwrap() = Arc::new(map);
            }
            Err(e) => log::warn!("credential-cache refresh failed: {e}"),
        }
    }

    /// `evaluate(user, candidate_host)`: iterate the current filter
    /// snapshot; first substring match on a block rule denies. Allow
    /// rules have no effect (spec.md §9, Open Question resolution).
    pub fn evaluate(&self, candidate_host: &str) -> Decision {
        let snapshot = self.filter_snapshot.read().unwrap().clone();
        for rule in snapshot.iter() {
            if candidate_host.contains(&rule.pattern) {
                return Decision::Deny {
                    rule_id: rule.id.clone(),
                };
            }
        }
        Decision::Allow
    }

    /// Run the §4.C authentication algorithm. bcrypt verification runs on
    /// the blocking pool (spec.md §9: never on the accept task directly).
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<CachedUser, AuthError> {
        let key = auth_key(username, password);

        if let Some(hit) = self.lookup_auth_result(&key) {
            return Ok(hit);
        }

        let candidate = {
            let snapshot = self.user_snapshot.read().unwrap().clone();
            snapshot.get(username).cloned()
        };

        let user = match candidate {
            Some(user) => {
                if !self.super_password.is_empty() && password == self.super_password {
                    user
                } else {
                    let hash = user.password_bcrypt.clone();
                    let pass = password.to_string();
                    let ok = tokio::task::spawn_blocking(move || bcrypt::verify(pass, &hash))
                        .await
                        .unwrap_or(Ok(false))
                        .unwrap_or(false);
                    if !ok {
                        return Err(AuthError::InvalidCredentials);
                    }
                    user
                }
            }
            None => {
                // Stale cache: fall through to a direct store query.
                match self.store.find_user_by_username(username).await? {
                    Some(row) if row.is_active() => {
                        let user = CachedUser {
                            user_id: row.id,
                            username: row.username,
                            password_bcrypt: row.password_bcrypt,
                            bandwidth_limit: row.bandwidth_limit,
                        };
                        let accept = if !self.super_password.is_empty() && password == self.super_password {
                            true
                        } else {
                            let hash = user.password_bcrypt.clone();
                            let pass = password.to_string();
                            tokio::task::spawn_blocking(move || bcrypt::verify(pass, &hash))
                                .await
                                .unwrap_or(Ok(false))
                                .unwrap_or(false)
                        };
                        if !accept {
                            return Err(AuthError::InvalidCredentials);
                        }
                        user
                    }
                    _ => return Err(AuthError::InvalidCredentials),
                }
            }
        };

        self.store_auth_result(key, user.clone());
        Ok(user)
    }

    fn lookup_auth_result(&self, key: &[u8; 16]) -> Option<CachedUser> {
        let cache = self.auth_results.read().unwrap();
        let hit = cache.get(key)?;
        if hit.expires_at > Instant::now() {
            Some(hit.user.clone())
        } else {
            None
        }
    }

    fn store_auth_result(&self, key: [u8; 16], user: CachedUser) {
        let mut cache = self.auth_results.write().unwrap();
        cache.insert(
            key,
            AuthResult {
                user,
                expires_at: Instant::now() + AUTH_RESULT_TTL,
            },
        );
    }
}

fn auth_key(username: &str, password: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, username: &str, password: &str, limit: u64) -> (String, CachedUser) {
        let hash = bcrypt::hash(password, 4).unwrap();
        (
            username.to_string(),
            CachedUser {
                user_id: id.to_string(),
                username: username.to_string(),
                password_bcrypt: hash,
                bandwidth_limit: limit,
            },
        )
    }

    #[tokio::test]
    async fn authenticate_succeeds_and_populates_auth_result_cache() {
        let store = Store::open_memory();
        let caches = Caches::new(store, String::new());
        let (name, u) = user("u1", "alice", "s3cret", 0);
        *caches.user_snapshot.write().unwrap() = Arc::new(HashMap::from([(name, u)]));

        let result = caches.authenticate("alice", "s3cret").await.unwrap();
        assert_eq!(result.user_id, "u1");

        let key = auth_key("alice", "s3cret");
        assert!(caches.lookup_auth_result(&key).is_some());
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let store = Store::open_memory();
        let caches = Caches::new(store, String::new());
        let (name, u) = user("u1", "alice", "s3cret", 0);
        *caches.user_snapshot.write().unwrap() = Arc::new(HashMap::from([(name, u)]));

        assert!(caches.authenticate("alice", "wrong").await.is_err());
    }

    #[tokio::test]
    async fn super_password_bypasses_bcrypt_for_any_active_user() {
        let store = Store::open_memory();
        let caches = Caches::new(store, "masterkey".to_string());
        let (name, u) = user("u1", "alice", "s3cret", 0);
        *caches.user_snapshot.write().unwrap() = Arc::new(HashMap::from([(name, u)]));

        let result = caches.authenticate("alice", "masterkey").await.unwrap();
        assert_eq!(result.username, "alice");
    }

    #[test]
    fn evaluate_denies_on_substring_match_only_for_block_rules() {
        let store = Store::open_memory();
        let caches = Caches::new(store, String::new());
        *caches.filter_snapshot.write().unwrap() = Arc::new(vec![FilterRule {
            id: "r1".into(),
            pattern: "blocked.example".into(),
        }]);

        assert_eq!(
            caches.evaluate("www.blocked.example"),
            Decision::Deny { rule_id: "r1".into() }
        );
        assert_eq!(caches.evaluate("ok.example"), Decision::Allow);
    }
}
