//! User Aggregation Index
//!
//! Maps a resolved user id to every token seen for that user. Tokens are
//! never unlearned. Each user carries its own decision lock, so deciding
//! for one user never holds a map shard against another.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Tokens observed for a resolved user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserTokenInfo {
    /// Resolved user id
    pub user_id: String,

    /// Every token seen for the user
    pub tokens: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct UserEntry {
    tokens: Arc<BTreeSet<String>>,
    decision: Arc<Mutex<()>>,
}

/// Concurrent user id to token set index
#[derive(Debug, Default)]
pub struct UserIndex {
    users: DashMap<String, UserEntry>,
}

impl UserIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token to a user and return the user's up-to-date token set
    pub fn record_token(&self, user_id: &str, token: &str) -> BTreeSet<String> {
        self.with_user(user_id, token, |tokens| tokens.clone())
    }

    /// Add a token to a user, then run `f` on the user's token set while
    /// holding that user's decision lock.
    ///
    /// Calls for the same user are serialized. The token set is read after
    /// the lock is taken, so it includes every token charged by an earlier
    /// decision.
    pub fn with_user<R>(
        &self,
        user_id: &str,
        token: &str,
        f: impl FnOnce(&BTreeSet<String>) -> R,
    ) -> R {
        let decision = self.record(user_id, token);
        let _decision = decision.lock().unwrap_or_else(PoisonError::into_inner);

        let tokens = self
            .users
            .get(user_id)
            .map(|entry| entry.tokens.clone())
            .unwrap_or_default();
        f(tokens.as_ref())
    }

    /// Learn `token` for `user_id` and return the user's decision lock.
    /// Only takes a shard write lock the first time a token is seen.
    fn record(&self, user_id: &str, token: &str) -> Arc<Mutex<()>> {
        if let Some(entry) = self.users.get(user_id) {
            if entry.tokens.contains(token) {
                return entry.decision.clone();
            }
        }

        let mut entry = self.users.entry(user_id.to_string()).or_default();
        if !entry.tokens.contains(token) {
            Arc::make_mut(&mut entry.tokens).insert(token.to_string());
        }
        entry.decision.clone()
    }

    /// Snapshot of a user's tokens
    pub fn tokens(&self, user_id: &str) -> Option<BTreeSet<String>> {
        self.users
            .get(user_id)
            .map(|entry| entry.tokens.as_ref().clone())
    }

    /// Snapshot of every user
    pub fn users(&self) -> Vec<UserTokenInfo> {
        let mut users: Vec<UserTokenInfo> = self
            .users
            .iter()
            .map(|entry| UserTokenInfo {
                user_id: entry.key().clone(),
                tokens: entry.tokens.as_ref().clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Number of known users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no user was seen yet
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
