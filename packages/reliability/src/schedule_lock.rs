//! Mutual exclusion for recurring tasks.
//!
//! Each schedule id is either unlocked or held by exactly one unexpired lock.
//! Acquiring a held lock fails immediately; nothing queues or blocks.
//!
//! Locks expire on their own after the requested timeout. There is no
//! renewal: a task that runs past its timeout silently loses the lock and a
//! second firing of the same schedule can then overlap with it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::DEFAULT_LOCK_TIMEOUT;
use crate::expiry::expires_after;

/// Proof of a successful [`ScheduleLockManager::acquire_lock`]; releases
/// exactly the lock it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// How long the lock is held before it expires on its own.
    pub timeout: Duration,
    pub metadata: Option<HashMap<String, Value>>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl LockOptions {
    /// Default timeout of 5 minutes, no metadata.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            metadata: None,
        }
    }

    pub fn metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone)]
struct ScheduleLock {
    token: LockToken,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    metadata: Option<HashMap<String, Value>>,
}

impl ScheduleLock {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn info(&self, schedule_id: &str) -> LockInfo {
        LockInfo {
            schedule_id: schedule_id.to_string(),
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Public view of a held lock. The token is never exposed here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
    pub schedule_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: Option<HashMap<String, Value>>,
}

/// Outcome of [`ScheduleLockManager::acquire_lock`].
#[derive(Debug, Clone, PartialEq)]
pub enum LockAcquisition {
    Acquired {
        token: LockToken,
        locked_until: DateTime<Utc>,
    },
    /// Someone else holds the lock until `locked_until`.
    Held { locked_until: DateTime<Utc> },
}

impl LockAcquisition {
    pub fn acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn token(&self) -> Option<&LockToken> {
        match self {
            Self::Acquired { token, .. } => Some(token),
            Self::Held { .. } => None,
        }
    }

    pub fn locked_until(&self) -> DateTime<Utc> {
        match self {
            Self::Acquired { locked_until, .. } | Self::Held { locked_until } => *locked_until,
        }
    }
}

/// Outcome of [`ScheduleLockManager::with_schedule_lock`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleRun<T> {
    /// Another run holds the lock; the task was not invoked.
    Skipped { locked_until: DateTime<Utc> },
    Executed(T),
}

impl<T> ScheduleRun<T> {
    pub fn executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }
}

/// Holds a schedule lock and releases it on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ScheduleLockGuard<'a> {
    manager: &'a ScheduleLockManager,
    token: LockToken,
    locked_until: DateTime<Utc>,
}

impl ScheduleLockGuard<'_> {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn locked_until(&self) -> DateTime<Utc> {
        self.locked_until
    }
}

impl Drop for ScheduleLockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_lock(&self.token);
    }
}

/// Time-bounded locks keyed by schedule id.
///
/// `locks` and `tokens` are only ever nested in that order (lock shard first,
/// then token shard).
#[derive(Debug, Default)]
pub struct ScheduleLockManager {
    locks: DashMap<String, ScheduleLock>,
    tokens: DashMap<LockToken, String>,
}

impl ScheduleLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `schedule_id` unless an unexpired one exists.
    ///
    /// An expired lock is replaced, and its token stops working.
    pub fn acquire_lock(&self, schedule_id: &str, options: LockOptions) -> LockAcquisition {
        let now = Utc::now();
        let lock = ScheduleLock {
            token: LockToken::generate(),
            acquired_at: now,
            expires_at: expires_after(now, options.timeout),
            metadata: options.metadata,
        };
        let token = lock.token.clone();
        let locked_until = lock.expires_at;

        match self.locks.entry(schedule_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    let held_until = occupied.get().expires_at;
                    trace!(schedule_id, %held_until, "Schedule lock contended");
                    return LockAcquisition::Held {
                        locked_until: held_until,
                    };
                }
                let stale = occupied.insert(lock);
                self.tokens.remove(&stale.token);
                self.tokens.insert(token.clone(), schedule_id.to_string());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lock);
                self.tokens.insert(token.clone(), schedule_id.to_string());
            }
        }

        debug!(schedule_id, %locked_until, "Schedule lock acquired");
        LockAcquisition::Acquired {
            token,
            locked_until,
        }
    }

    /// [`acquire_lock`](Self::acquire_lock) returning an RAII guard.
    pub fn try_lock(&self, schedule_id: &str, options: LockOptions) -> Option<ScheduleLockGuard<'_>> {
        match self.acquire_lock(schedule_id, options) {
            LockAcquisition::Acquired {
                token,
                locked_until,
            } => Some(ScheduleLockGuard {
                manager: self,
                token,
                locked_until,
            }),
            LockAcquisition::Held { .. } => None,
        }
    }

    /// Whether an unexpired lock exists. Evicts an expired one.
    pub fn is_schedule_running(&self, schedule_id: &str) -> bool {
        let now = Utc::now();
        if let Some((_, stale)) = self
            .locks
            .remove_if(schedule_id, |_, lock| lock.is_expired(now))
        {
            self.tokens.remove(&stale.token);
            trace!(schedule_id, "Evicted expired schedule lock");
            return false;
        }
        self.locks.contains_key(schedule_id)
    }

    /// Release the lock issued with `token`.
    ///
    /// Returns `false` for an unknown or already-used token. The lock itself
    /// is only removed if it still belongs to this token.
    pub fn release_lock(&self, token: &LockToken) -> bool {
        let Some((_, schedule_id)) = self.tokens.remove(token) else {
            return false;
        };
        self.locks
            .remove_if(&schedule_id, |_, lock| &lock.token == token);
        debug!(schedule_id, "Schedule lock released");
        true
    }

    /// Drop the lock for `schedule_id` whoever holds it, along with its token.
    ///
    /// Returns whether a lock (expired or not) was present.
    pub fn force_release_lock(&self, schedule_id: &str) -> bool {
        let removed = self.locks.remove(schedule_id);
        if let Some((_, lock)) = &removed {
            self.tokens.remove(&lock.token);
        }
        if removed.is_some() {
            debug!(schedule_id, "Schedule lock force-released");
        }
        removed.is_some()
    }

    /// The unexpired lock for `schedule_id`, if any.
    pub fn get_lock_info(&self, schedule_id: &str) -> Option<LockInfo> {
        let now = Utc::now();
        self.locks
            .get(schedule_id)
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.info(schedule_id))
    }

    /// Every unexpired lock by schedule id. Expired locks are skipped, not evicted.
    pub fn get_active_locks(&self) -> HashMap<String, LockInfo> {
        let now = Utc::now();
        self.locks
            .iter()
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| (lock.key().clone(), lock.info(lock.key())))
            .collect()
    }

    /// Sweep expired locks and their tokens. Returns how many locks were removed.
    pub fn cleanup_expired_locks(&self) -> usize {
        let now = Utc::now();
        let mut stale_tokens = Vec::new();
        self.locks.retain(|_, lock| {
            if lock.is_expired(now) {
                stale_tokens.push(lock.token.clone());
                false
            } else {
                true
            }
        });
        for token in &stale_tokens {
            self.tokens.remove(token);
        }
        stale_tokens.len()
    }

    /// Drop every lock and its token. Returns how many locks there were.
    ///
    /// Tokens are removed one by one so a lock taken concurrently keeps its
    /// own token.
    pub fn clear_all_locks(&self) -> usize {
        let mut removed_tokens = Vec::new();
        self.locks.retain(|_, lock| {
            removed_tokens.push(lock.token.clone());
            false
        });
        for token in &removed_tokens {
            self.tokens.remove(token);
        }
        removed_tokens.len()
    }

    /// Run `task` while holding the lock for `schedule_id`.
    ///
    /// If the lock is held elsewhere the task is not invoked and
    /// `Ok(ScheduleRun::Skipped)` comes back. Otherwise the lock is released
    /// after the task finishes, whether it returned `Ok`, returned `Err`,
    /// panicked, or was cancelled. A task error is passed through.
    pub async fn with_schedule_lock<T, E, F, Fut>(
        &self,
        schedule_id: &str,
        task: F,
        options: LockOptions,
    ) -> Result<ScheduleRun<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _guard = match self.acquire_lock(schedule_id, options) {
            LockAcquisition::Acquired {
                token,
                locked_until,
            } => ScheduleLockGuard {
                manager: self,
                token,
                locked_until,
            },
            LockAcquisition::Held { locked_until } => {
                return Ok(ScheduleRun::Skipped { locked_until });
            }
        };

        let value = task().await?;
        Ok(ScheduleRun::Executed(value))
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
