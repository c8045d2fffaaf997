//! Delivery reliability primitives for events and scheduled tasks.
//!
//! - [`backoff`]: exponential backoff with jitter.
//! - [`retry`]: bounded retries of a fallible async operation.
//! - [`dedup`]: event fingerprints and TTL-bounded "already processed" tracking.
//! - [`dlq`]: terminal store for events that exhausted their retries.
//! - [`schedule_lock`]: non-blocking, time-bounded locks for recurring tasks.
//!
//! Every store is an ordinary value owned by the application, safe to share
//! behind an `Arc`. Nothing here is global, and nothing outlives the process.

pub mod backoff;
pub mod config;
pub mod dedup;
pub mod dlq;
mod expiry;
pub mod retry;
pub mod schedule_lock;
pub mod sweeper;

pub use backoff::calculate_backoff;
pub use config::{DEFAULT_LOCK_TIMEOUT, DEFAULT_PROCESSED_TTL, RetryConfig};
pub use dedup::{Deduplicator, EventIdOptions, ProcessedEntry, generate_event_id};
pub use dlq::{
    DeadLetterEntry, DeadLetterOptions, DeadLetterQuery, DeadLetterStats, DeadLetterStore,
    ErrorDetails,
};
pub use retry::{RetryAttempt, RetryResult, is_retryable_error, is_retryable_message, with_retry};
pub use schedule_lock::{
    LockAcquisition, LockInfo, LockOptions, LockToken, ScheduleLockGuard, ScheduleLockManager,
    ScheduleRun,
};
pub use sweeper::{Sweep, spawn_sweeper};
