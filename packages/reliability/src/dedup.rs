//! Idempotency tracking for event delivery.
//!
//! Event ids are fingerprints of `(event name, payload)`. They come from a
//! 32-bit non-cryptographic hash, so two different payloads can collide and
//! suppress each other; callers that cannot tolerate that should supply their
//! own ids.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::config::DEFAULT_PROCESSED_TTL;
use crate::expiry::expires_after;

const HASH_SEED: u32 = 5381;

/// What goes into a generated event id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventIdOptions {
    /// Mix the current time (ms) in, making every id unique.
    #[serde(default)]
    pub include_timestamp: bool,
    /// Only hash these top-level payload fields.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

/// Deterministic id for an event: `evt_{name}_{hash}`.
///
/// The name has dots replaced with underscores and is lowercased; the hash is
/// 8 hex digits over the canonical JSON of `[name, timestamp?, payload]`.
pub fn generate_event_id(event_name: &str, data: &Value, options: &EventIdOptions) -> String {
    let payload = match (&options.fields, data) {
        (Some(fields), Value::Object(map)) => Value::Object(
            fields
                .iter()
                .filter_map(|field| map.get(field).map(|v| (field.clone(), v.clone())))
                .collect(),
        ),
        _ => data.clone(),
    };

    let mut parts = vec![Value::String(event_name.to_string())];
    if options.include_timestamp {
        parts.push(Value::from(Utc::now().timestamp_millis()));
    }
    parts.push(payload);

    let mut canonical = String::new();
    write_canonical(&Value::Array(parts), &mut canonical);

    format!(
        "evt_{}_{:08x}",
        event_name.replace('.', "_").to_lowercase(),
        rolling_hash(&canonical)
    )
}

/// Compact JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(key.clone()));
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// djb2-xor over UTF-16 code units.
fn rolling_hash(input: &str) -> u32 {
    input
        .encode_utf16()
        .fold(HASH_SEED, |hash, unit| hash.wrapping_mul(33) ^ u32::from(unit))
}

/// Marker that an event id has been handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub event_id: String,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProcessedEntry {
    fn new(event_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            event_id: event_id.to_string(),
            processed_at: now,
            expires_at: expires_after(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Tracks which event ids were processed within their TTL window.
///
/// Expired markers are dropped lazily when looked at, or in bulk by
/// [`cleanup_expired`](Self::cleanup_expired).
#[derive(Debug)]
pub struct Deduplicator {
    entries: DashMap<String, ProcessedEntry>,
    default_ttl: Duration,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_PROCESSED_TTL)
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Whether `event_id` has an unexpired marker. Evicts an expired one.
    pub fn is_processed(&self, event_id: &str) -> bool {
        let now = Utc::now();
        if self
            .entries
            .remove_if(event_id, |_, entry| entry.is_expired(now))
            .is_some()
        {
            trace!(event_id, "Evicted expired processed marker");
            return false;
        }
        self.entries.contains_key(event_id)
    }

    pub fn mark_processed(&self, event_id: &str) {
        self.mark_processed_with_ttl(event_id, self.default_ttl);
    }

    /// Insert or overwrite the marker, expiring `ttl` from now.
    pub fn mark_processed_with_ttl(&self, event_id: &str, ttl: Duration) {
        self.entries
            .insert(event_id.to_string(), ProcessedEntry::new(event_id, ttl));
    }

    pub fn acquire_processing_lock(&self, event_id: &str) -> bool {
        self.acquire_processing_lock_with_ttl(event_id, self.default_ttl)
    }

    /// Atomic check-then-mark.
    ///
    /// Returns `false` if the event is already marked and unexpired;
    /// otherwise marks it and returns `true`. Prefer this to calling
    /// [`is_processed`](Self::is_processed) then
    /// [`mark_processed`](Self::mark_processed), which races.
    pub fn acquire_processing_lock_with_ttl(&self, event_id: &str, ttl: Duration) -> bool {
        let now = Utc::now();
        match self.entries.entry(event_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    trace!(event_id, "Duplicate event suppressed");
                    return false;
                }
                occupied.insert(ProcessedEntry::new(event_id, ttl));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ProcessedEntry::new(event_id, ttl));
                true
            }
        }
    }

    /// Drop the marker. Returns whether one existed.
    pub fn unmark_processed(&self, event_id: &str) -> bool {
        self.entries.remove(event_id).is_some()
    }

    /// Drop every marker. Returns how many there were.
    pub fn clear_processed(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, _| {
            removed += 1;
            false
        });
        removed
    }

    /// Sweep all expired markers. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            removed += usize::from(expired);
            !expired
        });
        removed
    }

    /// Number of markers held, including expired ones not yet swept.
    pub fn processed_count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, event_id: &str) -> Option<ProcessedEntry> {
        self.entries.get(event_id).map(|entry| entry.value().clone())
    }
}
