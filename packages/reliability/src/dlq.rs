use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// The failure that sent an event to the dead-letter queue.
///
/// Fields are kept exactly as captured: never wrapped, renamed or truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    pub stack: Option<String>,
    pub name: String,
}

impl ErrorDetails {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            name: name.into(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture a typed error. The name is the error's type; the stack is the
    /// `source()` chain, one cause per line.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            stack: (!causes.is_empty()).then(|| causes.join("\n")),
            name: short_type_name::<E>().to_string(),
        }
    }

    /// Capture an `anyhow` error with its full debug rendering (context chain
    /// and backtrace, when one was captured) as the stack.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            stack: Some(format!("{error:?}")),
            name: "Error".to_string(),
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// `std::io::error::Error` -> `Error`, `my::Wrapper<u8>` -> `Wrapper`.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// An event that exhausted its retries. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub event_name: String,
    pub data: Value,
    pub error: ErrorDetails,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub metadata: Option<HashMap<String, Value>>,
}

/// Optional extras for [`DeadLetterStore::add_to_dead_letter`].
#[derive(Debug, Clone, Default)]
pub struct DeadLetterOptions {
    pub metadata: Option<HashMap<String, Value>>,
    /// Defaults to the time the entry is created.
    pub first_attempt_at: Option<DateTime<Utc>>,
}

/// Filter and page for [`DeadLetterStore::list`].
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQuery {
    /// Glob over event names; `*` matches any run of characters.
    pub event_name: Option<String>,
    /// Only entries dead-lettered at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only entries dead-lettered strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DeadLetterQuery {
    pub fn event_name(mut self, pattern: impl Into<String>) -> Self {
        self.event_name = Some(pattern.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Statistics about the dead letter queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_event: HashMap<String, usize>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Terminal sink for events whose retries ran out.
///
/// Performs no retries itself; replaying an entry and removing it on success
/// is up to the caller.
#[derive(Debug, Default)]
pub struct DeadLetterStore {
    entries: DashMap<String, DeadLetterEntry>,
}

impl DeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed event and return the stored entry.
    pub fn add_to_dead_letter(
        &self,
        event_name: &str,
        data: Value,
        error: ErrorDetails,
        attempts: u32,
        options: DeadLetterOptions,
    ) -> DeadLetterEntry {
        let now = Utc::now();
        let entry = DeadLetterEntry {
            id: format!("dlq_{}", Uuid::now_v7().simple()),
            event_name: event_name.to_string(),
            data,
            error,
            attempts,
            first_attempt_at: options.first_attempt_at.unwrap_or(now),
            dead_lettered_at: now,
            metadata: options.metadata,
        };

        debug!(
            id = %entry.id,
            event_name,
            attempts,
            error = %entry.error,
            "Event dead-lettered"
        );

        self.entries.insert(entry.id.clone(), entry.clone());
        entry
    }

    /// Matching entries, most recently dead-lettered first, then paged.
    pub fn list(&self, query: &DeadLetterQuery) -> Vec<DeadLetterEntry> {
        let name_filter = query.event_name.as_deref().map(NameFilter::new);

        let mut items: Vec<DeadLetterEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                name_filter
                    .as_ref()
                    .is_none_or(|filter| filter.matches(&entry.event_name))
                    && query.since.is_none_or(|since| entry.dead_lettered_at >= since)
                    && query.before.is_none_or(|before| entry.dead_lettered_at < before)
            })
            .map(|entry| entry.value().clone())
            .collect();

        // v7 ids are time-ordered, which keeps ties stable across pages.
        items.sort_by(|a, b| {
            b.dead_lettered_at
                .cmp(&a.dead_lettered_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        items
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn get_by_id(&self, id: &str) -> Option<DeadLetterEntry> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Returns `false` if no entry has this id.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove several entries. Returns how many existed.
    pub fn remove_many<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        ids.iter().filter(|id| self.remove(id.as_ref())).count()
    }

    /// Empty the queue. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, _| {
            removed += 1;
            false
        });
        removed
    }

    pub fn stats(&self) -> DeadLetterStats {
        let mut stats = DeadLetterStats::default();

        for entry in self.entries.iter() {
            stats.total += 1;
            *stats.by_event.entry(entry.event_name.clone()).or_insert(0) += 1;

            let at = entry.dead_lettered_at;
            stats.oldest_entry = Some(stats.oldest_entry.map_or(at, |oldest| oldest.min(at)));
            stats.newest_entry = Some(stats.newest_entry.map_or(at, |newest| newest.max(at)));
        }

        stats
    }

    /// Delete entries dead-lettered strictly before `older_than`.
    pub fn purge(&self, older_than: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let stale = entry.dead_lettered_at < older_than;
            removed += usize::from(stale);
            !stale
        });
        if removed > 0 {
            debug!(removed, %older_than, "Purged dead letters");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Event-name matcher for list queries.
enum NameFilter {
    Pattern(Regex),
    Exact(String),
}

impl NameFilter {
    fn new(glob: &str) -> Self {
        let escaped: Vec<String> = glob.split('*').map(regex::escape).collect();
        match Regex::new(&format!("(?s)^{}$", escaped.join(".*"))) {
            Ok(re) => Self::Pattern(re),
            // Only reachable if the compiled pattern exceeds regex size limits.
            Err(_) => Self::Exact(glob.to_string()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Pattern(re) => re.is_match(name),
            Self::Exact(expected) => expected == name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn add(store: &DeadLetterStore, name: &str) -> DeadLetterEntry {
        store.add_to_dead_letter(
            name,
            json!({"name": name}),
            ErrorDetails::new("Error", format!("{name} failed")),
            4,
            DeadLetterOptions::default(),
        )
    }

    /// Adds entries with distinct `dead_lettered_at` values.
    async fn add_spaced(store: &DeadLetterStore, names: &[&str]) -> Vec<DeadLetterEntry> {
        let mut out = Vec::new();
        for name in names {
            out.push(add(store, name));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        out
    }

    #[derive(Debug, thiserror::Error)]
    #[error("handler failed")]
    struct HandlerError {
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn test_add_then_get_round_trips_inputs() {
        let store = DeadLetterStore::new();
        let error = ErrorDetails::new("TypeError", "x is undefined").with_stack("at handler (a.js:1)");
        let mut metadata = HashMap::new();
        metadata.insert("tenant".to_string(), json!("acme"));
        let first = Utc::now() - chrono::TimeDelta::seconds(30);

        let entry = store.add_to_dead_letter(
            "Order.created",
            json!({"orderId": "123"}),
            error.clone(),
            4,
            DeadLetterOptions {
                metadata: Some(metadata.clone()),
                first_attempt_at: Some(first),
            },
        );

        let fetched = store.get_by_id(&entry.id).unwrap();
        assert_eq!(fetched, entry);
        assert_eq!(fetched.event_name, "Order.created");
        assert_eq!(fetched.data, json!({"orderId": "123"}));
        assert_eq!(fetched.error, error);
        assert_eq!(fetched.attempts, 4);
        assert_eq!(fetched.first_attempt_at, first);
        assert_eq!(fetched.metadata, Some(metadata));
        assert!(fetched.id.starts_with("dlq_"));
    }

    #[test]
    fn test_first_attempt_defaults_to_now() {
        let store = DeadLetterStore::new();
        let entry = add(&store, "a");
        assert_eq!(entry.first_attempt_at, entry.dead_lettered_at);
    }

    #[test]
    fn test_ids_are_unique() {
        let store = DeadLetterStore::new();
        let ids: std::collections::HashSet<String> = (0..100).map(|_| add(&store, "e").id).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_error_is_stored_verbatim() {
        let store = DeadLetterStore::new();
        let long = "x".repeat(10_000);
        let entry = store.add_to_dead_letter(
            "e",
            Value::Null,
            ErrorDetails::new("RangeError", long.clone()),
            1,
            DeadLetterOptions::default(),
        );
        assert_eq!(store.get_by_id(&entry.id).unwrap().error.message, long);
    }

    #[test]
    fn test_error_details_from_typed_error() {
        let err = HandlerError {
            source: std::io::Error::other("disk full"),
        };
        let details = ErrorDetails::from_error(&err);
        assert_eq!(details.name, "HandlerError");
        assert_eq!(details.message, "handler failed");
        assert_eq!(details.stack.as_deref(), Some("caused by: disk full"));
    }

    #[test]
    fn test_error_details_from_anyhow() {
        let err = anyhow::anyhow!("root cause").context("while handling Order.created");
        let details = ErrorDetails::from_anyhow(&err);
        assert_eq!(details.message, "while handling Order.created");
        assert!(details.stack.unwrap().contains("root cause"));
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let store = DeadLetterStore::new();
        let added = add_spaced(&store, &["a", "b", "c"]).await;

        let names: Vec<String> = store
            .list(&DeadLetterQuery::default())
            .into_iter()
            .map(|e| e.event_name)
            .collect();
        assert_eq!(names, vec!["c", "b", "a"]);
        assert_eq!(added.len(), 3);
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let store = DeadLetterStore::new();
        add_spaced(&store, &["a", "b", "c", "d", "e"]).await;

        let page = |offset, limit| -> Vec<String> {
            store
                .list(&DeadLetterQuery::default().page(offset, limit))
                .into_iter()
                .map(|e| e.event_name)
                .collect()
        };
        assert_eq!(page(0, 2), vec!["e", "d"]);
        assert_eq!(page(2, 2), vec!["c", "b"]);
        assert_eq!(page(4, 2), vec!["a"]);
        assert!(page(10, 2).is_empty());
    }

    #[test]
    fn test_list_filters_by_glob() {
        let store = DeadLetterStore::new();
        for name in ["Order.created", "Order.updated", "OrderXcreated", "User.created"] {
            add(&store, name);
        }

        let names = |pattern: &str| -> Vec<String> {
            let mut names: Vec<String> = store
                .list(&DeadLetterQuery::default().event_name(pattern))
                .into_iter()
                .map(|e| e.event_name)
                .collect();
            names.sort();
            names
        };

        assert_eq!(names("Order.*"), vec!["Order.created", "Order.updated"]);
        assert_eq!(names("*.created"), vec!["Order.created", "User.created"]);
        assert_eq!(names("User.created"), vec!["User.created"]);
        assert_eq!(names("*"), vec!["Order.created", "Order.updated", "OrderXcreated", "User.created"]);
        assert!(names("Order").is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_by_time_window() {
        let store = DeadLetterStore::new();
        let added = add_spaced(&store, &["a", "b", "c"]).await;

        let since_b: Vec<String> = store
            .list(&DeadLetterQuery::default().since(added[1].dead_lettered_at))
            .into_iter()
            .map(|e| e.event_name)
            .collect();
        assert_eq!(since_b, vec!["c", "b"]);

        let before_b: Vec<String> = store
            .list(&DeadLetterQuery::default().before(added[1].dead_lettered_at))
            .into_iter()
            .map(|e| e.event_name)
            .collect();
        assert_eq!(before_b, vec!["a"]);
    }

    #[test]
    fn test_remove_and_remove_many() {
        let store = DeadLetterStore::new();
        let a = add(&store, "a");
        let b = add(&store, "b");
        let c = add(&store, "c");

        assert!(store.remove(&a.id));
        assert!(!store.remove(&a.id));
        assert!(store.get_by_id(&a.id).is_none());

        assert_eq!(store.remove_many(&[b.id.as_str(), "dlq_missing", c.id.as_str()]), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_returns_count() {
        let store = DeadLetterStore::new();
        add(&store, "a");
        add(&store, "b");
        assert_eq!(store.clear(), 2);
        assert_eq!(store.clear(), 0);
    }

    #[tokio::test]
    async fn test_stats_group_by_event() {
        let store = DeadLetterStore::new();
        assert_eq!(store.stats(), DeadLetterStats::default());

        let added = add_spaced(&store, &["a", "b", "a"]).await;
        let stats = store.stats();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_event.get("a"), Some(&2));
        assert_eq!(stats.by_event.get("b"), Some(&1));
        assert_eq!(stats.oldest_entry, Some(added[0].dead_lettered_at));
        assert_eq!(stats.newest_entry, Some(added[2].dead_lettered_at));
    }

    #[tokio::test]
    async fn test_purge_removes_only_older_entries() {
        let store = DeadLetterStore::new();
        let added = add_spaced(&store, &["old-1", "old-2", "new"]).await;

        assert_eq!(store.purge(added[2].dead_lettered_at), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get_by_id(&added[2].id).is_some());
        assert_eq!(store.purge(added[2].dead_lettered_at), 0);
    }

    #[test]
    fn test_short_type_names() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<Vec<u8>>(), "Vec");
        assert_eq!(short_type_name::<u8>(), "u8");
    }
}
