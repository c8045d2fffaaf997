use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use reliability::{
    DeadLetterOptions, DeadLetterStore, Deduplicator, ErrorDetails, EventIdOptions, RetryConfig,
    RetryResult, generate_event_id, with_retry,
};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::error::{DispatcherError, Result};
use crate::event::{EventHandler, InboundEvent};

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Already processed within the dedup window; the handler was not called.
    Duplicate { event_id: String },
    Delivered { event_id: String, attempts: u32 },
    /// Every attempt failed and the event was moved to the dead-letter store.
    DeadLettered {
        event_id: String,
        entry_id: String,
        attempts: u32,
    },
}

/// Result of replaying a dead-lettered event.
#[derive(Debug, Clone, PartialEq)]
pub enum RedeliveryOutcome {
    /// The handler succeeded and the entry was removed.
    Redelivered { attempts: u32 },
    /// The handler failed again; the entry stays where it was.
    StillFailing { attempts: u32, error: ErrorDetails },
}

/// Dedup, retry with backoff, then dead-letter.
pub struct EventDispatcher<H> {
    handler: Arc<H>,
    dedup: Arc<Deduplicator>,
    dead_letters: Arc<DeadLetterStore>,
    retry: RetryConfig,
    id_options: EventIdOptions,
}

impl<H: EventHandler> EventDispatcher<H> {
    pub fn new(handler: Arc<H>, dedup: Arc<Deduplicator>, dead_letters: Arc<DeadLetterStore>) -> Self {
        Self {
            handler,
            dedup,
            dead_letters,
            retry: RetryConfig::default(),
            id_options: EventIdOptions::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_id_options(mut self, id_options: EventIdOptions) -> Self {
        self.id_options = id_options;
        self
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    /// Deliver one event.
    ///
    /// The processed marker is claimed before the first attempt and kept
    /// even when the event is dead-lettered, so a redelivered copy from
    /// upstream is treated as a duplicate. Use [`Self::redeliver`] to replay.
    #[instrument(skip_all, fields(event_name = %event.name))]
    pub async fn dispatch(&self, event: InboundEvent) -> DispatchOutcome {
        let event_id = generate_event_id(&event.name, &event.data, &self.id_options);
        if !self.dedup.acquire_processing_lock(&event_id) {
            info!(event_id = %event_id, "Duplicate event skipped");
            return DispatchOutcome::Duplicate { event_id };
        }

        let first_attempt_at = Utc::now();
        let outcome = self.deliver(&event).await;

        if outcome.success {
            info!(event_id = %event_id, attempts = outcome.attempts, "Event delivered");
            return DispatchOutcome::Delivered {
                event_id,
                attempts: outcome.attempts,
            };
        }

        let mut metadata = HashMap::new();
        metadata.insert("event_id".to_string(), Value::String(event_id.clone()));
        metadata.insert(
            "retry_history".to_string(),
            serde_json::to_value(&outcome.history).unwrap_or_default(),
        );

        let entry = self.dead_letters.add_to_dead_letter(
            &event.name,
            event.data,
            failure_details(&outcome),
            outcome.attempts,
            DeadLetterOptions {
                metadata: Some(metadata),
                first_attempt_at: Some(first_attempt_at),
            },
        );

        error!(
            event_id = %event_id,
            entry_id = %entry.id,
            attempts = outcome.attempts,
            error = %entry.error,
            "Max retries exhausted, event dead-lettered"
        );

        DispatchOutcome::DeadLettered {
            event_id,
            entry_id: entry.id,
            attempts: outcome.attempts,
        }
    }

    /// Replay a dead-lettered event through the handler, bypassing dedup.
    #[instrument(skip(self))]
    pub async fn redeliver(&self, entry_id: &str) -> Result<RedeliveryOutcome> {
        let entry = self
            .dead_letters
            .get_by_id(entry_id)
            .ok_or_else(|| DispatcherError::DeadLetterNotFound(entry_id.to_string()))?;

        let event = InboundEvent::new(entry.event_name, entry.data);
        let outcome = self.deliver(&event).await;

        if outcome.success {
            self.dead_letters.remove(entry_id);
            info!(attempts = outcome.attempts, "Dead-lettered event redelivered");
            return Ok(RedeliveryOutcome::Redelivered {
                attempts: outcome.attempts,
            });
        }

        let error = failure_details(&outcome);
        warn!(attempts = outcome.attempts, error = %error, "Redelivery failed");
        Ok(RedeliveryOutcome::StillFailing {
            attempts: outcome.attempts,
            error,
        })
    }

    async fn deliver(&self, event: &InboundEvent) -> RetryResult<(), anyhow::Error> {
        let handler: &H = &self.handler;
        with_retry(move || handler.handle(event), &self.retry).await
    }
}

fn failure_details<T>(outcome: &RetryResult<T, anyhow::Error>) -> ErrorDetails {
    match &outcome.error {
        Some(error) => ErrorDetails::from_anyhow(error),
        None => ErrorDetails::new("Error", "delivery failed without an error"),
    }
}
