use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use dispatcher::{
    DispatchOutcome, DispatcherError, EventDispatcher, EventHandler, InboundEvent,
    RedeliveryOutcome,
};
use reliability::{DeadLetterQuery, DeadLetterStore, Deduplicator, EventIdOptions, RetryConfig};
use serde_json::json;

/// Fails the first `failures` calls, then succeeds. `broken` forces failure.
struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
    broken: AtomicBool,
}

impl FlakyHandler {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            broken: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.broken.load(Ordering::SeqCst) || n <= self.failures {
            anyhow::bail!("ECONNRESET delivering {} (call {n})", event.name);
        }
        Ok(())
    }
}

fn dispatcher(handler: Arc<FlakyHandler>, max_retries: u32) -> EventDispatcher<FlakyHandler> {
    EventDispatcher::new(
        handler,
        Arc::new(Deduplicator::new()),
        Arc::new(DeadLetterStore::new()),
    )
    .with_retry_config(RetryConfig::immediate(max_retries))
}

fn order_created() -> InboundEvent {
    InboundEvent::new("Order.created", json!({"orderId": "123", "total": 42}))
}

#[tokio::test]
async fn test_delivers_after_transient_failures() {
    let handler = Arc::new(FlakyHandler::new(2));
    let dispatcher = dispatcher(handler.clone(), 3);

    let outcome = dispatcher.dispatch(order_created()).await;
    match outcome {
        DispatchOutcome::Delivered { event_id, attempts } => {
            assert!(event_id.starts_with("evt_order_created_"));
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(handler.calls(), 3);
    assert!(dispatcher.dead_letters().is_empty());
}

#[tokio::test]
async fn test_duplicate_is_not_handled_twice() {
    let handler = Arc::new(FlakyHandler::new(0));
    let dispatcher = dispatcher(handler.clone(), 3);

    let first = dispatcher.dispatch(order_created()).await;
    let second = dispatcher.dispatch(order_created()).await;

    let DispatchOutcome::Delivered { event_id, .. } = first else {
        panic!("first dispatch should deliver");
    };
    assert_eq!(second, DispatchOutcome::Duplicate { event_id });
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_field_filter_treats_events_with_same_key_as_duplicates() {
    let handler = Arc::new(FlakyHandler::new(0));
    let dispatcher = dispatcher(handler.clone(), 0).with_id_options(EventIdOptions {
        fields: Some(vec!["orderId".into()]),
        ..Default::default()
    });

    dispatcher.dispatch(order_created()).await;
    let retry = InboundEvent::new("Order.created", json!({"orderId": "123", "total": 43}));
    assert!(matches!(
        dispatcher.dispatch(retry).await,
        DispatchOutcome::Duplicate { .. }
    ));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_event_is_dead_lettered_with_history() {
    let handler = Arc::new(FlakyHandler::new(u32::MAX));
    let dispatcher = dispatcher(handler.clone(), 2);

    let outcome = dispatcher.dispatch(order_created()).await;
    let DispatchOutcome::DeadLettered {
        event_id,
        entry_id,
        attempts,
    } = outcome
    else {
        panic!("expected dead-lettering, got {outcome:?}");
    };
    assert_eq!(attempts, 3);
    assert_eq!(handler.calls(), 3);
    assert!(dispatcher.dedup().is_processed(&event_id));

    let entry = dispatcher.dead_letters().get_by_id(&entry_id).unwrap();
    assert_eq!(entry.event_name, "Order.created");
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.error.message, "ECONNRESET delivering Order.created (call 3)");
    assert!(entry.first_attempt_at <= entry.dead_lettered_at);

    let metadata = entry.metadata.unwrap();
    assert_eq!(metadata["event_id"], json!(event_id));
    assert_eq!(metadata["retry_history"].as_array().unwrap().len(), 3);

    // The processed marker survives, so upstream redelivery is suppressed.
    assert!(matches!(
        dispatcher.dispatch(order_created()).await,
        DispatchOutcome::Duplicate { .. }
    ));
    assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn test_redeliver_removes_entry_on_success() {
    let handler = Arc::new(FlakyHandler::new(0));
    handler.broken.store(true, Ordering::SeqCst);
    let dispatcher = dispatcher(handler.clone(), 1);

    let DispatchOutcome::DeadLettered { entry_id, .. } = dispatcher.dispatch(order_created()).await
    else {
        panic!("expected dead-lettering");
    };

    let still = dispatcher.redeliver(&entry_id).await.unwrap();
    match still {
        RedeliveryOutcome::StillFailing { attempts, error } => {
            assert_eq!(attempts, 2);
            assert!(error.message.starts_with("ECONNRESET"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(dispatcher.dead_letters().get_by_id(&entry_id).is_some());

    handler.broken.store(false, Ordering::SeqCst);
    let outcome = dispatcher.redeliver(&entry_id).await.unwrap();
    assert_eq!(outcome, RedeliveryOutcome::Redelivered { attempts: 1 });
    assert!(dispatcher.dead_letters().get_by_id(&entry_id).is_none());
    assert!(dispatcher.dead_letters().list(&DeadLetterQuery::default()).is_empty());
}

#[tokio::test]
async fn test_redeliver_unknown_entry_is_an_error() {
    let dispatcher = dispatcher(Arc::new(FlakyHandler::new(0)), 0);
    let err = dispatcher.redeliver("dlq_missing").await.unwrap_err();
    assert!(matches!(err, DispatcherError::DeadLetterNotFound(ref id) if id == "dlq_missing"));
}

#[tokio::test]
async fn test_concurrent_duplicate_dispatches_handle_once() {
    let handler = Arc::new(FlakyHandler::new(0));
    let dispatcher = Arc::new(dispatcher(handler.clone(), 0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move { dispatcher.dispatch(order_created()).await }));
    }

    let mut delivered = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), DispatchOutcome::Delivered { .. }) {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 1);
    assert_eq!(handler.calls(), 1);
}
