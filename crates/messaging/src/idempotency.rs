//! Idempotent-consumption guard.
//!
//! At-least-once delivery means every consumer must tolerate duplicates.
//! The guard records a `(consumer, event_id)` marker before running the
//! side effect; losing the insert race means another delivery of the same
//! event already ran it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::EventId;
use tokio::sync::RwLock;

use crate::error::{MessagingError, Result};

/// Outcome of running an effect under the guard.
#[derive(Debug)]
pub enum IdempotencyOutcome<T> {
    /// The effect ran; this was the first delivery of the event.
    Fresh(T),
    /// The event was already processed by this consumer; the effect was
    /// not invoked. A normal outcome, not an error.
    Duplicate,
}

impl<T> IdempotencyOutcome<T> {
    /// Returns true if the event had already been processed.
    pub fn already_processed(&self) -> bool {
        matches!(self, IdempotencyOutcome::Duplicate)
    }

    /// Extracts the effect result, if the effect ran.
    pub fn into_inner(self) -> Option<T> {
        match self {
            IdempotencyOutcome::Fresh(value) => Some(value),
            IdempotencyOutcome::Duplicate => None,
        }
    }
}

/// Durable record of processed event ids, one per consumer.
///
/// Uniqueness of `(consumer, event_id)` is the store's responsibility
/// (a constraint, not application logic), so concurrent delivery retries
/// lose the race safely.
#[async_trait]
pub trait ProcessedStore: Send + Sync {
    /// Atomically creates the marker. Returns `false` if it already
    /// existed.
    async fn insert(&self, consumer: &str, event_id: EventId) -> Result<bool>;

    /// Removes a marker, releasing the event for reprocessing.
    async fn remove(&self, consumer: &str, event_id: EventId) -> Result<()>;
}

/// Runs `effect` at most once per `(consumer, event_id)`.
///
/// The marker is inserted *before* the effect so that concurrent retries
/// dedup correctly, but it is rolled back if the effect fails: a handler
/// error must not permanently mask the event from broker-level
/// redelivery. Only a completed effect leaves a marker behind.
pub async fn with_idempotency<S, F, Fut, T, E>(
    store: &S,
    consumer: &str,
    event_id: EventId,
    effect: F,
) -> std::result::Result<IdempotencyOutcome<T>, E>
where
    S: ProcessedStore + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<MessagingError>,
{
    if !store.insert(consumer, event_id).await? {
        return Ok(IdempotencyOutcome::Duplicate);
    }

    match effect().await {
        Ok(value) => Ok(IdempotencyOutcome::Fresh(value)),
        Err(err) => {
            if let Err(remove_err) = store.remove(consumer, event_id).await {
                tracing::error!(
                    consumer,
                    %event_id,
                    error = %remove_err,
                    "failed to roll back idempotency marker; event may be stuck as processed"
                );
            }
            Err(err)
        }
    }
}

/// In-memory processed-marker store for tests and single-process wiring.
#[derive(Clone, Default)]
pub struct InMemoryProcessedStore {
    markers: Arc<RwLock<HashSet<(String, EventId)>>>,
}

impl InMemoryProcessedStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of markers currently held.
    pub async fn marker_count(&self) -> usize {
        self.markers.read().await.len()
    }
}

#[async_trait]
impl ProcessedStore for InMemoryProcessedStore {
    async fn insert(&self, consumer: &str, event_id: EventId) -> Result<bool> {
        Ok(self
            .markers
            .write()
            .await
            .insert((consumer.to_string(), event_id)))
    }

    async fn remove(&self, consumer: &str, event_id: EventId) -> Result<()> {
        self.markers
            .write()
            .await
            .remove(&(consumer.to_string(), event_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn effect_runs_at_most_once() {
        let store = InMemoryProcessedStore::new();
        let event_id = EventId::new();
        let calls = AtomicU32::new(0);

        let first: std::result::Result<_, MessagingError> =
            with_idempotency(&store, "svc", event_id, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await;
        let first = first.unwrap();
        assert!(!first.already_processed());
        assert_eq!(first.into_inner(), Some(42));

        let second: std::result::Result<IdempotencyOutcome<i32>, MessagingError> =
            with_idempotency(&store, "svc", event_id, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await;
        assert!(second.unwrap().already_processed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_consumers_process_independently() {
        let store = InMemoryProcessedStore::new();
        let event_id = EventId::new();

        for consumer in ["inventory", "payment"] {
            let outcome: std::result::Result<_, MessagingError> =
                with_idempotency(&store, consumer, event_id, || async { Ok(()) }).await;
            assert!(!outcome.unwrap().already_processed());
        }
        assert_eq!(store.marker_count().await, 2);
    }

    #[tokio::test]
    async fn failed_effect_releases_marker_for_retry() {
        let store = InMemoryProcessedStore::new();
        let event_id = EventId::new();
        let calls = AtomicU32::new(0);

        let attempt = with_idempotency(&store, "svc", event_id, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), MessagingError>(MessagingError::Broker("boom".into()))
        })
        .await;
        assert!(attempt.is_err());
        assert_eq!(store.marker_count().await, 0);

        // Redelivery retries the genuinely failed work.
        let retry: std::result::Result<_, MessagingError> =
            with_idempotency(&store, "svc", event_id, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(!retry.unwrap().already_processed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.marker_count().await, 1);
    }
}
