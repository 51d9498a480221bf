//! Composes scraper, state machine and stores into the ingestion pipeline.
//!
//! `start_ingestion` inserts a pending record and spawns the continuation
//! as an explicit tokio task whose outcome is always written back through
//! the state machine. Each ingestion is one independent task; records never
//! share mutable state beyond the keyed stores.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::normalize::normalize;
use crate::scrape::ListingFetcher;
use crate::store::{CanonicalStore, RawStore, StoreError};
use crate::types::{IngestionRecord, IngestionStatus};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("listing locator must not be empty")]
    EmptyLocator,
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct IngestionOrchestrator {
    raw_store: Arc<dyn RawStore>,
    canonical_store: Arc<dyn CanonicalStore>,
    fetcher: Arc<dyn ListingFetcher>,
    /// Handles of continuations still in flight. Each continuation removes
    /// its own entry when it finishes, so embedders that only ever poll do
    /// not accumulate finished handles.
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl IngestionOrchestrator {
    pub fn new(
        raw_store: Arc<dyn RawStore>,
        canonical_store: Arc<dyn CanonicalStore>,
        fetcher: Arc<dyn ListingFetcher>,
    ) -> Self {
        Self {
            raw_store,
            canonical_store,
            fetcher,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a pending record for `locator` and schedule the
    /// scrape-and-normalize continuation without blocking the caller.
    ///
    /// The record is inserted before the task is spawned, so pollers can
    /// observe it immediately; the continuation runs exactly once per call.
    pub async fn start_ingestion(&self, locator: &str) -> Result<String, IngestError> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(IngestError::EmptyLocator);
        }

        let record = IngestionRecord::new(locator);
        let id = record.id.clone();
        self.raw_store.insert(record).await?;
        log::info!("Created ingestion record {} for '{}'", id, locator);

        let raw_store = Arc::clone(&self.raw_store);
        let canonical_store = Arc::clone(&self.canonical_store);
        let fetcher = Arc::clone(&self.fetcher);
        let tasks = Arc::clone(&self.tasks);
        let task_id = id.clone();
        let cleanup_id = id.clone();
        let task_locator = locator.to_string();

        // Hold the map lock across the spawn so the continuation's own
        // cleanup cannot run before its handle is inserted.
        let mut guard = self.tasks.lock().await;
        let handle = tokio::spawn(async move {
            run_ingestion(raw_store, canonical_store, fetcher, task_id, task_locator).await;
            tasks.lock().await.remove(&cleanup_id);
        });
        guard.insert(id.clone(), handle);
        drop(guard);

        Ok(id)
    }

    /// Number of continuations still tracked.
    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Read-only status lookup. Callers re-poll on `pending`/`processing`
    /// until a terminal state appears; there is no push channel.
    pub async fn poll_status(&self, record_id: &str) -> Result<IngestionRecord, IngestError> {
        self.raw_store
            .get(record_id)
            .await?
            .ok_or_else(|| IngestError::RecordNotFound(record_id.to_string()))
    }

    /// Await the background continuation for a record. Lets the CLI and
    /// tests wait for the terminal state deterministically instead of
    /// sleeping.
    pub async fn join_ingestion(&self, record_id: &str) {
        let handle = self.tasks.lock().await.remove(record_id);
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            log::error!("Ingestion task for {} panicked: {}", record_id, e);
        }
    }
}

/// The continuation: processing -> scrape -> terminal state, then
/// normalization on success. Store failures are logged, never panicked on;
/// a record stuck in `processing` after a store failure is the documented
/// trade-off.
async fn run_ingestion(
    raw_store: Arc<dyn RawStore>,
    canonical_store: Arc<dyn CanonicalStore>,
    fetcher: Arc<dyn ListingFetcher>,
    id: String,
    locator: String,
) {
    match raw_store
        .update_status(&id, IngestionStatus::Processing, None, None)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            // Someone already moved this record; this trigger is a duplicate.
            log::warn!("Record {} was not pending, skipping ingestion", id);
            return;
        }
        Err(e) => {
            log::error!("Failed to mark record {} processing: {}", id, e);
            return;
        }
    }

    let payload = match fetcher.fetch_listing(&locator).await {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("Scrape failed for '{}': {}", locator, e);
            if let Err(store_err) = raw_store
                .update_status(&id, IngestionStatus::Failed, None, Some(e.to_string()))
                .await
            {
                log::error!("Failed to record scrape failure for {}: {}", id, store_err);
            }
            return;
        }
    };

    match raw_store
        .update_status(
            &id,
            IngestionStatus::Success,
            Some(payload.clone()),
            None,
        )
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            log::warn!("Record {} already terminal, dropping scrape result", id);
            return;
        }
        Err(e) => {
            log::error!("Failed to record scrape success for {}: {}", id, e);
            return;
        }
    }

    // The raw record stays `success` whatever happens below; re-running
    // normalization only affects the canonical store.
    match normalize(&payload) {
        Ok(doc) => {
            if let Err(e) = canonical_store.upsert(&locator, doc).await {
                log::error!("Canonical upsert failed for '{}': {}", locator, e);
            } else {
                log::info!("Upserted canonical listing for '{}'", locator);
            }
        }
        Err(e) => {
            log::error!(
                "Normalization failed for record {} ('{}'): {}",
                id,
                locator,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::ScrapeError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned fetcher: one fixed outcome per construction, call-counted.
    struct MockFetcher {
        outcome: Result<Value, String>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn success(payload: Value) -> Self {
            Self {
                outcome: Ok(payload),
                calls: AtomicUsize::new(0),
            }
        }

        fn failure(message: &str) -> Self {
            Self {
                outcome: Err(message.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ListingFetcher for MockFetcher {
        async fn fetch_listing(&self, _locator: &str) -> Result<Value, ScrapeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Ok(payload) => Ok(payload.clone()),
                Err(message) => Err(ScrapeError::Upstream(message.clone())),
            }
        }
    }

    fn orchestrator_with(
        fetcher: Arc<MockFetcher>,
    ) -> (IngestionOrchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = IngestionOrchestrator::new(
            store.clone() as Arc<dyn RawStore>,
            store.clone() as Arc<dyn CanonicalStore>,
            fetcher,
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn empty_locator_is_rejected() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MockFetcher::success(json!({}))));
        assert!(matches!(
            orchestrator.start_ingestion("   ").await,
            Err(IngestError::EmptyLocator)
        ));
    }

    #[tokio::test]
    async fn record_is_visible_before_the_continuation_finishes() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MockFetcher::success(json!({}))));
        let id = orchestrator.start_ingestion("listing-42").await.expect("start");

        // Whatever the continuation has done so far, the record exists.
        let record = orchestrator.poll_status(&id).await.expect("poll");
        assert_eq!(record.listing_locator, "listing-42");
    }

    #[tokio::test]
    async fn successful_scrape_normalizes_and_upserts() {
        let payload = json!({
            "id": "7421337",
            "title": "Sunny loft",
            "price": { "breakDown": { "total": { "price": "$492.62" } } },
        });
        let fetcher = Arc::new(MockFetcher::success(payload));
        let (orchestrator, store) = orchestrator_with(fetcher.clone());

        let id = orchestrator.start_ingestion("listing-42").await.expect("start");
        orchestrator.join_ingestion(&id).await;

        let record = orchestrator.poll_status(&id).await.expect("poll");
        assert_eq!(record.status, IngestionStatus::Success);
        assert!(record.payload.is_some());
        assert!(record.error_message.is_none());
        assert_eq!(fetcher.call_count(), 1);

        let doc = CanonicalStore::get(store.as_ref(), "listing-42")
            .await
            .expect("get")
            .expect("canonical listing upserted");
        assert_eq!(doc.identity.id, "7421337");
        assert_eq!(doc.price.total, 492.62);
    }

    #[tokio::test]
    async fn minimal_payload_still_produces_a_total_document() {
        let fetcher = Arc::new(MockFetcher::success(json!({ "title": "X" })));
        let (orchestrator, store) = orchestrator_with(fetcher);

        let id = orchestrator.start_ingestion("listing-7").await.expect("start");
        orchestrator.join_ingestion(&id).await;

        let doc = CanonicalStore::get(store.as_ref(), "listing-7")
            .await
            .expect("get")
            .expect("canonical listing upserted");
        assert!(doc.amenities.values().all(Vec::is_empty));
        assert_eq!(doc.amenities.len(), crate::canonical::AMENITY_CATEGORIES.len());
        assert_eq!(doc.price.total, 0.0);
    }

    #[tokio::test]
    async fn scrape_failure_records_message_and_skips_normalization() {
        let fetcher = Arc::new(MockFetcher::failure("scraper unreachable on both transports"));
        let (orchestrator, store) = orchestrator_with(fetcher);

        let id = orchestrator.start_ingestion("listing-42").await.expect("start");
        orchestrator.join_ingestion(&id).await;

        let record = orchestrator.poll_status(&id).await.expect("poll");
        assert_eq!(record.status, IngestionStatus::Failed);
        assert!(record.payload.is_none());
        let message = record.error_message.expect("failure message recorded");
        assert!(!message.is_empty());
        assert!(message.contains("scraper unreachable"));

        assert!(
            CanonicalStore::get(store.as_ref(), "listing-42")
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn normalization_failure_leaves_raw_record_success() {
        // Structurally broken payload: not a document.
        let fetcher = Arc::new(MockFetcher::success(json!(["not", "a", "document"])));
        let (orchestrator, store) = orchestrator_with(fetcher);

        let id = orchestrator.start_ingestion("listing-42").await.expect("start");
        orchestrator.join_ingestion(&id).await;

        let record = orchestrator.poll_status(&id).await.expect("poll");
        assert_eq!(record.status, IngestionStatus::Success);
        assert!(
            CanonicalStore::get(store.as_ref(), "listing-42")
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn terminal_record_is_frozen_across_polls() {
        let fetcher = Arc::new(MockFetcher::failure("boom"));
        let (orchestrator, _) = orchestrator_with(fetcher);

        let id = orchestrator.start_ingestion("listing-42").await.expect("start");
        orchestrator.join_ingestion(&id).await;

        let first = orchestrator.poll_status(&id).await.expect("poll");
        let second = orchestrator.poll_status(&id).await.expect("poll");
        assert_eq!(first.status, IngestionStatus::Failed);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn duplicate_ingestions_make_independent_records() {
        let payload = json!({ "id": "99", "title": "Twice" });
        let fetcher = Arc::new(MockFetcher::success(payload));
        let (orchestrator, store) = orchestrator_with(fetcher.clone());

        let first = orchestrator.start_ingestion("listing-99").await.expect("start");
        let second = orchestrator.start_ingestion("listing-99").await.expect("start");
        assert_ne!(first, second);

        orchestrator.join_ingestion(&first).await;
        orchestrator.join_ingestion(&second).await;

        assert_eq!(store.record_count(), 2);
        // Last write wins on the canonical side; one row per identity.
        assert_eq!(store.listing_count(), 1);
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn finished_continuations_drop_their_handles() {
        let fetcher = Arc::new(MockFetcher::success(json!({ "id": "1" })));
        let (orchestrator, _) = orchestrator_with(fetcher);

        // Poll-only embedder: lots of ingestions, never a join.
        let mut ids = Vec::new();
        for i in 0..50 {
            let locator = format!("listing-{}", i);
            ids.push(orchestrator.start_ingestion(&locator).await.expect("start"));
        }
        for id in &ids {
            loop {
                let record = orchestrator.poll_status(id).await.expect("poll");
                if record.status.is_terminal() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        }

        // Each continuation removes its own entry once done.
        for _ in 0..500 {
            if orchestrator.task_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(orchestrator.task_count().await, 0);
    }

    #[tokio::test]
    async fn polling_an_unknown_record_is_an_error() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MockFetcher::success(json!({}))));
        assert!(matches!(
            orchestrator.poll_status("no-such-record").await,
            Err(IngestError::RecordNotFound(_))
        ));
    }
}
