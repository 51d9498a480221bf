//! Storage seams for ingestion records and canonical listings.
//!
//! The pipeline only needs single-row atomic updates keyed by record id and
//! upsert-by-key for canonical documents, so the traits stay that narrow.
//! `MemoryStore` is the in-process implementation used by the CLI and
//! tests; a durable backend implements the same two traits.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::canonical::CanonicalListing;
use crate::types::{IngestionRecord, IngestionStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RawStore: Send + Sync {
    /// Insert a freshly created record. The record must be visible to
    /// readers before this returns.
    async fn insert(&self, record: IngestionRecord) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<IngestionRecord>, StoreError>;

    /// Atomically advance one record's status, attaching the payload
    /// (success) or error message (failure).
    ///
    /// Returns `Ok(false)` without touching the record when the state
    /// machine refuses the transition, so duplicate background triggers
    /// against a terminal record degrade to no-ops.
    async fn update_status(
        &self,
        id: &str,
        status: IngestionStatus,
        payload: Option<Value>,
        error_message: Option<String>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Last-write-wins upsert keyed by listing identity; a second
    /// normalization of the same listing overwrites, never duplicates.
    async fn upsert(&self, listing_key: &str, doc: CanonicalListing) -> Result<(), StoreError>;

    async fn get(&self, listing_key: &str) -> Result<Option<CanonicalListing>, StoreError>;
}

/// In-memory store. Data is lost on restart; fine for the CLI and tests.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, IngestionRecord>>,
    listings: RwLock<HashMap<String, CanonicalListing>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().expect("records lock poisoned").len()
    }

    pub fn listing_count(&self) -> usize {
        self.listings.read().expect("listings lock poisoned").len()
    }
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn insert(&self, record: IngestionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<IngestionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .expect("records lock poisoned")
            .get(id)
            .cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: IngestionStatus,
        payload: Option<Value>,
        error_message: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !record.status.can_advance_to(status) {
            log::warn!(
                "Refusing transition {} -> {} for record {}",
                record.status,
                status,
                id
            );
            return Ok(false);
        }

        record.status = status;
        record.payload = payload;
        record.error_message = error_message;
        record.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn upsert(&self, listing_key: &str, doc: CanonicalListing) -> Result<(), StoreError> {
        self.listings
            .write()
            .expect("listings lock poisoned")
            .insert(listing_key.to_string(), doc);
        Ok(())
    }

    async fn get(&self, listing_key: &str) -> Result<Option<CanonicalListing>, StoreError> {
        Ok(self
            .listings
            .read()
            .expect("listings lock poisoned")
            .get(listing_key)
            .cloned())
    }
}
