use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of one ingestion attempt. Transitions only move forward:
/// `Pending -> Processing -> {Success | Failed}`. A terminal record is
/// never revived in place; a retry creates a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl IngestionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, IngestionStatus::Success | IngestionStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_advance_to(self, next: IngestionStatus) -> bool {
        use IngestionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Success) | (Processing, Failed)
        )
    }
}

impl Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestionStatus::Pending => write!(f, "pending"),
            IngestionStatus::Processing => write!(f, "processing"),
            IngestionStatus::Success => write!(f, "success"),
            IngestionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One attempt to fetch and normalize a listing. Not the listing itself:
/// re-requesting the same listing produces a fresh record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub id: String,
    pub listing_locator: String,
    pub status: IngestionStatus,
    /// Raw scrape result, present only once the record reaches `Success`.
    pub payload: Option<Value>,
    /// Present only when the record reaches `Failed`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionRecord {
    pub fn new(listing_locator: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            listing_locator: listing_locator.into(),
            status: IngestionStatus::Pending,
            payload: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Display for IngestionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} — {}", self.status, self.id, self.listing_locator)?;
        if let Some(message) = &self.error_message {
            write!(f, " ({})", message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_permitted() {
        use IngestionStatus::*;
        assert!(Pending.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Success));
        assert!(Processing.can_advance_to(Failed));
    }

    #[test]
    fn terminal_states_admit_no_transition() {
        use IngestionStatus::*;
        for next in [Pending, Processing, Success, Failed] {
            assert!(!Success.can_advance_to(next));
            assert!(!Failed.can_advance_to(next));
        }
    }

    #[test]
    fn no_skipping_or_backwards_moves() {
        use IngestionStatus::*;
        assert!(!Pending.can_advance_to(Success));
        assert!(!Pending.can_advance_to(Failed));
        assert!(!Processing.can_advance_to(Pending));
        assert!(!Pending.can_advance_to(Pending));
    }

    #[test]
    fn new_record_starts_pending_without_payload() {
        let record = IngestionRecord::new("https://www.airbnb.com/rooms/12345");
        assert_eq!(record.status, IngestionStatus::Pending);
        assert!(record.payload.is_none());
        assert!(record.error_message.is_none());
        assert_eq!(record.created_at, record.updated_at);
        assert!(!record.id.is_empty());
    }
}
