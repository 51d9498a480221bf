pub mod canonical;
pub mod normalize;
pub mod orchestrator;
pub mod scrape;
pub mod store;
pub mod types;

pub use canonical::CanonicalListing;
pub use normalize::normalize;
pub use orchestrator::IngestionOrchestrator;
pub use scrape::{ListingFetcher, ScraperClient, ScraperConfig};
pub use store::{CanonicalStore, MemoryStore, RawStore};
pub use types::{IngestionRecord, IngestionStatus};
