use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod api;
pub mod assembler;
pub mod config;
pub mod error;
pub mod filter;
pub mod sampler;
pub mod sentiment;
pub mod store;

pub use error::{ApiError, ConfigError, FeedbackError, StoreError};
pub use filter::{FilterPredicate, RatingFilter};
pub use sampler::{BucketSampler, SamplerConfig, Strategy};
pub use store::{PartitionedStore, ReviewTable};

/// Number of random buckets every review is spread across.
pub const BUCKET_COUNT: u8 = 10;
/// Largest batch a single sampling request may ask for.
pub const MAX_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_SIZE: usize = 20;
/// Ratings at or above this value count as positive.
pub const POSITIVE_RATING_THRESHOLD: i64 = 4;

/// A stored review as an attribute map, the shape the table hands back.
pub type Document = Map<String, Value>;

pub fn review_id(document: &Document) -> Option<&str> {
    document.get("reviewId").and_then(Value::as_str)
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SampleRequest {
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_filter")]
    pub rating_filter: String,
    #[serde(default = "default_filter")]
    pub department_filter: String,
}

fn default_batch_size() -> i64 {
    DEFAULT_BATCH_SIZE as i64
}

fn default_filter() -> String {
    "all".to_string()
}

impl Default for SampleRequest {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            rating_filter: default_filter(),
            department_filter: default_filter(),
        }
    }
}

impl SampleRequest {
    /// Requested batch size clamped to `[0, MAX_BATCH_SIZE]`.
    pub fn batch_size(&self) -> usize {
        self.batch_size.clamp(0, MAX_BATCH_SIZE as i64) as usize
    }

    pub fn predicate(&self) -> FilterPredicate {
        FilterPredicate::new(
            RatingFilter::parse(&self.rating_filter),
            &self.department_filter,
        )
    }

    pub fn filters(&self) -> AppliedFilters {
        AppliedFilters {
            rating_filter: self.rating_filter.clone(),
            department_filter: self.department_filter.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedFilters {
    pub rating_filter: String,
    pub department_filter: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SampleMetadata {
    pub count: usize,
    pub timestamp: String,
    pub query_time: f64,
    pub filters: AppliedFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SampleResponse {
    pub reviews: Vec<Document>,
    pub metadata: SampleMetadata,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResponse {
    pub message: String,
    pub processed_count: usize,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FeedbackFailure>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackFailure {
    pub review_id: String,
    pub error: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BucketStats {
    pub bucket: u8,
    pub count: usize,
}
