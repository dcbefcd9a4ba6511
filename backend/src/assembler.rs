//! Turns the rows gathered from buckets into the final ordered sample.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

use crate::{review_id, AppliedFilters, Document, SampleMetadata, SampleResponse};

/// Fields stored as numbers that must leave the service as integers.
pub const INTEGER_FIELDS: [&str; 3] = ["age", "rating", "randomBucket"];

/// Shuffles, drops repeated ids, truncates to `batch_size` and normalizes.
///
/// The result holds `min(batch_size, distinct rows)` documents; it is never
/// padded.
pub fn assemble<R: Rng + ?Sized>(
    items: Vec<Document>,
    batch_size: usize,
    rng: &mut R,
) -> Vec<Document> {
    let mut seen = HashSet::new();
    let mut items: Vec<Document> = items
        .into_iter()
        .filter(|doc| match review_id(doc) {
            Some(id) => seen.insert(id.to_string()),
            None => true,
        })
        .collect();

    items.shuffle(rng);
    items.truncate(batch_size);
    for doc in &mut items {
        normalize(doc);
    }
    items
}

/// Coerces float-valued integer fields by truncation. Idempotent.
pub fn normalize(document: &mut Document) {
    for field in INTEGER_FIELDS {
        if let Some(value) = document.get_mut(field) {
            if let Some(coerced) = coerce_integer(value) {
                *value = coerced;
            }
        }
    }
}

fn coerce_integer(value: &Value) -> Option<Value> {
    let Value::Number(n) = value else {
        return None;
    };
    if n.is_i64() || n.is_u64() {
        return None;
    }
    n.as_f64()
        .filter(|f| f.is_finite())
        .map(|f| Value::from(f.trunc() as i64))
}

/// Seconds rounded to three decimals.
pub fn query_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

impl SampleResponse {
    pub fn new(
        reviews: Vec<Document>,
        elapsed: Duration,
        filters: AppliedFilters,
        partial: Option<String>,
    ) -> Self {
        Self {
            metadata: SampleMetadata {
                count: reviews.len(),
                timestamp: Utc::now().to_rfc3339(),
                query_time: query_seconds(elapsed),
                filters,
                partial,
            },
            reviews,
        }
    }
}
