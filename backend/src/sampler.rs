//! Bucket sampling over a partitioned store.
//!
//! The store has no random-read primitive, so a sample is built by visiting a
//! random subset of buckets. Each bucket was filled with a roughly uniform
//! slice of all reviews at write time, so rows gathered from several random
//! buckets approximate a global random sample. Within a bucket a random
//! pagination skip picks a pseudo-random window before fetching.
//!
//! Per invocation: select buckets, then for each bucket count, optionally
//! skip, fetch; the accumulated rows go to the assembler.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::{index, SliceRandom};
use rand::Rng;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::filter::{FilterPredicate, RatingClass, RatingFilter};
use crate::store::{Cursor, PartitionedStore};
use crate::{Document, BUCKET_COUNT};

/// How rows are spread across the selected buckets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Strategy {
    /// Three buckets, each contributing `batch / 3 + 1` rows from a random window.
    EvenSplit,
    /// Five buckets, each contributing up to a full batch from a random
    /// window; the assembler subsamples the surplus.
    Oversample,
    /// Five buckets read from the start, drawing positive and negative rows
    /// towards separate targets until the batch is filled.
    RatioBalanced { positive_ratio: f64 },
}

impl Strategy {
    pub fn balanced() -> Self {
        Strategy::RatioBalanced {
            positive_ratio: 0.5,
        }
    }

    pub fn bucket_fanout(&self) -> usize {
        match self {
            Strategy::EvenSplit => 3,
            Strategy::Oversample | Strategy::RatioBalanced { .. } => 5,
        }
    }

    /// Rows requested from each bucket.
    pub fn per_bucket_target(&self, batch_size: usize, fanout: usize) -> usize {
        match self {
            Strategy::EvenSplit => batch_size / fanout.max(1) + 1,
            Strategy::Oversample | Strategy::RatioBalanced { .. } => batch_size,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::EvenSplit => "even-split",
            Strategy::Oversample => "oversample",
            Strategy::RatioBalanced { .. } => "ratio-balanced",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "even-split" | "even_split" | "evensplit" => Ok(Strategy::EvenSplit),
            "oversample" => Ok(Strategy::Oversample),
            "ratio-balanced" | "ratio_balanced" | "ratiobalanced" => Ok(Strategy::balanced()),
            other => Err(format!("unknown sampling strategy '{other}'")),
        }
    }
}

/// Positive and negative targets for a batch.
///
/// With no rating filter the batch is split by `positive_ratio`; a rating
/// filter hands the whole batch to its class.
pub fn balanced_targets(
    batch_size: usize,
    rating: RatingFilter,
    positive_ratio: f64,
) -> (usize, usize) {
    match rating {
        RatingFilter::Positive => (batch_size, 0),
        RatingFilter::Negative => (0, batch_size),
        RatingFilter::All => {
            let ratio = if positive_ratio.is_finite() {
                positive_ratio.clamp(0.0, 1.0)
            } else {
                0.5
            };
            let positive = ((batch_size as f64) * ratio).round() as usize;
            let positive = positive.min(batch_size);
            (positive, batch_size - positive)
        }
    }
}

/// Draws `count` distinct buckets from `1..=bucket_count`.
pub fn select_buckets<R: Rng + ?Sized>(bucket_count: u8, count: usize, rng: &mut R) -> Vec<u8> {
    let available = usize::from(bucket_count);
    index::sample(rng, available, count.min(available))
        .into_iter()
        .map(|i| i as u8 + 1)
        .collect()
}

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    pub strategy: Strategy,
    pub bucket_count: u8,
    /// Cap on store calls made by a single skip walk or fetch.
    pub max_skip_pages: usize,
    /// A bucket is not started once less than this much time is left.
    pub min_bucket_budget: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Oversample,
            bucket_count: BUCKET_COUNT,
            max_skip_pages: 64,
            min_bucket_budget: Duration::from_millis(50),
        }
    }
}

/// What happened to the selected buckets during one invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleReport {
    pub buckets: Vec<u8>,
    pub queried: usize,
    pub empty: usize,
    pub failed: usize,
    pub deadline_hit: bool,
}

impl SampleReport {
    pub fn visited(&self) -> usize {
        self.queried + self.empty + self.failed
    }

    /// Annotation for responses cut short by the deadline.
    pub fn partial_note(&self) -> Option<String> {
        self.deadline_hit.then(|| {
            format!(
                "deadline reached after {} of {} buckets; returning partial results",
                self.visited(),
                self.buckets.len()
            )
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct SampleOutcome {
    pub items: Vec<Document>,
    pub report: SampleReport,
}

pub struct BucketSampler {
    store: Arc<dyn PartitionedStore>,
    config: SamplerConfig,
}

impl BucketSampler {
    pub fn new(store: Arc<dyn PartitionedStore>, config: SamplerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PartitionedStore> {
        &self.store
    }

    /// Gathers candidate rows for a batch. Store failures only ever shrink
    /// the result; they are never returned.
    pub async fn sample<R: Rng + Send>(
        &self,
        batch_size: usize,
        filter: &FilterPredicate,
        deadline: Option<Instant>,
        rng: &mut R,
    ) -> SampleOutcome {
        let strategy = self.config.strategy;
        let fanout = strategy
            .bucket_fanout()
            .min(usize::from(self.config.bucket_count));
        let buckets = select_buckets(self.config.bucket_count, fanout, rng);
        let mut outcome = SampleOutcome {
            items: Vec::new(),
            report: SampleReport {
                buckets: buckets.clone(),
                ..SampleReport::default()
            },
        };
        if batch_size == 0 {
            return outcome;
        }

        debug!(
            strategy = strategy.name(),
            ?buckets,
            batch_size,
            index = self.store.index_name(),
            "sampling buckets"
        );
        match strategy {
            Strategy::RatioBalanced { positive_ratio } => {
                self.sample_balanced(
                    &buckets,
                    batch_size,
                    positive_ratio,
                    filter,
                    deadline,
                    rng,
                    &mut outcome,
                )
                .await
            }
            Strategy::EvenSplit | Strategy::Oversample => {
                let target = strategy.per_bucket_target(batch_size, fanout);
                self.sample_windows(&buckets, target, filter, deadline, rng, &mut outcome)
                    .await
            }
        }
        outcome
    }

    async fn sample_windows<R: Rng + Send>(
        &self,
        buckets: &[u8],
        target: usize,
        filter: &FilterPredicate,
        deadline: Option<Instant>,
        rng: &mut R,
        outcome: &mut SampleOutcome,
    ) {
        for &bucket in buckets {
            if self.out_of_time(deadline) {
                outcome.report.deadline_hit = true;
                break;
            }
            let Some(total) = self.count_bucket(bucket, filter, &mut outcome.report).await else {
                continue;
            };

            let start = self.random_start(bucket, filter, total, target, rng).await;
            match self.fetch(bucket, filter, target, start).await {
                Ok(rows) => {
                    outcome.report.queried += 1;
                    outcome.items.extend(rows);
                }
                Err(e) => {
                    warn!(bucket, error = %e, "error querying bucket, skipping it");
                    outcome.report.failed += 1;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn sample_balanced<R: Rng + Send>(
        &self,
        buckets: &[u8],
        batch_size: usize,
        positive_ratio: f64,
        filter: &FilterPredicate,
        deadline: Option<Instant>,
        rng: &mut R,
        outcome: &mut SampleOutcome,
    ) {
        let (mut want_positive, mut want_negative) =
            balanced_targets(batch_size, filter.rating, positive_ratio);

        for &bucket in buckets {
            if outcome.items.len() >= batch_size || want_positive + want_negative == 0 {
                break;
            }
            if self.out_of_time(deadline) {
                outcome.report.deadline_hit = true;
                break;
            }
            if self.count_bucket(bucket, filter, &mut outcome.report).await.is_none() {
                continue;
            }

            let rows = match self.fetch(bucket, filter, batch_size, None).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(bucket, error = %e, "error querying bucket, skipping it");
                    outcome.report.failed += 1;
                    continue;
                }
            };
            outcome.report.queried += 1;

            let mut positive = Vec::new();
            let mut negative = Vec::new();
            for row in rows {
                match RatingClass::of(&row) {
                    Some(RatingClass::Positive) => positive.push(row),
                    Some(RatingClass::Negative) => negative.push(row),
                    None => {}
                }
            }

            let drawn_positive = draw(positive, want_positive, rng);
            let drawn_negative = draw(negative, want_negative, rng);
            want_positive -= drawn_positive.len();
            want_negative -= drawn_negative.len();
            debug!(
                bucket,
                positive = drawn_positive.len(),
                negative = drawn_negative.len(),
                want_positive,
                want_negative,
                "balanced draw"
            );
            outcome.items.extend(drawn_positive);
            outcome.items.extend(drawn_negative);
        }
    }

    /// Matching rows in `bucket`, or `None` when the bucket should be skipped.
    async fn count_bucket(
        &self,
        bucket: u8,
        filter: &FilterPredicate,
        report: &mut SampleReport,
    ) -> Option<usize> {
        match self.store.count(bucket, filter).await {
            Ok(0) => {
                report.empty += 1;
                None
            }
            Ok(total) => Some(total),
            Err(e) => {
                warn!(bucket, error = %e, "error counting bucket, skipping it");
                report.failed += 1;
                None
            }
        }
    }

    /// Picks a random window start. Any failure degrades to the bucket start.
    async fn random_start<R: Rng + Send>(
        &self,
        bucket: u8,
        filter: &FilterPredicate,
        total: usize,
        target: usize,
        rng: &mut R,
    ) -> Option<Cursor> {
        let skip = rng.gen_range(0..=total.saturating_sub(target));
        if skip == 0 {
            return None;
        }
        match self.skip_rows(bucket, filter, skip).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(bucket, skip, error = %e, "error in random positioning, reading from bucket start");
                None
            }
        }
    }

    /// Walks the cursor `skip` matching rows forward, in store-sized pages.
    async fn skip_rows(
        &self,
        bucket: u8,
        filter: &FilterPredicate,
        skip: usize,
    ) -> Result<Option<Cursor>, StoreError> {
        let mut cursor: Option<Cursor> = None;
        let mut remaining = skip;
        for _ in 0..self.config.max_skip_pages {
            let page = self
                .store
                .query(bucket, filter, remaining, cursor.as_ref())
                .await?;
            remaining = remaining.saturating_sub(page.items.len());
            match page.next {
                Some(next) => cursor = Some(next),
                // Walked off the end of the bucket.
                None => return Ok(None),
            }
            if remaining == 0 {
                return Ok(cursor);
            }
        }
        debug!(bucket, skip, remaining, "skip walk hit page cap");
        Ok(cursor)
    }

    async fn fetch(
        &self,
        bucket: u8,
        filter: &FilterPredicate,
        target: usize,
        start: Option<Cursor>,
    ) -> Result<Vec<Document>, StoreError> {
        let mut rows = Vec::with_capacity(target);
        let mut cursor = start;
        for _ in 0..self.config.max_skip_pages.max(1) {
            let page = self
                .store
                .query(bucket, filter, target - rows.len(), cursor.as_ref())
                .await?;
            rows.extend(page.items);
            cursor = page.next;
            if rows.len() >= target || cursor.is_none() {
                break;
            }
        }
        Ok(rows)
    }

    fn out_of_time(&self, deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|deadline| {
            deadline.saturating_duration_since(Instant::now()) < self.config.min_bucket_budget
        })
    }
}

fn draw<R: Rng + ?Sized>(mut rows: Vec<Document>, count: usize, rng: &mut R) -> Vec<Document> {
    if rows.len() > count {
        rows.shuffle(rng);
        rows.truncate(count);
    }
    rows
}
