use crate::error::StoreError;
use crate::filter::FilterPredicate;
use crate::{review_id, Document, BUCKET_COUNT};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Draws the partition for a newly written review. Every write path goes through here.
pub fn assign_bucket<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    rng.gen_range(1..=BUCKET_COUNT)
}

/// Position of a row inside its bucket: sorted by timestamp, ties broken by id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub timestamp: i64,
    pub review_id: String,
}

impl Cursor {
    fn of(document: &Document) -> Result<Self, StoreError> {
        let review_id = review_id(document)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StoreError::InvalidDocument("missing reviewId".into()))?;
        let timestamp = document
            .get("timestamp")
            .and_then(integer_value)
            .ok_or_else(|| StoreError::InvalidDocument(format!("{review_id}: missing timestamp")))?;
        Ok(Self {
            timestamp,
            review_id: review_id.to_string(),
        })
    }
}

/// One page of a bucket query. `next` is the resume point when rows remain.
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub items: Vec<Document>,
    pub next: Option<Cursor>,
}

/// A table with a secondary index on `randomBucket`.
///
/// `query` returns at most `limit` matching rows strictly after `resume`, and
/// may return fewer when the store's own page size is smaller.
#[async_trait]
pub trait PartitionedStore: Send + Sync {
    fn index_name(&self) -> &str;

    async fn query(
        &self,
        bucket: u8,
        filter: &FilterPredicate,
        limit: usize,
        resume: Option<&Cursor>,
    ) -> Result<Page, StoreError>;

    async fn count(&self, bucket: u8, filter: &FilterPredicate) -> Result<usize, StoreError>;

    /// Insert or overwrite by `reviewId`, returning the document as stored.
    /// A review keeps the `randomBucket` of its first write.
    async fn put(&self, document: Document) -> Result<Document, StoreError>;

    async fn bucket_sizes(&self) -> Result<Vec<(u8, usize)>, StoreError>;
}

struct TableState {
    buckets: Vec<BTreeMap<Cursor, Document>>,
    locations: HashMap<String, (u8, Cursor)>,
}

impl TableState {
    fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| BTreeMap::new()).collect(),
            locations: HashMap::new(),
        }
    }

    /// Bucket a write must land in: the one already holding `review_id`, if any.
    fn pin_bucket(&self, bucket: u8, review_id: &str, document: &mut Document) -> u8 {
        match self.locations.get(review_id) {
            Some((stored, _)) if *stored != bucket => {
                debug!(review_id, bucket, stored = *stored, "keeping existing bucket");
                document.insert("randomBucket".into(), Value::from(*stored));
                *stored
            }
            _ => bucket,
        }
    }

    fn insert(&mut self, bucket: u8, key: Cursor, document: Document) {
        if let Some((old_bucket, old_key)) = self.locations.remove(&key.review_id) {
            self.buckets[usize::from(old_bucket - 1)].remove(&old_key);
        }
        self.locations
            .insert(key.review_id.clone(), (bucket, key.clone()));
        self.buckets[usize::from(bucket - 1)].insert(key, document);
    }

    fn len(&self) -> usize {
        self.locations.len()
    }
}

// File-backed review table, indexed in memory by bucket
pub struct ReviewTable {
    path: Option<PathBuf>,
    index_name: String,
    page_size: usize,
    state: RwLock<TableState>,
}

impl ReviewTable {
    /// Opens `{data_dir}/{table_name}.jsonl`, creating the directory if needed.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        table_name: &str,
        index_name: &str,
        page_size: usize,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(format!("{table_name}.jsonl"));

        let table = Self {
            path: Some(path),
            index_name: index_name.to_string(),
            page_size: page_size.max(1),
            state: RwLock::new(TableState::new()),
        };
        table.load_from_disk().await?;
        Ok(table)
    }

    /// A table that never touches disk.
    pub fn in_memory(index_name: &str, page_size: usize) -> Self {
        Self {
            path: None,
            index_name: index_name.to_string(),
            page_size: page_size.max(1),
            state: RwLock::new(TableState::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // Load existing rows; later lines overwrite earlier ones with the same id
    async fn load_from_disk(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut state = self.state.write().await;
        let mut skipped = 0usize;
        for line in reader.split(b'\n') {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let parsed = serde_json::from_slice::<Document>(&line)
                .map_err(StoreError::from)
                .and_then(|doc| locate(&doc).map(|(bucket, key)| (bucket, key, doc)));
            match parsed {
                Ok((bucket, key, mut doc)) => {
                    let bucket = state.pin_bucket(bucket, &key.review_id, &mut doc);
                    state.insert(bucket, key, doc);
                }
                Err(e) => {
                    skipped += 1;
                    debug!(error = %e, "skipping unreadable review row");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, path = %path.display(), "skipped unreadable review rows");
        }
        info!(rows = state.len(), path = %path.display(), "loaded review table");
        Ok(())
    }

    fn append_to_disk(&self, document: &Document) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(document)?)?;
        Ok(())
    }
}

fn check_bucket(bucket: u8) -> Result<usize, StoreError> {
    if (1..=BUCKET_COUNT).contains(&bucket) {
        Ok(usize::from(bucket - 1))
    } else {
        Err(StoreError::InvalidBucket(bucket))
    }
}

fn locate(document: &Document) -> Result<(u8, Cursor), StoreError> {
    let key = Cursor::of(document)?;
    let bucket = document
        .get("randomBucket")
        .and_then(integer_value)
        .ok_or_else(|| {
            StoreError::InvalidDocument(format!("{}: missing randomBucket", key.review_id))
        })?;
    let bucket = u8::try_from(bucket).map_err(|_| {
        StoreError::InvalidDocument(format!("{}: randomBucket {bucket} out of range", key.review_id))
    })?;
    check_bucket(bucket)?;
    Ok((bucket, key))
}

fn integer_value(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.trunc() as i64))
}

#[async_trait]
impl PartitionedStore for ReviewTable {
    fn index_name(&self) -> &str {
        &self.index_name
    }

    async fn query(
        &self,
        bucket: u8,
        filter: &FilterPredicate,
        limit: usize,
        resume: Option<&Cursor>,
    ) -> Result<Page, StoreError> {
        let slot = check_bucket(bucket)?;
        let cap = limit.min(self.page_size);
        if cap == 0 {
            return Ok(Page {
                items: Vec::new(),
                next: resume.cloned(),
            });
        }

        let state = self.state.read().await;
        let lower = match resume {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Unbounded,
        };
        let mut rows = state.buckets[slot].range((lower, Bound::Unbounded));

        let mut items = Vec::with_capacity(cap);
        let mut last = None;
        for (key, document) in rows.by_ref() {
            if filter.matches(document) {
                items.push(document.clone());
                last = Some(key);
                if items.len() == cap {
                    break;
                }
            }
        }
        let more = items.len() == cap && rows.next().is_some();
        Ok(Page {
            items,
            next: if more { last.cloned() } else { None },
        })
    }

    async fn count(&self, bucket: u8, filter: &FilterPredicate) -> Result<usize, StoreError> {
        let slot = check_bucket(bucket)?;
        let state = self.state.read().await;
        if filter.is_unfiltered() {
            return Ok(state.buckets[slot].len());
        }
        Ok(state.buckets[slot]
            .values()
            .filter(|document| filter.matches(document))
            .count())
    }

    async fn put(&self, mut document: Document) -> Result<Document, StoreError> {
        let (bucket, key) = locate(&document)?;
        // Hold the write lock across the append so file order matches memory order
        let mut state = self.state.write().await;
        let bucket = state.pin_bucket(bucket, &key.review_id, &mut document);
        self.append_to_disk(&document)?;
        state.insert(bucket, key, document.clone());
        Ok(document)
    }

    async fn bucket_sizes(&self) -> Result<Vec<(u8, usize)>, StoreError> {
        let state = self.state.read().await;
        Ok((1..=BUCKET_COUNT)
            .zip(state.buckets.iter().map(BTreeMap::len))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RatingFilter;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn row(id: &str, ts: i64, bucket: u8, rating: i64) -> Document {
        serde_json::from_value(json!({
            "reviewId": id,
            "timestamp": ts,
            "randomBucket": bucket,
            "rating": rating,
            "department": if rating >= 4 { "Tops" } else { "Dresses" },
        }))
        .unwrap()
    }

    async fn seeded(page_size: usize) -> ReviewTable {
        let table = ReviewTable::in_memory("RandomAccessIndex", page_size);
        for i in 0..10 {
            table
                .put(row(&format!("r{i}"), 100 + i, 3, if i % 2 == 0 { 5 } else { 2 }))
                .await
                .unwrap();
        }
        table.put(row("other", 1, 4, 5)).await.unwrap();
        table
    }

    #[test]
    fn assigned_buckets_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = [false; BUCKET_COUNT as usize];
        for _ in 0..500 {
            let bucket = assign_bucket(&mut rng);
            assert!((1..=BUCKET_COUNT).contains(&bucket));
            seen[usize::from(bucket - 1)] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
    }

    #[tokio::test]
    async fn query_pages_through_a_bucket_in_order() {
        let table = seeded(3).await;
        let all = FilterPredicate::all();

        let mut ids = Vec::new();
        let mut cursor: Option<Cursor> = None;
        let mut calls = 0;
        loop {
            let page = table.query(3, &all, 100, cursor.as_ref()).await.unwrap();
            assert!(page.items.len() <= 3);
            ids.extend(page.items.iter().map(|d| review_id(d).unwrap().to_string()));
            calls += 1;
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(calls, 4);
        let expected: Vec<String> = (0..10).map(|i| format!("r{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn filtered_query_and_count_agree() {
        let table = seeded(100).await;
        let positive = FilterPredicate::new(RatingFilter::Positive, "all");

        assert_eq!(table.count(3, &positive).await.unwrap(), 5);
        let page = table.query(3, &positive, 100, None).await.unwrap();
        assert_eq!(page.items.len(), 5);
        assert!(page.next.is_none());

        let limited = table.query(3, &positive, 2, None).await.unwrap();
        assert_eq!(limited.items.len(), 2);
        assert!(limited.next.is_some());

        assert_eq!(table.count(7, &positive).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_out_of_range_buckets_and_bad_rows() {
        let table = ReviewTable::in_memory("idx", 10);
        let all = FilterPredicate::all();
        assert!(matches!(
            table.count(0, &all).await,
            Err(StoreError::InvalidBucket(0))
        ));
        assert!(matches!(
            table.query(11, &all, 1, None).await,
            Err(StoreError::InvalidBucket(11))
        ));
        let missing_bucket: Document =
            serde_json::from_value(json!({"reviewId": "x", "timestamp": 1})).unwrap();
        assert!(matches!(
            table.put(missing_bucket).await,
            Err(StoreError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn overwrite_keeps_the_first_bucket() {
        let table = ReviewTable::in_memory("idx", 10);
        table.put(row("same", 1, 2, 5)).await.unwrap();
        let stored = table.put(row("same", 2, 6, 1)).await.unwrap();

        assert_eq!(stored["randomBucket"], json!(2));
        assert_eq!(table.len().await, 1);
        let sizes = table.bucket_sizes().await.unwrap();
        assert_eq!(sizes[1], (2, 1));
        assert_eq!(sizes[5], (6, 0));

        let page = table.query(2, &FilterPredicate::all(), 10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["rating"], json!(1));
        assert_eq!(page.items[0]["timestamp"], json!(2));
    }

    #[tokio::test]
    async fn reopen_keeps_the_first_bucket_of_a_rewritten_row() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("reviews.jsonl"),
            concat!(
                r#"{"reviewId":"x","timestamp":1,"randomBucket":2}"#,
                "\n",
                r#"{"reviewId":"x","timestamp":1,"randomBucket":7,"rating":3}"#,
                "\n",
            ),
        )
        .unwrap();

        let table = ReviewTable::open(dir.path(), "reviews", "idx", 10)
            .await
            .unwrap();
        assert_eq!(table.len().await, 1);
        assert_eq!(table.count(2, &FilterPredicate::all()).await.unwrap(), 1);
        assert_eq!(table.count(7, &FilterPredicate::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reopen_skips_unreadable_rows() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = ReviewTable::open(dir.path(), "reviews", "idx", 10)
                .await
                .unwrap();
            table.put(row("a", 1, 1, 5)).await.unwrap();
            table.put(row("b", 2, 1, 2)).await.unwrap();
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("reviews.jsonl"))
            .and_then(|mut f| {
                writeln!(f, "not json")?;
                f.write_all(&[0xff, 0xfe, b'\n'])
            })
            .unwrap();

        let reopened = ReviewTable::open(dir.path(), "reviews", "idx", 10)
            .await
            .unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(
            reopened.count(1, &FilterPredicate::all()).await.unwrap(),
            2
        );
    }
}
