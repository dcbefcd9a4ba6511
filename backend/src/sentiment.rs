use crate::error::FeedbackError;
use crate::store::{assign_bucket, PartitionedStore};
use crate::{Document, FeedbackFailure, BUCKET_COUNT};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const SOURCE_TAG: &str = "review-analysis";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

/// Confidence per label; the four scores sum to 1.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SentimentScore {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
    pub mixed: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SentimentAnalysis {
    pub label: SentimentLabel,
    pub scores: SentimentScore,
}

pub trait SentimentAnalyzer: Send + Sync {
    fn detect_sentiment(&self, text: &str) -> Result<SentimentAnalysis, FeedbackError>;
    fn detect_key_phrases(&self, text: &str) -> Result<Vec<String>, FeedbackError>;
}

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "amazing", "love", "perfect", "best", "beautiful", "comfortable",
    "cute", "flattering", "soft", "gorgeous", "nice", "happy", "recommend", "fits",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "hate", "worst", "horrible", "poor", "cheap", "disappointed",
    "disappointing", "itchy", "unflattering", "returned", "return", "ugly", "scratchy", "tight",
];
const NEGATIONS: &[&str] = &["not", "no", "never", "dont", "didnt", "isnt", "wasnt", "doesnt"];
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "is", "are", "was", "were", "be", "been", "it", "its",
    "this", "that", "i", "me", "my", "we", "you", "she", "he", "they", "to", "of", "in", "on",
    "for", "with", "at", "as", "so", "very", "too", "just", "not", "no", "really", "have", "has",
    "had", "do", "does", "did", "would", "could", "will", "if", "than", "then", "also", "am",
];
const MAX_PHRASE_WORDS: usize = 3;

// Word-list analyzer standing in for a hosted NLP service
#[derive(Debug, Default, Clone)]
pub struct LexiconAnalyzer;

impl LexiconAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn clean(text: &str) -> String {
        text.to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect()
    }

    // Counts lexicon hits, flipping polarity after a negation word
    fn polarity_hits(&self, words: &[&str]) -> (usize, usize) {
        let mut positive = 0;
        let mut negative = 0;
        for (i, word) in words.iter().enumerate() {
            let negated = i > 0 && NEGATIONS.contains(&words[i - 1]);
            let (is_pos, is_neg) = (POSITIVE_WORDS.contains(word), NEGATIVE_WORDS.contains(word));
            match (is_pos, is_neg, negated) {
                (true, _, false) | (_, true, true) => positive += 1,
                (true, _, true) | (_, true, false) => negative += 1,
                _ => {}
            }
        }
        (positive, negative)
    }
}

impl SentimentAnalyzer for LexiconAnalyzer {
    fn detect_sentiment(&self, text: &str) -> Result<SentimentAnalysis, FeedbackError> {
        let cleaned = Self::clean(text);
        let words: Vec<&str> = cleaned.split_whitespace().collect();
        if words.is_empty() {
            return Err(FeedbackError::Analysis("text is empty".into()));
        }

        let (pos, neg) = self.polarity_hits(&words);
        let positive = pos as f64;
        let negative = neg as f64;
        let mixed = if pos > 0 && neg > 0 {
            pos.min(neg) as f64 * 1.5
        } else {
            0.0
        };
        let neutral = 0.5;
        let total = positive + negative + mixed + neutral;
        let scores = SentimentScore {
            positive: positive / total,
            negative: negative / total,
            neutral: neutral / total,
            mixed: mixed / total,
        };

        let label = [
            (SentimentLabel::Positive, scores.positive),
            (SentimentLabel::Negative, scores.negative),
            (SentimentLabel::Mixed, scores.mixed),
            (SentimentLabel::Neutral, scores.neutral),
        ]
        .into_iter()
        .fold((SentimentLabel::Neutral, f64::MIN), |best, candidate| {
            if candidate.1 > best.1 {
                candidate
            } else {
                best
            }
        })
        .0;

        Ok(SentimentAnalysis { label, scores })
    }

    fn detect_key_phrases(&self, text: &str) -> Result<Vec<String>, FeedbackError> {
        let mut phrases: Vec<String> = Vec::new();
        let lowered = text.to_lowercase();
        for clause in lowered.split(|c: char| ".,;:!?()\n".contains(c)) {
            let mut run: Vec<&str> = Vec::new();
            for word in clause
                .split_whitespace()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                .filter(|w| !w.is_empty())
            {
                if STOPWORDS.contains(&word) {
                    flush_phrase(&mut run, &mut phrases);
                } else {
                    run.push(word);
                }
            }
            flush_phrase(&mut run, &mut phrases);
        }
        Ok(phrases)
    }
}

// Emits a run of content words as phrases of at most MAX_PHRASE_WORDS words
fn flush_phrase(run: &mut Vec<&str>, phrases: &mut Vec<String>) {
    for chunk in run.chunks(MAX_PHRASE_WORDS) {
        let phrase = chunk.join(" ");
        if (chunk.len() > 1 || phrase.len() > 2) && !phrases.contains(&phrase) {
            phrases.push(phrase);
        }
    }
    run.clear();
}

/// Search-engine side of the enrichment path. Indexing is idempotent per `reviewId`.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn index(&self, document: &Document) -> Result<(), FeedbackError>;
}

// Append-only JSON lines index keeping the latest document per id
pub struct JsonlIndex {
    path: Option<PathBuf>,
    documents: RwLock<HashMap<String, Document>>,
}

impl JsonlIndex {
    /// Opens the index file, replaying it so the latest line per id wins.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FeedbackError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FeedbackError::Index(e.to_string()))?;
        }
        let documents = if path.exists() {
            Self::replay(&path)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Some(path),
            documents: RwLock::new(documents),
        })
    }

    fn replay(path: &Path) -> Result<HashMap<String, Document>, FeedbackError> {
        let file = File::open(path).map_err(|e| FeedbackError::Index(e.to_string()))?;
        let mut documents = HashMap::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).split(b'\n') {
            let line = line.map_err(|e| FeedbackError::Index(e.to_string()))?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Document>(&line) {
                Ok(document) => match crate::review_id(&document) {
                    Some(id) => {
                        documents.insert(id.to_string(), document);
                    }
                    None => skipped += 1,
                },
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, path = %path.display(), "skipped unreadable index lines");
        }
        info!(documents = documents.len(), path = %path.display(), "loaded search index");
        Ok(documents)
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, review_id: &str) -> Option<Document> {
        self.documents.read().await.get(review_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DocumentIndex for JsonlIndex {
    async fn index(&self, document: &Document) -> Result<(), FeedbackError> {
        let id = crate::review_id(document)
            .ok_or_else(|| FeedbackError::Index("document has no reviewId".into()))?
            .to_string();

        let mut documents = self.documents.write().await;
        if let Some(path) = &self.path {
            let line = serde_json::to_string(document).map_err(|e| FeedbackError::Index(e.to_string()))?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{line}"))
                .map_err(|e| FeedbackError::Index(e.to_string()))?;
        }
        documents.insert(id, document.clone());
        Ok(())
    }
}

/// A submitted review before enrichment.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInput {
    pub review_id: Option<String>,
    pub timestamp: Option<i64>,
    pub review_date_time: Option<String>,
    #[serde(default)]
    pub review: String,
    pub title: Option<String>,
    pub rating: Option<i64>,
    pub recommended: Option<bool>,
    pub age: Option<i64>,
    pub department: Option<String>,
    pub division: Option<String>,
    #[serde(rename = "class")]
    pub class_name: Option<String>,
    pub clothing_id: Option<Value>,
    pub random_bucket: Option<i64>,
}

#[derive(Debug, Default)]
pub struct FeedbackOutcome {
    pub processed: Vec<Document>,
    pub errors: Vec<FeedbackFailure>,
}

pub struct FeedbackProcessor {
    analyzer: Arc<dyn SentimentAnalyzer>,
    store: Arc<dyn PartitionedStore>,
    index: Arc<dyn DocumentIndex>,
}

impl FeedbackProcessor {
    pub fn new(
        analyzer: Arc<dyn SentimentAnalyzer>,
        store: Arc<dyn PartitionedStore>,
        index: Arc<dyn DocumentIndex>,
    ) -> Self {
        Self {
            analyzer,
            store,
            index,
        }
    }

    /// Builds the enriched document for one review.
    pub fn enrich<R: Rng + ?Sized>(
        &self,
        input: FeedbackInput,
        rng: &mut R,
    ) -> Result<Document, FeedbackError> {
        let text = input.review.trim();
        if text.is_empty() {
            return Err(FeedbackError::InvalidInput("review text is empty".into()));
        }
        let sentiment = self.analyzer.detect_sentiment(text)?;
        let key_phrases = self.analyzer.detect_key_phrases(text)?;

        let now = Utc::now();
        let review_id = input
            .review_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let timestamp = input.timestamp.unwrap_or_else(|| now.timestamp());
        let random_bucket = input
            .random_bucket
            .and_then(|b| u8::try_from(b).ok())
            .filter(|b| (1..=BUCKET_COUNT).contains(b))
            .unwrap_or_else(|| assign_bucket(rng));

        let enriched = json!({
            "reviewId": review_id,
            "timestamp": timestamp,
            "reviewDateTime": input.review_date_time.unwrap_or_else(|| now.to_rfc3339()),
            "review": text,
            "title": input.title,
            "rating": input.rating,
            "recommended": input.recommended,
            "age": input.age,
            "department": input.department,
            "division": input.division,
            "class": input.class_name,
            "clothingId": input.clothing_id,
            "randomBucket": random_bucket,
            "sentiment": sentiment.label,
            "sentimentScore": sentiment.scores,
            "keyPhrases": key_phrases,
            "processingTimestamp": Utc::now().to_rfc3339(),
            "source": SOURCE_TAG,
        });
        serde_json::from_value(enriched).map_err(|e| FeedbackError::InvalidInput(e.to_string()))
    }

    /// Enriches, stores and indexes each entry. Entries without review text
    /// are skipped; failures are collected per entry.
    pub async fn process_batch<R: Rng + Send>(
        &self,
        entries: Vec<Value>,
        rng: &mut R,
    ) -> FeedbackOutcome {
        let mut outcome = FeedbackOutcome::default();

        for entry in entries {
            let has_text = entry
                .get("review")
                .and_then(Value::as_str)
                .is_some_and(|text| !text.trim().is_empty());
            if !has_text {
                continue;
            }
            let claimed_id = entry
                .get("reviewId")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();

            match self.process_one(entry, rng).await {
                Ok(document) => outcome.processed.push(document),
                Err(e) => {
                    warn!(review_id = %claimed_id, error = %e, "error processing feedback");
                    outcome.errors.push(FeedbackFailure {
                        review_id: claimed_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            processed = outcome.processed.len(),
            failed = outcome.errors.len(),
            "feedback batch processed"
        );
        outcome
    }

    async fn process_one<R: Rng + Send>(
        &self,
        entry: Value,
        rng: &mut R,
    ) -> Result<Document, FeedbackError> {
        let input: FeedbackInput =
            serde_json::from_value(entry).map_err(|e| FeedbackError::InvalidInput(e.to_string()))?;
        let document = self.enrich(input, rng)?;
        let document = self.store.put(document).await?;
        self.index.index(&document).await?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterPredicate;
    use crate::store::ReviewTable;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn processor() -> (FeedbackProcessor, Arc<ReviewTable>, Arc<JsonlIndex>) {
        let store = Arc::new(ReviewTable::in_memory("RandomAccessIndex", 100));
        let index = Arc::new(JsonlIndex::in_memory());
        let processor =
            FeedbackProcessor::new(Arc::new(LexiconAnalyzer::new()), store.clone(), index.clone());
        (processor, store, index)
    }

    #[test]
    fn labels_follow_lexicon_hits() {
        let analyzer = LexiconAnalyzer::new();
        let label = |text: &str| analyzer.detect_sentiment(text).unwrap().label;

        assert_eq!(label("I love this dress, the fabric is soft"), SentimentLabel::Positive);
        assert_eq!(label("Awful fit and cheap material"), SentimentLabel::Negative);
        assert_eq!(label("It arrived on Tuesday"), SentimentLabel::Neutral);
        assert_eq!(label("Great color but terrible zipper"), SentimentLabel::Mixed);
        assert_eq!(label("Not good at all"), SentimentLabel::Negative);
        assert!(analyzer.detect_sentiment("  !! ").is_err());
    }

    #[test]
    fn scores_sum_to_one() {
        let analysis = LexiconAnalyzer::new()
            .detect_sentiment("great great awful")
            .unwrap();
        let s = analysis.scores;
        assert!((s.positive + s.negative + s.neutral + s.mixed - 1.0).abs() < 1e-9);
        assert!(s.positive > s.negative);
    }

    #[test]
    fn key_phrases_break_on_stopwords_and_punctuation() {
        let phrases = LexiconAnalyzer::new()
            .detect_key_phrases("The linen fabric is breathable. Runs small in the shoulders!")
            .unwrap();
        assert_eq!(
            phrases,
            vec!["linen fabric", "breathable", "runs small", "shoulders"]
        );
    }

    #[tokio::test]
    async fn enriched_reviews_land_in_a_valid_bucket() {
        let (processor, store, index) = processor();
        let mut rng = StdRng::seed_from_u64(8);

        let entries = vec![
            json!({"reviewId": "keep", "review": "Love it", "rating": 5, "randomBucket": 4}),
            json!({"review": "Too tight, returned it", "rating": 2, "randomBucket": 42}),
            json!({"review": "   ", "rating": 3}),
        ];
        let outcome = processor.process_batch(entries, &mut rng).await;

        assert_eq!(outcome.processed.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.processed[0]["randomBucket"], json!(4));
        let reassigned = outcome.processed[1]["randomBucket"].as_i64().unwrap();
        assert!((1..=10).contains(&reassigned));
        assert_eq!(outcome.processed[1]["sentiment"], json!("NEGATIVE"));
        assert_eq!(outcome.processed[0]["source"], json!(SOURCE_TAG));

        assert_eq!(store.len().await, 2);
        assert_eq!(store.count(4, &FilterPredicate::all()).await.unwrap(), 1);
        assert_eq!(index.len().await, 2);
        assert!(index.get("keep").await.is_some());
    }

    #[tokio::test]
    async fn resubmitted_review_stays_in_its_bucket() {
        let (processor, store, index) = processor();
        let mut rng = StdRng::seed_from_u64(10);

        let first = vec![json!({"reviewId": "x", "review": "Nice fit", "rating": 5, "randomBucket": 2})];
        processor.process_batch(first, &mut rng).await;
        let again = vec![json!({"reviewId": "x", "review": "Awful after washing", "rating": 1, "randomBucket": 7})];
        let outcome = processor.process_batch(again, &mut rng).await;

        assert_eq!(outcome.processed[0]["randomBucket"], json!(2));
        let all = FilterPredicate::all();
        assert_eq!(store.count(2, &all).await.unwrap(), 1);
        assert_eq!(store.count(7, &all).await.unwrap(), 0);
        let indexed = index.get("x").await.unwrap();
        assert_eq!(indexed["randomBucket"], json!(2));
        assert_eq!(indexed["sentiment"], json!("NEGATIVE"));
    }

    #[tokio::test]
    async fn index_file_is_replayed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search-index.jsonl");
        {
            let index = JsonlIndex::open(&path).unwrap();
            for (id, label) in [("a", "POSITIVE"), ("b", "NEUTRAL"), ("a", "NEGATIVE")] {
                let document: Document =
                    serde_json::from_value(json!({"reviewId": id, "sentiment": label})).unwrap();
                index.index(&document).await.unwrap();
            }
        }
        OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(b"{broken\n"))
            .unwrap();

        let reopened = JsonlIndex::open(&path).unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.get("a").await.unwrap()["sentiment"], json!("NEGATIVE"));
    }

    #[tokio::test]
    async fn malformed_entries_are_reported_not_fatal() {
        let (processor, store, _) = processor();
        let mut rng = StdRng::seed_from_u64(9);

        let entries = vec![
            json!({"reviewId": "bad", "review": "Nice", "rating": "five"}),
            json!({"reviewId": "ok", "review": "Nice", "rating": 5}),
        ];
        let outcome = processor.process_batch(entries, &mut rng).await;

        assert_eq!(outcome.processed.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].review_id, "bad");
        assert_eq!(store.len().await, 1);
    }
}
