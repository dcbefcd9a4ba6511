use axum::{
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::assembler::assemble;
use crate::error::{ApiError, ConfigError};
use crate::sampler::BucketSampler;
use crate::sentiment::FeedbackProcessor;
use crate::{BucketStats, FeedbackResponse, SampleRequest, SampleResponse};

pub struct AppState {
    /// Sampling refuses to run until the table settings are complete.
    pub sampler: Result<Arc<BucketSampler>, ConfigError>,
    pub feedback: Result<Arc<FeedbackProcessor>, ConfigError>,
    pub request_deadline: Duration,
}

pub type SharedState = Arc<AppState>;

// JSON body extractor; an empty body means every field takes its default
pub struct JsonBody<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned + Default,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::Internal(rejection.body_text()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonBody(T::default()));
        }
        serde_json::from_slice(&bytes)
            .map(JsonBody)
            .map_err(|e| ApiError::Internal(format!("Invalid JSON request: {e}")))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string(), "message": "Service configuration error" }),
            ),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, json!({ "message": message }))
            }
            ApiError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e, "message": "Internal server error" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-amz-date"),
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-amz-security-token"),
        ]);

    Router::new()
        .route("/", post(sample_reviews))
        .route("/reviews", post(sample_reviews))
        .route("/feedback", post(submit_feedback))
        .route("/stats", get(get_stats))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

// Random sample of reviews matching the requested filters
async fn sample_reviews(
    State(state): State<SharedState>,
    JsonBody(request): JsonBody<SampleRequest>,
) -> Result<Json<SampleResponse>, ApiError> {
    let sampler = state.sampler.as_ref().map_err(|e| ApiError::Config(e.clone()))?;

    let started = Instant::now();
    let deadline = request_deadline(started, state.request_deadline);
    let batch_size = request.batch_size();
    let predicate = request.predicate();
    let mut rng = StdRng::from_entropy();

    let outcome = sampler
        .sample(batch_size, &predicate, deadline, &mut rng)
        .await;
    let reviews = assemble(outcome.items, batch_size, &mut rng);
    let partial = outcome.report.partial_note();

    info!(
        batch_size,
        returned = reviews.len(),
        buckets = ?outcome.report.buckets,
        failed = outcome.report.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "served review sample"
    );
    Ok(Json(SampleResponse::new(
        reviews,
        started.elapsed(),
        request.filters(),
        partial,
    )))
}

/// A budget too large to represent means no deadline.
fn request_deadline(started: Instant, budget: Duration) -> Option<Instant> {
    started.checked_add(budget)
}

// Enrich, store and index submitted reviews
async fn submit_feedback(
    State(state): State<SharedState>,
    JsonBody(body): JsonBody<Value>,
) -> Result<Response, ApiError> {
    let processor = state.feedback.as_ref().map_err(|e| ApiError::Config(e.clone()))?;

    let entries = match body {
        Value::Object(mut map) => match map.remove("reviews") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(invalid_feedback_request()),
        },
        _ => return Err(invalid_feedback_request()),
    };

    let mut rng = StdRng::from_entropy();
    let outcome = processor.process_batch(entries, &mut rng).await;
    for failure in &outcome.errors {
        error!(review_id = %failure.review_id, error = %failure.error, "feedback entry failed");
    }

    let status = if outcome.errors.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    let response = FeedbackResponse {
        message: "Reviews processed successfully".to_string(),
        processed_count: outcome.processed.len(),
        timestamp: Utc::now().to_rfc3339(),
        errors: outcome.errors,
    };
    Ok((status, Json(response)).into_response())
}

fn invalid_feedback_request() -> ApiError {
    ApiError::BadRequest("Invalid request format. Expected reviews array.".to_string())
}

// Row counts per bucket
async fn get_stats(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let sampler = state.sampler.as_ref().map_err(|e| ApiError::Config(e.clone()))?;
    let store = sampler.store();

    let sizes = store
        .bucket_sizes()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let total_reviews: usize = sizes.iter().map(|(_, count)| count).sum();
    let buckets: Vec<BucketStats> = sizes
        .into_iter()
        .map(|(bucket, count)| BucketStats { bucket, count })
        .collect();

    Ok(Json(json!({
        "total_reviews": total_reviews,
        "index": store.index_name(),
        "strategy": sampler.config().strategy.name(),
        "buckets": buckets,
        "status": "operational"
    })))
}
