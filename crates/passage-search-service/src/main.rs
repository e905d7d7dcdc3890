//! Demo search endpoint over a vector-indexed passage table.
//!
//! One POST handler: embed the query through Cohere, normalize the vector,
//! run a nearest-neighbor lookup, return the rows. Everything else here is
//! request plumbing around those three blocking steps.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use postgres::{Client, NoTls};
use serde::{Deserialize, Serialize};
use serde_json::json;

const COHERE_EMBED_URL: &str = "https://api.cohere.ai/v1/embed";
const COHERE_EMBED_MODEL: &str = "embed-multilingual-v2.0";
const SEARCH_LIMIT: i64 = 10;
const EMBED_FAILURE_MESSAGE: &str = "Failed to fetch data from Cohere, or embeddings missing";
const QUERY_FAILURE_MESSAGE: &str = "Internal server error";

const NEAREST_SQL: &str = "
SELECT title, text_content, url, cos_dist(emb, $1::real[]) AS cos_dist
FROM passages
ORDER BY emb <=> $1::real[]
LIMIT $2
";

#[derive(Debug, Parser)]
#[command(name = "passage-search-service")]
#[command(about = "Vector search demo over embedded passages")]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, env = "COHERE_API_KEY")]
    cohere_api_key: String,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 10_000)]
    operation_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRequest {
    query: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct SearchHit {
    title: Option<String>,
    text_content: Option<String>,
    url: Option<String>,
    cos_dist: f32,
}

trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

trait PassageSearcher: Send + Sync {
    fn nearest(&self, embedding: &[f32], limit: i64) -> Result<Vec<SearchHit>>;
}

#[derive(Debug, Deserialize)]
struct CohereEmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
}

struct CohereEmbedder {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
}

impl CohereEmbedder {
    fn new(api_key: String, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: COHERE_EMBED_URL.to_string(),
            api_key,
        }
    }
}

impl EmbeddingProvider for CohereEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .agent
            .request("POST", &self.endpoint)
            .set("accept", "application/json")
            .set("content-type", "application/json")
            .set("authorization", &format!("Bearer {}", self.api_key))
            .send_json(json!({
                "texts": [text],
                "truncate": "END",
                "model": COHERE_EMBED_MODEL,
            }));

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("embedding api returned status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("embedding api transport failure: {err}"));
            }
        };

        let body: CohereEmbedResponse = response
            .into_json()
            .context("embedding api returned a non-JSON body")?;
        let Some(mut vectors) = body.embeddings else {
            return Err(anyhow!("embeddings field not found in the response"));
        };
        if vectors.is_empty() {
            return Err(anyhow!("embedding api returned no vectors"));
        }
        Ok(vectors.swap_remove(0))
    }
}

struct PgPassageSearcher {
    client: Mutex<Client>,
}

impl PgPassageSearcher {
    fn connect(database_url: &str) -> Result<Self> {
        let client = Client::connect(database_url, NoTls)
            .with_context(|| format!("failed to connect to postgres at {database_url}"))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

impl PassageSearcher for PgPassageSearcher {
    fn nearest(&self, embedding: &[f32], limit: i64) -> Result<Vec<SearchHit>> {
        let mut client = self
            .client
            .lock()
            .map_err(|_| anyhow!("searcher connection poisoned"))?;

        client
            .batch_execute("SET enable_seqscan = false")
            .context("failed to disable sequential scans")?;

        let rows = client
            .query(NEAREST_SQL, &[&embedding, &limit])
            .context("nearest-neighbor query failed")?;

        rows.iter()
            .map(|row| {
                Ok(SearchHit {
                    title: row.try_get("title")?,
                    text_content: row.try_get("text_content")?,
                    url: row.try_get("url")?,
                    cos_dist: row.try_get("cos_dist")?,
                })
            })
            .collect()
    }
}

/// Scales a vector to unit length. `None` when the magnitude is zero or not
/// finite, which would poison the distance operator with NaNs.
#[allow(clippy::cast_possible_truncation)]
fn normalize_vector(vector: &[f32]) -> Option<Vec<f32>> {
    let magnitude = vector
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>()
        .sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return None;
    }

    Some(
        vector
            .iter()
            .map(|value| (f64::from(*value) / magnitude) as f32)
            .collect(),
    )
}

#[derive(Debug, Default)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    invalid_json_total: AtomicU64,
    embed_failure_total: AtomicU64,
    query_failure_total: AtomicU64,
    db_queries_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    invalid_json_total: u64,
    embed_failure_total: u64,
    query_failure_total: u64,
    db_queries_total: u64,
}

impl ServiceTelemetry {
    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            embed_failure_total: self.embed_failure_total.load(Ordering::Relaxed),
            query_failure_total: self.query_failure_total.load(Ordering::Relaxed),
            db_queries_total: self.db_queries_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct ServiceState {
    embedder: Arc<dyn EmbeddingProvider>,
    searcher: Arc<dyn PassageSearcher>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

impl ServiceState {
    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(op);
        let join = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                anyhow!(
                    "operation timed out after {} ms",
                    self.operation_timeout.as_millis()
                )
            })?;
        join.map_err(|err| anyhow!("blocking join failure: {err}"))?
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/search", post(search))
        .route("/v1/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<ServiceState>) -> Response {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(json!({
        "status": "ok",
        "timeout_ms": timeout_ms,
        "telemetry": state.telemetry.snapshot(),
    }))
    .into_response()
}

async fn search(
    State(state): State<ServiceState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Response {
    state
        .telemetry
        .requests_total
        .fetch_add(1, Ordering::Relaxed);

    let Ok(Json(request)) = payload else {
        state
            .telemetry
            .invalid_json_total
            .fetch_add(1, Ordering::Relaxed);
        state
            .telemetry
            .requests_failure_total
            .fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };

    let embedder = Arc::clone(&state.embedder);
    let query_text = request.query.clone();
    let embedded = state
        .run_blocking(move || embedder.embed(&query_text))
        .await;

    let normalized = match embedded {
        Ok(vector) => normalize_vector(&vector),
        Err(_) => None,
    };
    let Some(embedding) = normalized else {
        state
            .telemetry
            .embed_failure_total
            .fetch_add(1, Ordering::Relaxed);
        state
            .telemetry
            .requests_failure_total
            .fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, EMBED_FAILURE_MESSAGE);
    };

    let started = Instant::now();
    state
        .telemetry
        .db_queries_total
        .fetch_add(1, Ordering::Relaxed);

    let searcher = Arc::clone(&state.searcher);
    let results = state
        .run_blocking(move || searcher.nearest(&embedding, SEARCH_LIMIT))
        .await;

    let results = match results {
        Ok(results) => results,
        Err(_) => {
            state
                .telemetry
                .query_failure_total
                .fetch_add(1, Ordering::Relaxed);
            state
                .telemetry
                .requests_failure_total
                .fetch_add(1, Ordering::Relaxed);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, QUERY_FAILURE_MESSAGE);
        }
    };

    let search_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    state
        .telemetry
        .requests_success_total
        .fetch_add(1, Ordering::Relaxed);

    Json(json!({
        "message": "Search successful",
        "query": request.query,
        "searchTime": search_time_ms,
        "results": results,
    }))
    .into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let timeout = Duration::from_millis(args.operation_timeout_ms);

    let state = ServiceState {
        embedder: Arc::new(CohereEmbedder::new(args.cohere_api_key, timeout)),
        searcher: Arc::new(PgPassageSearcher::connect(&args.database_url)?),
        operation_timeout: timeout,
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    struct MockEmbedder {
        vector: Vec<f32>,
        calls: AtomicU64,
        last_text: Mutex<Option<String>>,
    }

    impl MockEmbedder {
        fn returning(vector: Vec<f32>) -> Self {
            Self {
                vector,
                calls: AtomicU64::new(0),
                last_text: Mutex::new(None),
            }
        }
    }

    impl EmbeddingProvider for MockEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut last) = self.last_text.lock() {
                *last = Some(text.to_string());
            }
            Ok(self.vector.clone())
        }
    }

    struct FailingEmbedder;

    impl EmbeddingProvider for FailingEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(anyhow!("embedding api returned status 500"))
        }
    }

    #[derive(Default)]
    struct MockSearcher {
        hits: Vec<SearchHit>,
        fail: bool,
        calls: AtomicU64,
        last_embedding: Mutex<Option<Vec<f32>>>,
    }

    impl PassageSearcher for MockSearcher {
        fn nearest(&self, embedding: &[f32], _limit: i64) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut last) = self.last_embedding.lock() {
                *last = Some(embedding.to_vec());
            }
            if self.fail {
                return Err(anyhow!("nearest-neighbor query failed"));
            }
            Ok(self.hits.clone())
        }
    }

    fn hit(title: &str) -> SearchHit {
        SearchHit {
            title: Some(title.to_string()),
            text_content: Some(format!("{title} passage text")),
            url: Some(format!("https://example.org/{title}")),
            cos_dist: 0.25,
        }
    }

    fn test_state(
        embedder: Arc<dyn EmbeddingProvider>,
        searcher: Arc<dyn PassageSearcher>,
    ) -> ServiceState {
        ServiceState {
            embedder,
            searcher,
            operation_timeout: Duration::from_millis(2_500),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!(
                "response body is not JSON: {err}; body={}",
                String::from_utf8_lossy(&bytes)
            ),
        }
    }

    fn search_request(body: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri("/search")
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    #[tokio::test]
    async fn search_round_trip_returns_the_demo_shape() {
        let searcher = Arc::new(MockSearcher {
            hits: vec![hit("black-holes"), hit("stellar-collapse")],
            ..MockSearcher::default()
        });
        let embedder = Arc::new(MockEmbedder::returning(vec![3.0, 4.0]));
        let state = test_state(
            Arc::clone(&embedder) as Arc<dyn EmbeddingProvider>,
            Arc::clone(&searcher) as Arc<dyn PassageSearcher>,
        );
        let router = app(state);

        let response = match router
            .oneshot(search_request(
                "{\"query\": \"how do black holes form\"}",
            ))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("message").and_then(serde_json::Value::as_str),
            Some("Search successful")
        );
        assert_eq!(
            value.get("query").and_then(serde_json::Value::as_str),
            Some("how do black holes form")
        );
        assert!(value
            .get("searchTime")
            .and_then(serde_json::Value::as_u64)
            .is_some());

        let results = value
            .get("results")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing results array: {value}"));
        assert!(results.len() <= 10);
        assert_eq!(results.len(), 2);
        for result in results {
            for field in ["title", "text_content", "url", "cos_dist"] {
                assert!(result.get(field).is_some(), "missing {field}: {result}");
            }
        }

        // The searcher saw the unit-length vector, not the raw embedding.
        let seen = searcher
            .last_embedding
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| panic!("searcher never received an embedding"));
        assert_eq!(seen.len(), 2);
        assert!((seen[0] - 0.6).abs() < 1e-6);
        assert!((seen[1] - 0.8).abs() < 1e-6);
        assert_eq!(searcher.calls.load(Ordering::Relaxed), 1);

        // The embedding api saw the raw query text exactly once.
        assert_eq!(embedder.calls.load(Ordering::Relaxed), 1);
        let embedded_text = embedder
            .last_text
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| panic!("embedder never received the query"));
        assert_eq!(embedded_text, "how do black holes form");
    }

    #[tokio::test]
    async fn embed_failure_returns_500_and_skips_the_database() {
        let searcher = Arc::new(MockSearcher::default());
        let state = test_state(
            Arc::new(FailingEmbedder),
            Arc::clone(&searcher) as Arc<dyn PassageSearcher>,
        );
        let telemetry = Arc::clone(&state.telemetry);
        let router = app(state);

        let response = match router
            .oneshot(search_request("{\"query\": \"anything\"}"))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let value = response_json(response).await;
        assert_eq!(
            value.get("error").and_then(serde_json::Value::as_str),
            Some("Failed to fetch data from Cohere, or embeddings missing")
        );

        assert_eq!(searcher.calls.load(Ordering::Relaxed), 0);
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.embed_failure_total, 1);
        assert_eq!(snapshot.db_queries_total, 0);
    }

    #[tokio::test]
    async fn zero_magnitude_embedding_counts_as_an_embed_failure() {
        let searcher = Arc::new(MockSearcher::default());
        let state = test_state(
            Arc::new(MockEmbedder::returning(vec![0.0, 0.0, 0.0])),
            Arc::clone(&searcher) as Arc<dyn PassageSearcher>,
        );
        let router = app(state);

        let response = match router
            .oneshot(search_request("{\"query\": \"anything\"}"))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = response_json(response).await;
        assert_eq!(
            value.get("error").and_then(serde_json::Value::as_str),
            Some("Failed to fetch data from Cohere, or embeddings missing")
        );
        assert_eq!(searcher.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn query_failure_returns_the_static_internal_error() {
        let searcher = Arc::new(MockSearcher {
            fail: true,
            ..MockSearcher::default()
        });
        let state = test_state(
            Arc::new(MockEmbedder::returning(vec![1.0, 0.0])),
            Arc::clone(&searcher) as Arc<dyn PassageSearcher>,
        );
        let router = app(state);

        let response = match router
            .oneshot(search_request("{\"query\": \"anything\"}"))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = response_json(response).await;
        assert_eq!(
            value.get("error").and_then(serde_json::Value::as_str),
            Some("Internal server error")
        );
        assert_eq!(searcher.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalid_json_body_is_rejected() {
        let state = test_state(
            Arc::new(MockEmbedder::returning(vec![1.0])),
            Arc::new(MockSearcher::default()),
        );
        let router = app(state);

        let response = match router.oneshot(search_request("{")).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value.get("error").is_some());
    }

    #[tokio::test]
    async fn non_post_search_is_method_not_allowed() {
        let state = test_state(
            Arc::new(MockEmbedder::returning(vec![1.0])),
            Arc::new(MockSearcher::default()),
        );
        let router = app(state);

        let request = Request::builder()
            .uri("/search")
            .method("GET")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn health_reports_telemetry_counters() {
        let state = test_state(
            Arc::new(FailingEmbedder),
            Arc::new(MockSearcher::default()),
        );
        let router = app(state);

        let failed = match router
            .clone()
            .oneshot(search_request("{\"query\": \"anything\"}"))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let request = Request::builder()
            .uri("/v1/health")
            .method("GET")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("health request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("status").and_then(serde_json::Value::as_str),
            Some("ok")
        );
        assert_eq!(
            value
                .get("telemetry")
                .and_then(|telemetry| telemetry.get("embed_failure_total"))
                .and_then(serde_json::Value::as_u64),
            Some(1)
        );
    }

    #[test]
    fn normalize_scales_to_unit_length() {
        let normalized = normalize_vector(&[3.0, 4.0])
            .unwrap_or_else(|| panic!("expected a normalized vector"));
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);

        assert_eq!(normalize_vector(&[0.0, 0.0]), None);
        assert_eq!(normalize_vector(&[]), None);
    }
}
