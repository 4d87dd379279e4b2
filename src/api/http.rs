//! Thin HTTP edge adapter over [`QueryApi`].
//!
//! Routing only: every handler extracts the principal from edge-supplied
//! headers, converts the request body, and dispatches to the typed
//! operation. Responses wrap in `{ "data": ..., "timestamp": rfc3339 }`;
//! errors render uniformly as `{ "error": ..., "timestamp": rfc3339 }`
//! with the status mapped from the error taxonomy.
//!
//! Each operation runs under a deadline; on expiry the request fails
//! with 504 and the outstanding tier I/O is abandoned to its blocking
//! task.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{
    AggregationParams, AnalyticsQueryRequest, EventQueryRequest, ExportParams, MemoryQueryRequest,
    MetricsParams, PatternsParams, Principal, QueryApi, RecordEventRequest, RelateRequest,
    RelatedParams, Role, SimilarityRequest, StoreMemoryRequest, TrackEventRequest, TrendsParams,
};
use crate::error::{MembraneError, Result};
use crate::memory::MemoryEntry;
use crate::types::{MemoryId, Timestamp};

/// Per-operation deadline.
const OPERATION_DEADLINE: Duration = Duration::from_secs(30);

/// Principal subject header set by the edge authenticator.
const SUBJECT_HEADER: &str = "x-subject";
/// Comma-separated role list header set by the edge authenticator.
const ROLES_HEADER: &str = "x-roles";

/// Builds the full edge router over a bound API.
pub fn router(api: QueryApi) -> Router {
    Router::new()
        .route("/memory", post(store_memory))
        .route("/memory/{id}", get(get_memory))
        .route("/memory/query", post(query_memory))
        .route("/memory/search/similarity", post(search_similarity))
        .route("/memory/aggregations", get(aggregations))
        .route("/memory/relationships", post(relate))
        .route("/memory/{id}/related", get(related))
        .route("/memory/archive", post(trigger_archive))
        .route("/learning/events", post(record_event))
        .route("/learning/events/query", post(query_events))
        .route("/learning/patterns", get(patterns))
        .route("/learning/metrics", get(metrics))
        .route("/learning/trends", get(trends))
        .route("/analytics/query", post(analytics_query))
        .route("/analytics/metrics/{domain}", get(business_metrics))
        .route("/analytics/dashboard", get(dashboard))
        .route("/analytics/reports/{kind}/{domain}", get(report))
        .route("/analytics/events", post(track_event))
        .route("/analytics/insights", get(insights))
        .route("/analytics/export", get(export))
        .route("/health", get(health))
        .with_state(api)
}

/// Serves the router until the token cancels.
pub async fn serve(api: QueryApi, listener: TcpListener, cancel: CancellationToken) {
    let app = router(api);
    info!("Edge adapter listening");
    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Edge adapter failed");
    }
}

// ============================================================================
// Response envelope
// ============================================================================

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    data: T,
    timestamp: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    timestamp: String,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            data,
            timestamp: Timestamp::now().to_rfc3339(),
        }),
    )
        .into_response()
}

fn fail(err: MembraneError) -> Response {
    let status = status_of(&err);
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            timestamp: Timestamp::now().to_rfc3339(),
        }),
    )
        .into_response()
}

/// Maps the error taxonomy onto HTTP status classes.
fn status_of(err: &MembraneError) -> StatusCode {
    match err {
        MembraneError::Validation(_) => StatusCode::BAD_REQUEST,
        MembraneError::NotFound(_) => StatusCode::NOT_FOUND,
        MembraneError::Conflict { .. } => StatusCode::CONFLICT,
        MembraneError::Unauthorized => StatusCode::UNAUTHORIZED,
        MembraneError::Forbidden { .. } => StatusCode::FORBIDDEN,
        MembraneError::TierUnavailable { .. } | MembraneError::Storage(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MembraneError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Extracts the authenticated principal from edge headers.
fn principal_from(headers: &HeaderMap) -> Result<Principal> {
    let subject = headers
        .get(SUBJECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or(MembraneError::Unauthorized)?
        .to_string();

    let roles = headers
        .get(ROLES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|list| list.split(',').filter_map(Role::parse).collect())
        .unwrap_or_else(|| vec![Role::Agent]);

    Ok(Principal { subject, roles })
}

/// Runs a blocking core operation under the request deadline.
async fn with_deadline<T, F>(name: &'static str, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(OPERATION_DEADLINE, tokio::task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(MembraneError::internal(format!("{} panicked: {}", name, join))),
        Err(_) => Err(MembraneError::timeout(name)),
    }
}

/// Runs an operation end-to-end: principal, deadline, envelope.
macro_rules! run {
    ($name:literal, $headers:expr, $api:expr, |$p:ident, $a:ident| $body:expr) => {{
        let $p = match principal_from(&$headers) {
            Ok(principal) => principal,
            Err(e) => return fail(e),
        };
        let $a = $api.clone();
        match with_deadline($name, move || $body).await {
            Ok(data) => ok(data),
            Err(e) => fail(e),
        }
    }};
}

// ============================================================================
// Memory handlers
// ============================================================================

async fn store_memory(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<StoreMemoryRequest>,
) -> Response {
    run!("memory.store", headers, api, |p, a| a.store_memory(&p, request))
}

async fn get_memory(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Path(id): Path<uuid::Uuid>,
) -> Response {
    run!("memory.get", headers, api, |p, a| a
        .get_memory(&p, MemoryId(id)))
}

async fn query_memory(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<MemoryQueryRequest>,
) -> Response {
    run!("memory.query", headers, api, |p, a| a.query_memory(&p, request))
}

/// One similarity hit in the response body.
#[derive(Serialize)]
struct SimilarityHit {
    entry: MemoryEntry,
    similarity: f32,
}

async fn search_similarity(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<SimilarityRequest>,
) -> Response {
    run!("memory.similarity", headers, api, |p, a| {
        a.search_similarity(&p, request).map(|hits| {
            hits.into_iter()
                .map(|(entry, similarity)| SimilarityHit { entry, similarity })
                .collect::<Vec<_>>()
        })
    })
}

async fn aggregations(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Query(params): Query<AggregationParams>,
) -> Response {
    run!("memory.aggregate", headers, api, |p, a| a.aggregate(&p, params))
}

async fn relate(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<RelateRequest>,
) -> Response {
    run!("memory.relate", headers, api, |p, a| a.relate(&p, request))
}

async fn related(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Path(id): Path<uuid::Uuid>,
    Query(params): Query<RelatedParams>,
) -> Response {
    run!("memory.related", headers, api, |p, a| a.related(
        &p,
        MemoryId(id),
        params
    ))
}

async fn trigger_archive(State(api): State<QueryApi>, headers: HeaderMap) -> Response {
    run!("memory.archive", headers, api, |p, a| {
        a.trigger_archive(&p).map(|stats| {
            serde_json::json!({
                "scanned": stats.scanned,
                "archived": stats.archived,
                "failed": stats.failed,
            })
        })
    })
}

// ============================================================================
// Learning handlers
// ============================================================================

async fn record_event(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<RecordEventRequest>,
) -> Response {
    run!("learning.record", headers, api, |p, a| a.record_event(&p, request))
}

async fn query_events(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<EventQueryRequest>,
) -> Response {
    run!("learning.history", headers, api, |p, a| a.query_events(&p, request))
}

async fn patterns(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Query(params): Query<PatternsParams>,
) -> Response {
    run!("learning.patterns", headers, api, |p, a| a.patterns(&p, params))
}

async fn metrics(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Query(params): Query<MetricsParams>,
) -> Response {
    run!("learning.metrics", headers, api, |p, a| a.metrics(&p, params))
}

async fn trends(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Query(params): Query<TrendsParams>,
) -> Response {
    run!("learning.trends", headers, api, |p, a| a.trends(&p, params))
}

// ============================================================================
// Analytics handlers
// ============================================================================

async fn analytics_query(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<AnalyticsQueryRequest>,
) -> Response {
    run!("analytics.query", headers, api, |p, a| a.analytics_query(&p, request))
}

async fn business_metrics(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Response {
    run!("analytics.metrics", headers, api, |p, a| a
        .business_metrics(&p, &domain))
}

async fn dashboard(State(api): State<QueryApi>, headers: HeaderMap) -> Response {
    run!("analytics.dashboard", headers, api, |p, a| a.dashboard(&p))
}

async fn report(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Path((kind, domain)): Path<(String, String)>,
) -> Response {
    run!("analytics.report", headers, api, |p, a| a.report(&p, &kind, &domain))
}

async fn track_event(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Json(request): Json<TrackEventRequest>,
) -> Response {
    run!("analytics.track", headers, api, |p, a| a.track_event(&p, request))
}

/// `GET /analytics/insights` query parameters.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InsightParams {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    limit: usize,
}

async fn insights(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Query(params): Query<InsightParams>,
) -> Response {
    run!("analytics.insights", headers, api, |p, a| a.insights(
        &p,
        params.domain.as_deref(),
        params.limit
    ))
}

async fn export(
    State(api): State<QueryApi>,
    headers: HeaderMap,
    Query(params): Query<ExportParams>,
) -> Response {
    run!("analytics.export", headers, api, |p, a| a.export(&p, params))
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(api): State<QueryApi>) -> Response {
    ok(api.health())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        use crate::error::{NotFoundError, ValidationError};

        assert_eq!(
            status_of(&ValidationError::required_field("domain").into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&NotFoundError::memory("x").into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&MembraneError::conflict("immutable")),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(&MembraneError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(&MembraneError::forbidden("admin")),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(&MembraneError::tier_unavailable("warm", "down")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&MembraneError::timeout("memory.get")),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(&MembraneError::internal("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_principal_extraction() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            principal_from(&headers),
            Err(MembraneError::Unauthorized)
        ));

        headers.insert(SUBJECT_HEADER, "svc-a".parse().unwrap());
        let principal = principal_from(&headers).unwrap();
        assert_eq!(principal.subject, "svc-a");
        // Default role when the edge sends none
        assert_eq!(principal.roles, vec![Role::Agent]);

        headers.insert(ROLES_HEADER, "admin,analyst".parse().unwrap());
        let principal = principal_from(&headers).unwrap();
        assert_eq!(principal.roles, vec![Role::Admin, Role::Analyst]);
    }
}
