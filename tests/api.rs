//! Integration tests for the typed query API surface.
//!
//! These tests verify request validation, role enforcement, and dispatch
//! through [`membrane::api::QueryApi`] - the same surface the HTTP edge
//! routes into.

use membrane::api::{
    AggregationParams, AnalyticsQueryRequest, AnalyticsQueryType, ExportParams,
    MemoryQueryRequest, Principal, QueryApi, Role, StoreMemoryRequest, TrackEventRequest,
};
use membrane::{Config, EmbeddingDimension, MemoryCore, MemoryKind};
use tempfile::tempdir;

fn open_api(dir: &tempfile::TempDir) -> QueryApi {
    let config = Config {
        warm_path: dir.path().join("warm.db"),
        cold_dir: dir.path().join("cold"),
        embedding_dimension: EmbeddingDimension::Custom(3),
        ..Default::default()
    };
    QueryApi::new(MemoryCore::open(config).unwrap())
}

fn agent() -> Principal {
    Principal {
        subject: "agent-1".into(),
        roles: vec![Role::Agent],
    }
}

fn admin() -> Principal {
    Principal {
        subject: "ops".into(),
        roles: vec![Role::Admin],
    }
}

fn store_request(domain: &str) -> StoreMemoryRequest {
    serde_json::from_value(serde_json::json!({
        "service_id": "svc-a",
        "agent_id": "agent-1",
        "domain": domain,
        "kind": "semantic",
        "payload": {"k": 1},
    }))
    .unwrap()
}

#[test]
fn test_store_and_get_through_api() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);
    let principal = agent();

    let stored = api.store_memory(&principal, store_request("legal")).unwrap();
    let read = api.get_memory(&principal, stored.id).unwrap();
    assert_eq!(read.payload, stored.payload);
}

#[test]
fn test_get_unknown_is_not_found() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);

    let err = api.get_memory(&agent(), membrane::MemoryId::new()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_store_validation_surfaces() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);

    let mut bad = store_request("legal");
    bad.importance = 99.0;
    assert!(api.store_memory(&agent(), bad).unwrap_err().is_validation());
}

#[test]
fn test_query_through_api() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);
    let principal = agent();

    api.store_memory(&principal, store_request("legal")).unwrap();
    api.store_memory(&principal, store_request("marketing")).unwrap();

    let request: MemoryQueryRequest =
        serde_json::from_value(serde_json::json!({"domain": "legal"})).unwrap();
    let results = api.query_memory(&principal, request).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].domain, "legal");
}

#[test]
fn test_archive_trigger_requires_admin() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);

    let err = api.trigger_archive(&agent()).unwrap_err();
    assert!(matches!(err, membrane::MembraneError::Forbidden { .. }));

    assert!(api.trigger_archive(&admin()).is_ok());
}

#[test]
fn test_export_requires_elevated_role() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);

    let err = api.export(&agent(), ExportParams::default()).unwrap_err();
    assert!(matches!(err, membrane::MembraneError::Forbidden { .. }));

    let analyst = Principal {
        subject: "bi".into(),
        roles: vec![Role::Analyst],
    };
    api.store_memory(&analyst, store_request("legal")).unwrap();

    let bundle = api.export(&analyst, ExportParams::default()).unwrap();
    assert_eq!(bundle.entries.len(), 1);
    assert!(bundle.events.is_empty());
}

#[test]
fn test_track_event_lands_as_business_entry() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);
    let principal = agent();

    let request: TrackEventRequest = serde_json::from_value(serde_json::json!({
        "service_id": "svc-a",
        "agent_id": "edge",
        "domain": "product",
        "name": "document_uploaded",
        "properties": {"pages": 12},
    }))
    .unwrap();

    let entry = api.track_event(&principal, request).unwrap();
    assert_eq!(entry.kind, MemoryKind::Business);
    assert!(entry.tags.contains("analytics"));
    assert_eq!(entry.payload["event"], "document_uploaded");
    assert_eq!(entry.payload["properties"]["pages"], 12);
}

#[test]
fn test_aggregation_through_api() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);
    let principal = agent();

    api.store_memory(&principal, store_request("legal")).unwrap();

    let params: AggregationParams = serde_json::from_value(serde_json::json!({
        "service_id": "svc-a",
        "domain": "legal",
    }))
    .unwrap();
    let agg = api.aggregate(&principal, params).unwrap();
    assert_eq!(agg.total_entries, 1);
}

#[test]
fn test_analytics_historical_requires_metric() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);

    let request: AnalyticsQueryRequest = serde_json::from_value(serde_json::json!({
        "query_type": "historical",
        "domain": "legal",
    }))
    .unwrap();
    assert_eq!(request.query_type, AnalyticsQueryType::Historical);

    let err = api.analytics_query(&agent(), request).unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn test_dashboard_bundle_shape() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);
    let principal = agent();

    api.store_memory(&principal, store_request("legal")).unwrap();

    let dashboard = api.dashboard(&principal).unwrap();
    assert_eq!(dashboard.health.status, "ok");
    assert_eq!(dashboard.domains, vec!["legal".to_string()]);
    assert!(dashboard.recent_insights.is_empty());
}

#[test]
fn test_report_unknown_kind_rejected() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);

    let err = api.report(&agent(), "vibes", "legal").unwrap_err();
    assert!(err.is_validation());

    let report = api.report(&agent(), "performance", "legal").unwrap();
    assert!(report.trends.is_some());

    let report = api.report(&agent(), "usage", "legal").unwrap();
    assert!(report.trends.is_none());
}

#[test]
fn test_health_reports_components() {
    let dir = tempdir().unwrap();
    let api = open_api(&dir);

    let health = api.health();
    assert_eq!(health.status, "ok");
    assert!(health.warm_ok);
    assert!(health.peers.is_empty());
}
