//! The external query contract: typed operations, validation, principals.
//!
//! Every external request carries an authenticated principal (the edge
//! adapter authenticates; the core only checks roles). Request types are
//! declarative serde schemas with `deny_unknown_fields` - unknown input
//! fields are rejected uniformly, and RFC3339 timestamp strings convert
//! to core instants here at the boundary.
//!
//! [`QueryApi`] is the dispatch surface the HTTP edge calls into; it can
//! equally be driven directly by an embedding process.

pub mod http;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{HealthReport, MemoryCore};
use crate::error::{MembraneError, Result, ValidationError};
use crate::insight::Insight;
use crate::learning::{
    CostMetrics, EventFeedback, EventFilter, EventImpact, EventKind, LearningEvent, LearningPattern,
    MetricsRollup, NewLearningEvent, OutputSnapshot, TrendReport,
};
use crate::memory::{
    MemoryAggregation, MemoryEntry, MemoryFilter, MemoryKind, NewMemoryEntry,
};
use crate::types::{AgentId, EventId, MemoryId, ServiceId, Timestamp};

// ============================================================================
// Principals and roles
// ============================================================================

/// A role carried by an authenticated principal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full control, including archive triggers and exports.
    Admin,
    /// Read-heavy analytics access, including exports.
    Analyst,
    /// Regular read/write agent access.
    Agent,
}

impl Role {
    /// Parses a role name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "analyst" => Some(Self::Analyst),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// The authenticated caller of an operation.
#[derive(Clone, Debug)]
pub struct Principal {
    /// Stable subject identifier from the edge authenticator.
    pub subject: String,

    /// Roles granted to the subject.
    pub roles: Vec<Role>,
}

impl Principal {
    /// Returns true if the principal holds the role.
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Requires at least one of the listed roles.
    pub fn require_any(&self, roles: &[Role]) -> Result<()> {
        if roles.iter().any(|r| self.has_role(*r)) {
            Ok(())
        } else {
            Err(MembraneError::forbidden(
                roles
                    .iter()
                    .map(|r| format!("{:?}", r).to_lowercase())
                    .collect::<Vec<_>>()
                    .join("|"),
            ))
        }
    }
}

// ============================================================================
// Request schemas
// ============================================================================

fn default_importance() -> f32 {
    5.0
}

fn default_k() -> usize {
    10
}

fn default_max_depth() -> usize {
    2
}

fn default_periods() -> usize {
    7
}

fn default_window_hours() -> i64 {
    24
}

/// `POST /memory` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreMemoryRequest {
    /// Owning service.
    pub service_id: String,
    /// Writing agent.
    pub agent_id: String,
    /// Domain tag.
    pub domain: String,
    /// Entry kind.
    pub kind: MemoryKind,
    /// Opaque payload body.
    pub payload: serde_json::Value,
    /// Tag set.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional correlation id.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Optional session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Optional user id.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Importance in [0, 10].
    #[serde(default = "default_importance")]
    pub importance: f32,
    /// Optional RFC3339 expiry instant.
    #[serde(default)]
    pub expires_at: Option<String>,
    /// Optional embedding vector.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Related entry ids known at creation.
    #[serde(default)]
    pub related_ids: Vec<MemoryId>,
    /// Optional causing entry.
    #[serde(default)]
    pub cause_id: Option<MemoryId>,
    /// Entries this one led to.
    #[serde(default)]
    pub effect_ids: Vec<MemoryId>,
}

impl StoreMemoryRequest {
    fn into_new_entry(self) -> Result<NewMemoryEntry> {
        let expires_at = self
            .expires_at
            .map(|s| parse_rfc3339("expires_at", &s))
            .transpose()?;

        Ok(NewMemoryEntry {
            service_id: ServiceId::new(self.service_id),
            agent_id: AgentId::new(self.agent_id),
            domain: self.domain,
            kind: self.kind,
            payload: self.payload,
            tags: self.tags.into_iter().collect(),
            correlation_id: self.correlation_id,
            session_id: self.session_id,
            user_id: self.user_id,
            importance: self.importance,
            expires_at,
            embedding: self.embedding,
            related_ids: self.related_ids.into_iter().collect(),
            cause_id: self.cause_id,
            effect_ids: self.effect_ids.into_iter().collect(),
        })
    }
}

/// `POST /memory/query` body.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryQueryRequest {
    /// Restrict to a service.
    #[serde(default)]
    pub service_id: Option<String>,
    /// Restrict to an agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Restrict to a kind.
    #[serde(default)]
    pub kind: Option<MemoryKind>,
    /// Restrict to a domain.
    #[serde(default)]
    pub domain: Option<String>,
    /// Require at least one of these tags.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// RFC3339 window start (inclusive).
    #[serde(default)]
    pub since: Option<String>,
    /// RFC3339 window end (exclusive).
    #[serde(default)]
    pub until: Option<String>,
    /// Minimum importance.
    #[serde(default)]
    pub min_importance: Option<f32>,
    /// Substring over the serialized payload.
    #[serde(default)]
    pub text: Option<String>,
    /// Pagination offset.
    #[serde(default)]
    pub offset: usize,
    /// Pagination limit (0 = default).
    #[serde(default)]
    pub limit: usize,
}

impl MemoryQueryRequest {
    fn into_filter(self) -> Result<MemoryFilter> {
        Ok(MemoryFilter {
            service_id: self.service_id.map(ServiceId::new),
            agent_id: self.agent_id.map(AgentId::new),
            kind: self.kind,
            domain: self.domain,
            tags: self.tags.map(|t| t.into_iter().collect::<BTreeSet<_>>()),
            since: self.since.map(|s| parse_rfc3339("since", &s)).transpose()?,
            until: self.until.map(|s| parse_rfc3339("until", &s)).transpose()?,
            min_importance: self.min_importance,
            text: self.text,
            offset: self.offset,
            limit: self.limit,
        })
    }
}

/// `POST /memory/search/similarity` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimilarityRequest {
    /// Query vector (must match the configured dimension).
    pub vector: Vec<f32>,
    /// Domain whose index to search.
    pub domain: String,
    /// Result cap.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Minimum (exclusive) similarity.
    #[serde(default)]
    pub threshold: f32,
}

/// `POST /memory/relationships` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelateRequest {
    /// Edge source.
    pub source_id: MemoryId,
    /// Edge target.
    pub target_id: MemoryId,
    /// Relationship kind.
    pub kind: String,
}

/// `GET /memory/{id}/related` query parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelatedParams {
    /// Follow only this edge kind.
    #[serde(default)]
    pub kind: Option<String>,
    /// Traversal depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

/// `GET /memory/aggregations` query parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationParams {
    /// Service scope.
    pub service_id: String,
    /// Domain scope.
    pub domain: String,
    /// Window length ending now, in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

/// `POST /learning/events` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordEventRequest {
    /// Recording service.
    pub service_id: String,
    /// Performing agent.
    pub agent_id: String,
    /// Domain tag.
    pub domain: String,
    /// Event kind.
    pub kind: EventKind,
    /// Input snapshot.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Context snapshot.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Output snapshot.
    pub output: OutputSnapshot,
    /// Optional feedback.
    #[serde(default)]
    pub feedback: Option<EventFeedback>,
    /// Impact block.
    #[serde(default)]
    pub impact: EventImpact,
    /// Optional cost metrics.
    #[serde(default)]
    pub cost: Option<CostMetrics>,
    /// Importance in [0, 10].
    #[serde(default = "default_importance")]
    pub importance: f32,
    /// Parent event for corrections.
    #[serde(default)]
    pub parent_event_id: Option<EventId>,
}

impl RecordEventRequest {
    fn into_new_event(self) -> NewLearningEvent {
        NewLearningEvent {
            service_id: ServiceId::new(self.service_id),
            agent_id: AgentId::new(self.agent_id),
            domain: self.domain,
            kind: self.kind,
            input: self.input,
            context: self.context,
            output: self.output,
            feedback: self.feedback,
            impact: self.impact,
            cost: self.cost,
            importance: self.importance,
            parent_event_id: self.parent_event_id,
        }
    }
}

/// `POST /learning/events/query` body.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventQueryRequest {
    /// Restrict to a service.
    #[serde(default)]
    pub service_id: Option<String>,
    /// Restrict to an agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Restrict to a domain.
    #[serde(default)]
    pub domain: Option<String>,
    /// Restrict to a kind.
    #[serde(default)]
    pub kind: Option<EventKind>,
    /// RFC3339 window start (inclusive).
    #[serde(default)]
    pub since: Option<String>,
    /// RFC3339 window end (exclusive).
    #[serde(default)]
    pub until: Option<String>,
    /// Minimum importance.
    #[serde(default)]
    pub min_importance: Option<f32>,
    /// Pagination offset.
    #[serde(default)]
    pub offset: usize,
    /// Pagination limit (0 = default).
    #[serde(default)]
    pub limit: usize,
}

impl EventQueryRequest {
    fn into_filter(self) -> Result<EventFilter> {
        Ok(EventFilter {
            service_id: self.service_id.map(ServiceId::new),
            agent_id: self.agent_id.map(AgentId::new),
            domain: self.domain,
            kind: self.kind,
            since: self.since.map(|s| parse_rfc3339("since", &s)).transpose()?,
            until: self.until.map(|s| parse_rfc3339("until", &s)).transpose()?,
            min_importance: self.min_importance,
            offset: self.offset,
            limit: self.limit,
        })
    }
}

/// `GET /learning/patterns` query parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternsParams {
    /// Domain scope.
    pub domain: String,
    /// Minimum observation count.
    #[serde(default)]
    pub min_frequency: u64,
}

/// `GET /learning/metrics` query parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsParams {
    /// Domain scope.
    pub domain: String,
    /// Window length ending now, in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

/// `GET /learning/trends` query parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrendsParams {
    /// Domain scope.
    pub domain: String,
    /// Number of daily periods to analyze.
    #[serde(default = "default_periods")]
    pub periods: usize,
}

/// `POST /analytics/query` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyticsQueryRequest {
    /// Query mode.
    pub query_type: AnalyticsQueryType,
    /// Domain scope.
    pub domain: String,
    /// Metric name (historical mode).
    #[serde(default)]
    pub metric: Option<String>,
    /// Window length ending now, in hours (historical mode).
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

/// Analytics query modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsQueryType {
    /// Folded hot-tier rates and latencies.
    Realtime,
    /// Persisted metric time series.
    Historical,
    /// Trend classification with forecast.
    Predictive,
}

/// `POST /analytics/events` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackEventRequest {
    /// Originating service.
    pub service_id: String,
    /// Originating agent or component.
    pub agent_id: String,
    /// Domain scope.
    pub domain: String,
    /// Event name.
    pub name: String,
    /// Free-form properties.
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// `GET /analytics/export` query parameters.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportParams {
    /// Restrict the export to one domain.
    #[serde(default)]
    pub domain: Option<String>,
}

// ============================================================================
// Response shapes
// ============================================================================

/// Analytics query result, shaped by the query mode.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum AnalyticsResult {
    /// Realtime mode: folded metric cells.
    Realtime {
        /// Folded rates and latencies for the domain.
        metrics: Vec<RealtimeMetricView>,
    },
    /// Historical mode: a persisted series.
    Historical {
        /// Metric name.
        metric: String,
        /// `(rfc3339, value)` points, oldest first.
        series: Vec<(String, f64)>,
    },
    /// Predictive mode: trend + forecast.
    Predictive {
        /// The underlying trend report.
        trend: TrendReport,
    },
}

/// Serializable view of a folded metric cell.
#[derive(Clone, Debug, Serialize)]
pub struct RealtimeMetricView {
    /// Metric name.
    pub metric: String,
    /// Rate per second over the last fold window.
    pub rate_per_sec: f64,
    /// EMA-smoothed latency, milliseconds.
    pub ema_latency_ms: f64,
    /// All-time count.
    pub total: u64,
}

/// The `GET /analytics/dashboard` bundle.
#[derive(Clone, Debug, Serialize)]
pub struct DashboardBundle {
    /// Per-component health.
    pub health: HealthReport,
    /// Every known domain.
    pub domains: Vec<String>,
    /// Most recent insights across domains.
    pub recent_insights: Vec<Insight>,
}

/// The `GET /analytics/reports/{kind}/{domain}` bundle.
#[derive(Clone, Debug, Serialize)]
pub struct ReportBundle {
    /// Report kind (`performance`, `usage`, `cost`).
    pub kind: String,
    /// Domain scope.
    pub domain: String,
    /// Metrics rollup over the report window.
    pub metrics: MetricsRollup,
    /// Trend analysis (performance reports).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trends: Option<TrendReport>,
}

/// The `GET /analytics/export` bundle.
#[derive(Clone, Debug, Serialize)]
pub struct ExportBundle {
    /// Exported memory entries.
    pub entries: Vec<MemoryEntry>,
    /// Exported learning events.
    pub events: Vec<LearningEvent>,
    /// Export instant, RFC3339.
    pub exported_at: String,
}

// ============================================================================
// QueryApi
// ============================================================================

/// Typed operation surface over an opened core.
#[derive(Clone)]
pub struct QueryApi {
    core: Arc<MemoryCore>,
}

impl QueryApi {
    /// Binds the API to a core.
    pub fn new(core: Arc<MemoryCore>) -> Self {
        Self { core }
    }

    /// Stores a memory entry.
    pub fn store_memory(&self, _p: &Principal, request: StoreMemoryRequest) -> Result<MemoryEntry> {
        self.core.memory().store(request.into_new_entry()?)
    }

    /// Retrieves a memory entry by id.
    pub fn get_memory(&self, _p: &Principal, id: MemoryId) -> Result<MemoryEntry> {
        self.core
            .memory()
            .get(id)?
            .ok_or_else(|| crate::error::NotFoundError::memory(id).into())
    }

    /// Runs a filter query.
    pub fn query_memory(
        &self,
        _p: &Principal,
        request: MemoryQueryRequest,
    ) -> Result<Vec<MemoryEntry>> {
        self.core.memory().query(&request.into_filter()?)
    }

    /// Runs a similarity search.
    pub fn search_similarity(
        &self,
        _p: &Principal,
        request: SimilarityRequest,
    ) -> Result<Vec<(MemoryEntry, f32)>> {
        self.core.memory().search_similarity(
            &request.vector,
            &request.domain,
            request.k,
            request.threshold,
        )
    }

    /// Creates a relationship edge.
    pub fn relate(&self, _p: &Principal, request: RelateRequest) -> Result<()> {
        self.core
            .memory()
            .relate(request.source_id, request.target_id, &request.kind)
    }

    /// Traverses relationship edges.
    pub fn related(
        &self,
        _p: &Principal,
        id: MemoryId,
        params: RelatedParams,
    ) -> Result<Vec<MemoryEntry>> {
        self.core
            .memory()
            .related(id, params.kind.as_deref(), params.max_depth)
    }

    /// Aggregates a (service, domain) scope over a trailing window.
    pub fn aggregate(&self, _p: &Principal, params: AggregationParams) -> Result<MemoryAggregation> {
        let (start, end) = trailing_window(params.window_hours)?;
        self.core.memory().aggregate(
            &ServiceId::new(params.service_id),
            &params.domain,
            start,
            end,
        )
    }

    /// Triggers an archive sweep. Requires `admin`.
    pub fn trigger_archive(&self, principal: &Principal) -> Result<crate::tier::ArchiveStats> {
        principal.require_any(&[Role::Admin])?;
        self.core.memory().run_archive_sweep(Timestamp::now())
    }

    /// Records a learning event.
    pub fn record_event(&self, _p: &Principal, request: RecordEventRequest) -> Result<LearningEvent> {
        self.core.learning().record(request.into_new_event())
    }

    /// Queries event history.
    pub fn query_events(
        &self,
        _p: &Principal,
        request: EventQueryRequest,
    ) -> Result<Vec<LearningEvent>> {
        self.core.learning().history(&request.into_filter()?)
    }

    /// Lists patterns ordered by composite score.
    pub fn patterns(&self, _p: &Principal, params: PatternsParams) -> Result<Vec<LearningPattern>> {
        self.core.learning().patterns(&params.domain, params.min_frequency)
    }

    /// Computes the domain metrics rollup.
    pub fn metrics(&self, _p: &Principal, params: MetricsParams) -> Result<MetricsRollup> {
        let (start, end) = trailing_window(params.window_hours)?;
        self.core.learning().metrics(&params.domain, start, end)
    }

    /// Computes trend + forecast.
    pub fn trends(&self, _p: &Principal, params: TrendsParams) -> Result<TrendReport> {
        if params.periods == 0 {
            return Err(ValidationError::invalid_field("periods", "must be at least 1").into());
        }
        self.core.learning().trends(&params.domain, params.periods)
    }

    /// Runs an analytics query in one of the three modes.
    pub fn analytics_query(
        &self,
        _p: &Principal,
        request: AnalyticsQueryRequest,
    ) -> Result<AnalyticsResult> {
        match request.query_type {
            AnalyticsQueryType::Realtime => Ok(AnalyticsResult::Realtime {
                metrics: self.realtime_metrics(&request.domain),
            }),
            AnalyticsQueryType::Historical => {
                let metric = request.metric.ok_or_else(|| {
                    MembraneError::from(ValidationError::required_field("metric"))
                })?;
                let (start, end) = trailing_window(request.window_hours)?;
                let series = self
                    .core
                    .tiers()
                    .warm()
                    .metric_series(&request.domain, &metric, start, end)?
                    .into_iter()
                    .map(|(ts, value)| (ts.to_rfc3339(), value))
                    .collect();
                Ok(AnalyticsResult::Historical { metric, series })
            }
            AnalyticsQueryType::Predictive => Ok(AnalyticsResult::Predictive {
                trend: self.core.learning().trends(&request.domain, default_periods())?,
            }),
        }
    }

    /// Returns the business-metrics bundle for a domain.
    pub fn business_metrics(&self, _p: &Principal, domain: &str) -> Result<MetricsRollup> {
        let (start, end) = trailing_window(default_window_hours())?;
        self.core.learning().metrics(domain, start, end)
    }

    /// Returns the dashboard bundle.
    pub fn dashboard(&self, _p: &Principal) -> Result<DashboardBundle> {
        Ok(DashboardBundle {
            health: self.core.health(),
            domains: self.core.tiers().warm().known_domains()?,
            recent_insights: self.core.tiers().warm().recent_insights(None, 20)?,
        })
    }

    /// Generates a report bundle of the given kind.
    pub fn report(&self, _p: &Principal, kind: &str, domain: &str) -> Result<ReportBundle> {
        let (start, end) = trailing_window(default_window_hours())?;
        let metrics = self.core.learning().metrics(domain, start, end)?;

        let trends = match kind {
            "performance" => Some(self.core.learning().trends(domain, default_periods())?),
            "usage" | "cost" => None,
            other => {
                return Err(ValidationError::invalid_field(
                    "kind",
                    format!("unknown report kind '{}'", other),
                )
                .into())
            }
        };

        Ok(ReportBundle {
            kind: kind.to_string(),
            domain: domain.to_string(),
            metrics,
            trends,
        })
    }

    /// Tracks a custom analytics event as a business-kind entry.
    pub fn track_event(&self, _p: &Principal, request: TrackEventRequest) -> Result<MemoryEntry> {
        let entry = NewMemoryEntry {
            service_id: ServiceId::new(request.service_id),
            agent_id: AgentId::new(request.agent_id),
            domain: request.domain,
            kind: MemoryKind::Business,
            payload: serde_json::json!({
                "event": request.name,
                "properties": request.properties,
            }),
            tags: [request.name, "analytics".to_string()].into_iter().collect(),
            ..Default::default()
        };
        self.core.memory().store(entry)
    }

    /// Lists recent insights, optionally scoped to a domain.
    pub fn insights(&self, _p: &Principal, domain: Option<&str>, limit: usize) -> Result<Vec<Insight>> {
        let limit = if limit == 0 { 50 } else { limit.min(500) };
        self.core.tiers().warm().recent_insights(domain, limit)
    }

    /// Exports entries and events. Requires `admin` or `analyst`.
    pub fn export(&self, principal: &Principal, params: ExportParams) -> Result<ExportBundle> {
        principal.require_any(&[Role::Admin, Role::Analyst])?;

        let entries = self.core.memory().query(&MemoryFilter {
            domain: params.domain.clone(),
            limit: crate::tier::schema::MAX_QUERY_LIMIT,
            ..Default::default()
        })?;
        let events = self.core.learning().history(&EventFilter {
            domain: params.domain,
            limit: crate::tier::schema::MAX_QUERY_LIMIT,
            ..Default::default()
        })?;

        Ok(ExportBundle {
            entries,
            events,
            exported_at: Timestamp::now().to_rfc3339(),
        })
    }

    /// Takes the health report.
    pub fn health(&self) -> HealthReport {
        self.core.health()
    }

    fn realtime_metrics(&self, domain: &str) -> Vec<RealtimeMetricView> {
        self.core
            .tiers()
            .hot()
            .current_metrics()
            .into_iter()
            .filter(|m| m.domain == domain)
            .map(|m| RealtimeMetricView {
                metric: m.metric,
                rate_per_sec: m.rate_per_sec,
                ema_latency_ms: m.ema_latency_ms,
                total: m.total,
            })
            .collect()
    }
}

/// Parses an RFC3339 field or fails with a validation error naming it.
fn parse_rfc3339(field: &str, value: &str) -> Result<Timestamp> {
    Timestamp::from_rfc3339(value).ok_or_else(|| {
        ValidationError::invalid_field(field, format!("'{}' is not a valid RFC3339 instant", value))
            .into()
    })
}

/// Computes a `[now - hours, now)` window.
fn trailing_window(hours: i64) -> Result<(Timestamp, Timestamp)> {
    if hours <= 0 {
        return Err(ValidationError::invalid_field("window_hours", "must be positive").into());
    }
    let end = Timestamp::now();
    let start = Timestamp::from_millis(end.as_millis() - hours * 3600 * 1000);
    Ok((start, end))
}
