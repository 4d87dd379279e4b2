//! Type definitions for insights.
//!
//! An **insight** is a persisted finding produced by evaluating a fixed
//! rule set over a domain's recent aggregates. Each fired rule yields one
//! insight row and an `insight.created` bus event.

use serde::{Deserialize, Serialize};

use crate::types::{InsightId, Timestamp};

/// The category of finding an insight represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    /// Something is off relative to the baseline.
    Anomaly,
    /// A sustained directional movement.
    Trend,
    /// A favorable condition worth exploiting.
    Opportunity,
    /// A condition that may degrade outcomes if ignored.
    Risk,
}

/// How urgent an insight is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; no action required.
    Low,
    /// Worth scheduling a response.
    Medium,
    /// Needs prompt attention.
    High,
}

/// The metric aggregate a rule evaluation ran against.
///
/// Persisted alongside the insight so the numbers that fired the rule
/// survive later metric churn.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Total learning events in the evaluation window.
    pub total_events: u64,

    /// Fraction of judged events marked incorrect, in [0, 1].
    pub error_rate: f64,

    /// Mean recorded latency across the window, milliseconds.
    pub avg_response_time_ms: f64,

    /// Learning events per day across the window.
    pub learning_rate_per_day: f64,

    /// Fraction of events carrying feedback, in [0, 1].
    pub feedback_rate: f64,
}

/// A persisted finding over a domain's recent aggregates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Insight {
    /// Unique identifier.
    pub id: InsightId,

    /// The domain the finding concerns.
    pub domain: String,

    /// Finding category.
    pub insight_type: InsightType,

    /// Urgency.
    pub severity: Severity,

    /// Short human-readable title.
    pub title: String,

    /// Longer description of what fired and why it matters.
    pub description: String,

    /// The aggregates the rule evaluated.
    pub metrics: MetricSnapshot,

    /// Suggested responses.
    pub recommendations: Vec<String>,

    /// When the insight was generated.
    pub created_at: Timestamp,
}
