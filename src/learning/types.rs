//! Type definitions for learning events.
//!
//! A **learning event** is an immutable record of an agent's learning step:
//! what went in, what came out, how it was judged, and what it changed.
//! Corrections never mutate an event; they are new events referencing the
//! original through `parent_event_id`.

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, EventId, ServiceId, Timestamp};

// ============================================================================
// EventKind
// ============================================================================

/// The kind of learning step an event records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A training pass over labeled data.
    Training,
    /// Human or downstream feedback on a prediction.
    Feedback,
    /// A correction of an earlier event's output.
    Correction,
    /// A reinforcement signal for a successful behavior.
    Reinforcement,
    /// A runtime adaptation (model or configuration change applied).
    Adaptation,
}

impl EventKind {
    /// Returns the compact 1-byte discriminant for use in index keys.
    pub const fn as_u8(&self) -> u8 {
        match self {
            Self::Training => 0,
            Self::Feedback => 1,
            Self::Correction => 2,
            Self::Reinforcement => 3,
            Self::Adaptation => 4,
        }
    }

    /// Restores a kind from its index-key discriminant.
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Training),
            1 => Some(Self::Feedback),
            2 => Some(Self::Correction),
            3 => Some(Self::Reinforcement),
            4 => Some(Self::Adaptation),
            _ => None,
        }
    }

    /// Returns the canonical lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Feedback => "feedback",
            Self::Correction => "correction",
            Self::Reinforcement => "reinforcement",
            Self::Adaptation => "adaptation",
        }
    }
}

// ============================================================================
// Snapshots, feedback, impact
// ============================================================================

/// What the model produced for this learning step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutputSnapshot {
    /// The primary prediction, opaque to the core.
    pub prediction: serde_json::Value,

    /// Confidence in [0, 1] the producer attached to the prediction.
    pub confidence: f64,

    /// Alternative predictions, best-first.
    pub alternatives: Vec<serde_json::Value>,
}

/// Downstream judgment of an event's output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventFeedback {
    /// Rating in [0, 5], if the judge supplied one.
    pub rating: Option<f64>,

    /// Whether the output was judged correct.
    pub correct: Option<bool>,

    /// The corrected value, when the judge supplied one.
    pub corrected: Option<serde_json::Value>,

    /// Free-text explanation.
    pub explanation: Option<String>,
}

/// What the learning step changed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventImpact {
    /// Whether a model was actually updated by this step.
    pub model_updated: bool,

    /// Signed performance delta. Positive = improvement.
    pub performance_delta: f64,

    /// Ids of models affected by this step.
    pub affected_models: Vec<String>,
}

/// Optional cost accounting for a learning step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CostMetrics {
    /// Monetary cost attributed to the step, in fractional currency units.
    pub cost: f64,

    /// Tokens consumed.
    pub tokens: u64,

    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
}

// ============================================================================
// LearningEvent — the full stored record
// ============================================================================

/// A stored learning event. Immutable after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LearningEvent {
    /// Unique identifier (UUID v7, time-ordered).
    pub id: EventId,

    /// The service that recorded the event.
    pub service_id: ServiceId,

    /// The agent that performed the learning step.
    pub agent_id: AgentId,

    /// Domain tag scoping the event.
    pub domain: String,

    /// What kind of learning step this was.
    pub kind: EventKind,

    /// Snapshot of the input, opaque to the core. The sorted top-level
    /// key names feed the pattern signature.
    pub input: serde_json::Value,

    /// Snapshot of contextual state at the time of the step.
    pub context: serde_json::Value,

    /// What the model produced.
    pub output: OutputSnapshot,

    /// Downstream judgment, if any arrived with the event.
    pub feedback: Option<EventFeedback>,

    /// What the step changed.
    pub impact: EventImpact,

    /// Cost accounting, if the producer tracked it.
    pub cost: Option<CostMetrics>,

    /// Importance score in [0, 10].
    pub importance: f32,

    /// When the step happened.
    pub timestamp: Timestamp,

    /// The event this one corrects or refines, if any.
    pub parent_event_id: Option<EventId>,
}

// ============================================================================
// NewLearningEvent — input for LearningLedger::record()
// ============================================================================

/// Input for recording a new learning event.
///
/// The `id` and `timestamp` are assigned by the ledger.
#[derive(Clone, Debug)]
pub struct NewLearningEvent {
    /// The service recording the event.
    pub service_id: ServiceId,

    /// The agent that performed the step.
    pub agent_id: AgentId,

    /// Domain tag.
    pub domain: String,

    /// Event kind.
    pub kind: EventKind,

    /// Input snapshot.
    pub input: serde_json::Value,

    /// Context snapshot.
    pub context: serde_json::Value,

    /// Output snapshot.
    pub output: OutputSnapshot,

    /// Optional feedback.
    pub feedback: Option<EventFeedback>,

    /// Impact block.
    pub impact: EventImpact,

    /// Optional cost metrics.
    pub cost: Option<CostMetrics>,

    /// Importance score in [0, 10].
    pub importance: f32,

    /// Optional parent event (corrections reference the original).
    pub parent_event_id: Option<EventId>,
}

impl Default for NewLearningEvent {
    fn default() -> Self {
        Self {
            service_id: ServiceId::new("anonymous"),
            agent_id: AgentId::new("anonymous"),
            domain: String::new(),
            kind: EventKind::Training,
            input: serde_json::Value::Null,
            context: serde_json::Value::Null,
            output: OutputSnapshot::default(),
            feedback: None,
            impact: EventImpact::default(),
            cost: None,
            importance: 5.0,
            parent_event_id: None,
        }
    }
}

// ============================================================================
// EventFilter — history query criteria
// ============================================================================

/// Filter criteria for learning-event history queries.
///
/// Mirrors the memory filter plus event kind. Fields set to `None` are
/// not filtered on.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only events recorded by this service.
    pub service_id: Option<ServiceId>,

    /// Only events performed by this agent.
    pub agent_id: Option<AgentId>,

    /// Only events in this domain.
    pub domain: Option<String>,

    /// Only events of this kind.
    pub kind: Option<EventKind>,

    /// Only events at or after this instant.
    pub since: Option<Timestamp>,

    /// Only events strictly before this instant.
    pub until: Option<Timestamp>,

    /// Only events with importance >= this threshold.
    pub min_importance: Option<f32>,

    /// Number of leading results to skip (pagination).
    pub offset: usize,

    /// Maximum results to return. 0 means the ledger default.
    pub limit: usize,
}

impl EventFilter {
    /// Returns `true` if the given event passes all filter criteria.
    pub fn matches(&self, event: &LearningEvent) -> bool {
        if let Some(ref service_id) = self.service_id {
            if &event.service_id != service_id {
                return false;
            }
        }

        if let Some(ref agent_id) = self.agent_id {
            if &event.agent_id != agent_id {
                return false;
            }
        }

        if let Some(ref domain) = self.domain {
            if &event.domain != domain {
                return false;
            }
        }

        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.timestamp >= until {
                return false;
            }
        }

        if let Some(min) = self.min_importance {
            if event.importance < min {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// Rollups and trends
// ============================================================================

/// Aggregate rollup over a domain's learning events within a window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsRollup {
    /// The domain scope.
    pub domain: String,

    /// Window start (inclusive).
    pub window_start: Timestamp,

    /// Window end (exclusive).
    pub window_end: Timestamp,

    /// Total events in the window.
    pub total_events: u64,

    /// Event counts broken down by kind.
    pub by_kind: Vec<(EventKind, u64)>,

    /// Events per day across the window.
    pub events_per_day: f64,

    /// Fraction of events with `impact.model_updated` set.
    pub adaptation_rate: f64,

    /// Fraction of events carrying feedback.
    pub feedback_rate: f64,

    /// Midpoint-split confidence improvement, percent. See
    /// [`performance_improvement`](crate::learning::performance_improvement).
    pub performance_improvement: f64,

    /// Top patterns by composite score, best-first.
    pub top_patterns: Vec<PatternSummary>,

    /// Cost accounting summed over the window.
    pub cost: CostMetrics,
}

/// Compact view of a pattern row for rollups.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternSummary {
    /// The pattern's input-shape signature.
    pub signature: String,

    /// Times the pattern has been observed.
    pub frequency: u64,

    /// Composite score in [0, 1].
    pub score: f64,
}

/// Direction of a domain's performance trend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    /// Regression slope above the stability threshold.
    Improving,
    /// Slope within ±0.05.
    Stable,
    /// Slope below the negative stability threshold.
    Declining,
}

/// Trend analysis over equal-length windows of a domain's history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrendReport {
    /// The domain analyzed.
    pub domain: String,

    /// Classified direction of the performance series.
    pub trend: TrendDirection,

    /// Per-window performance-improvement values, oldest first.
    pub series: Vec<f64>,

    /// Linear extrapolation of the next periods (empty when the series
    /// is empty).
    pub forecast: Vec<f64>,

    /// Human-readable observations derived from the series.
    pub insights: Vec<String>,
}
