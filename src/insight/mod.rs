//! Aggregation and insight pipeline.
//!
//! Three schedules drive this module:
//!
//! 1. **Real-time metric fold** (every second) - hot-tier counters become
//!    rate-per-second and EMA-smoothed latency.
//! 2. **Rollup persist** (every 5 minutes) - hot counter totals copy into
//!    the warm `metrics` time series.
//! 3. **Insight generation** (hourly) - a fixed rule set evaluates each
//!    known domain's last-hour aggregates; every fired rule persists one
//!    [`Insight`] row and emits `insight.created`.
//!
//! # Rule set
//!
//! | Rule | Condition | Severity |
//! |------|-----------|----------|
//! | HighErrorRate | error_rate > 0.10 | high |
//! | LatencyDegradation | avg_response_time > 500ms | medium |
//! | AcceleratedLearning | learning_rate > 10 events/day | low |
//! | LowFeedback | feedback_rate < 0.20 | medium |
//!
//! Rules only evaluate domains with at least one event in the window;
//! idle domains never fire.

pub mod types;

pub use types::{Insight, InsightType, MetricSnapshot, Severity};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::bus::{BusEvent, EventBus};
use crate::error::Result;
use crate::tier::{RealtimeMetric, TierStore};
use crate::types::{InsightId, Timestamp};

/// Error-rate threshold for the HighErrorRate rule.
const HIGH_ERROR_RATE: f64 = 0.10;
/// Latency threshold (ms) for the LatencyDegradation rule.
const HIGH_LATENCY_MS: f64 = 500.0;
/// Events-per-day threshold for the AcceleratedLearning rule.
const ACCELERATED_RATE_PER_DAY: f64 = 10.0;
/// Feedback-rate floor for the LowFeedback rule.
const LOW_FEEDBACK_RATE: f64 = 0.20;

/// Evaluation window for the insight pass, in milliseconds (one hour).
const INSIGHT_WINDOW_MILLIS: i64 = 3600 * 1000;

/// The periodic aggregation and insight pipeline.
pub struct InsightPipeline {
    tiers: Arc<TierStore>,
    bus: Arc<EventBus>,
}

impl InsightPipeline {
    /// Builds the pipeline over the shared tier store.
    pub fn new(tiers: Arc<TierStore>, bus: Arc<EventBus>) -> Self {
        Self { tiers, bus }
    }

    /// Runs one real-time fold over the hot-tier metric cells.
    ///
    /// `elapsed` is the time since the previous fold; the folded rates
    /// stay readable from the hot tier for dashboards and health.
    pub fn run_realtime_fold(&self, elapsed: Duration) -> Vec<RealtimeMetric> {
        self.tiers.hot().fold_metrics(elapsed)
    }

    /// Copies hot counter totals into the warm metric time series.
    #[instrument(skip(self))]
    pub fn run_rollup_persist(&self, now: Timestamp) -> Result<usize> {
        let snapshot = self.tiers.hot().snapshot_metrics();
        for (domain, metric, value) in &snapshot {
            self.tiers.warm().record_metric(domain, metric, now, *value)?;
        }
        if !snapshot.is_empty() {
            debug!(points = snapshot.len(), "Rollup persisted");
        }
        Ok(snapshot.len())
    }

    /// Runs one insight pass over every known domain.
    ///
    /// Returns the persisted insights. Each fired rule also lands on the
    /// bus as `insight.created`.
    #[instrument(skip(self))]
    pub fn run_insight_pass(&self, now: Timestamp) -> Result<Vec<Insight>> {
        let window_start = Timestamp::from_millis(now.as_millis() - INSIGHT_WINDOW_MILLIS);
        let mut generated = Vec::new();

        for domain in self.tiers.warm().known_domains()? {
            let snapshot = self.domain_snapshot(&domain, window_start, now)?;
            if snapshot.total_events == 0 {
                continue;
            }

            for insight in evaluate_rules(&domain, &snapshot, now) {
                self.tiers.warm().save_insight(&insight)?;
                self.bus.publish(BusEvent::InsightCreated(insight.clone()));
                info!(
                    domain = %domain,
                    title = %insight.title,
                    severity = ?insight.severity,
                    "Insight generated"
                );
                generated.push(insight);
            }
        }

        Ok(generated)
    }

    /// Computes a domain's metric snapshot for the evaluation window.
    fn domain_snapshot(
        &self,
        domain: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<MetricSnapshot> {
        let ids = self.tiers.warm().event_ids_in_window(domain, start, end)?;

        let mut total = 0u64;
        let mut incorrect = 0u64;
        let mut with_feedback = 0u64;
        let mut latency_sum = 0.0f64;
        let mut latency_count = 0u64;

        for id in ids {
            let Some(event) = self.tiers.warm().get_event(id)? else {
                continue;
            };
            total += 1;
            if let Some(ref feedback) = event.feedback {
                with_feedback += 1;
                if feedback.correct == Some(false) {
                    incorrect += 1;
                }
            }
            if let Some(ref cost) = event.cost {
                latency_sum += cost.latency_ms as f64;
                latency_count += 1;
            }
        }

        let span_days =
            (end.as_millis() - start.as_millis()).max(1) as f64 / (24.0 * 3600.0 * 1000.0);

        Ok(MetricSnapshot {
            total_events: total,
            error_rate: if total > 0 {
                incorrect as f64 / total as f64
            } else {
                0.0
            },
            avg_response_time_ms: if latency_count > 0 {
                latency_sum / latency_count as f64
            } else {
                0.0
            },
            learning_rate_per_day: total as f64 / span_days,
            feedback_rate: if total > 0 {
                with_feedback as f64 / total as f64
            } else {
                0.0
            },
        })
    }
}

/// Evaluates the fixed rule set against one domain snapshot.
pub fn evaluate_rules(domain: &str, snapshot: &MetricSnapshot, now: Timestamp) -> Vec<Insight> {
    let mut fired = Vec::new();

    if snapshot.error_rate > HIGH_ERROR_RATE {
        fired.push(Insight {
            id: InsightId::new(),
            domain: domain.to_string(),
            insight_type: InsightType::Anomaly,
            severity: Severity::High,
            title: "High error rate".to_string(),
            description: format!(
                "{:.0}% of the window's events were judged incorrect (threshold {:.0}%)",
                snapshot.error_rate * 100.0,
                HIGH_ERROR_RATE * 100.0
            ),
            metrics: snapshot.clone(),
            recommendations: vec!["review recent model changes".to_string()],
            created_at: now,
        });
    }

    if snapshot.avg_response_time_ms > HIGH_LATENCY_MS {
        fired.push(Insight {
            id: InsightId::new(),
            domain: domain.to_string(),
            insight_type: InsightType::Risk,
            severity: Severity::Medium,
            title: "Latency degradation".to_string(),
            description: format!(
                "average response time {:.0}ms exceeds {:.0}ms",
                snapshot.avg_response_time_ms, HIGH_LATENCY_MS
            ),
            metrics: snapshot.clone(),
            recommendations: vec!["scale out or optimize the slow path".to_string()],
            created_at: now,
        });
    }

    if snapshot.learning_rate_per_day > ACCELERATED_RATE_PER_DAY {
        fired.push(Insight {
            id: InsightId::new(),
            domain: domain.to_string(),
            insight_type: InsightType::Opportunity,
            severity: Severity::Low,
            title: "Accelerated learning".to_string(),
            description: format!(
                "{:.0} events/day exceeds the {:.0}/day baseline",
                snapshot.learning_rate_per_day, ACCELERATED_RATE_PER_DAY
            ),
            metrics: snapshot.clone(),
            recommendations: vec!["continue the current strategy".to_string()],
            created_at: now,
        });
    }

    if snapshot.feedback_rate < LOW_FEEDBACK_RATE {
        fired.push(Insight {
            id: InsightId::new(),
            domain: domain.to_string(),
            insight_type: InsightType::Risk,
            severity: Severity::Medium,
            title: "Low feedback coverage".to_string(),
            description: format!(
                "only {:.0}% of events carried feedback (floor {:.0}%)",
                snapshot.feedback_rate * 100.0,
                LOW_FEEDBACK_RATE * 100.0
            ),
            metrics: snapshot.clone(),
            recommendations: vec!["add feedback prompts to the agent loop".to_string()],
            created_at: now,
        });
    }

    fired
}
