//! The learning ledger: record path, history, rollups, trends.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::bus::{BusEvent, EventBus};
use crate::error::Result;
use crate::learning::patterns::{pattern_signature, LearningPattern};
use crate::learning::types::{
    CostMetrics, EventFilter, EventKind, LearningEvent, MetricsRollup, NewLearningEvent,
    PatternSummary, TrendDirection, TrendReport,
};
use crate::learning::validate_new_event;
use crate::tier::schema::{DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
use crate::tier::TierStore;
use crate::types::{EventId, Timestamp};

/// Below this first-half mean, performance improvement reads as 0 rather
/// than dividing by a near-zero baseline.
const IMPROVEMENT_EPSILON: f64 = 1e-6;

/// Regression slopes within ±this bound classify as a stable trend.
const STABLE_SLOPE: f64 = 0.05;

/// Fixed forecast horizon, in periods.
const FORECAST_PERIODS: usize = 3;

/// One trend period, in milliseconds (daily windows).
const PERIOD_MILLIS: i64 = 24 * 3600 * 1000;

/// How many top patterns a rollup carries.
const ROLLUP_TOP_PATTERNS: usize = 5;

/// The learning ledger: append-only event log, derived pattern index,
/// and rollup metrics.
pub struct LearningLedger {
    tiers: Arc<TierStore>,
    bus: Arc<EventBus>,
}

impl LearningLedger {
    /// Builds the ledger over the shared tier store.
    pub fn new(tiers: Arc<TierStore>, bus: Arc<EventBus>) -> Self {
        Self { tiers, bus }
    }

    /// Records a new learning event.
    ///
    /// Assigns the id and timestamp, appends the immutable row, bumps the
    /// hot-tier pattern and metric counters, and emits `learning.recorded`.
    #[instrument(skip(self, new), fields(domain = %new.domain))]
    pub fn record(&self, new: NewLearningEvent) -> Result<LearningEvent> {
        validate_new_event(&new)?;

        let event = LearningEvent {
            id: EventId::new(),
            service_id: new.service_id,
            agent_id: new.agent_id,
            domain: new.domain,
            kind: new.kind,
            input: new.input,
            context: new.context,
            output: new.output,
            feedback: new.feedback,
            impact: new.impact,
            cost: new.cost,
            importance: new.importance,
            timestamp: Timestamp::now(),
            parent_event_id: new.parent_event_id,
        };

        // Freshly minted UUIDv7 ids don't collide; a duplicate here means
        // the clock produced a repeat, which append_event surfaces as false
        self.tiers.warm().append_event(&event)?;
        self.fold_into_counters(&event);

        self.bus.publish(BusEvent::LearningRecorded(event.clone()));

        info!(id = %event.id, kind = event.kind.as_str(), "Learning event recorded");
        Ok(event)
    }

    /// Applies a replicated event from the inbound sync path.
    ///
    /// Idempotent by id: a duplicate delivery writes nothing and returns
    /// `false`. Accepted applies update the rolling counters but do NOT
    /// re-publish on the bus.
    #[instrument(skip(self, event), fields(id = %event.id))]
    pub fn apply_replicated(&self, event: LearningEvent) -> Result<bool> {
        if !self.tiers.warm().append_event(&event)? {
            return Ok(false);
        }
        self.fold_into_counters(&event);
        Ok(true)
    }

    /// Queries event history, newest first.
    #[instrument(skip(self, filter))]
    pub fn history(&self, filter: &EventFilter) -> Result<Vec<LearningEvent>> {
        let limit = if filter.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            filter.limit.min(MAX_QUERY_LIMIT)
        };

        let ids = self.tiers.warm().recent_event_ids(filter.domain.as_deref())?;

        let mut matches = Vec::new();
        let mut skipped = 0usize;
        for id in ids {
            if matches.len() >= limit {
                break;
            }
            let Some(event) = self.tiers.warm().get_event(id)? else {
                continue;
            };
            if !filter.matches(&event) {
                continue;
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            matches.push(event);
        }
        Ok(matches)
    }

    /// Lists a domain's patterns at or above `min_frequency`, ordered by
    /// composite score descending.
    #[instrument(skip(self))]
    pub fn patterns(&self, domain: &str, min_frequency: u64) -> Result<Vec<LearningPattern>> {
        let mut rows: Vec<LearningPattern> = self
            .tiers
            .warm()
            .patterns_in_domain(domain)?
            .into_iter()
            .filter(|p| p.frequency >= min_frequency)
            .collect();

        rows.sort_by(|a, b| {
            b.composite_score()
                .partial_cmp(&a.composite_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }

    /// Computes the metrics rollup for a domain over `[start, end)`.
    #[instrument(skip(self))]
    pub fn metrics(&self, domain: &str, start: Timestamp, end: Timestamp) -> Result<MetricsRollup> {
        let events = self.events_in_window(domain, start, end)?;

        let total = events.len() as u64;
        let mut by_kind: HashMap<EventKind, u64> = HashMap::new();
        let mut adaptations = 0u64;
        let mut with_feedback = 0u64;
        let mut cost = CostMetrics::default();
        let mut latency_count = 0u64;
        let mut latency_sum = 0u64;

        for event in &events {
            *by_kind.entry(event.kind).or_default() += 1;
            if event.impact.model_updated {
                adaptations += 1;
            }
            if event.feedback.is_some() {
                with_feedback += 1;
            }
            if let Some(ref c) = event.cost {
                cost.cost += c.cost;
                cost.tokens += c.tokens;
                latency_sum += c.latency_ms;
                latency_count += 1;
            }
        }
        cost.latency_ms = if latency_count > 0 {
            latency_sum / latency_count
        } else {
            0
        };

        let span_days = (end.as_millis() - start.as_millis()).max(1) as f64 / PERIOD_MILLIS as f64;

        let mut by_kind: Vec<(EventKind, u64)> = by_kind.into_iter().collect();
        by_kind.sort_by_key(|(kind, _)| kind.as_u8());

        let top_patterns = self
            .patterns(domain, 0)?
            .into_iter()
            .take(ROLLUP_TOP_PATTERNS)
            .map(|p| PatternSummary {
                signature: p.signature.clone(),
                frequency: p.frequency,
                score: p.composite_score(),
            })
            .collect();

        Ok(MetricsRollup {
            domain: domain.to_string(),
            window_start: start,
            window_end: end,
            total_events: total,
            by_kind,
            events_per_day: total as f64 / span_days,
            adaptation_rate: rate(adaptations, total),
            feedback_rate: rate(with_feedback, total),
            performance_improvement: performance_improvement(&events, start, end),
            top_patterns,
            cost,
        })
    }

    /// Computes the performance trend over `periods` daily windows ending
    /// now, with a fixed 3-period linear forecast.
    ///
    /// A series with no judged events in any window classifies as stable
    /// with a zero forecast.
    #[instrument(skip(self))]
    pub fn trends(&self, domain: &str, periods: usize) -> Result<TrendReport> {
        let now = Timestamp::now();
        let mut series = Vec::with_capacity(periods);

        for i in (0..periods).rev() {
            let end = Timestamp::from_millis(now.as_millis() - i as i64 * PERIOD_MILLIS);
            let start = Timestamp::from_millis(end.as_millis() - PERIOD_MILLIS);
            let events = self.events_in_window(domain, start, end)?;
            series.push(performance_improvement(&events, start, end));
        }

        let slope = regression_slope(&series);
        let trend = if slope.abs() <= STABLE_SLOPE {
            TrendDirection::Stable
        } else if slope > 0.0 {
            TrendDirection::Improving
        } else {
            TrendDirection::Declining
        };

        let forecast = forecast_linear(&series, FORECAST_PERIODS);

        let mut insights = Vec::new();
        match trend {
            TrendDirection::Improving => insights.push(format!(
                "performance improving at {:.2} per period over the last {} periods",
                slope, periods
            )),
            TrendDirection::Declining => insights.push(format!(
                "performance declining at {:.2} per period; review recent adaptations",
                slope.abs()
            )),
            TrendDirection::Stable => {
                insights.push("performance is stable across the analyzed periods".to_string())
            }
        }
        if series.iter().all(|v| *v == 0.0) {
            insights.push("no judged feedback in the analyzed periods".to_string());
        }

        debug!(domain = domain, slope = slope, ?trend, "Trend computed");
        Ok(TrendReport {
            domain: domain.to_string(),
            trend,
            series,
            forecast,
            insights,
        })
    }

    /// Persists the hot-tier pattern counters into warm rows.
    ///
    /// Success rate is recomputed from the bounded sample of event ids on
    /// each sweep, so a drifting rolling estimate self-corrects. Runs on
    /// the pattern sweep cadence.
    #[instrument(skip(self))]
    pub fn run_pattern_sweep(&self) -> Result<usize> {
        let drained = self.tiers.hot().drain_patterns();
        let count = drained.len();

        for ((domain, signature), counter) in drained {
            let prior = self.tiers.warm().get_pattern(&domain, &signature)?;
            let mut row = counter.fold_into(&domain, &signature, prior);

            // Recompute success rate from the sample window
            let mut judged = 0u64;
            let mut correct = 0u64;
            for id in &row.sample_event_ids {
                if let Some(event) = self.tiers.warm().get_event(*id)? {
                    if let Some(was_correct) = event.feedback.as_ref().and_then(|f| f.correct) {
                        judged += 1;
                        if was_correct {
                            correct += 1;
                        }
                    }
                }
            }
            if judged > 0 {
                row.success_rate = correct as f64 / judged as f64;
            }

            self.tiers.warm().upsert_pattern(&row)?;
        }

        if count > 0 {
            debug!(patterns = count, "Pattern sweep persisted counters");
        }
        Ok(count)
    }

    /// Loads the full events for a domain window, oldest first.
    fn events_in_window(
        &self,
        domain: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<LearningEvent>> {
        let ids = self.tiers.warm().event_ids_in_window(domain, start, end)?;
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = self.tiers.warm().get_event(id)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Bumps the hot-tier counters a recorded event feeds.
    fn fold_into_counters(&self, event: &LearningEvent) {
        let signature = pattern_signature(event);
        self.tiers.hot().observe_pattern(&signature, event);
        self.tiers.hot().bump_metric(&event.domain, event.kind.as_str());
        if let Some(ref cost) = event.cost {
            self.tiers.hot().observe_latency(&event.domain, cost.latency_ms as f64);
        }
    }
}

/// Midpoint-split performance improvement over a window, in percent.
///
/// The window splits at its time midpoint; each half contributes the mean
/// output confidence of events whose feedback judged them correct. The
/// result is `(second - first) / first * 100`, or 0 when the first half's
/// mean is below a small epsilon (near-zero baselines would explode the
/// ratio).
pub fn performance_improvement(events: &[LearningEvent], start: Timestamp, end: Timestamp) -> f64 {
    let mid = Timestamp::from_millis((start.as_millis() + end.as_millis()) / 2);

    let half_mean = |pred: &dyn Fn(&LearningEvent) -> bool| -> f64 {
        let confidences: Vec<f64> = events
            .iter()
            .filter(|e| pred(e))
            .filter(|e| e.feedback.as_ref().and_then(|f| f.correct) == Some(true))
            .map(|e| e.output.confidence)
            .collect();
        if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        }
    };

    let first = half_mean(&|e| e.timestamp < mid);
    let second = half_mean(&|e| e.timestamp >= mid);

    if first < IMPROVEMENT_EPSILON {
        return 0.0;
    }
    (second - first) / first * 100.0
}

/// Fraction helper guarding the zero denominator.
fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Least-squares slope of a series indexed 0..n.
fn regression_slope(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n_f;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Extrapolates the fitted line `horizon` periods past the series.
fn forecast_linear(series: &[f64], horizon: usize) -> Vec<f64> {
    if series.is_empty() {
        return vec![0.0; horizon];
    }
    let slope = regression_slope(series);
    let n = series.len() as f64;
    let mean_y = series.iter().sum::<f64>() / n;
    let mean_x = (n - 1.0) / 2.0;
    let intercept = mean_y - slope * mean_x;

    (0..horizon)
        .map(|i| intercept + slope * (n + i as f64))
        .collect()
}
