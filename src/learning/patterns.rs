//! Derived learning patterns.
//!
//! A **pattern** aggregates recurring learning situations keyed by
//! `(domain, signature)`, where the signature is deterministic from an
//! event's kind and the sorted top-level key names of its input and
//! context snapshots. Two events with the same input shape land on the
//! same pattern row regardless of payload values.
//!
//! Maintenance is two-phase: each recorded event bumps an in-memory
//! rolling counter (hot tier, atomic field increments), and the periodic
//! pattern sweep folds counters into the persisted `learning_patterns`
//! rows.

use serde::{Deserialize, Serialize};

use crate::learning::types::LearningEvent;
use crate::types::{EventId, Timestamp};

/// Upper bound on sample event ids retained per pattern.
pub const MAX_PATTERN_SAMPLES: usize = 50;

/// Weight of the success rate in the composite score.
const W_SUCCESS: f64 = 0.5;
/// Weight of the average confidence in the composite score.
const W_CONFIDENCE: f64 = 0.3;
/// Weight of the feedback score in the composite score.
const W_FEEDBACK: f64 = 0.2;

/// Computes the deterministic input-shape signature for an event.
///
/// Format: `{kind}:in[{sorted input keys}]:ctx[{sorted context keys}]`.
/// Non-object snapshots contribute an empty key list, so scalar inputs of
/// the same kind still collapse onto one pattern.
pub fn pattern_signature(event: &LearningEvent) -> String {
    format!(
        "{}:in[{}]:ctx[{}]",
        event.kind.as_str(),
        sorted_keys(&event.input),
        sorted_keys(&event.context),
    )
}

fn sorted_keys(value: &serde_json::Value) -> String {
    match value.as_object() {
        Some(map) => {
            // serde_json object iteration is insertion-ordered; sort for determinism
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            keys.join(",")
        }
        None => String::new(),
    }
}

/// A persisted pattern row, unique on `(domain, signature)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LearningPattern {
    /// The domain scope.
    pub domain: String,

    /// Deterministic input-shape signature.
    pub signature: String,

    /// Times the pattern has been observed.
    pub frequency: u64,

    /// First observation instant.
    pub first_seen: Timestamp,

    /// Most recent observation instant.
    pub last_seen: Timestamp,

    /// Rolling fraction of observations judged correct, in [0, 1].
    pub success_rate: f64,

    /// Rolling mean output confidence, in [0, 1].
    pub avg_confidence: f64,

    /// Rolling mean feedback rating normalized to [0, 1].
    pub feedback_score: f64,

    /// Bounded window of sample event ids (newest retained).
    pub sample_event_ids: Vec<EventId>,

    /// Recommendation hints derived from the rolling stats.
    pub recommendations: Vec<String>,
}

impl LearningPattern {
    /// Returns the composite score `0.5*success + 0.3*avg_confidence +
    /// 0.2*feedback_score`, clamped to [0, 1].
    pub fn composite_score(&self) -> f64 {
        let score = W_SUCCESS * self.success_rate
            + W_CONFIDENCE * self.avg_confidence
            + W_FEEDBACK * self.feedback_score;
        score.clamp(0.0, 1.0)
    }
}

/// In-memory rolling accumulator for one `(domain, signature)` pair.
///
/// Lives in the hot tier between pattern sweeps. All fields are plain
/// sums so that merging a counter into a persisted row is a pure fold.
#[derive(Clone, Debug, Default)]
pub struct PatternCounter {
    /// Observations since the last sweep.
    pub frequency: u64,

    /// Observations whose feedback judged the output correct.
    pub success_count: u64,

    /// Observations carrying any feedback block.
    pub feedback_count: u64,

    /// Observations whose feedback judged correctness either way.
    pub judged_count: u64,

    /// Sum of output confidences.
    pub confidence_sum: f64,

    /// Sum of feedback ratings (raw 0-5 scale).
    pub rating_sum: f64,

    /// Count of observations that carried a rating.
    pub rating_count: u64,

    /// First observation instant in this window.
    pub first_seen: Option<Timestamp>,

    /// Most recent observation instant in this window.
    pub last_seen: Option<Timestamp>,

    /// Sample event ids observed in this window (bounded).
    pub samples: Vec<EventId>,
}

impl PatternCounter {
    /// Folds one event into the counter.
    pub fn observe(&mut self, event: &LearningEvent) {
        self.frequency += 1;
        self.confidence_sum += event.output.confidence;

        if let Some(ref feedback) = event.feedback {
            self.feedback_count += 1;
            if let Some(correct) = feedback.correct {
                self.judged_count += 1;
                if correct {
                    self.success_count += 1;
                }
            }
            if let Some(rating) = feedback.rating {
                self.rating_sum += rating;
                self.rating_count += 1;
            }
        }

        if self.first_seen.is_none() {
            self.first_seen = Some(event.timestamp);
        }
        self.last_seen = Some(event.timestamp);

        if self.samples.len() < MAX_PATTERN_SAMPLES {
            self.samples.push(event.id);
        }
    }

    /// Merges this window's counts into a persisted pattern row,
    /// producing the updated row.
    ///
    /// Rolling means are frequency-weighted across the old row and the
    /// new window, so repeated sweeps converge on the true averages.
    pub fn fold_into(&self, domain: &str, signature: &str, prior: Option<LearningPattern>) -> LearningPattern {
        let now = Timestamp::now();
        let mut row = prior.unwrap_or(LearningPattern {
            domain: domain.to_string(),
            signature: signature.to_string(),
            frequency: 0,
            first_seen: self.first_seen.unwrap_or(now),
            last_seen: self.last_seen.unwrap_or(now),
            success_rate: 0.0,
            avg_confidence: 0.0,
            feedback_score: 0.0,
            sample_event_ids: Vec::new(),
            recommendations: Vec::new(),
        });

        let old_freq = row.frequency as f64;
        let new_freq = self.frequency as f64;
        let total = old_freq + new_freq;
        if total == 0.0 {
            return row;
        }

        let window_confidence = self.confidence_sum / new_freq.max(1.0);
        row.avg_confidence =
            (row.avg_confidence * old_freq + window_confidence * new_freq) / total;

        // Success rate is judged-observation-weighted within the window,
        // then frequency-weighted across windows like the other means.
        let window_success = if self.judged_count > 0 {
            self.success_count as f64 / self.judged_count as f64
        } else {
            row.success_rate
        };
        row.success_rate = (row.success_rate * old_freq + window_success * new_freq) / total;

        let window_feedback = if self.rating_count > 0 {
            (self.rating_sum / self.rating_count as f64 / 5.0).clamp(0.0, 1.0)
        } else {
            row.feedback_score
        };
        row.feedback_score = (row.feedback_score * old_freq + window_feedback * new_freq) / total;

        row.frequency += self.frequency;
        if let Some(first) = self.first_seen {
            if first < row.first_seen {
                row.first_seen = first;
            }
        }
        if let Some(last) = self.last_seen {
            if last > row.last_seen {
                row.last_seen = last;
            }
        }

        // Keep the newest samples, bounded
        row.sample_event_ids.extend(self.samples.iter().copied());
        if row.sample_event_ids.len() > MAX_PATTERN_SAMPLES {
            let excess = row.sample_event_ids.len() - MAX_PATTERN_SAMPLES;
            row.sample_event_ids.drain(..excess);
        }

        row.recommendations = recommend(&row);
        row
    }
}

/// Derives recommendation hints from a pattern's rolling stats.
fn recommend(pattern: &LearningPattern) -> Vec<String> {
    let mut hints = Vec::new();

    if pattern.success_rate < 0.5 && pattern.frequency >= 5 {
        hints.push(format!(
            "success rate {:.0}% below half; review prompts or routing for this input shape",
            pattern.success_rate * 100.0
        ));
    }
    if pattern.avg_confidence < 0.4 && pattern.frequency >= 5 {
        hints.push("low average confidence; consider adding training examples".to_string());
    }
    if pattern.success_rate >= 0.9 && pattern.frequency >= 10 {
        hints.push("consistently successful; candidate for caching or distillation".to_string());
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::types::{EventFeedback, EventImpact, EventKind, OutputSnapshot};
    use crate::types::{AgentId, ServiceId};

    fn event_with(
        kind: EventKind,
        input: serde_json::Value,
        context: serde_json::Value,
    ) -> LearningEvent {
        LearningEvent {
            id: EventId::new(),
            service_id: ServiceId::new("svc"),
            agent_id: AgentId::new("agent"),
            domain: "support".to_string(),
            kind,
            input,
            context,
            output: OutputSnapshot {
                prediction: serde_json::Value::Null,
                confidence: 0.8,
                alternatives: vec![],
            },
            feedback: None,
            impact: EventImpact::default(),
            cost: None,
            importance: 5.0,
            timestamp: Timestamp::from_millis(1000),
            parent_event_id: None,
        }
    }

    #[test]
    fn test_signature_is_deterministic_and_sorted() {
        let a = event_with(
            EventKind::Feedback,
            serde_json::json!({"zebra": 1, "alpha": 2}),
            serde_json::json!({"channel": "chat"}),
        );
        let b = event_with(
            EventKind::Feedback,
            serde_json::json!({"alpha": "different", "zebra": "values"}),
            serde_json::json!({"channel": "email"}),
        );

        assert_eq!(pattern_signature(&a), pattern_signature(&b));
        assert_eq!(pattern_signature(&a), "feedback:in[alpha,zebra]:ctx[channel]");
    }

    #[test]
    fn test_signature_distinguishes_kind_and_shape() {
        let a = event_with(EventKind::Feedback, serde_json::json!({"q": 1}), serde_json::Value::Null);
        let b = event_with(EventKind::Training, serde_json::json!({"q": 1}), serde_json::Value::Null);
        let c = event_with(EventKind::Feedback, serde_json::json!({"r": 1}), serde_json::Value::Null);

        assert_ne!(pattern_signature(&a), pattern_signature(&b));
        assert_ne!(pattern_signature(&a), pattern_signature(&c));
    }

    #[test]
    fn test_scalar_input_yields_empty_key_list() {
        let a = event_with(EventKind::Training, serde_json::json!("plain"), serde_json::Value::Null);
        assert_eq!(pattern_signature(&a), "training:in[]:ctx[]");
    }

    #[test]
    fn test_counter_observe_accumulates() {
        let mut counter = PatternCounter::default();

        let mut event = event_with(EventKind::Feedback, serde_json::json!({"q": 1}), serde_json::Value::Null);
        event.feedback = Some(EventFeedback {
            rating: Some(4.0),
            correct: Some(true),
            corrected: None,
            explanation: None,
        });
        counter.observe(&event);

        let mut miss = event.clone();
        miss.id = EventId::new();
        miss.feedback = Some(EventFeedback {
            rating: Some(2.0),
            correct: Some(false),
            corrected: None,
            explanation: None,
        });
        counter.observe(&miss);

        assert_eq!(counter.frequency, 2);
        assert_eq!(counter.success_count, 1);
        assert_eq!(counter.judged_count, 2);
        assert_eq!(counter.rating_count, 2);
        assert_eq!(counter.samples.len(), 2);
    }

    #[test]
    fn test_fold_into_fresh_row() {
        let mut counter = PatternCounter::default();
        let mut event = event_with(EventKind::Feedback, serde_json::json!({"q": 1}), serde_json::Value::Null);
        event.feedback = Some(EventFeedback {
            rating: Some(5.0),
            correct: Some(true),
            corrected: None,
            explanation: None,
        });
        counter.observe(&event);

        let row = counter.fold_into("support", "sig", None);
        assert_eq!(row.frequency, 1);
        assert_eq!(row.success_rate, 1.0);
        assert!((row.avg_confidence - 0.8).abs() < 1e-9);
        assert_eq!(row.feedback_score, 1.0);
    }

    #[test]
    fn test_fold_into_weights_prior_row() {
        let prior = LearningPattern {
            domain: "support".into(),
            signature: "sig".into(),
            frequency: 3,
            first_seen: Timestamp::from_millis(100),
            last_seen: Timestamp::from_millis(200),
            success_rate: 1.0,
            avg_confidence: 0.6,
            feedback_score: 0.8,
            sample_event_ids: vec![EventId::new()],
            recommendations: vec![],
        };

        let mut counter = PatternCounter::default();
        let mut event = event_with(EventKind::Feedback, serde_json::json!({"q": 1}), serde_json::Value::Null);
        event.feedback = Some(EventFeedback {
            rating: None,
            correct: Some(false),
            corrected: None,
            explanation: None,
        });
        counter.observe(&event);

        let row = counter.fold_into("support", "sig", Some(prior));
        assert_eq!(row.frequency, 4);
        // 3 prior at 1.0, 1 new at 0.0 -> 0.75
        assert!((row.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(row.sample_event_ids.len(), 2);
    }

    #[test]
    fn test_composite_score_weights_and_bounds() {
        let pattern = LearningPattern {
            domain: "d".into(),
            signature: "s".into(),
            frequency: 1,
            first_seen: Timestamp::from_millis(0),
            last_seen: Timestamp::from_millis(0),
            success_rate: 1.0,
            avg_confidence: 1.0,
            feedback_score: 1.0,
            sample_event_ids: vec![],
            recommendations: vec![],
        };
        assert!((pattern.composite_score() - 1.0).abs() < 1e-9);

        let half = LearningPattern {
            success_rate: 0.5,
            avg_confidence: 0.5,
            feedback_score: 0.5,
            ..pattern.clone()
        };
        assert!((half.composite_score() - 0.5).abs() < 1e-9);

        let zero = LearningPattern {
            success_rate: 0.0,
            avg_confidence: 0.0,
            feedback_score: 0.0,
            ..pattern
        };
        assert_eq!(zero.composite_score(), 0.0);
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let mut counter = PatternCounter::default();
        for _ in 0..(MAX_PATTERN_SAMPLES + 20) {
            let event = event_with(EventKind::Training, serde_json::json!({"q": 1}), serde_json::Value::Null);
            counter.observe(&event);
        }
        assert_eq!(counter.samples.len(), MAX_PATTERN_SAMPLES);

        let row = counter.fold_into("support", "sig", None);
        assert!(row.sample_event_ids.len() <= MAX_PATTERN_SAMPLES);
    }
}
