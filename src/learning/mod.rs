//! Learning ledger: append-only events, derived patterns, rollups, trends.
//!
//! A **learning event** is immutable once recorded; corrections are new
//! events referencing a parent. The ledger derives per-(domain, signature)
//! pattern rows, windowed metric rollups, and linear-regression trends
//! from the event log.
//!
//! # Operations
//!
//! All ledger operations are available on [`LearningLedger`]:
//!
//! - [`record(event)`](LearningLedger::record)
//! - [`history(filter)`](LearningLedger::history)
//! - [`patterns(domain, min_frequency)`](LearningLedger::patterns)
//! - [`metrics(domain, window)`](LearningLedger::metrics)
//! - [`trends(domain, periods)`](LearningLedger::trends)
//! - [`apply_replicated(event)`](LearningLedger::apply_replicated) - the
//!   idempotent inbound-sync write path

mod ledger;
pub mod patterns;
pub mod types;

pub use ledger::{performance_improvement, LearningLedger};
pub use patterns::{pattern_signature, LearningPattern, PatternCounter, MAX_PATTERN_SAMPLES};
pub use types::{
    CostMetrics, EventFeedback, EventFilter, EventImpact, EventKind, LearningEvent, MetricsRollup,
    NewLearningEvent, OutputSnapshot, PatternSummary, TrendDirection, TrendReport,
};

use crate::error::{MembraneError, ValidationError};
use crate::tier::schema::{MAX_DOMAIN_LENGTH, MAX_IMPORTANCE};

/// Validates a [`NewLearningEvent`] before recording.
///
/// # Rules
///
/// - `service_id`, `agent_id`, `domain`: non-empty; domain ≤ 100 chars
/// - `importance`: 0.0-10.0
/// - `output.confidence`: 0.0-1.0
/// - `feedback.rating` (if present): 0.0-5.0
pub(crate) fn validate_new_event(event: &NewLearningEvent) -> Result<(), MembraneError> {
    if event.service_id.as_str().is_empty() {
        return Err(ValidationError::required_field("service_id").into());
    }

    if event.agent_id.as_str().is_empty() {
        return Err(ValidationError::required_field("agent_id").into());
    }

    if event.domain.is_empty() {
        return Err(ValidationError::required_field("domain").into());
    }

    if event.domain.len() > MAX_DOMAIN_LENGTH {
        return Err(ValidationError::invalid_field(
            "domain",
            format!("exceeds max length of {} chars", MAX_DOMAIN_LENGTH),
        )
        .into());
    }

    if !(0.0..=MAX_IMPORTANCE).contains(&event.importance) {
        return Err(ValidationError::invalid_field(
            "importance",
            format!("must be between 0.0 and {}, got {}", MAX_IMPORTANCE, event.importance),
        )
        .into());
    }

    if !(0.0..=1.0).contains(&event.output.confidence) {
        return Err(ValidationError::invalid_field(
            "output.confidence",
            format!("must be between 0.0 and 1.0, got {}", event.output.confidence),
        )
        .into());
    }

    if let Some(ref feedback) = event.feedback {
        if let Some(rating) = feedback.rating {
            if !(0.0..=5.0).contains(&rating) {
                return Err(ValidationError::invalid_field(
                    "feedback.rating",
                    format!("must be between 0.0 and 5.0, got {}", rating),
                )
                .into());
            }
        }
    }

    Ok(())
}
