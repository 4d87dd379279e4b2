//! Integration tests for the learning ledger and insight pipeline.
//!
//! These tests verify the end-to-end behavior of:
//! - Event recording, immutability, and history queries
//! - Pattern sweeps and composite-score ordering
//! - Metric rollups and trend classification with forecast
//! - Insight rule firing over a domain's recent aggregates

use membrane::learning::{
    EventFeedback, EventFilter, EventImpact, NewLearningEvent, OutputSnapshot,
};
use membrane::{
    AgentId, Config, EventKind, MemoryCore, ServiceId, Severity, Timestamp, TrendDirection,
};
use tempfile::tempdir;

fn open_core(dir: &tempfile::TempDir) -> std::sync::Arc<MemoryCore> {
    let config = Config {
        warm_path: dir.path().join("warm.db"),
        cold_dir: dir.path().join("cold"),
        ..Default::default()
    };
    MemoryCore::open(config).unwrap()
}

fn new_event(domain: &str, kind: EventKind) -> NewLearningEvent {
    NewLearningEvent {
        service_id: ServiceId::new("svc-a"),
        agent_id: AgentId::new("agent-1"),
        domain: domain.to_string(),
        kind,
        input: serde_json::json!({"query": "refund policy"}),
        context: serde_json::json!({"channel": "chat"}),
        output: OutputSnapshot {
            prediction: serde_json::json!("within 30 days"),
            confidence: 0.8,
            alternatives: vec![],
        },
        ..Default::default()
    }
}

fn feedback(correct: bool, rating: f64) -> Option<EventFeedback> {
    Some(EventFeedback {
        rating: Some(rating),
        correct: Some(correct),
        corrected: None,
        explanation: None,
    })
}

/// A judged event with an explicit timestamp, for replay-style tests.
fn historical_event(
    domain: &str,
    ts: Timestamp,
    confidence: f64,
    correct: bool,
) -> membrane::LearningEvent {
    membrane::LearningEvent {
        id: membrane::EventId::new(),
        service_id: ServiceId::new("svc-remote"),
        agent_id: AgentId::new("agent-r"),
        domain: domain.to_string(),
        kind: EventKind::Feedback,
        input: serde_json::json!({"q": 1}),
        context: serde_json::Value::Null,
        output: OutputSnapshot {
            prediction: serde_json::Value::Null,
            confidence,
            alternatives: vec![],
        },
        feedback: feedback(correct, 4.0),
        impact: EventImpact::default(),
        cost: None,
        importance: 5.0,
        timestamp: ts,
        parent_event_id: None,
    }
}

// ============================================================================
// Record / history
// ============================================================================

#[test]
fn test_record_then_history_finds_exactly_once() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    let recorded = core
        .learning()
        .record(new_event("support", EventKind::Feedback))
        .unwrap();

    let history = core
        .learning()
        .history(&EventFilter {
            domain: Some("support".into()),
            kind: Some(EventKind::Feedback),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(
        history.iter().filter(|e| e.id == recorded.id).count(),
        1,
        "recorded event appears exactly once"
    );
}

#[test]
fn test_replicated_duplicate_is_dropped() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    let event = historical_event("support", Timestamp::now(), 0.8, true);
    assert!(core.learning().apply_replicated(event.clone()).unwrap());
    assert!(!core.learning().apply_replicated(event.clone()).unwrap());

    let history = core
        .learning()
        .history(&EventFilter {
            domain: Some("support".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[test]
fn test_history_filters_by_kind_and_window() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    core.learning()
        .record(new_event("support", EventKind::Training))
        .unwrap();
    core.learning()
        .record(new_event("support", EventKind::Feedback))
        .unwrap();

    let training = core
        .learning()
        .history(&EventFilter {
            domain: Some("support".into()),
            kind: Some(EventKind::Training),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(training.len(), 1);
    assert_eq!(training[0].kind, EventKind::Training);

    let future = core
        .learning()
        .history(&EventFilter {
            since: Some(Timestamp::now().offset_millis(60_000)),
            ..Default::default()
        })
        .unwrap();
    assert!(future.is_empty());
}

#[test]
fn test_correction_references_parent() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    let original = core
        .learning()
        .record(new_event("support", EventKind::Feedback))
        .unwrap();

    let mut correction = new_event("support", EventKind::Correction);
    correction.parent_event_id = Some(original.id);
    let correction = core.learning().record(correction).unwrap();

    assert_eq!(correction.parent_event_id, Some(original.id));
    // The original is untouched
    let history = core
        .learning()
        .history(&EventFilter {
            domain: Some("support".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(history.len(), 2);
}

// ============================================================================
// Patterns
// ============================================================================

#[test]
fn test_pattern_sweep_persists_rows() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    for _ in 0..4 {
        let mut event = new_event("support", EventKind::Feedback);
        event.feedback = feedback(true, 5.0);
        core.learning().record(event).unwrap();
    }
    let mut miss = new_event("support", EventKind::Feedback);
    miss.feedback = feedback(false, 1.0);
    core.learning().record(miss).unwrap();

    let swept = core.learning().run_pattern_sweep().unwrap();
    assert_eq!(swept, 1, "one (domain, signature) pair");

    let patterns = core.learning().patterns("support", 0).unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].frequency, 5);
    // 4 of 5 judged correct
    assert!((patterns[0].success_rate - 0.8).abs() < 1e-9);

    let score = patterns[0].composite_score();
    assert!((0.0..=1.0).contains(&score));
}

#[test]
fn test_patterns_ordered_by_composite_score() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    // Two input shapes with different outcomes
    for _ in 0..3 {
        let mut good = new_event("support", EventKind::Feedback);
        good.input = serde_json::json!({"alpha": 1});
        good.feedback = feedback(true, 5.0);
        core.learning().record(good).unwrap();

        let mut bad = new_event("support", EventKind::Feedback);
        bad.input = serde_json::json!({"beta": 1, "gamma": 2});
        bad.feedback = feedback(false, 1.0);
        core.learning().record(bad).unwrap();
    }
    core.learning().run_pattern_sweep().unwrap();

    let patterns = core.learning().patterns("support", 0).unwrap();
    assert_eq!(patterns.len(), 2);
    assert!(patterns[0].composite_score() >= patterns[1].composite_score());
    assert!(patterns[0].signature.contains("alpha"));
}

#[test]
fn test_min_frequency_filters_patterns() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    core.learning()
        .record(new_event("support", EventKind::Training))
        .unwrap();
    core.learning().run_pattern_sweep().unwrap();

    assert_eq!(core.learning().patterns("support", 1).unwrap().len(), 1);
    assert!(core.learning().patterns("support", 2).unwrap().is_empty());
}

// ============================================================================
// Metrics
// ============================================================================

#[test]
fn test_metrics_rollup_rates() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    for i in 0..10 {
        let mut event = new_event("support", EventKind::Feedback);
        if i < 4 {
            event.feedback = feedback(true, 4.0);
        } else {
            event.feedback = None;
        }
        if i == 0 {
            event.impact = EventImpact {
                model_updated: true,
                performance_delta: 0.1,
                affected_models: vec!["ranker".into()],
            };
        }
        core.learning().record(event).unwrap();
    }

    let now = Timestamp::now();
    let rollup = core
        .learning()
        .metrics(
            "support",
            Timestamp::from_millis(now.as_millis() - 3_600_000),
            Timestamp::from_millis(now.as_millis() + 1),
        )
        .unwrap();

    assert_eq!(rollup.total_events, 10);
    assert!((rollup.adaptation_rate - 0.1).abs() < 1e-9);
    assert!((rollup.feedback_rate - 0.4).abs() < 1e-9);
}

#[test]
fn test_metrics_empty_window_is_zeroed() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    let rollup = core
        .learning()
        .metrics(
            "nowhere",
            Timestamp::from_millis(0),
            Timestamp::from_millis(1000),
        )
        .unwrap();

    assert_eq!(rollup.total_events, 0);
    assert_eq!(rollup.adaptation_rate, 0.0);
    assert_eq!(rollup.feedback_rate, 0.0);
    assert_eq!(rollup.performance_improvement, 0.0);
}

// ============================================================================
// Trends
// ============================================================================

const DAY: i64 = 24 * 3600 * 1000;

#[test]
fn test_trend_improving_with_forecast() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);
    let now = Timestamp::now();

    // 7 daily windows whose improvement values climb 0, 2, 4, ... 12:
    // each window holds one correct event in each half, with the second
    // half's confidence lifted by the target percentage.
    for (j, target) in [0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0].iter().enumerate() {
        let i = 6 - j as i64; // windows count back from now
        let window_end = now.as_millis() - i * DAY;

        let first_half = Timestamp::from_millis(window_end - 20 * 3600 * 1000);
        let second_half = Timestamp::from_millis(window_end - 4 * 3600 * 1000);

        core.learning()
            .apply_replicated(historical_event("support", first_half, 0.5, true))
            .unwrap();
        core.learning()
            .apply_replicated(historical_event(
                "support",
                second_half,
                0.5 * (1.0 + target / 100.0),
                true,
            ))
            .unwrap();
    }

    let report = core.learning().trends("support", 7).unwrap();

    assert_eq!(report.trend, TrendDirection::Improving);
    assert_eq!(report.series.len(), 7);
    for (value, target) in report.series.iter().zip([0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0]) {
        assert!(
            (value - target).abs() < 0.5,
            "window value {} should be near {}",
            value,
            target
        );
    }

    assert_eq!(report.forecast.len(), 3);
    let last = *report.series.last().unwrap();
    assert!(report.forecast.iter().all(|v| *v > last));
}

#[test]
fn test_trend_empty_domain_is_stable() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    let report = core.learning().trends("nowhere", 5).unwrap();
    assert_eq!(report.trend, TrendDirection::Stable);
    assert_eq!(report.series, vec![0.0; 5]);
    assert_eq!(report.forecast.len(), 3);
}

#[test]
fn test_trend_declining() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);
    let now = Timestamp::now();

    for (j, target) in [30.0, 20.0, 10.0, 0.0].iter().enumerate() {
        let i = 3 - j as i64;
        let window_end = now.as_millis() - i * DAY;
        let first_half = Timestamp::from_millis(window_end - 20 * 3600 * 1000);
        let second_half = Timestamp::from_millis(window_end - 4 * 3600 * 1000);

        core.learning()
            .apply_replicated(historical_event("support", first_half, 0.5, true))
            .unwrap();
        core.learning()
            .apply_replicated(historical_event(
                "support",
                second_half,
                0.5 * (1.0 + target / 100.0),
                true,
            ))
            .unwrap();
    }

    let report = core.learning().trends("support", 4).unwrap();
    assert_eq!(report.trend, TrendDirection::Declining);
}

// ============================================================================
// Insights
// ============================================================================

#[test]
fn test_high_error_rate_insight_fires() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    // 100 events in the last hour, 15 judged incorrect
    for i in 0..100 {
        let mut event = new_event("support", EventKind::Feedback);
        event.feedback = feedback(i >= 15, 3.0);
        core.learning().record(event).unwrap();
    }

    let generated = core.insights().run_insight_pass(Timestamp::now()).unwrap();

    let high_error = generated
        .iter()
        .find(|insight| insight.title == "High error rate")
        .expect("HighErrorRate should fire at 15% errors");
    assert_eq!(high_error.severity, Severity::High);
    assert_eq!(high_error.domain, "support");
    assert!((high_error.metrics.error_rate - 0.15).abs() < 1e-9);
    assert_eq!(
        high_error.recommendations,
        vec!["review recent model changes".to_string()]
    );

    // The insight row is persisted and listable
    let listed = core.tiers().warm().recent_insights(Some("support"), 10).unwrap();
    assert!(listed.iter().any(|i| i.id == high_error.id));
}

#[test]
fn test_quiet_domain_generates_no_insights() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    // A healthy mix: mostly correct, plenty of feedback, low volume
    // relative to nothing - actually zero events means no evaluation
    let generated = core.insights().run_insight_pass(Timestamp::now()).unwrap();
    assert!(generated.is_empty());
}

#[test]
fn test_rollup_persist_writes_series() {
    let dir = tempdir().unwrap();
    let core = open_core(&dir);

    core.learning()
        .record(new_event("support", EventKind::Training))
        .unwrap();

    let now = Timestamp::now();
    let written = core.insights().run_rollup_persist(now).unwrap();
    assert!(written >= 1);

    let series = core
        .tiers()
        .warm()
        .metric_series(
            "support",
            "training",
            Timestamp::from_millis(now.as_millis() - 1000),
            Timestamp::from_millis(now.as_millis() + 1000),
        )
        .unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].1, 1.0);
}
