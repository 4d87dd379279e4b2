//! Hot-tier cache: expiring entry KV plus rolling counters.
//!
//! Three concerns share this tier, all on sharded concurrent maps with
//! per-entry mutation (no coarse locks):
//!
//! - **Entry cache** - memory entries keyed by id with a TTL derived from
//!   the entry's own expiry, else the configured default.
//! - **Pattern counters** - rolling per-(domain, signature) accumulators
//!   bumped on every recorded learning event and drained by the periodic
//!   pattern sweep.
//! - **Metric cells** - per-(domain, metric) counters folded every second
//!   into rates and EMA-smoothed latency.
//!
//! A failure here never fails a caller: the warm tier is the source of
//! truth and this tier is repopulated on read.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::learning::{LearningEvent, PatternCounter};
use crate::memory::MemoryEntry;
use crate::types::MemoryId;

/// Smoothing factor for the latency EMA.
const EMA_ALPHA: f64 = 0.1;

/// A cached entry with its eviction deadline.
struct CachedEntry {
    entry: MemoryEntry,
    expires: Instant,
}

/// One (domain, metric) rolling counter cell.
#[derive(Clone, Debug, Default)]
pub struct MetricCell {
    /// All-time count since process start.
    pub total: u64,

    /// Count since the last fold (drives rate-per-second).
    pub window: u64,

    /// Latency sum since the last fold, milliseconds.
    pub latency_sum_ms: f64,

    /// Latency observations since the last fold.
    pub latency_count: u64,

    /// Rate per second computed by the last fold.
    pub rate_per_sec: f64,

    /// EMA-smoothed latency, milliseconds.
    pub ema_latency_ms: f64,
}

/// A folded point-in-time view of one metric cell.
#[derive(Clone, Debug)]
pub struct RealtimeMetric {
    /// The domain scope.
    pub domain: String,

    /// The metric name (event kind, `latency`, ...).
    pub metric: String,

    /// Rate per second over the last fold window.
    pub rate_per_sec: f64,

    /// EMA-smoothed latency, milliseconds.
    pub ema_latency_ms: f64,

    /// All-time count.
    pub total: u64,
}

/// The hot tier.
///
/// `Send + Sync`; all maps shard internally.
pub struct HotTier {
    /// Entry cache TTL when the entry has no expiry of its own.
    default_ttl: Duration,

    /// Cached entries by id.
    entries: DashMap<MemoryId, CachedEntry>,

    /// Rolling pattern accumulators keyed by (domain, signature).
    patterns: DashMap<(String, String), PatternCounter>,

    /// Metric cells keyed by (domain, metric).
    metrics: DashMap<(String, String), MetricCell>,
}

impl HotTier {
    /// Creates an empty hot tier with the given default TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: DashMap::new(),
            patterns: DashMap::new(),
            metrics: DashMap::new(),
        }
    }

    // =========================================================================
    // Entry cache
    // =========================================================================

    /// Caches an entry. The TTL derives from the entry's `expires_at` when
    /// set (clamped at zero), else the configured default.
    pub fn put_entry(&self, entry: MemoryEntry) {
        // Far-future expiries clamp to 30 days so the deadline arithmetic
        // below can't overflow the monotonic clock
        const MAX_TTL_MILLIS: i64 = 30 * 24 * 3600 * 1000;

        let ttl = match entry.expires_at {
            Some(expires_at) => {
                let remaining = expires_at.as_millis() - crate::types::Timestamp::now().as_millis();
                Duration::from_millis(remaining.clamp(0, MAX_TTL_MILLIS) as u64)
            }
            None => self.default_ttl,
        };
        self.entries.insert(
            entry.id,
            CachedEntry {
                entry,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Returns a cached entry, or `None` on miss or staleness.
    ///
    /// Stale hits are evicted on the way out.
    pub fn get_entry(&self, id: MemoryId) -> Option<MemoryEntry> {
        let stale = match self.entries.get(&id) {
            Some(cached) if cached.expires > Instant::now() => {
                return Some(cached.entry.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.entries.remove(&id);
        }
        None
    }

    /// Drops an entry from the cache.
    pub fn invalidate(&self, id: MemoryId) {
        self.entries.remove(&id);
    }

    /// Evicts every stale cache entry. Returns the eviction count.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.expires > now);
        before - self.entries.len()
    }

    /// Returns the number of cached entries (including not-yet-purged
    /// stale ones).
    pub fn cached_entries(&self) -> usize {
        self.entries.len()
    }

    // =========================================================================
    // Pattern counters
    // =========================================================================

    /// Folds an event into its (domain, signature) rolling counter.
    pub fn observe_pattern(&self, signature: &str, event: &LearningEvent) {
        self.patterns
            .entry((event.domain.clone(), signature.to_string()))
            .or_default()
            .observe(event);
    }

    /// Takes every rolling pattern counter, leaving the map empty.
    ///
    /// The pattern sweep folds the result into persisted rows; counts
    /// recorded after the drain land in the next sweep.
    pub fn drain_patterns(&self) -> Vec<((String, String), PatternCounter)> {
        let keys: Vec<(String, String)> = self.patterns.iter().map(|e| e.key().clone()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((key, counter)) = self.patterns.remove(&key) {
                drained.push((key, counter));
            }
        }
        drained
    }

    /// Returns the number of live pattern counters.
    pub fn pattern_counters(&self) -> usize {
        self.patterns.len()
    }

    // =========================================================================
    // Metric cells
    // =========================================================================

    /// Bumps a (domain, metric) counter by one.
    pub fn bump_metric(&self, domain: &str, metric: &str) {
        let mut cell = self
            .metrics
            .entry((domain.to_string(), metric.to_string()))
            .or_default();
        cell.total += 1;
        cell.window += 1;
    }

    /// Records one latency observation under (domain, "latency").
    pub fn observe_latency(&self, domain: &str, latency_ms: f64) {
        let mut cell = self
            .metrics
            .entry((domain.to_string(), "latency".to_string()))
            .or_default();
        cell.total += 1;
        cell.window += 1;
        cell.latency_sum_ms += latency_ms;
        cell.latency_count += 1;
    }

    /// Folds every metric cell: derives rate-per-second from the window
    /// count and advances the latency EMA, then resets the window.
    ///
    /// Called by the real-time fold task; `elapsed` is the time since the
    /// previous fold.
    pub fn fold_metrics(&self, elapsed: Duration) -> Vec<RealtimeMetric> {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let mut folded = Vec::with_capacity(self.metrics.len());

        for mut item in self.metrics.iter_mut() {
            let (domain, metric) = item.key().clone();
            let cell = item.value_mut();

            cell.rate_per_sec = cell.window as f64 / secs;
            if cell.latency_count > 0 {
                let window_avg = cell.latency_sum_ms / cell.latency_count as f64;
                cell.ema_latency_ms = if cell.ema_latency_ms == 0.0 {
                    window_avg
                } else {
                    EMA_ALPHA * window_avg + (1.0 - EMA_ALPHA) * cell.ema_latency_ms
                };
            }
            cell.window = 0;
            cell.latency_sum_ms = 0.0;
            cell.latency_count = 0;

            folded.push(RealtimeMetric {
                domain,
                metric,
                rate_per_sec: cell.rate_per_sec,
                ema_latency_ms: cell.ema_latency_ms,
                total: cell.total,
            });
        }
        folded
    }

    /// Reads the folded view of every cell without touching the windows.
    ///
    /// Rates and EMAs are whatever the last fold produced; reads never
    /// perturb the fold cadence.
    pub fn current_metrics(&self) -> Vec<RealtimeMetric> {
        self.metrics
            .iter()
            .map(|item| {
                let (domain, metric) = item.key().clone();
                let cell = item.value();
                RealtimeMetric {
                    domain,
                    metric,
                    rate_per_sec: cell.rate_per_sec,
                    ema_latency_ms: cell.ema_latency_ms,
                    total: cell.total,
                }
            })
            .collect()
    }

    /// Snapshots every cell's all-time total for the rollup persist.
    pub fn snapshot_metrics(&self) -> Vec<(String, String, f64)> {
        self.metrics
            .iter()
            .map(|item| {
                let (domain, metric) = item.key().clone();
                (domain, metric, item.value().total as f64)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKind;
    use crate::types::{AgentId, ServiceId, Timestamp};

    fn test_entry() -> MemoryEntry {
        MemoryEntry {
            id: MemoryId::new(),
            service_id: ServiceId::new("svc"),
            agent_id: AgentId::new("agent"),
            domain: "legal".to_string(),
            kind: MemoryKind::Semantic,
            payload: serde_json::json!({"k": 1}),
            created_at: Timestamp::now(),
            version: 1,
            tags: Default::default(),
            correlation_id: None,
            session_id: None,
            user_id: None,
            importance: 5.0,
            access_count: 0,
            last_accessed: Timestamp::now(),
            expires_at: None,
            embedding: None,
            related_ids: Default::default(),
            cause_id: None,
            effect_ids: Default::default(),
            archived: false,
        }
    }

    #[test]
    fn test_put_get_invalidate() {
        let hot = HotTier::new(Duration::from_secs(60));
        let entry = test_entry();
        let id = entry.id;

        assert!(hot.get_entry(id).is_none());
        hot.put_entry(entry);
        assert!(hot.get_entry(id).is_some());

        hot.invalidate(id);
        assert!(hot.get_entry(id).is_none());
    }

    #[test]
    fn test_entry_ttl_from_expiry() {
        let hot = HotTier::new(Duration::from_secs(60));
        let mut entry = test_entry();
        // Already past expiry: cached with zero TTL, so a get is a miss
        entry.expires_at = Some(Timestamp::from_millis(Timestamp::now().as_millis() - 1000));
        let id = entry.id;
        hot.put_entry(entry);
        assert!(hot.get_entry(id).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let hot = HotTier::new(Duration::from_secs(60));
        let mut stale = test_entry();
        stale.expires_at = Some(Timestamp::from_millis(Timestamp::now().as_millis() - 1));
        let fresh = test_entry();

        hot.put_entry(stale);
        hot.put_entry(fresh);
        assert_eq!(hot.cached_entries(), 2);

        assert_eq!(hot.purge_expired(), 1);
        assert_eq!(hot.cached_entries(), 1);
    }

    #[test]
    fn test_pattern_drain_resets() {
        use crate::learning::{EventImpact, EventKind, OutputSnapshot};
        use crate::types::EventId;

        let hot = HotTier::new(Duration::from_secs(60));
        let event = LearningEvent {
            id: EventId::new(),
            service_id: ServiceId::new("svc"),
            agent_id: AgentId::new("agent"),
            domain: "support".to_string(),
            kind: EventKind::Training,
            input: serde_json::json!({}),
            context: serde_json::json!({}),
            output: OutputSnapshot::default(),
            feedback: None,
            impact: EventImpact::default(),
            cost: None,
            importance: 5.0,
            timestamp: Timestamp::now(),
            parent_event_id: None,
        };

        hot.observe_pattern("sig-a", &event);
        hot.observe_pattern("sig-a", &event);
        hot.observe_pattern("sig-b", &event);
        assert_eq!(hot.pattern_counters(), 2);

        let drained = hot.drain_patterns();
        assert_eq!(drained.len(), 2);
        assert_eq!(hot.pattern_counters(), 0);

        let sig_a = drained
            .iter()
            .find(|((_, sig), _)| sig == "sig-a")
            .map(|(_, counter)| counter.frequency)
            .unwrap();
        assert_eq!(sig_a, 2);
    }

    #[test]
    fn test_metric_fold_computes_rate_and_resets_window() {
        let hot = HotTier::new(Duration::from_secs(60));
        for _ in 0..10 {
            hot.bump_metric("support", "feedback");
        }

        let folded = hot.fold_metrics(Duration::from_secs(2));
        assert_eq!(folded.len(), 1);
        assert!((folded[0].rate_per_sec - 5.0).abs() < 1e-9);
        assert_eq!(folded[0].total, 10);

        // Window reset: next fold with no new events is zero rate
        let folded = hot.fold_metrics(Duration::from_secs(1));
        assert_eq!(folded[0].rate_per_sec, 0.0);
        assert_eq!(folded[0].total, 10);
    }

    #[test]
    fn test_latency_ema_smoothing() {
        let hot = HotTier::new(Duration::from_secs(60));

        hot.observe_latency("support", 100.0);
        let folded = hot.fold_metrics(Duration::from_secs(1));
        // First observation seeds the EMA
        assert!((folded[0].ema_latency_ms - 100.0).abs() < 1e-9);

        hot.observe_latency("support", 200.0);
        let folded = hot.fold_metrics(Duration::from_secs(1));
        // 0.1 * 200 + 0.9 * 100 = 110
        assert!((folded[0].ema_latency_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_current_metrics_does_not_reset_windows() {
        let hot = HotTier::new(Duration::from_secs(60));
        hot.bump_metric("support", "feedback");

        // Reading leaves the window intact for the next fold
        let view = hot.current_metrics();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].total, 1);

        let folded = hot.fold_metrics(Duration::from_secs(1));
        assert!((folded[0].rate_per_sec - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_metrics_totals() {
        let hot = HotTier::new(Duration::from_secs(60));
        hot.bump_metric("support", "training");
        hot.bump_metric("support", "training");

        let snapshot = hot.snapshot_metrics();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].2, 2.0);
    }
}
