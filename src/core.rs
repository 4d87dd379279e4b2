//! The assembled core: tier store, engines, pipeline, fabric, lifecycle.
//!
//! [`MemoryCore`] is the primary handle. [`MemoryCore::open`] builds and
//! wires every component; [`MemoryCore::start`] spawns the long-lived
//! background tasks (per-peer senders, sweepers, fold/rollup/insight
//! schedules) under a shared cancellation token. Dropping the token's
//! guard or cancelling it gives every task its shutdown signal; the
//! durable queues need no extra flush because they live in the warm
//! store to begin with.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use membrane::{Config, MemoryCore};
//! use tokio_util::sync::CancellationToken;
//!
//! let core = MemoryCore::open(Config::from_env()?)?;
//! let cancel = CancellationToken::new();
//! core.start(cancel.clone());
//! // ... serve until shutdown ...
//! cancel.cancel();
//! ```
//!
//! # Thread Safety
//!
//! `MemoryCore` is `Send + Sync`; share it with `Arc`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::error::Result;
use crate::insight::InsightPipeline;
use crate::learning::LearningLedger;
use crate::memory::MemoryEngine;
use crate::sync::{PeerStatus, SyncFabric};
use crate::tier::{ColdStore, HotTier, TierStore, WarmStore};
use crate::types::Timestamp;

/// Liveness and per-component health.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    /// `"ok"` when every component responds, `"degraded"` otherwise.
    pub status: &'static str,

    /// Whether the warm tier answered a probe read.
    pub warm_ok: bool,

    /// Entries currently in the hot cache.
    pub hot_cached_entries: usize,

    /// Live pattern counters awaiting the next sweep.
    pub pattern_counters: usize,

    /// Connection state of every configured peer.
    pub peers: Vec<PeerStatus>,

    /// When the report was taken (unix millis).
    pub timestamp: i64,
}

/// The assembled memory persistence and synchronization core.
pub struct MemoryCore {
    config: Config,
    tiers: Arc<TierStore>,
    bus: Arc<EventBus>,
    memory: Arc<MemoryEngine>,
    learning: Arc<LearningLedger>,
    insights: Arc<InsightPipeline>,
    fabric: Arc<SyncFabric>,
}

impl MemoryCore {
    /// Opens every tier, rebuilds the similarity indexes, and wires the
    /// components. No background task runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or an unreachable warm tier -
    /// both are unrecoverable initialization failures.
    #[instrument(skip(config), fields(service = %config.service_id))]
    pub fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        info!("Opening membrane core");

        let warm = Arc::new(WarmStore::open(&config.warm_path, &config)?);
        let hot = Arc::new(HotTier::new(config.cache_default_ttl));
        let cold = Arc::new(ColdStore::open(&config.cold_dir)?);
        let tiers = Arc::new(TierStore::new(
            Arc::clone(&warm),
            hot,
            cold,
            config.archive_threshold_millis(),
            config.archive_batch_size,
        ));

        let bus = Arc::new(EventBus::new());
        let memory = Arc::new(MemoryEngine::open(
            Arc::clone(&tiers),
            Arc::clone(&bus),
            config.clone(),
        )?);
        let learning = Arc::new(LearningLedger::new(Arc::clone(&tiers), Arc::clone(&bus)));
        let insights = Arc::new(InsightPipeline::new(Arc::clone(&tiers), Arc::clone(&bus)));
        let fabric = Arc::new(SyncFabric::new(
            config.clone(),
            warm,
            Arc::clone(&memory),
            Arc::clone(&learning),
            Arc::clone(&bus),
        ));

        info!(
            dimension = config.dimension(),
            peers = config.peers.len(),
            "Membrane core opened"
        );

        Ok(Arc::new(Self {
            config,
            tiers,
            bus,
            memory,
            learning,
            insights,
            fabric,
        }))
    }

    /// Spawns the background machinery: the sync fabric (senders + bus
    /// drain) and all periodic sweepers. Requires a tokio runtime.
    ///
    /// Every task watches `cancel`; cancelling gives each one its grace
    /// signal.
    pub fn start(&self, cancel: CancellationToken) {
        Arc::clone(&self.fabric).start(cancel.clone());

        let memory = Arc::clone(&self.memory);
        spawn_sweeper(
            "expiry-sweeper",
            self.config.expiry_sweep_interval,
            cancel.clone(),
            move || memory.run_expiry_sweep(Timestamp::now()).map(|_| ()),
        );

        let memory = Arc::clone(&self.memory);
        spawn_sweeper(
            "archive-sweeper",
            self.config.archive_sweep_interval,
            cancel.clone(),
            move || memory.run_archive_sweep(Timestamp::now()).map(|_| ()),
        );

        let learning = Arc::clone(&self.learning);
        spawn_sweeper(
            "pattern-sweeper",
            self.config.pattern_sweep_interval,
            cancel.clone(),
            move || learning.run_pattern_sweep().map(|_| ()),
        );

        let insights = Arc::clone(&self.insights);
        spawn_sweeper(
            "rollup-persister",
            self.config.rollup_interval,
            cancel.clone(),
            move || insights.run_rollup_persist(Timestamp::now()).map(|_| ()),
        );

        let insights = Arc::clone(&self.insights);
        spawn_sweeper(
            "insight-generator",
            self.config.insight_interval,
            cancel.clone(),
            move || insights.run_insight_pass(Timestamp::now()).map(|_| ()),
        );

        // The realtime fold tracks its own elapsed time between ticks
        let insights = Arc::clone(&self.insights);
        let fold_interval = self.config.realtime_fold_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(fold_interval);
            let mut last = std::time::Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let elapsed = last.elapsed();
                        last = std::time::Instant::now();
                        insights.run_realtime_fold(elapsed);
                    }
                }
            }
        });

        info!("Background tasks started");
    }

    /// Binds the sync accept loop on the given listener.
    pub fn serve_sync(&self, listener: TcpListener, cancel: CancellationToken) {
        let fabric = Arc::clone(&self.fabric);
        tokio::spawn(fabric.serve_inbound(listener, cancel));
    }

    // =========================================================================
    // Component accessors
    // =========================================================================

    /// The configuration this core was opened with.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The memory engine.
    #[inline]
    pub fn memory(&self) -> &MemoryEngine {
        &self.memory
    }

    /// The learning ledger.
    #[inline]
    pub fn learning(&self) -> &LearningLedger {
        &self.learning
    }

    /// The insight pipeline.
    #[inline]
    pub fn insights(&self) -> &InsightPipeline {
        &self.insights
    }

    /// The sync fabric.
    #[inline]
    pub fn fabric(&self) -> &Arc<SyncFabric> {
        &self.fabric
    }

    /// The tier store.
    #[inline]
    pub fn tiers(&self) -> &Arc<TierStore> {
        &self.tiers
    }

    /// The process-internal event bus.
    #[inline]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Takes a liveness and per-component health report.
    pub fn health(&self) -> HealthReport {
        let warm_ok = self.tiers.warm().known_domains().is_ok();
        let peers = self.fabric.peer_statuses();

        HealthReport {
            status: if warm_ok { "ok" } else { "degraded" },
            warm_ok,
            hot_cached_entries: self.tiers.hot().cached_entries(),
            pattern_counters: self.tiers.hot().pattern_counters(),
            peers,
            timestamp: Timestamp::now().as_millis(),
        }
    }
}

/// Spawns one periodic background pass under the cancellation token.
///
/// Errors never kill a sweeper; a failed pass logs and pauses until the
/// next tick.
fn spawn_sweeper<F>(name: &'static str, interval: Duration, cancel: CancellationToken, tick: F)
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would sweep an empty store
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = tick() {
                        warn!(task = name, error = %e, "Sweeper pass failed");
                    }
                }
            }
        }
    });
}
