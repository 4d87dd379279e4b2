//! Configuration types for the membrane core.
//!
//! The [`Config`] struct controls core behavior including:
//! - Tier locations (warm store path, cold archive directory)
//! - Cache TTL and archive/expiry policy
//! - Sweep cadences (archive, expiry, pattern, rollup, insight)
//! - The peer table and replication policy for the sync fabric
//!
//! # Example
//! ```rust
//! use membrane::{Config, EmbeddingDimension};
//!
//! // Use defaults (384-dimension embeddings, 1-hour default TTL)
//! let config = Config::default();
//!
//! // Customize for production
//! let config = Config {
//!     embedding_dimension: EmbeddingDimension::D768,
//!     archive_threshold_days: 30,
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::sync::PayloadKind;
use crate::types::{PeerId, ServiceId};

/// Core configuration options.
///
/// All fields have sensible defaults. Use struct update syntax to override
/// specific settings:
///
/// ```rust
/// use membrane::Config;
///
/// let config = Config {
///     queue_high_water: 5_000,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// This service's own identity, stamped on outbound envelopes and used
    /// as the inbound loop guard.
    pub service_id: ServiceId,

    /// Bind address for the HTTP edge adapter.
    pub edge_host: String,

    /// Bind port for the HTTP edge adapter.
    pub edge_port: u16,

    /// Bind port for the sync fabric's inbound accept loop.
    pub sync_port: u16,

    /// Path to the warm-tier database file (created if missing).
    pub warm_path: PathBuf,

    /// Root directory for the cold-tier object archive.
    ///
    /// Objects are laid out as `memories/{service_id}/{domain}/{id}.json`
    /// beneath this root.
    pub cold_dir: PathBuf,

    /// Embedding vector dimension (must match the fleet's encoder output).
    pub embedding_dimension: EmbeddingDimension,

    /// Hot-tier entry lifetime when the entry carries no expiry of its own.
    pub cache_default_ttl: Duration,

    /// Age at which non-archived entries demote to the cold tier.
    pub archive_threshold_days: u32,

    /// Maximum entries demoted per archive sweep pass.
    pub archive_batch_size: usize,

    /// Cadence of the archive sweep.
    pub archive_sweep_interval: Duration,

    /// Cadence of the expiry sweep.
    pub expiry_sweep_interval: Duration,

    /// Cadence at which hot-tier pattern counters persist to the warm tier.
    pub pattern_sweep_interval: Duration,

    /// Cadence of the warm-tier metric rollup persist.
    pub rollup_interval: Duration,

    /// Cadence of the real-time metric fold.
    pub realtime_fold_interval: Duration,

    /// Cadence of insight rule evaluation.
    pub insight_interval: Duration,

    /// Known remote peers, keyed by peer id.
    pub peers: Vec<PeerConfig>,

    /// Queue drain cadence per peer when the connection is idle.
    pub sync_interval: Duration,

    /// Initial reconnect delay after a peer connection drops.
    ///
    /// Grows exponentially per consecutive failure, capped at
    /// [`retry_delay_cap`](Self::retry_delay_cap).
    pub retry_delay: Duration,

    /// Upper bound on the exponential reconnect delay.
    pub retry_delay_cap: Duration,

    /// Outbound queue depth above which the newest writes for a peer are
    /// dropped with a warning.
    pub queue_high_water: u64,

    /// HNSW vector index parameters.
    pub hnsw: HnswConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: ServiceId::new("membrane"),
            edge_host: "127.0.0.1".to_string(),
            edge_port: 7710,
            sync_port: 7711,
            warm_path: PathBuf::from("./membrane.db"),
            cold_dir: PathBuf::from("./membrane-archive"),
            // 384 matches all-MiniLM-L6-v2, the fleet's default encoder
            embedding_dimension: EmbeddingDimension::D384,
            cache_default_ttl: Duration::from_secs(3600),
            archive_threshold_days: 90,
            archive_batch_size: 500,
            archive_sweep_interval: Duration::from_secs(3600),
            expiry_sweep_interval: Duration::from_secs(60),
            pattern_sweep_interval: Duration::from_secs(300),
            rollup_interval: Duration::from_secs(300),
            realtime_fold_interval: Duration::from_secs(1),
            insight_interval: Duration::from_secs(3600),
            peers: Vec::new(),
            sync_interval: Duration::from_millis(500),
            retry_delay: Duration::from_secs(1),
            retry_delay_cap: Duration::from_secs(60),
            queue_high_water: 10_000,
            hnsw: HnswConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new Config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a Config from recognized environment variables.
    ///
    /// Unset variables fall back to defaults. Recognized names:
    ///
    /// | Variable | Effect |
    /// |----------|--------|
    /// | `MEMBRANE_SERVICE_ID` | own service identity |
    /// | `MEMBRANE_HOST` / `MEMBRANE_PORT` | edge bind address |
    /// | `MEMBRANE_SYNC_PORT` | sync accept-loop port |
    /// | `MEMBRANE_WARM_PATH` | warm-tier database file |
    /// | `MEMBRANE_COLD_DIR` | cold archive root |
    /// | `MEMBRANE_CACHE_TTL_SECS` | hot-tier default TTL |
    /// | `MEMBRANE_ARCHIVE_THRESHOLD_DAYS` | demotion age |
    /// | `MEMBRANE_PATTERN_SWEEP_SECS` | pattern persist cadence |
    /// | `MEMBRANE_INSIGHT_INTERVAL_SECS` | insight cadence |
    /// | `MEMBRANE_SYNC_INTERVAL_MS` | per-peer drain cadence |
    /// | `MEMBRANE_RETRY_DELAY_MS` | initial reconnect delay |
    /// | `MEMBRANE_QUEUE_HIGH_WATER` | backpressure drop threshold |
    /// | `MEMBRANE_PEERS` | JSON array of [`PeerConfig`] |
    ///
    /// # Errors
    ///
    /// Returns a validation error if a set variable fails to parse.
    pub fn from_env() -> Result<Self, ValidationError> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("MEMBRANE_SERVICE_ID") {
            config.service_id = ServiceId::new(v);
        }
        if let Ok(v) = std::env::var("MEMBRANE_HOST") {
            config.edge_host = v;
        }
        if let Ok(v) = std::env::var("MEMBRANE_PORT") {
            config.edge_port = parse_env("MEMBRANE_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("MEMBRANE_SYNC_PORT") {
            config.sync_port = parse_env("MEMBRANE_SYNC_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("MEMBRANE_WARM_PATH") {
            config.warm_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MEMBRANE_COLD_DIR") {
            config.cold_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MEMBRANE_CACHE_TTL_SECS") {
            config.cache_default_ttl = Duration::from_secs(parse_env("MEMBRANE_CACHE_TTL_SECS", &v)?);
        }
        if let Ok(v) = std::env::var("MEMBRANE_ARCHIVE_THRESHOLD_DAYS") {
            config.archive_threshold_days = parse_env("MEMBRANE_ARCHIVE_THRESHOLD_DAYS", &v)?;
        }
        if let Ok(v) = std::env::var("MEMBRANE_PATTERN_SWEEP_SECS") {
            config.pattern_sweep_interval =
                Duration::from_secs(parse_env("MEMBRANE_PATTERN_SWEEP_SECS", &v)?);
        }
        if let Ok(v) = std::env::var("MEMBRANE_INSIGHT_INTERVAL_SECS") {
            config.insight_interval =
                Duration::from_secs(parse_env("MEMBRANE_INSIGHT_INTERVAL_SECS", &v)?);
        }
        if let Ok(v) = std::env::var("MEMBRANE_SYNC_INTERVAL_MS") {
            config.sync_interval = Duration::from_millis(parse_env("MEMBRANE_SYNC_INTERVAL_MS", &v)?);
        }
        if let Ok(v) = std::env::var("MEMBRANE_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(parse_env("MEMBRANE_RETRY_DELAY_MS", &v)?);
        }
        if let Ok(v) = std::env::var("MEMBRANE_QUEUE_HIGH_WATER") {
            config.queue_high_water = parse_env("MEMBRANE_QUEUE_HIGH_WATER", &v)?;
        }
        if let Ok(v) = std::env::var("MEMBRANE_PEERS") {
            config.peers = serde_json::from_str(&v).map_err(|e| {
                ValidationError::invalid_field("MEMBRANE_PEERS", format!("invalid JSON: {}", e))
            })?;
        }

        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Called automatically when the core opens. You can also call this
    /// explicitly to check configuration before attempting to start.
    ///
    /// # Errors
    /// Returns `ValidationError` if:
    /// - `service_id` is empty
    /// - Custom dimension is 0 or > 4096
    /// - A peer entry has an empty id or endpoint
    /// - `queue_high_water` is 0
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service_id.as_str().is_empty() {
            return Err(ValidationError::required_field("service_id"));
        }

        if self.queue_high_water == 0 {
            return Err(ValidationError::invalid_field(
                "queue_high_water",
                "must be greater than 0",
            ));
        }

        if self.archive_batch_size == 0 {
            return Err(ValidationError::invalid_field(
                "archive_batch_size",
                "must be greater than 0",
            ));
        }

        // Validate HNSW parameters
        if self.hnsw.max_nb_connection == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.max_nb_connection",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_construction == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_construction",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_search == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_search",
                "must be greater than 0",
            ));
        }

        // Validate custom dimension bounds
        if let EmbeddingDimension::Custom(dim) = self.embedding_dimension {
            if dim == 0 {
                return Err(ValidationError::invalid_field(
                    "embedding_dimension",
                    "custom dimension must be greater than 0",
                ));
            }
            if dim > 4096 {
                return Err(ValidationError::invalid_field(
                    "embedding_dimension",
                    "custom dimension must not exceed 4096",
                ));
            }
        }

        for peer in &self.peers {
            if peer.id.as_str().is_empty() {
                return Err(ValidationError::required_field("peers[].id"));
            }
            if peer.endpoint.is_empty() {
                return Err(ValidationError::invalid_field(
                    "peers[].endpoint",
                    format!("peer '{}' has an empty endpoint", peer.id),
                ));
            }
        }

        Ok(())
    }

    /// Returns the embedding dimension as a numeric value.
    pub fn dimension(&self) -> usize {
        self.embedding_dimension.size()
    }

    /// Returns the archive demotion threshold in milliseconds.
    pub fn archive_threshold_millis(&self) -> i64 {
        i64::from(self.archive_threshold_days) * 24 * 3600 * 1000
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::invalid_field(name, format!("cannot parse '{}'", value)))
}

/// A remote peer entry in the sync fabric's registry.
///
/// Loaded from configuration at startup. An envelope is enqueued for a peer
/// only when the peer's `domains` contains the event's domain and its
/// `kinds` contains the envelope's payload kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's stable identifier.
    pub id: PeerId,

    /// WebSocket endpoint URL (e.g. `ws://dspy.internal:7710/sync`).
    pub endpoint: String,

    /// Domains the peer accepts.
    pub domains: Vec<String>,

    /// Payload kinds the peer accepts.
    pub kinds: Vec<PayloadKind>,
}

impl PeerConfig {
    /// Returns true if this peer accepts the given (domain, kind) pair.
    pub fn accepts(&self, domain: &str, kind: PayloadKind) -> bool {
        self.domains.iter().any(|d| d == domain) && self.kinds.contains(&kind)
    }
}

/// Embedding vector dimensions.
///
/// Standard dimensions are provided for common models. Use `Custom` for
/// other embedding services.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingDimension {
    /// 384 dimensions (all-MiniLM-L6-v2).
    #[default]
    D384,

    /// 768 dimensions (bge-base-en-v1.5, BERT-base).
    D768,

    /// Custom dimension for other embedding models.
    ///
    /// Must be between 1 and 4096.
    Custom(usize),
}

impl EmbeddingDimension {
    /// Returns the numeric size of this dimension.
    ///
    /// # Example
    /// ```rust
    /// use membrane::EmbeddingDimension;
    ///
    /// assert_eq!(EmbeddingDimension::D384.size(), 384);
    /// assert_eq!(EmbeddingDimension::D768.size(), 768);
    /// assert_eq!(EmbeddingDimension::Custom(1536).size(), 1536);
    /// ```
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::D384 => 384,
            Self::D768 => 768,
            Self::Custom(n) => *n,
        }
    }
}

/// Configuration for the HNSW vector index.
///
/// Controls the trade-off between index build time, memory usage,
/// and search accuracy. The defaults are tuned for the core's target
/// scale (10K-500K entries per domain).
///
/// # Tuning Guide
///
/// | Use Case     | M  | ef_construction | ef_search |
/// |--------------|----|-----------------|-----------|
/// | Low memory   |  8 |             100 |        30 |
/// | Balanced     | 16 |             200 |        50 |
/// | High recall  | 32 |             400 |       100 |
#[derive(Clone, Debug)]
pub struct HnswConfig {
    /// Maximum bidirectional connections per node (M parameter).
    ///
    /// Higher values improve recall but increase memory and build time.
    /// Each node stores up to M links, so memory per node is O(M).
    /// Default: 16
    pub max_nb_connection: usize,

    /// Number of candidates tracked during index construction.
    ///
    /// Higher values produce a better quality graph but slow down insertion.
    /// Rule of thumb: ef_construction >= 2 * max_nb_connection.
    /// Default: 200
    pub ef_construction: usize,

    /// Number of candidates tracked during search.
    ///
    /// Higher values improve recall but increase search latency.
    /// Must be >= k (the number of results requested).
    /// Default: 50
    pub ef_search: usize,

    /// Maximum number of layers in the skip-list structure.
    ///
    /// Default 16 handles datasets up to ~1M vectors with M=16.
    pub max_layer: usize,

    /// Initial pre-allocated capacity (number of vectors).
    ///
    /// The index grows beyond this automatically, but pre-allocation
    /// avoids reallocations for known workloads.
    /// Default: 10_000
    pub max_elements: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_nb_connection: 16,
            ef_construction: 200,
            ef_search: 50,
            max_layer: 16,
            max_elements: 10_000,
        }
    }
}
