//! # meshsim-net
//!
//! Network condition simulator for MeshSim.
//!
//! The [`NetworkSimulator`] models the "wire" between virtual nodes:
//! - per-link latency with configurable distributions
//! - per-link probabilistic packet loss, with optional burst mode
//! - per-link active/dropped state (directed)
//! - a delivery priority queue ordered by `(delivery_time, enqueue order)`
//! - per-link delivery statistics
//!
//! The simulator has no time source of its own. The current simulation
//! time is passed into [`NetworkSimulator::enqueue`] and
//! [`NetworkSimulator::ready_messages`] by the outer loop.
//!
//! All randomness (latency samples, loss trials, burst triggers) is drawn
//! from a single seeded `ChaCha8Rng`, so an entire run is reproducible
//! from the seed alone.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use meshsim_common::{NodeId, SimTime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, Exp, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by network configuration operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// A latency or loss configuration failed validation.
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Link Configuration
// ============================================================================

/// Latency distribution types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyDistribution {
    /// Uniform distribution over `[min, max]`.
    #[default]
    Uniform,
    /// Normal distribution with mean `(min+max)/2` and stddev `(max-min)/6`,
    /// clamped to `[min, max]`.
    #[serde(alias = "gaussian")]
    Normal,
    /// Exponential distribution with rate `3/(max-min)`, offset by `min`
    /// and clamped to `[min, max]`.
    Exponential,
}

/// Latency configuration for a link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyConfig {
    /// Minimum latency in milliseconds.
    #[serde(rename = "min")]
    pub min_ms: u32,
    /// Maximum latency in milliseconds.
    #[serde(rename = "max")]
    pub max_ms: u32,
    /// Distribution used to sample within `[min, max]`.
    #[serde(default)]
    pub distribution: LatencyDistribution,
}

impl LatencyConfig {
    /// Fixed latency: every sample is exactly `ms`.
    pub fn fixed(ms: u32) -> Self {
        LatencyConfig {
            min_ms: ms,
            max_ms: ms,
            distribution: LatencyDistribution::Uniform,
        }
    }

    /// Validate the configuration.
    pub fn valid(&self) -> bool {
        self.min_ms <= self.max_ms
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        LatencyConfig {
            min_ms: 10,
            max_ms: 50,
            distribution: LatencyDistribution::Normal,
        }
    }
}

/// Packet loss configuration for a link.
///
/// With `burst_mode` off, every packet independently fails with
/// `probability`. With `burst_mode` on, a successful trial *enters* a
/// burst: the next `burst_length` decisions (counting the trigger) are all
/// drops, and a new burst may begin immediately after the previous one
/// ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketLossConfig {
    /// Drop probability in `[0, 1]`.
    pub probability: f32,
    /// Whether drops come in bursts.
    #[serde(default)]
    pub burst_mode: bool,
    /// Length of a drop burst; must be at least 1.
    #[serde(default = "default_burst_length")]
    pub burst_length: u32,
}

fn default_burst_length() -> u32 {
    3
}

impl PacketLossConfig {
    /// A lossless configuration.
    pub fn none() -> Self {
        PacketLossConfig {
            probability: 0.0,
            burst_mode: false,
            burst_length: 3,
        }
    }

    /// Independent (non-bursty) loss with the given probability.
    pub fn independent(probability: f32) -> Self {
        PacketLossConfig {
            probability,
            burst_mode: false,
            burst_length: 3,
        }
    }

    /// Validate the configuration.
    pub fn valid(&self) -> bool {
        (0.0..=1.0).contains(&self.probability) && self.burst_length >= 1
    }
}

impl Default for PacketLossConfig {
    fn default() -> Self {
        Self::none()
    }
}

// ============================================================================
// Queued Messages
// ============================================================================

/// A message admitted to the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Source node id.
    pub from: NodeId,
    /// Destination node id.
    pub to: NodeId,
    /// Message content.
    pub payload: String,
    /// Time at which the message becomes deliverable.
    pub delivery_time: SimTime,
}

/// Heap entry wrapping a queued message with its admission sequence number.
#[derive(Debug)]
struct QueueEntry {
    message: QueuedMessage,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior: earliest delivery first,
        // FIFO among equal delivery times.
        other
            .message
            .delivery_time
            .cmp(&self.message.delivery_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// Link Statistics
// ============================================================================

/// Internal per-link statistics accumulator.
#[derive(Debug, Clone)]
struct ConnectionStats {
    total_latency_ms: u64,
    min_latency_ms: u32,
    max_latency_ms: u32,
    delivered_count: u64,
    dropped_count: u64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        ConnectionStats {
            total_latency_ms: 0,
            min_latency_ms: u32::MAX,
            max_latency_ms: 0,
            delivered_count: 0,
            dropped_count: 0,
        }
    }
}

/// Read-only view of the statistics for a single directed link.
///
/// Derived fields (`avg_latency_ms`, `drop_rate`) are computed when the
/// view is produced. Looking up a link with no recorded traffic yields a
/// zero-valued view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LinkStats {
    /// Sum of sampled latencies of delivered messages.
    pub total_latency_ms: u64,
    /// Smallest sampled latency (0 when nothing was delivered).
    pub min_latency_ms: u32,
    /// Largest sampled latency.
    pub max_latency_ms: u32,
    /// Messages admitted to the queue.
    pub delivered_count: u64,
    /// Messages dropped at admission (inactive link or loss model).
    pub dropped_count: u64,
    /// Mean latency of delivered messages.
    pub avg_latency_ms: u32,
    /// `dropped / (dropped + delivered)`.
    pub drop_rate: f64,
}

impl ConnectionStats {
    fn view(&self) -> LinkStats {
        let total = self.delivered_count + self.dropped_count;
        LinkStats {
            total_latency_ms: self.total_latency_ms,
            min_latency_ms: if self.delivered_count > 0 {
                self.min_latency_ms
            } else {
                0
            },
            max_latency_ms: self.max_latency_ms,
            delivered_count: self.delivered_count,
            dropped_count: self.dropped_count,
            avg_latency_ms: if self.delivered_count > 0 {
                (self.total_latency_ms / self.delivered_count) as u32
            } else {
                0
            },
            drop_rate: if total > 0 {
                self.dropped_count as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

// ============================================================================
// Network Simulator
// ============================================================================

type LinkKey = (NodeId, NodeId);

/// Simulator for latency, loss and link state between mesh nodes.
pub struct NetworkSimulator {
    default_latency: LatencyConfig,
    latency_overrides: BTreeMap<LinkKey, LatencyConfig>,
    default_loss: PacketLossConfig,
    loss_overrides: BTreeMap<LinkKey, PacketLossConfig>,
    /// Directed links with an explicit drop in effect.
    dropped_links: BTreeSet<LinkKey>,
    /// Remaining forced drops per link while inside a loss burst.
    burst_remaining: BTreeMap<LinkKey, u32>,
    queue: BinaryHeap<QueueEntry>,
    next_seq: u64,
    stats: BTreeMap<LinkKey, ConnectionStats>,
    rng: ChaCha8Rng,
}

impl NetworkSimulator {
    /// Create a simulator with the given seed.
    pub fn new(seed: u64) -> Self {
        NetworkSimulator {
            default_latency: LatencyConfig::default(),
            latency_overrides: BTreeMap::new(),
            default_loss: PacketLossConfig::default(),
            loss_overrides: BTreeMap::new(),
            dropped_links: BTreeSet::new(),
            burst_remaining: BTreeMap::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
            stats: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    // ── Configuration ─────────────────────────────────────────────────

    /// Set the latency configuration used by links without an override.
    pub fn set_default_latency(&mut self, config: LatencyConfig) -> Result<(), NetError> {
        if !config.valid() {
            return Err(NetError::InvalidConfig(
                "latency min_ms must not exceed max_ms".to_string(),
            ));
        }
        self.default_latency = config;
        Ok(())
    }

    /// Set the latency configuration for the directed link `(from, to)`.
    pub fn set_link_latency(
        &mut self,
        from: NodeId,
        to: NodeId,
        config: LatencyConfig,
    ) -> Result<(), NetError> {
        if !config.valid() {
            return Err(NetError::InvalidConfig(
                "latency min_ms must not exceed max_ms".to_string(),
            ));
        }
        self.latency_overrides.insert((from, to), config);
        Ok(())
    }

    /// The latency configuration in effect for `(from, to)`.
    pub fn latency_config(&self, from: NodeId, to: NodeId) -> LatencyConfig {
        self.latency_overrides
            .get(&(from, to))
            .copied()
            .unwrap_or(self.default_latency)
    }

    /// Set the loss configuration used by links without an override.
    pub fn set_default_loss(&mut self, config: PacketLossConfig) -> Result<(), NetError> {
        if !config.valid() {
            return Err(NetError::InvalidConfig(
                "loss probability must be in [0, 1] and burst_length >= 1".to_string(),
            ));
        }
        self.default_loss = config;
        Ok(())
    }

    /// Set the loss configuration for the directed link `(from, to)`.
    pub fn set_link_loss(
        &mut self,
        from: NodeId,
        to: NodeId,
        config: PacketLossConfig,
    ) -> Result<(), NetError> {
        if !config.valid() {
            return Err(NetError::InvalidConfig(
                "loss probability must be in [0, 1] and burst_length >= 1".to_string(),
            ));
        }
        self.loss_overrides.insert((from, to), config);
        Ok(())
    }

    /// The loss configuration in effect for `(from, to)`.
    pub fn loss_config(&self, from: NodeId, to: NodeId) -> PacketLossConfig {
        self.loss_overrides
            .get(&(from, to))
            .copied()
            .unwrap_or(self.default_loss)
    }

    // ── Link State ────────────────────────────────────────────────────

    /// Drop the directed link `(from, to)`. Idempotent.
    pub fn drop_link(&mut self, from: NodeId, to: NodeId) {
        self.dropped_links.insert((from, to));
    }

    /// Restore the directed link `(from, to)`. Idempotent.
    pub fn restore_link(&mut self, from: NodeId, to: NodeId) {
        self.dropped_links.remove(&(from, to));
    }

    /// Clear every dropped flag. Latency and loss configs are unchanged.
    pub fn restore_all_links(&mut self) {
        self.dropped_links.clear();
    }

    /// Whether no explicit drop is in effect for `(from, to)`.
    pub fn is_link_active(&self, from: NodeId, to: NodeId) -> bool {
        !self.dropped_links.contains(&(from, to))
    }

    // ── Admission and Delivery ────────────────────────────────────────

    /// Submit a message for delivery at `now`.
    ///
    /// The admission decision happens here: an inactive link or a loss
    /// sample records a drop; otherwise a latency sample schedules the
    /// message on the delivery queue. Never fails.
    pub fn enqueue(&mut self, from: NodeId, to: NodeId, payload: impl Into<String>, now: SimTime) {
        let key = (from, to);

        if self.dropped_links.contains(&key) {
            self.stats.entry(key).or_default().dropped_count += 1;
            return;
        }

        let loss = self.loss_config(from, to);
        if self.sample_loss(key, &loss) {
            self.stats.entry(key).or_default().dropped_count += 1;
            debug!(%from, %to, "packet lost");
            return;
        }

        let latency_config = self.latency_config(from, to);
        let latency_ms = self.sample_latency(&latency_config);
        let delivery_time = now + SimTime::from_millis(latency_ms as u64);

        let stats = self.stats.entry(key).or_default();
        stats.total_latency_ms += latency_ms as u64;
        stats.min_latency_ms = stats.min_latency_ms.min(latency_ms);
        stats.max_latency_ms = stats.max_latency_ms.max(latency_ms);
        stats.delivered_count += 1;

        self.queue.push(QueueEntry {
            message: QueuedMessage {
                from,
                to,
                payload: payload.into(),
                delivery_time,
            },
            seq: self.next_seq,
        });
        self.next_seq += 1;
    }

    /// Pop every message whose delivery time has been reached, in
    /// `(delivery_time, enqueue order)` order.
    pub fn ready_messages(&mut self, now: SimTime) -> Vec<QueuedMessage> {
        let mut ready = Vec::new();
        while let Some(entry) = self.queue.peek() {
            if entry.message.delivery_time > now {
                break;
            }
            // peek() above guarantees the pop succeeds
            let entry = self.queue.pop().expect("peeked entry present");
            ready.push(entry.message);
        }
        ready
    }

    /// Number of in-flight messages.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Discard every in-flight message.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    // ── Statistics ────────────────────────────────────────────────────

    /// Statistics for the directed link `(from, to)`.
    pub fn stats(&self, from: NodeId, to: NodeId) -> LinkStats {
        self.stats
            .get(&(from, to))
            .map(|s| s.view())
            .unwrap_or_default()
    }

    /// Every link with recorded traffic, with its statistics view.
    pub fn all_stats(&self) -> Vec<(NodeId, NodeId, LinkStats)> {
        self.stats
            .iter()
            .map(|(&(from, to), s)| (from, to, s.view()))
            .collect()
    }

    /// Wipe all statistics.
    pub fn reset_stats(&mut self) {
        self.stats.clear();
    }

    // ── Sampling ──────────────────────────────────────────────────────

    /// One loss decision for `key`. Stateful in burst mode.
    fn sample_loss(&mut self, key: LinkKey, config: &PacketLossConfig) -> bool {
        if !config.burst_mode {
            return config.probability > 0.0
                && self.rng.gen::<f64>() < config.probability as f64;
        }

        if let Some(remaining) = self.burst_remaining.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }

        if config.probability > 0.0 && self.rng.gen::<f64>() < config.probability as f64 {
            // The trigger counts as the first drop of the burst.
            self.burst_remaining
                .insert(key, config.burst_length.saturating_sub(1));
            return true;
        }
        false
    }

    /// Sample a latency in milliseconds from the configured distribution.
    fn sample_latency(&mut self, config: &LatencyConfig) -> u32 {
        if config.min_ms == config.max_ms {
            return config.min_ms;
        }
        match config.distribution {
            LatencyDistribution::Uniform => self.rng.gen_range(config.min_ms..=config.max_ms),
            LatencyDistribution::Normal => {
                let min = config.min_ms as f64;
                let max = config.max_ms as f64;
                let mean = (min + max) / 2.0;
                // 99.7% of samples fall inside [min, max]; the rest clamp.
                let stddev = (max - min) / 6.0;
                let dist = Normal::new(mean, stddev).expect("stddev is positive");
                dist.sample(&mut self.rng).clamp(min, max).round() as u32
            }
            LatencyDistribution::Exponential => {
                let min = config.min_ms as f64;
                let max = config.max_ms as f64;
                let lambda = 3.0 / (max - min);
                let dist = Exp::new(lambda).expect("lambda is positive");
                (dist.sample(&mut self.rng) + min).clamp(min, max).round() as u32
            }
        }
    }
}
