//! # meshsim-runner
//!
//! Simulation assembly and run loop for MeshSim.
//!
//! [`Simulation::build`] turns a validated scenario into a wired engine:
//! nodes created, network configured, topology applied, timeline
//! scheduled. [`Simulation::run`] drives the wall-clock outer loop (time
//! scaled by `time_scale`, stop flag polled each tick);
//! [`Simulation::run_virtual`] drives the same tick function from virtual
//! time for tests and head-less batch runs.
//!
//! Tick order, every iteration: event scheduler drain, node manager
//! update (task scheduler, per-node updates, outbox flush into the
//! network), then ready-message dispatch.

pub mod metrics_export;

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshsim_common::{SimError, SimTime};
use meshsim_events::EventScheduler;
use meshsim_firmware::register_builtin_firmwares;
use meshsim_net::{NetError, NetworkSimulator};
use meshsim_node::NodeManager;
use meshsim_scenario::{Scenario, ScenarioError};
use crate::metrics_export::{collect_snapshot, MetricsReport, MetricsSnapshot};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while building or running a simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Scenario loading or validation failed.
    #[error("Scenario error: {0}")]
    Scenario(#[from] ScenarioError),

    /// An engine operation failed.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    /// A network configuration was rejected.
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    /// An output file could not be written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Result serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Aggregate Statistics
// ============================================================================

/// Aggregate statistics of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Scenario name.
    pub name: String,
    /// Seed the run actually used.
    pub seed: u64,
    /// Number of managed nodes at the end of the run.
    pub node_count: usize,
    /// Final simulation time in milliseconds.
    pub simulation_time_ms: u64,
    /// Wall-clock duration of the run in milliseconds.
    pub wall_time_ms: u64,
    /// Ticks performed.
    pub total_updates: u64,
    /// Fault-injection events executed.
    pub events_executed: u64,
    /// Messages sent by all nodes.
    pub messages_sent: u64,
    /// Messages received by all nodes.
    pub messages_received: u64,
    /// Messages the network admitted for delivery.
    pub network_delivered: u64,
    /// Messages the network dropped at admission.
    pub network_dropped: u64,
}

// ============================================================================
// Simulation
// ============================================================================

/// A fully wired simulation instance.
pub struct Simulation {
    scenario: Scenario,
    manager: NodeManager,
    net: NetworkSimulator,
    events: EventScheduler,
    now: SimTime,
    updates: u64,
    events_executed: u64,
    snapshots: Vec<MetricsSnapshot>,
    /// Set by the shared task scheduler when a metrics snapshot is due.
    snapshot_due: Rc<Cell<bool>>,
    seed: u64,
}

impl Simulation {
    /// Build a simulation from a scenario.
    ///
    /// The scenario is validated here; a validation failure carries the
    /// full finding list.
    pub fn build(scenario: Scenario) -> Result<Self, RunnerError> {
        scenario.validate()?;
        register_builtin_firmwares();

        let seed = if scenario.simulation.seed == 0 {
            rand::random()
        } else {
            scenario.simulation.seed as u64
        };
        info!(seed, name = scenario.simulation.name.as_str(), "building simulation");

        let mut net = NetworkSimulator::new(seed);
        net.set_default_latency(scenario.network.default_latency)?;
        net.set_default_loss(scenario.network.default_loss)?;

        let ids = scenario.node_ids_by_name();
        for over in &scenario.network.latency_overrides {
            match (ids.get(&over.from), ids.get(&over.to)) {
                (Some(&from), Some(&to)) => net.set_link_latency(from, to, over.config)?,
                _ => warn!(
                    from = over.from.as_str(),
                    to = over.to.as_str(),
                    "latency override references unknown node, skipping"
                ),
            }
        }
        for over in &scenario.network.loss_overrides {
            match (ids.get(&over.from), ids.get(&over.to)) {
                (Some(&from), Some(&to)) => net.set_link_loss(from, to, over.config)?,
                _ => warn!(
                    from = over.from.as_str(),
                    to = over.to.as_str(),
                    "packet loss override references unknown node, skipping"
                ),
            }
        }

        let mut manager = NodeManager::with_seed(seed);
        for spec in &scenario.nodes {
            manager.create_node(spec.clone())?;
        }

        let mut events = EventScheduler::new();
        for (time_s, event) in scenario.build_events()? {
            events.schedule(event, time_s);
        }

        let snapshot_due = Rc::new(Cell::new(false));
        let wants_metrics =
            !scenario.metrics.export.is_empty() || !scenario.metrics.output.is_empty();
        if wants_metrics {
            let interval = SimTime::from_secs(scenario.metrics.interval_s.max(1) as u64);
            let flag = snapshot_due.clone();
            manager
                .scheduler_mut()
                .add_periodic(interval, interval, move |_| flag.set(true));
        }

        Ok(Simulation {
            scenario,
            manager,
            net,
            events,
            now: SimTime::ZERO,
            updates: 0,
            events_executed: 0,
            snapshots: Vec::new(),
            snapshot_due,
            seed,
        })
    }

    /// Start every node and wire the initial topology.
    pub fn start(&mut self) -> Result<(), RunnerError> {
        self.manager.start_all(SimTime::ZERO);
        let topology = self.scenario.build_topology()?;
        self.manager.apply_topology(&topology);
        info!(nodes = self.manager.node_count(), "simulation started");
        Ok(())
    }

    /// One simulation tick at `now`.
    pub fn tick(&mut self, now: SimTime) {
        self.now = now;
        self.events_executed +=
            self.events.process(now, &mut self.manager, &mut self.net) as u64;
        self.manager.update_all(now, &mut self.net);
        self.manager.dispatch_ready(&mut self.net, now);

        if self.snapshot_due.replace(false) {
            self.snapshots
                .push(collect_snapshot(now, &self.manager, &self.net));
        }
        self.updates += 1;
    }

    /// Run against the wall clock until the duration elapses or the stop
    /// flag is raised. `on_progress` is invoked roughly every five
    /// seconds.
    pub fn run<F>(
        &mut self,
        stop_flag: Arc<AtomicBool>,
        mut on_progress: F,
    ) -> Result<SimulationStats, RunnerError>
    where
        F: FnMut(&Simulation, SimTime),
    {
        let wall_start = Instant::now();
        let time_scale = self.scenario.simulation.time_scale as f64;
        let duration_s = self.scenario.simulation.duration_s;

        self.start()?;

        let sleep_ms = ((10.0 / time_scale).round() as u64).max(1);
        let progress_interval = Duration::from_secs(5);
        let mut last_progress = Instant::now();

        loop {
            if stop_flag.load(Ordering::Relaxed) {
                info!("stop requested, shutting down");
                break;
            }

            let now =
                SimTime::from_millis((wall_start.elapsed().as_millis() as f64 * time_scale) as u64);
            self.tick(now);

            if last_progress.elapsed() >= progress_interval {
                on_progress(&*self, now);
                last_progress = Instant::now();
            }

            if duration_s > 0 && wall_start.elapsed().as_secs() >= duration_s as u64 {
                info!(duration_s, "simulation duration reached");
                break;
            }

            std::thread::sleep(Duration::from_millis(sleep_ms));
        }

        let final_now = self.now;
        self.manager.stop_all(final_now);
        Ok(self.finalize(wall_start.elapsed()))
    }

    /// Run in virtual time: tick from zero to `duration` in fixed steps,
    /// with no sleeping and no wall-clock dependence. Deterministic for a
    /// given scenario and seed.
    pub fn run_virtual(&mut self, duration: SimTime, step: SimTime) -> Result<SimulationStats, RunnerError> {
        let wall_start = Instant::now();
        self.start()?;

        let step = step.max(SimTime::from_millis(1));
        let mut now = SimTime::ZERO;
        loop {
            self.tick(now);
            if now >= duration {
                break;
            }
            now = now + step;
        }

        self.manager.stop_all(duration);
        Ok(self.finalize(wall_start.elapsed()))
    }

    fn finalize(&self, wall: Duration) -> SimulationStats {
        let mut stats = SimulationStats {
            name: self.scenario.simulation.name.clone(),
            seed: self.seed,
            node_count: self.manager.node_count(),
            simulation_time_ms: self.now.as_millis(),
            wall_time_ms: wall.as_millis() as u64,
            total_updates: self.updates,
            events_executed: self.events_executed,
            ..SimulationStats::default()
        };
        for node in self.manager.nodes() {
            stats.messages_sent += node.metrics().messages_sent;
            stats.messages_received += node.metrics().messages_received;
        }
        for (_, _, link) in self.net.all_stats() {
            stats.network_delivered += link.delivered_count;
            stats.network_dropped += link.dropped_count;
        }
        stats
    }

    /// Build the end-of-run metrics report.
    pub fn report(&self, stats: SimulationStats) -> MetricsReport {
        let final_snapshot = collect_snapshot(self.now, &self.manager, &self.net);
        MetricsReport {
            stats,
            nodes: final_snapshot.nodes,
            links: final_snapshot.links,
            snapshots: self.snapshots.clone(),
        }
    }

    /// Write the report in every format the scenario requests, under
    /// `output_dir`. Returns the written paths.
    pub fn write_exports(
        &self,
        report: &MetricsReport,
        output_dir: &Path,
    ) -> Result<Vec<std::path::PathBuf>, RunnerError> {
        use meshsim_scenario::ExportFormat;

        if self.scenario.metrics.export.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(output_dir)?;

        let stem = Path::new(&self.scenario.metrics.output)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("metrics")
            .to_string();

        let mut written = Vec::new();
        for format in &self.scenario.metrics.export {
            let (ext, write): (&str, fn(&MetricsReport, &mut dyn std::io::Write) -> Result<(), RunnerError>) =
                match format {
                    ExportFormat::Json => ("json", metrics_export::export_json),
                    ExportFormat::Csv => ("csv", metrics_export::export_csv),
                    ExportFormat::Graphviz => ("dot", metrics_export::export_graphviz),
                };
            let path = output_dir.join(format!("{}.{}", stem, ext));
            let mut file = std::fs::File::create(&path)?;
            write(report, &mut file)?;
            info!(path = %path.display(), "metrics exported");
            written.push(path);
        }
        Ok(written)
    }

    // ── Accessors ─────────────────────────────────────────────────────

    /// The scenario this simulation was built from.
    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// The node manager.
    pub fn manager(&self) -> &NodeManager {
        &self.manager
    }

    /// The network simulator.
    pub fn net(&self) -> &NetworkSimulator {
        &self.net
    }

    /// Current simulation time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of fault-injection events still scheduled.
    pub fn pending_events(&self) -> usize {
        self.events.pending_count()
    }

    /// The seed this run uses.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}
