//! # meshsim-node
//!
//! Virtual node and node manager for MeshSim.
//!
//! A [`VirtualNode`] represents one simulated mesh device: its mesh
//! instance, firmware slot, lifecycle state, metrics and partition tag.
//! The [`NodeManager`] exclusively owns the set of nodes, drives their
//! update ticks, flushes their mesh outboxes into the network simulator
//! and wires the initial topology.

use std::collections::BTreeMap;

use meshsim_common::{NodeId, SimError, SimTime, TaskScheduler};
use meshsim_firmware::{create_firmware, Firmware, FirmwareConfig};
use meshsim_mesh::{Destination, MeshEvent, MeshHandle};
use meshsim_net::{NetworkSimulator, QueuedMessage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ============================================================================
// Node Specification
// ============================================================================

/// Concrete configuration for one virtual node, produced by the scenario
/// loader (directly or through template expansion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Numeric node id derived from the scenario name.
    pub id: NodeId,
    /// The scenario's string identifier for this node.
    pub name: String,
    /// Node type label (sensor, bridge, ...). Informational.
    #[serde(default)]
    pub node_type: String,
    /// Firmware registry key, when a firmware should be attached.
    #[serde(default)]
    pub firmware: Option<String>,
    /// Mesh network SSID prefix.
    pub mesh_prefix: String,
    /// Mesh network password.
    pub mesh_password: String,
    /// Mesh network port.
    pub mesh_port: u16,
    /// Optional `[x, y]` position for visualization.
    #[serde(default)]
    pub position: Option<(i32, i32)>,
    /// Firmware-specific configuration keys.
    #[serde(default)]
    pub firmware_config: BTreeMap<String, String>,
}

// ============================================================================
// Node Metrics
// ============================================================================

/// Per-node performance counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeMetrics {
    /// Messages handed to the mesh layer.
    pub messages_sent: u64,
    /// Messages delivered to this node.
    pub messages_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Time of the most recent start.
    pub start_time: SimTime,
    /// Accumulated running time across all sessions.
    pub total_uptime_ms: u64,
    /// Number of times the node has crashed.
    pub crash_count: u32,
}

// ============================================================================
// Virtual Node
// ============================================================================

/// A single simulated mesh device.
pub struct VirtualNode {
    id: NodeId,
    spec: NodeSpec,
    running: bool,
    partition_id: u32,
    network_quality: f32,
    metrics: NodeMetrics,
    firmware: Option<Box<dyn Firmware>>,
    firmware_setup_done: bool,
    mesh: MeshHandle,
}

impl VirtualNode {
    /// Create a node in the stopped state.
    ///
    /// When the spec names a firmware it is resolved through the registry
    /// and initialized immediately; `setup` runs inside the first start.
    pub fn new(spec: NodeSpec) -> Result<Self, SimError> {
        if spec.id.is_zero() {
            return Err(SimError::InvalidArgument(
                "node id must be non-zero".to_string(),
            ));
        }

        let mut node = VirtualNode {
            id: spec.id,
            mesh: MeshHandle::new(spec.id),
            running: false,
            partition_id: 0,
            network_quality: 1.0,
            metrics: NodeMetrics::default(),
            firmware: None,
            firmware_setup_done: false,
            spec,
        };

        if let Some(firmware_name) = node.spec.firmware.clone() {
            node.load_firmware(&firmware_name)?;
        }
        Ok(node)
    }

    /// The node's id.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// The spec the node was created from.
    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    /// Whether the node is currently running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// The node's mesh instance.
    pub fn mesh(&self) -> &MeshHandle {
        &self.mesh
    }

    /// Mutable access to the node's mesh instance.
    pub fn mesh_mut(&mut self) -> &mut MeshHandle {
        &mut self.mesh
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Start the node.
    ///
    /// The firmware's `setup` runs here on the first start after
    /// construction or after a firmware replacement.
    pub fn start(&mut self, now: SimTime) -> Result<(), SimError> {
        if self.running {
            return Err(SimError::AlreadyRunning(self.id));
        }
        self.running = true;
        self.metrics.start_time = now;

        if let Some(firmware) = &mut self.firmware {
            if !self.firmware_setup_done {
                firmware.setup(&mut self.mesh);
                self.firmware_setup_done = true;
            }
        }
        debug!(node = %self.id, "node started");
        Ok(())
    }

    /// Stop the node gracefully. A no-op when already stopped.
    pub fn stop(&mut self, now: SimTime) {
        if !self.running {
            return;
        }
        self.accumulate_uptime(now);
        self.running = false;
        self.mesh.clear_connections();
        // A stopped device cannot have messages sitting in its radio.
        let _ = self.mesh.take_outbound();
        debug!(node = %self.id, "node stopped");
    }

    /// Crash the node: an ungraceful stop that increments `crash_count`.
    /// Silently a no-op when the node is not running.
    pub fn crash(&mut self, now: SimTime) {
        if !self.running {
            return;
        }
        self.accumulate_uptime(now);
        self.running = false;
        self.metrics.crash_count += 1;
        self.mesh.clear_connections();
        let _ = self.mesh.take_outbound();
        warn!(node = %self.id, crash_count = self.metrics.crash_count, "node crashed");
    }

    /// Stop and immediately start again.
    pub fn restart(&mut self, now: SimTime) -> Result<(), SimError> {
        self.stop(now);
        self.start(now)
    }

    /// One update tick: drain mesh events into the firmware, then advance
    /// the firmware loop. A no-op when the node is stopped.
    pub fn update(&mut self, now: SimTime) {
        if !self.running {
            return;
        }

        while let Some(event) = self.mesh.pop_event() {
            match event {
                MeshEvent::Receive { from, message } => {
                    self.metrics.messages_received += 1;
                    self.metrics.bytes_received += message.len() as u64;
                    if let Some(firmware) = &mut self.firmware {
                        firmware.on_receive(&mut self.mesh, from, &message);
                    }
                }
                MeshEvent::NewConnection(peer) => {
                    if let Some(firmware) = &mut self.firmware {
                        firmware.on_new_connection(&mut self.mesh, peer);
                    }
                }
                MeshEvent::ChangedConnections => {
                    if let Some(firmware) = &mut self.firmware {
                        firmware.on_changed_connections(&mut self.mesh);
                    }
                }
                MeshEvent::TimeAdjusted { offset_us } => {
                    if let Some(firmware) = &mut self.firmware {
                        firmware.on_node_time_adjusted(offset_us);
                    }
                }
            }
        }

        if let Some(firmware) = &mut self.firmware {
            firmware.tick(&mut self.mesh, now);
        }
    }

    /// Uptime of the current session, zero when stopped.
    pub fn uptime(&self, now: SimTime) -> SimTime {
        if self.running {
            now.since(self.metrics.start_time)
        } else {
            SimTime::ZERO
        }
    }

    fn accumulate_uptime(&mut self, now: SimTime) {
        self.metrics.total_uptime_ms += now.since(self.metrics.start_time).as_millis();
    }

    // ── Partition and Quality ─────────────────────────────────────────

    /// Tag this node with a partition id (0 = unpartitioned).
    pub fn set_partition_id(&mut self, partition_id: u32) {
        self.partition_id = partition_id;
    }

    /// The current partition tag.
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Store a network quality factor in `[0, 1]`. Reserved for future use.
    pub fn set_network_quality(&mut self, quality: f32) -> Result<(), SimError> {
        if !(0.0..=1.0).contains(&quality) {
            return Err(SimError::InvalidArgument(format!(
                "network quality {} outside [0, 1]",
                quality
            )));
        }
        self.network_quality = quality;
        Ok(())
    }

    /// The stored network quality factor.
    pub fn network_quality(&self) -> f32 {
        self.network_quality
    }

    // ── Firmware ──────────────────────────────────────────────────────

    /// Load a firmware by registry name, replacing any current firmware.
    pub fn load_firmware(&mut self, name: &str) -> Result<(), SimError> {
        let firmware =
            create_firmware(name).ok_or_else(|| SimError::UnknownFirmware(name.to_string()))?;
        self.load_firmware_instance(firmware);
        Ok(())
    }

    /// Install a firmware instance, replacing any current firmware.
    ///
    /// The instance is initialized here; its `setup` runs on the next
    /// start.
    pub fn load_firmware_instance(&mut self, mut firmware: Box<dyn Firmware>) {
        firmware.initialize(
            self.id,
            FirmwareConfig::from_map(self.spec.firmware_config.clone()),
        );
        self.firmware = Some(firmware);
        self.firmware_setup_done = false;
    }

    /// Whether a firmware is attached.
    pub fn has_firmware(&self) -> bool {
        self.firmware.is_some()
    }

    // ── Connectivity and Delivery ─────────────────────────────────────

    /// Request a mesh-layer link from this node to `other`.
    pub fn connect_to(&mut self, other: &mut VirtualNode) {
        self.mesh.add_connection(other.id);
        other.mesh.add_connection(self.id);
    }

    /// Hand a delivered message to the mesh layer. Dropped silently when
    /// the node is stopped, like a powered-off device.
    pub fn deliver(&mut self, from: NodeId, payload: String) {
        if !self.running {
            debug!(node = %self.id, %from, "delivery to stopped node dropped");
            return;
        }
        self.mesh.push_receive(from, payload);
    }

    /// Take the node's buffered outbound messages, counting send metrics.
    fn take_outbound(&mut self) -> Vec<meshsim_mesh::OutboundMessage> {
        let outbound = self.mesh.take_outbound();
        for message in &outbound {
            self.metrics.messages_sent += 1;
            self.metrics.bytes_sent += message.payload.len() as u64;
        }
        outbound
    }
}

// ============================================================================
// Topology
// ============================================================================

/// Initial wiring of the mesh, projected from the scenario's topology
/// section.
#[derive(Debug, Clone, PartialEq)]
pub enum Topology {
    /// Spanning tree plus extra edges with probability `density`.
    Random {
        /// Probability of each extra edge, in `[0, 1]`.
        density: f32,
    },
    /// Every node connects to the hub.
    Star {
        /// The central node.
        hub: NodeId,
    },
    /// Consecutive nodes form a cycle.
    Ring {
        /// Whether links are used in both directions. Mesh-layer links
        /// are symmetric either way; the flag is kept for the scenario
        /// format.
        bidirectional: bool,
    },
    /// Every pair of nodes connects.
    Mesh,
    /// Exactly the listed connections.
    Custom {
        /// Pairs of nodes to connect.
        connections: Vec<(NodeId, NodeId)>,
    },
}

// ============================================================================
// Node Manager
// ============================================================================

/// Maximum number of nodes a manager will create.
pub const MAX_NODES: usize = 1000;

/// Owns and coordinates the set of virtual nodes.
pub struct NodeManager {
    nodes: BTreeMap<NodeId, VirtualNode>,
    /// Creation order; drives update order and connectivity wiring.
    order: Vec<NodeId>,
    scheduler: TaskScheduler,
    rng: ChaCha8Rng,
    started: bool,
}

impl NodeManager {
    /// Create a manager whose connectivity RNG is seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        NodeManager {
            nodes: BTreeMap::new(),
            order: Vec::new(),
            scheduler: TaskScheduler::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            started: false,
        }
    }

    /// Create a manager with the default seed.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    // ── Node Lifecycle ────────────────────────────────────────────────

    /// Create a node from a spec. The node starts out stopped.
    pub fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, SimError> {
        if spec.id.is_zero() {
            return Err(SimError::InvalidArgument(
                "node id must be non-zero".to_string(),
            ));
        }
        if self.nodes.contains_key(&spec.id) {
            return Err(SimError::DuplicateNode(spec.id));
        }
        if self.nodes.len() >= MAX_NODES {
            return Err(SimError::NodeLimit(MAX_NODES));
        }

        let id = spec.id;
        let node = VirtualNode::new(spec)?;
        self.nodes.insert(id, node);
        self.order.push(id);
        Ok(id)
    }

    /// Stop (if running) and destroy a node. Returns `true` when the node
    /// existed.
    pub fn remove_node(&mut self, id: NodeId, now: SimTime) -> bool {
        match self.nodes.remove(&id) {
            Some(mut node) => {
                node.stop(now);
                self.order.retain(|n| *n != id);
                true
            }
            None => false,
        }
    }

    /// Start every stopped node. Marks the simulation as started.
    pub fn start_all(&mut self, now: SimTime) {
        self.started = true;
        for id in self.order.clone() {
            if let Some(node) = self.nodes.get_mut(&id) {
                if !node.is_running() {
                    if let Err(error) = node.start(now) {
                        warn!(node = %id, %error, "failed to start node");
                    }
                }
            }
        }
    }

    /// Stop every running node.
    pub fn stop_all(&mut self, now: SimTime) {
        self.started = false;
        for node in self.nodes.values_mut() {
            node.stop(now);
        }
    }

    /// Whether `start_all` has been called (and not undone by `stop_all`).
    pub fn is_started(&self) -> bool {
        self.started
    }

    // ── Simulation Tick ───────────────────────────────────────────────

    /// One simulation tick: run the shared task scheduler, update every
    /// node in creation order, then flush each node's mesh outbox into
    /// the network simulator (the I/O step).
    pub fn update_all(&mut self, now: SimTime, net: &mut NetworkSimulator) {
        self.scheduler.run_due(now);

        let ids = self.order.clone();
        for id in &ids {
            if let Some(node) = self.nodes.get_mut(id) {
                node.update(now);
            }
        }

        for id in &ids {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if !node.is_running() {
                continue;
            }
            for message in node.take_outbound() {
                match message.destination {
                    Destination::Single(to) => {
                        net.enqueue(*id, to, message.payload, now);
                    }
                    Destination::Broadcast => {
                        for to in &ids {
                            if to != id {
                                net.enqueue(*id, *to, message.payload.clone(), now);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drain the network simulator's ready messages and dispatch each to
    /// its recipient. Returns the number of messages dispatched.
    pub fn dispatch_ready(&mut self, net: &mut NetworkSimulator, now: SimTime) -> usize {
        let ready = net.ready_messages(now);
        let count = ready.len();
        for message in ready {
            self.deliver(message);
        }
        count
    }

    /// Route one delivered message to its recipient node.
    pub fn deliver(&mut self, message: QueuedMessage) {
        match self.nodes.get_mut(&message.to) {
            Some(node) => node.deliver(message.from, message.payload),
            None => debug!(to = %message.to, "delivery to unknown node dropped"),
        }
    }

    // ── Connectivity ──────────────────────────────────────────────────

    /// Request a mesh-layer link between two managed nodes.
    pub fn connect(&mut self, a: NodeId, b: NodeId) -> Result<(), SimError> {
        if a == b {
            return Err(SimError::InvalidArgument(
                "cannot connect a node to itself".to_string(),
            ));
        }
        let mut node_a = self.nodes.remove(&a).ok_or(SimError::NodeNotFound(a))?;
        let result = match self.nodes.get_mut(&b) {
            Some(node_b) => {
                node_a.connect_to(node_b);
                Ok(())
            }
            None => Err(SimError::NodeNotFound(b)),
        };
        self.nodes.insert(a, node_a);
        result
    }

    /// Wire the mesh into a random spanning tree: each node (from the
    /// second onward, in creation order) connects to a uniformly chosen
    /// earlier node. Deterministic for a given manager seed.
    pub fn establish_connectivity(&mut self) {
        for i in 1..self.order.len() {
            let target = self.rng.gen_range(0..i);
            let a = self.order[i];
            let b = self.order[target];
            if let Err(error) = self.connect(a, b) {
                warn!(%a, %b, %error, "connectivity bootstrap failed for pair");
            }
        }
        info!(nodes = self.order.len(), "mesh connectivity established");
    }

    /// Wire the mesh according to a scenario topology.
    pub fn apply_topology(&mut self, topology: &Topology) {
        match topology {
            Topology::Random { density } => {
                self.establish_connectivity();
                // Extra edges beyond the spanning tree.
                for i in 0..self.order.len() {
                    for j in (i + 1)..self.order.len() {
                        if self.rng.gen::<f32>() < *density {
                            let _ = self.connect(self.order[i], self.order[j]);
                        }
                    }
                }
            }
            Topology::Star { hub } => {
                for id in self.order.clone() {
                    if id != *hub {
                        if let Err(error) = self.connect(*hub, id) {
                            warn!(hub = %hub, node = %id, %error, "star wiring failed");
                        }
                    }
                }
            }
            Topology::Ring { bidirectional: _ } => {
                let n = self.order.len();
                if n < 2 {
                    return;
                }
                for i in 0..n {
                    let _ = self.connect(self.order[i], self.order[(i + 1) % n]);
                }
            }
            Topology::Mesh => {
                for i in 0..self.order.len() {
                    for j in (i + 1)..self.order.len() {
                        let _ = self.connect(self.order[i], self.order[j]);
                    }
                }
            }
            Topology::Custom { connections } => {
                for (a, b) in connections {
                    if let Err(error) = self.connect(*a, *b) {
                        warn!(from = %a, to = %b, %error, "custom wiring failed");
                    }
                }
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Look up a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&VirtualNode> {
        self.nodes.get(&id)
    }

    /// Look up a node by id, mutably.
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut VirtualNode> {
        self.nodes.get_mut(&id)
    }

    /// Whether a node with this id exists.
    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Node ids in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    /// Number of managed nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &VirtualNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// The shared task scheduler.
    pub fn scheduler_mut(&mut self) -> &mut TaskScheduler {
        &mut self.scheduler
    }
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsim_net::LatencyConfig;

    fn spec(id: u32, name: &str) -> NodeSpec {
        NodeSpec {
            id: NodeId::new(id),
            name: name.to_string(),
            node_type: "sensor".to_string(),
            firmware: None,
            mesh_prefix: "TestMesh".to_string(),
            mesh_password: "password".to_string(),
            mesh_port: 5555,
            position: None,
            firmware_config: BTreeMap::new(),
        }
    }

    #[test]
    fn test_node_rejects_zero_id() {
        assert!(matches!(
            VirtualNode::new(spec(0, "zero")),
            Err(SimError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lifecycle_state_machine() {
        let mut node = VirtualNode::new(spec(1001, "n1")).unwrap();
        assert!(!node.is_running());

        node.start(SimTime::ZERO).unwrap();
        assert!(node.is_running());
        assert!(matches!(
            node.start(SimTime::ZERO),
            Err(SimError::AlreadyRunning(_))
        ));

        node.stop(SimTime::from_secs(5));
        assert!(!node.is_running());
        // stop(); stop() is stop().
        node.stop(SimTime::from_secs(6));
        assert_eq!(node.metrics().total_uptime_ms, 5000);
        assert_eq!(node.metrics().crash_count, 0);
    }

    #[test]
    fn test_crash_accounting() {
        let mut node = VirtualNode::new(spec(1001, "n1")).unwrap();

        // crash() on a stopped node is a silent no-op.
        node.crash(SimTime::ZERO);
        assert_eq!(node.metrics().crash_count, 0);

        node.start(SimTime::ZERO).unwrap();
        node.crash(SimTime::from_secs(10));
        node.start(SimTime::from_secs(20)).unwrap();
        node.crash(SimTime::from_secs(30));

        assert_eq!(node.metrics().crash_count, 2);
        assert_eq!(node.metrics().total_uptime_ms, 20_000);
    }

    #[test]
    fn test_restart_keeps_crash_count() {
        let mut node = VirtualNode::new(spec(1001, "n1")).unwrap();
        node.start(SimTime::ZERO).unwrap();
        node.restart(SimTime::from_secs(2)).unwrap();
        assert!(node.is_running());
        assert_eq!(node.metrics().crash_count, 0);
        assert_eq!(node.metrics().total_uptime_ms, 2000);
    }

    #[test]
    fn test_uptime_reads_zero_when_stopped() {
        let mut node = VirtualNode::new(spec(1001, "n1")).unwrap();
        assert_eq!(node.uptime(SimTime::from_secs(9)), SimTime::ZERO);
        node.start(SimTime::from_secs(1)).unwrap();
        assert_eq!(node.uptime(SimTime::from_secs(9)), SimTime::from_secs(8));
    }

    #[test]
    fn test_network_quality_validation() {
        let mut node = VirtualNode::new(spec(1001, "n1")).unwrap();
        assert!(node.set_network_quality(0.5).is_ok());
        assert!(node.set_network_quality(1.5).is_err());
        assert!(node.set_network_quality(-0.1).is_err());
        assert!((node.network_quality() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_manager_create_validations() {
        let mut manager = NodeManager::new();
        assert!(manager.create_node(spec(1001, "a")).is_ok());
        assert!(matches!(
            manager.create_node(spec(1001, "dup")),
            Err(SimError::DuplicateNode(_))
        ));
        assert!(matches!(
            manager.create_node(spec(0, "zero")),
            Err(SimError::InvalidArgument(_))
        ));
        assert_eq!(manager.node_count(), 1);
        assert!(manager.has_node(NodeId::new(1001)));
    }

    #[test]
    fn test_manager_bulk_lifecycle() {
        let mut manager = NodeManager::new();
        for i in 0..5 {
            manager.create_node(spec(1001 + i, &format!("n{}", i))).unwrap();
        }

        manager.start_all(SimTime::ZERO);
        assert!(manager.is_started());
        assert!(manager.nodes().all(|n| n.is_running()));

        // Starting again skips the already-running nodes.
        manager.start_all(SimTime::from_secs(1));

        manager.stop_all(SimTime::from_secs(2));
        assert!(manager.nodes().all(|n| !n.is_running()));
        assert!(!manager.is_started());
    }

    #[test]
    fn test_remove_node_stops_it_first() {
        let mut manager = NodeManager::new();
        manager.create_node(spec(1001, "a")).unwrap();
        manager.start_all(SimTime::ZERO);

        assert!(manager.remove_node(NodeId::new(1001), SimTime::from_secs(1)));
        assert!(!manager.has_node(NodeId::new(1001)));
        assert!(!manager.remove_node(NodeId::new(1001), SimTime::from_secs(1)));
        assert!(manager.node_ids().is_empty());
    }

    #[test]
    fn test_establish_connectivity_spanning_tree() {
        let mut manager = NodeManager::with_seed(42);
        for i in 0..8 {
            manager.create_node(spec(2000 + i, &format!("n{}", i))).unwrap();
        }
        manager.establish_connectivity();

        // Every node except possibly the first has at least one link, and
        // the total number of undirected links is exactly n - 1.
        let total_links: usize = manager
            .nodes()
            .map(|n| n.mesh().node_list().len())
            .sum();
        assert_eq!(total_links, 2 * (manager.node_count() - 1));
        for node in manager.nodes().skip(1) {
            assert!(!node.mesh().node_list().is_empty());
        }
    }

    #[test]
    fn test_establish_connectivity_is_seed_deterministic() {
        fn adjacency(seed: u64) -> Vec<Vec<NodeId>> {
            let mut manager = NodeManager::with_seed(seed);
            for i in 0..10 {
                manager.create_node(spec(3000 + i, &format!("n{}", i))).unwrap();
            }
            manager.establish_connectivity();
            manager.nodes().map(|n| n.mesh().node_list()).collect()
        }

        assert_eq!(adjacency(7), adjacency(7));
    }

    #[test]
    fn test_star_topology() {
        let mut manager = NodeManager::new();
        for i in 0..4 {
            manager.create_node(spec(1001 + i, &format!("n{}", i))).unwrap();
        }
        let hub = NodeId::new(1001);
        manager.apply_topology(&Topology::Star { hub });

        assert_eq!(manager.get_node(hub).unwrap().mesh().node_list().len(), 3);
        for node in manager.nodes().filter(|n| n.node_id() != hub) {
            assert_eq!(node.mesh().node_list(), vec![hub]);
        }
    }

    #[test]
    fn test_ring_topology() {
        let mut manager = NodeManager::new();
        for i in 0..4 {
            manager.create_node(spec(1001 + i, &format!("n{}", i))).unwrap();
        }
        manager.apply_topology(&Topology::Ring { bidirectional: true });
        for node in manager.nodes() {
            assert_eq!(node.mesh().node_list().len(), 2);
        }
    }

    #[test]
    fn test_full_mesh_topology() {
        let mut manager = NodeManager::new();
        for i in 0..4 {
            manager.create_node(spec(1001 + i, &format!("n{}", i))).unwrap();
        }
        manager.apply_topology(&Topology::Mesh);
        for node in manager.nodes() {
            assert_eq!(node.mesh().node_list().len(), 3);
        }
    }

    #[test]
    fn test_update_flushes_outbox_through_network() {
        let mut manager = NodeManager::new();
        manager.create_node(spec(1001, "a")).unwrap();
        manager.create_node(spec(1002, "b")).unwrap();
        manager.start_all(SimTime::ZERO);

        let mut net = NetworkSimulator::new(42);
        net.set_default_latency(LatencyConfig::fixed(10)).unwrap();

        manager
            .get_node_mut(NodeId::new(1001))
            .unwrap()
            .mesh_mut()
            .send_single(NodeId::new(1002), "ping");

        manager.update_all(SimTime::ZERO, &mut net);
        assert_eq!(net.pending_count(), 1);
        assert_eq!(
            manager.get_node(NodeId::new(1001)).unwrap().metrics().messages_sent,
            1
        );

        // Nothing is ready before the sampled latency has elapsed.
        assert_eq!(manager.dispatch_ready(&mut net, SimTime::from_millis(9)), 0);
        assert_eq!(manager.dispatch_ready(&mut net, SimTime::from_millis(10)), 1);

        // The receive event reaches the node's metrics on its next update.
        manager.update_all(SimTime::from_millis(20), &mut net);
        let receiver = manager.get_node(NodeId::new(1002)).unwrap();
        assert_eq!(receiver.metrics().messages_received, 1);
        assert_eq!(receiver.metrics().bytes_received, 4);
    }

    #[test]
    fn test_broadcast_expands_to_all_other_nodes() {
        let mut manager = NodeManager::new();
        for i in 0..4 {
            manager.create_node(spec(1001 + i, &format!("n{}", i))).unwrap();
        }
        manager.start_all(SimTime::ZERO);

        let mut net = NetworkSimulator::new(42);
        net.set_default_latency(LatencyConfig::fixed(5)).unwrap();

        manager
            .get_node_mut(NodeId::new(1001))
            .unwrap()
            .mesh_mut()
            .send_broadcast("hello");
        manager.update_all(SimTime::ZERO, &mut net);

        assert_eq!(net.pending_count(), 3);
        // One send operation, regardless of fan-out.
        assert_eq!(
            manager.get_node(NodeId::new(1001)).unwrap().metrics().messages_sent,
            1
        );
    }

    #[test]
    fn test_delivery_to_stopped_node_is_dropped() {
        let mut manager = NodeManager::new();
        manager.create_node(spec(1001, "a")).unwrap();
        manager.create_node(spec(1002, "b")).unwrap();
        manager.start_all(SimTime::ZERO);
        manager
            .get_node_mut(NodeId::new(1002))
            .unwrap()
            .stop(SimTime::ZERO);

        manager.deliver(QueuedMessage {
            from: NodeId::new(1001),
            to: NodeId::new(1002),
            payload: "lost".to_string(),
            delivery_time: SimTime::ZERO,
        });
        manager.update_all(SimTime::from_millis(10), &mut NetworkSimulator::new(1));
        assert_eq!(
            manager.get_node(NodeId::new(1002)).unwrap().metrics().messages_received,
            0
        );
    }

    #[test]
    fn test_node_limit() {
        let mut manager = NodeManager::new();
        for i in 0..MAX_NODES {
            manager
                .create_node(spec(10_000 + i as u32, &format!("n{}", i)))
                .unwrap();
        }
        assert!(matches!(
            manager.create_node(spec(99_999, "overflow")),
            Err(SimError::NodeLimit(_))
        ));
    }
}
