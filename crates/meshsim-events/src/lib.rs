//! # meshsim-events
//!
//! Fault-injection event catalogue and scheduler for MeshSim.
//!
//! A scenario declares a timeline of [`SimEvent`]s. The [`EventScheduler`]
//! holds them in a min-heap keyed by `(scheduled time, insertion order)`
//! and, on every tick, drains and executes all events whose time has been
//! reached against the node manager and the network simulator.
//!
//! A failing event is logged and counted as processed; it never aborts the
//! drain or the simulation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use meshsim_common::{NodeId, SimError, SimTime};
use meshsim_net::{LatencyConfig, LatencyDistribution, NetworkSimulator, PacketLossConfig};
use meshsim_node::{NodeManager, NodeSpec};
use tracing::{info, warn};

// ============================================================================
// Event Catalogue
// ============================================================================

/// A fault-injection event, projected from the scenario timeline.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// Start a node. No-op when it is already running.
    NodeStart(NodeId),
    /// Stop a node. The `graceful` flag is descriptive only.
    NodeStop {
        /// Target node.
        id: NodeId,
        /// Whether the shutdown is considered graceful.
        graceful: bool,
    },
    /// Crash a node (ungraceful stop, increments its crash count).
    NodeCrash(NodeId),
    /// Stop and immediately restart a node.
    NodeRestart(NodeId),
    /// Drop the link between two nodes, both directions.
    LinkDrop {
        /// One endpoint.
        a: NodeId,
        /// The other endpoint.
        b: NodeId,
    },
    /// Restore the link between two nodes, both directions.
    LinkRestore {
        /// One endpoint.
        a: NodeId,
        /// The other endpoint.
        b: NodeId,
    },
    /// Degrade the link between two nodes: raised latency and packet loss,
    /// both directions.
    LinkDegrade {
        /// One endpoint.
        a: NodeId,
        /// The other endpoint.
        b: NodeId,
        /// New base latency; the sampled range becomes `[latency, 2*latency]`.
        latency_ms: u32,
        /// New independent loss probability.
        loss_probability: f32,
    },
    /// Split the network into isolated groups.
    PartitionNetwork {
        /// At least two non-empty groups of node ids.
        groups: Vec<Vec<NodeId>>,
    },
    /// Restore every link and clear all partition tags.
    HealNetwork,
    /// Enqueue a message directly, bypassing any firmware.
    InjectMessage {
        /// Source node id.
        from: NodeId,
        /// Destination node id.
        to: NodeId,
        /// Message content.
        payload: String,
    },
    /// Store a network quality factor on one node, or on all nodes.
    SetNetworkQuality {
        /// Target node; `None` applies to every node.
        target: Option<NodeId>,
        /// Quality in `[0, 1]`.
        quality: f32,
    },
    /// Materialize new nodes from pre-expanded specs.
    AddNodes {
        /// Specs produced by template expansion at scenario load time.
        specs: Vec<NodeSpec>,
    },
    /// Stop (if running) and destroy a node.
    RemoveNode(NodeId),
}

impl std::fmt::Display for SimEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimEvent::NodeStart(id) => write!(f, "start node {}", id),
            SimEvent::NodeStop { id, graceful } => {
                write!(f, "stop node {} (graceful: {})", id, graceful)
            }
            SimEvent::NodeCrash(id) => write!(f, "crash node {}", id),
            SimEvent::NodeRestart(id) => write!(f, "restart node {}", id),
            SimEvent::LinkDrop { a, b } => write!(f, "drop link {} <-> {}", a, b),
            SimEvent::LinkRestore { a, b } => write!(f, "restore link {} <-> {}", a, b),
            SimEvent::LinkDegrade {
                a,
                b,
                latency_ms,
                loss_probability,
            } => write!(
                f,
                "degrade link {} <-> {} (latency: {}ms, loss: {:.0}%)",
                a,
                b,
                latency_ms,
                loss_probability * 100.0
            ),
            SimEvent::PartitionNetwork { groups } => {
                write!(f, "partition network into {} groups", groups.len())
            }
            SimEvent::HealNetwork => write!(f, "heal network partition"),
            SimEvent::InjectMessage { from, to, .. } => {
                write!(f, "inject message {} -> {}", from, to)
            }
            SimEvent::SetNetworkQuality { target, quality } => match target {
                Some(id) => write!(f, "set network quality {:.2} on node {}", quality, id),
                None => write!(f, "set network quality {:.2} on all nodes", quality),
            },
            SimEvent::AddNodes { specs } => write!(f, "add {} nodes", specs.len()),
            SimEvent::RemoveNode(id) => write!(f, "remove node {}", id),
        }
    }
}

impl SimEvent {
    /// Execute this event against the manager and the network.
    pub fn execute(
        &self,
        now: SimTime,
        manager: &mut NodeManager,
        net: &mut NetworkSimulator,
    ) -> Result<(), SimError> {
        match self {
            SimEvent::NodeStart(id) => {
                let node = manager
                    .get_node_mut(*id)
                    .ok_or(SimError::NodeNotFound(*id))?;
                if !node.is_running() {
                    node.start(now)?;
                }
                Ok(())
            }
            SimEvent::NodeStop { id, graceful } => {
                let node = manager
                    .get_node_mut(*id)
                    .ok_or(SimError::NodeNotFound(*id))?;
                info!(node = %id, graceful, "stopping node");
                node.stop(now);
                Ok(())
            }
            SimEvent::NodeCrash(id) => {
                let node = manager
                    .get_node_mut(*id)
                    .ok_or(SimError::NodeNotFound(*id))?;
                node.crash(now);
                Ok(())
            }
            SimEvent::NodeRestart(id) => {
                let node = manager
                    .get_node_mut(*id)
                    .ok_or(SimError::NodeNotFound(*id))?;
                node.restart(now)
            }
            SimEvent::LinkDrop { a, b } => {
                net.drop_link(*a, *b);
                net.drop_link(*b, *a);
                Ok(())
            }
            SimEvent::LinkRestore { a, b } => {
                net.restore_link(*a, *b);
                net.restore_link(*b, *a);
                Ok(())
            }
            SimEvent::LinkDegrade {
                a,
                b,
                latency_ms,
                loss_probability,
            } => {
                let latency = LatencyConfig {
                    min_ms: *latency_ms,
                    max_ms: latency_ms.saturating_mul(2),
                    distribution: LatencyDistribution::Uniform,
                };
                let loss = PacketLossConfig {
                    probability: *loss_probability,
                    burst_mode: false,
                    burst_length: 3,
                };
                net.set_link_latency(*a, *b, latency)
                    .and_then(|_| net.set_link_latency(*b, *a, latency))
                    .and_then(|_| net.set_link_loss(*a, *b, loss))
                    .and_then(|_| net.set_link_loss(*b, *a, loss))
                    .map_err(|e| SimError::EventFailed(e.to_string()))
            }
            SimEvent::PartitionNetwork { groups } => {
                if groups.len() < 2 {
                    return Err(SimError::EventFailed(
                        "partition requires at least 2 groups".to_string(),
                    ));
                }
                if groups.iter().any(|g| g.is_empty()) {
                    return Err(SimError::EventFailed(
                        "partition groups must be non-empty".to_string(),
                    ));
                }

                for i in 0..groups.len() {
                    for j in (i + 1)..groups.len() {
                        for &u in &groups[i] {
                            for &v in &groups[j] {
                                net.drop_link(u, v);
                                net.drop_link(v, u);
                            }
                        }
                    }
                }

                // 1-based partition ids, by group position.
                for (index, group) in groups.iter().enumerate() {
                    for &id in group {
                        match manager.get_node_mut(id) {
                            Some(node) => node.set_partition_id(index as u32 + 1),
                            None => warn!(node = %id, "partition group references unknown node"),
                        }
                    }
                }
                info!(groups = groups.len(), "network partitioned");
                Ok(())
            }
            SimEvent::HealNetwork => {
                net.restore_all_links();
                for id in manager.node_ids() {
                    if let Some(node) = manager.get_node_mut(id) {
                        node.set_partition_id(0);
                    }
                }
                info!("network partition healed");
                Ok(())
            }
            SimEvent::InjectMessage { from, to, payload } => {
                net.enqueue(*from, *to, payload.clone(), now);
                Ok(())
            }
            SimEvent::SetNetworkQuality { target, quality } => match target {
                Some(id) => {
                    let node = manager
                        .get_node_mut(*id)
                        .ok_or(SimError::NodeNotFound(*id))?;
                    node.set_network_quality(*quality)
                }
                None => {
                    for id in manager.node_ids() {
                        if let Some(node) = manager.get_node_mut(id) {
                            node.set_network_quality(*quality)?;
                        }
                    }
                    Ok(())
                }
            },
            SimEvent::AddNodes { specs } => {
                for spec in specs {
                    let id = spec.id;
                    match manager.create_node(spec.clone()) {
                        Ok(_) => {
                            if manager.is_started() {
                                if let Some(node) = manager.get_node_mut(id) {
                                    node.start(now)?;
                                }
                            }
                        }
                        Err(error) => {
                            warn!(node = %spec.name, %error, "failed to add node");
                        }
                    }
                }
                Ok(())
            }
            SimEvent::RemoveNode(id) => {
                if manager.remove_node(*id, now) {
                    Ok(())
                } else {
                    Err(SimError::NodeNotFound(*id))
                }
            }
        }
    }
}

// ============================================================================
// Event Scheduler
// ============================================================================

struct ScheduledEntry {
    /// Scheduled time in whole seconds since simulation start.
    time_s: u32,
    /// Insertion sequence for FIFO ordering among equal times.
    seq: u64,
    event: SimEvent,
    description: String,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior: earliest time first,
        // FIFO among equal times.
        other
            .time_s
            .cmp(&self.time_s)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Time-ordered fault-injection timeline.
pub struct EventScheduler {
    queue: BinaryHeap<ScheduledEntry>,
    next_seq: u64,
}

impl EventScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        EventScheduler {
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Schedule an event for execution at `time_s` seconds.
    pub fn schedule(&mut self, event: SimEvent, time_s: u32) {
        let description = event.to_string();
        self.queue.push(ScheduledEntry {
            time_s,
            seq: self.next_seq,
            event,
            description,
        });
        self.next_seq += 1;
    }

    /// Execute every event whose scheduled time is `<= now`, in
    /// `(time, insertion order)` order.
    ///
    /// Execution failures are logged and the drain continues; failed
    /// events still count as processed. Returns the number executed.
    pub fn process(
        &mut self,
        now: SimTime,
        manager: &mut NodeManager,
        net: &mut NetworkSimulator,
    ) -> u32 {
        let mut executed = 0;
        while let Some(entry) = self.queue.peek() {
            if SimTime::from_secs(entry.time_s as u64) > now {
                break;
            }
            // peek() above guarantees the pop succeeds
            let entry = self.queue.pop().expect("peeked entry present");
            info!(time_s = entry.time_s, event = %entry.description, "executing event");
            if let Err(error) = entry.event.execute(now, manager, net) {
                warn!(event = %entry.description, %error, "event execution failed");
            }
            executed += 1;
        }
        executed
    }

    /// Whether any events remain.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Number of remaining events.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Scheduled time of the next event in seconds, or `u32::MAX` when
    /// the timeline is empty.
    pub fn next_event_time(&self) -> u32 {
        self.queue.peek().map(|e| e.time_s).unwrap_or(u32::MAX)
    }

    /// Discard every remaining event.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsim_net::LatencyConfig;
    use std::collections::BTreeMap;

    fn spec(id: u32, name: &str) -> NodeSpec {
        NodeSpec {
            id: NodeId::new(id),
            name: name.to_string(),
            node_type: String::new(),
            firmware: None,
            mesh_prefix: "TestMesh".to_string(),
            mesh_password: "password".to_string(),
            mesh_port: 5555,
            position: None,
            firmware_config: BTreeMap::new(),
        }
    }

    fn manager_with_nodes(ids: &[u32]) -> NodeManager {
        let mut manager = NodeManager::with_seed(42);
        for &id in ids {
            manager.create_node(spec(id, &format!("node-{}", id))).unwrap();
        }
        manager
    }

    #[test]
    fn test_scheduler_orders_by_time_then_insertion() {
        let mut scheduler = EventScheduler::new();
        let mut manager = manager_with_nodes(&[1001, 1002]);
        let mut net = NetworkSimulator::new(42);
        net.set_default_latency(LatencyConfig::fixed(10)).unwrap();

        // Same scheduled time: registration order must hold.
        scheduler.schedule(
            SimEvent::InjectMessage {
                from: NodeId::new(1001),
                to: NodeId::new(1002),
                payload: "first".to_string(),
            },
            5,
        );
        scheduler.schedule(
            SimEvent::InjectMessage {
                from: NodeId::new(1001),
                to: NodeId::new(1002),
                payload: "second".to_string(),
            },
            5,
        );
        scheduler.schedule(
            SimEvent::InjectMessage {
                from: NodeId::new(1001),
                to: NodeId::new(1002),
                payload: "earlier".to_string(),
            },
            2,
        );

        assert_eq!(scheduler.next_event_time(), 2);
        let executed = scheduler.process(SimTime::from_secs(5), &mut manager, &mut net);
        assert_eq!(executed, 3);

        let delivered = net.ready_messages(SimTime::from_secs(60));
        let payloads: Vec<&str> = delivered.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, vec!["earlier", "first", "second"]);
    }

    #[test]
    fn test_event_at_exact_time_executes() {
        let mut scheduler = EventScheduler::new();
        let mut manager = manager_with_nodes(&[1001]);
        let mut net = NetworkSimulator::new(1);

        scheduler.schedule(SimEvent::NodeStart(NodeId::new(1001)), 30);
        assert_eq!(
            scheduler.process(SimTime::from_millis(29_999), &mut manager, &mut net),
            0
        );
        assert_eq!(
            scheduler.process(SimTime::from_secs(30), &mut manager, &mut net),
            1
        );
        assert!(manager.get_node(NodeId::new(1001)).unwrap().is_running());
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn test_failed_event_does_not_abort_drain() {
        let mut scheduler = EventScheduler::new();
        let mut manager = manager_with_nodes(&[1001]);
        let mut net = NetworkSimulator::new(1);

        scheduler.schedule(SimEvent::NodeCrash(NodeId::new(9999)), 1);
        scheduler.schedule(SimEvent::NodeStart(NodeId::new(1001)), 1);

        let executed = scheduler.process(SimTime::from_secs(1), &mut manager, &mut net);
        assert_eq!(executed, 2);
        assert!(manager.get_node(NodeId::new(1001)).unwrap().is_running());
    }

    #[test]
    fn test_crash_accounting_through_events() {
        let mut scheduler = EventScheduler::new();
        let mut manager = manager_with_nodes(&[1001]);
        let mut net = NetworkSimulator::new(1);
        let node = NodeId::new(1001);

        scheduler.schedule(SimEvent::NodeStart(node), 0);
        scheduler.schedule(SimEvent::NodeCrash(node), 10);
        scheduler.schedule(SimEvent::NodeStart(node), 20);
        scheduler.schedule(SimEvent::NodeCrash(node), 30);

        for t in 0..=30u64 {
            scheduler.process(SimTime::from_secs(t), &mut manager, &mut net);
        }

        let metrics = manager.get_node(node).unwrap().metrics();
        assert_eq!(metrics.crash_count, 2);
        assert_eq!(metrics.total_uptime_ms, 20_000);
    }

    #[test]
    fn test_stop_and_restart_do_not_count_as_crashes() {
        let mut scheduler = EventScheduler::new();
        let mut manager = manager_with_nodes(&[1001]);
        let mut net = NetworkSimulator::new(1);
        let node = NodeId::new(1001);

        scheduler.schedule(SimEvent::NodeStart(node), 0);
        scheduler.schedule(
            SimEvent::NodeStop {
                id: node,
                graceful: true,
            },
            5,
        );
        scheduler.schedule(SimEvent::NodeStart(node), 10);
        scheduler.schedule(SimEvent::NodeRestart(node), 15);

        for t in 0..=15u64 {
            scheduler.process(SimTime::from_secs(t), &mut manager, &mut net);
        }

        let node_ref = manager.get_node(node).unwrap();
        assert!(node_ref.is_running());
        assert_eq!(node_ref.metrics().crash_count, 0);
    }

    #[test]
    fn test_partition_and_heal_round_trip() {
        let mut scheduler = EventScheduler::new();
        let mut manager = manager_with_nodes(&[1001, 1002, 1003, 1004, 1005, 1006]);
        let mut net = NetworkSimulator::new(42);
        net.set_default_latency(LatencyConfig::fixed(10)).unwrap();

        let group_a: Vec<NodeId> = [1001, 1002, 1003].map(NodeId::new).to_vec();
        let group_b: Vec<NodeId> = [1004, 1005, 1006].map(NodeId::new).to_vec();

        scheduler.schedule(
            SimEvent::PartitionNetwork {
                groups: vec![group_a.clone(), group_b.clone()],
            },
            30,
        );
        scheduler.schedule(SimEvent::HealNetwork, 60);

        scheduler.process(SimTime::from_secs(30), &mut manager, &mut net);

        // Cross-partition traffic is dropped while the split holds.
        net.enqueue(
            NodeId::new(1001),
            NodeId::new(1004),
            "blocked",
            SimTime::from_secs(31),
        );
        assert_eq!(net.pending_count(), 0);
        assert_eq!(
            net.stats(NodeId::new(1001), NodeId::new(1004)).dropped_count,
            1
        );
        assert_eq!(manager.get_node(NodeId::new(1001)).unwrap().partition_id(), 1);
        assert_eq!(manager.get_node(NodeId::new(1005)).unwrap().partition_id(), 2);

        scheduler.process(SimTime::from_secs(60), &mut manager, &mut net);

        net.enqueue(
            NodeId::new(1001),
            NodeId::new(1004),
            "through",
            SimTime::from_secs(61),
        );
        assert_eq!(net.pending_count(), 1);
        for id in manager.node_ids() {
            assert_eq!(manager.get_node(id).unwrap().partition_id(), 0);
            for other in manager.node_ids() {
                assert!(net.is_link_active(id, other));
            }
        }
    }

    #[test]
    fn test_partition_validation() {
        let mut manager = manager_with_nodes(&[1001]);
        let mut net = NetworkSimulator::new(1);

        let single_group = SimEvent::PartitionNetwork {
            groups: vec![vec![NodeId::new(1001)]],
        };
        assert!(single_group
            .execute(SimTime::ZERO, &mut manager, &mut net)
            .is_err());

        let empty_group = SimEvent::PartitionNetwork {
            groups: vec![vec![NodeId::new(1001)], vec![]],
        };
        assert!(empty_group
            .execute(SimTime::ZERO, &mut manager, &mut net)
            .is_err());
    }

    #[test]
    fn test_link_degrade_sets_both_directions() {
        let mut manager = manager_with_nodes(&[1001, 1002]);
        let mut net = NetworkSimulator::new(1);
        let a = NodeId::new(1001);
        let b = NodeId::new(1002);

        let event = SimEvent::LinkDegrade {
            a,
            b,
            latency_ms: 500,
            loss_probability: 0.3,
        };
        event.execute(SimTime::ZERO, &mut manager, &mut net).unwrap();

        for (from, to) in [(a, b), (b, a)] {
            let latency = net.latency_config(from, to);
            assert_eq!(latency.min_ms, 500);
            assert_eq!(latency.max_ms, 1000);
            assert_eq!(latency.distribution, LatencyDistribution::Uniform);
            let loss = net.loss_config(from, to);
            assert!((loss.probability - 0.3).abs() < f32::EPSILON);
            assert!(!loss.burst_mode);
        }
    }

    #[test]
    fn test_link_drop_and_restore_symmetric() {
        let mut manager = manager_with_nodes(&[1001, 1002]);
        let mut net = NetworkSimulator::new(1);
        let a = NodeId::new(1001);
        let b = NodeId::new(1002);

        SimEvent::LinkDrop { a, b }
            .execute(SimTime::ZERO, &mut manager, &mut net)
            .unwrap();
        assert!(!net.is_link_active(a, b));
        assert!(!net.is_link_active(b, a));

        SimEvent::LinkRestore { a, b }
            .execute(SimTime::ZERO, &mut manager, &mut net)
            .unwrap();
        assert!(net.is_link_active(a, b));
        assert!(net.is_link_active(b, a));
    }

    #[test]
    fn test_add_nodes_starts_them_when_simulation_started() {
        let mut manager = manager_with_nodes(&[1001]);
        let mut net = NetworkSimulator::new(1);
        manager.start_all(SimTime::ZERO);

        let event = SimEvent::AddNodes {
            specs: vec![spec(2001, "late-0"), spec(2002, "late-1")],
        };
        event
            .execute(SimTime::from_secs(5), &mut manager, &mut net)
            .unwrap();

        assert_eq!(manager.node_count(), 3);
        assert!(manager.get_node(NodeId::new(2001)).unwrap().is_running());
        assert!(manager.get_node(NodeId::new(2002)).unwrap().is_running());
    }

    #[test]
    fn test_remove_node_event() {
        let mut manager = manager_with_nodes(&[1001]);
        let mut net = NetworkSimulator::new(1);

        SimEvent::RemoveNode(NodeId::new(1001))
            .execute(SimTime::ZERO, &mut manager, &mut net)
            .unwrap();
        assert!(!manager.has_node(NodeId::new(1001)));

        assert!(SimEvent::RemoveNode(NodeId::new(1001))
            .execute(SimTime::ZERO, &mut manager, &mut net)
            .is_err());
    }

    #[test]
    fn test_set_network_quality_global_and_single() {
        let mut manager = manager_with_nodes(&[1001, 1002]);
        let mut net = NetworkSimulator::new(1);

        SimEvent::SetNetworkQuality {
            target: None,
            quality: 0.25,
        }
        .execute(SimTime::ZERO, &mut manager, &mut net)
        .unwrap();
        for id in manager.node_ids() {
            assert!((manager.get_node(id).unwrap().network_quality() - 0.25).abs() < 1e-6);
        }

        SimEvent::SetNetworkQuality {
            target: Some(NodeId::new(1001)),
            quality: 0.75,
        }
        .execute(SimTime::ZERO, &mut manager, &mut net)
        .unwrap();
        assert!(
            (manager.get_node(NodeId::new(1001)).unwrap().network_quality() - 0.75).abs() < 1e-6
        );
        assert!(
            (manager.get_node(NodeId::new(1002)).unwrap().network_quality() - 0.25).abs() < 1e-6
        );
    }

    #[test]
    fn test_clear_discards_pending_events() {
        let mut scheduler = EventScheduler::new();
        scheduler.schedule(SimEvent::HealNetwork, 10);
        scheduler.schedule(SimEvent::HealNetwork, 20);
        assert_eq!(scheduler.pending_count(), 2);

        scheduler.clear();
        assert!(!scheduler.has_pending());
        assert_eq!(scheduler.next_event_time(), u32::MAX);
    }
}
