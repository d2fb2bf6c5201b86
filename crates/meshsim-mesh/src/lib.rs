//! # meshsim-mesh
//!
//! In-process mesh protocol substitute for MeshSim virtual nodes.
//!
//! Each virtual node owns one [`MeshHandle`]. The handle tracks the node's
//! mesh-layer connections, buffers outbound messages until the node manager
//! flushes them into the network simulator, and queues inbound
//! [`MeshEvent`] records that the node drains on every update tick and
//! routes to its firmware.
//!
//! The handle exposes the surface firmwares program against:
//! `send_single`, `send_broadcast`, `node_list`, `node_time`, `is_bridge`
//! and `has_internet_connection`.

use std::collections::{BTreeSet, VecDeque};

use meshsim_common::{NodeId, SimTime};
use tracing::debug;

// ============================================================================
// Message Types
// ============================================================================

/// Where an outbound message is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A single node.
    Single(NodeId),
    /// Every other node in the mesh.
    Broadcast,
}

/// A message buffered by the mesh layer, waiting to be flushed into the
/// network simulator.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Message destination.
    pub destination: Destination,
    /// Message content.
    pub payload: String,
}

/// Events surfaced by the mesh layer to the owning node.
///
/// These are the substitute for the callback registrations of a real mesh
/// stack: the node drains them on each update and forwards them to its
/// firmware.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A message arrived for this node.
    Receive {
        /// Sender node id.
        from: NodeId,
        /// Message content.
        message: String,
    },
    /// A new mesh-layer connection was established.
    NewConnection(NodeId),
    /// The connection topology changed.
    ChangedConnections,
    /// The mesh time was adjusted by a sync exchange.
    TimeAdjusted {
        /// Applied offset in microseconds.
        offset_us: i64,
    },
}

// ============================================================================
// Mesh Handle
// ============================================================================

/// The mesh instance owned by a single virtual node.
#[derive(Debug)]
pub struct MeshHandle {
    node_id: NodeId,
    connections: BTreeSet<NodeId>,
    outbox: Vec<OutboundMessage>,
    events: VecDeque<MeshEvent>,
    /// Offset of mesh time relative to simulation time, in microseconds.
    time_offset_us: i64,
    bridge: bool,
    internet: bool,
}

impl MeshHandle {
    /// Create a mesh handle for the given node.
    pub fn new(node_id: NodeId) -> Self {
        MeshHandle {
            node_id,
            connections: BTreeSet::new(),
            outbox: Vec::new(),
            events: VecDeque::new(),
            time_offset_us: 0,
            bridge: false,
            internet: false,
        }
    }

    /// The id of the owning node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    // ── Firmware-facing surface ───────────────────────────────────────

    /// Send a message to a single node.
    ///
    /// Returns `false` when the destination is invalid (zero or self);
    /// the message is then discarded.
    pub fn send_single(&mut self, to: NodeId, message: impl Into<String>) -> bool {
        if to.is_zero() || to == self.node_id {
            return false;
        }
        self.outbox.push(OutboundMessage {
            destination: Destination::Single(to),
            payload: message.into(),
        });
        true
    }

    /// Broadcast a message to every other node in the mesh.
    pub fn send_broadcast(&mut self, message: impl Into<String>) -> bool {
        self.outbox.push(OutboundMessage {
            destination: Destination::Broadcast,
            payload: message.into(),
        });
        true
    }

    /// Ids of the directly connected nodes, in ascending order.
    pub fn node_list(&self) -> Vec<NodeId> {
        self.connections.iter().copied().collect()
    }

    /// Whether a direct mesh-layer connection to `peer` exists.
    pub fn is_connected_to(&self, peer: NodeId) -> bool {
        self.connections.contains(&peer)
    }

    /// Mesh time in microseconds: simulation time plus the sync offset.
    pub fn node_time(&self, now: SimTime) -> u64 {
        let base = now.as_millis().saturating_mul(1000) as i64;
        base.saturating_add(self.time_offset_us).max(0) as u64
    }

    /// Whether this node acts as a bridge to an external network.
    pub fn is_bridge(&self) -> bool {
        self.bridge
    }

    /// Whether this node currently has internet connectivity.
    pub fn has_internet_connection(&self) -> bool {
        self.internet
    }

    // ── Node/manager-facing surface ───────────────────────────────────

    /// Mark or unmark this node as a bridge.
    pub fn set_bridge(&mut self, bridge: bool) {
        self.bridge = bridge;
    }

    /// Set the internet connectivity flag.
    pub fn set_internet_connection(&mut self, internet: bool) {
        self.internet = internet;
    }

    /// Apply a time-sync adjustment. Queues a [`MeshEvent::TimeAdjusted`].
    pub fn adjust_node_time(&mut self, offset_us: i64) {
        self.time_offset_us = self.time_offset_us.saturating_add(offset_us);
        self.events.push_back(MeshEvent::TimeAdjusted { offset_us });
    }

    /// Record a new connection to `peer`.
    ///
    /// Queues `NewConnection` and `ChangedConnections` events. Returns
    /// `false` when the connection already existed or `peer` is invalid.
    pub fn add_connection(&mut self, peer: NodeId) -> bool {
        if peer.is_zero() || peer == self.node_id || !self.connections.insert(peer) {
            return false;
        }
        debug!(node = %self.node_id, %peer, "mesh connection established");
        self.events.push_back(MeshEvent::NewConnection(peer));
        self.events.push_back(MeshEvent::ChangedConnections);
        true
    }

    /// Remove the connection to `peer`, if present.
    pub fn remove_connection(&mut self, peer: NodeId) -> bool {
        if !self.connections.remove(&peer) {
            return false;
        }
        self.events.push_back(MeshEvent::ChangedConnections);
        true
    }

    /// Drop every connection. Used when the owning node stops or crashes.
    pub fn clear_connections(&mut self) {
        self.connections.clear();
    }

    /// Queue an inbound message for the owning node.
    pub fn push_receive(&mut self, from: NodeId, message: String) {
        self.events.push_back(MeshEvent::Receive { from, message });
    }

    /// Take every buffered outbound message.
    pub fn take_outbound(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Pop the oldest queued mesh event.
    pub fn pop_event(&mut self) -> Option<MeshEvent> {
        self.events.pop_front()
    }

    /// Number of queued mesh events.
    pub fn pending_event_count(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_single_rejects_self_and_zero() {
        let mut mesh = MeshHandle::new(NodeId::new(1001));
        assert!(!mesh.send_single(NodeId::new(1001), "hello"));
        assert!(!mesh.send_single(NodeId::ZERO, "hello"));
        assert!(mesh.send_single(NodeId::new(1002), "hello"));
        assert_eq!(mesh.take_outbound().len(), 1);
    }

    #[test]
    fn test_broadcast_buffers_one_message() {
        let mut mesh = MeshHandle::new(NodeId::new(1001));
        assert!(mesh.send_broadcast("status"));
        let out = mesh.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, Destination::Broadcast);
        // Buffer is drained.
        assert!(mesh.take_outbound().is_empty());
    }

    #[test]
    fn test_connection_events() {
        let mut mesh = MeshHandle::new(NodeId::new(1001));
        assert!(mesh.add_connection(NodeId::new(1002)));
        assert!(!mesh.add_connection(NodeId::new(1002)));

        assert!(matches!(
            mesh.pop_event(),
            Some(MeshEvent::NewConnection(id)) if id == NodeId::new(1002)
        ));
        assert!(matches!(mesh.pop_event(), Some(MeshEvent::ChangedConnections)));
        assert!(mesh.pop_event().is_none());

        assert_eq!(mesh.node_list(), vec![NodeId::new(1002)]);
        assert!(mesh.remove_connection(NodeId::new(1002)));
        assert!(matches!(mesh.pop_event(), Some(MeshEvent::ChangedConnections)));
        assert!(mesh.node_list().is_empty());
    }

    #[test]
    fn test_node_time_tracks_offset() {
        let mut mesh = MeshHandle::new(NodeId::new(1001));
        let now = SimTime::from_millis(2000);
        assert_eq!(mesh.node_time(now), 2_000_000);

        mesh.adjust_node_time(-500);
        assert_eq!(mesh.node_time(now), 1_999_500);
        assert!(matches!(
            mesh.pop_event(),
            Some(MeshEvent::TimeAdjusted { offset_us: -500 })
        ));
    }

    #[test]
    fn test_bridge_and_internet_flags() {
        let mut mesh = MeshHandle::new(NodeId::new(1001));
        assert!(!mesh.is_bridge());
        assert!(!mesh.has_internet_connection());
        mesh.set_bridge(true);
        mesh.set_internet_connection(true);
        assert!(mesh.is_bridge());
        assert!(mesh.has_internet_connection());
    }
}
