//! # meshsim-firmware
//!
//! Firmware plugin contract and registry for MeshSim virtual nodes.
//!
//! A firmware is the behavior slot attached to a virtual node. The node
//! calls [`Firmware::initialize`] once after construction, [`Firmware::setup`]
//! inside the first start, and [`Firmware::tick`] on every update; mesh
//! callbacks (`on_receive`, `on_new_connection`, `on_changed_connections`,
//! `on_node_time_adjusted`) are routed to it as the node drains its mesh
//! event queue.
//!
//! The process-wide [`registry`](self) maps firmware names to constructor
//! closures. Registering a name that already exists fails with a warning
//! and leaves the first registration intact; `clear_registry` exists
//! strictly for test teardown.

use std::collections::BTreeMap;

use meshsim_common::{NodeId, SimTime};
use meshsim_mesh::MeshHandle;
use parking_lot::Mutex;
use tracing::{info, warn};

// ============================================================================
// Firmware Configuration
// ============================================================================

/// String-keyed configuration handed to a firmware at initialization,
/// taken from the scenario's per-node `config` section.
#[derive(Debug, Clone, Default)]
pub struct FirmwareConfig {
    values: BTreeMap<String, String>,
}

impl FirmwareConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        FirmwareConfig {
            values: BTreeMap::new(),
        }
    }

    /// Build from a raw key/value map.
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        FirmwareConfig { values }
    }

    /// Look up a value, falling back to `default` when the key is absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Look up and parse a value, falling back to `default` when the key
    /// is absent or unparsable.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Whether the key is present.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

// ============================================================================
// Firmware Contract
// ============================================================================

/// The capability set a firmware implements.
///
/// The mesh handle is passed into every lifecycle call rather than stored,
/// so firmwares never hold references into the owning node. Periodic
/// behavior is written against the tick clock (`now`).
pub trait Firmware: Send {
    /// Firmware name/identifier.
    fn name(&self) -> &str;

    /// Firmware version string.
    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Called once by the node before `setup`, carrying the node id and
    /// the firmware-specific configuration.
    fn initialize(&mut self, node_id: NodeId, config: FirmwareConfig) {
        let _ = (node_id, config);
    }

    /// Called exactly once, inside the first start after initialization.
    fn setup(&mut self, mesh: &mut MeshHandle) {
        let _ = mesh;
    }

    /// Called once per node update while the node is running.
    fn tick(&mut self, mesh: &mut MeshHandle, now: SimTime) {
        let _ = (mesh, now);
    }

    /// A message arrived for the node.
    fn on_receive(&mut self, mesh: &mut MeshHandle, from: NodeId, message: &str) {
        let _ = (mesh, from, message);
    }

    /// A new mesh connection was established.
    fn on_new_connection(&mut self, mesh: &mut MeshHandle, node_id: NodeId) {
        let _ = (mesh, node_id);
    }

    /// The mesh topology changed.
    fn on_changed_connections(&mut self, mesh: &mut MeshHandle) {
        let _ = mesh;
    }

    /// The mesh time was adjusted by a sync exchange.
    fn on_node_time_adjusted(&mut self, offset_us: i64) {
        let _ = offset_us;
    }
}

// ============================================================================
// Firmware Registry
// ============================================================================

/// Constructor closure stored in the registry.
pub type FirmwareCtor = Box<dyn Fn() -> Box<dyn Firmware> + Send + Sync>;

static REGISTRY: Mutex<BTreeMap<String, FirmwareCtor>> = Mutex::new(BTreeMap::new());

/// Register a firmware constructor under `name`.
///
/// Returns `false` (and logs a warning) when the name is already taken;
/// the first registration stays in effect.
pub fn register_firmware<F>(name: &str, ctor: F) -> bool
where
    F: Fn() -> Box<dyn Firmware> + Send + Sync + 'static,
{
    let mut registry = REGISTRY.lock();
    if registry.contains_key(name) {
        warn!(firmware = name, "firmware is already registered");
        return false;
    }
    registry.insert(name.to_string(), Box::new(ctor));
    info!(firmware = name, "registered firmware");
    true
}

/// Create a firmware instance by registry name.
pub fn create_firmware(name: &str) -> Option<Box<dyn Firmware>> {
    REGISTRY.lock().get(name).map(|ctor| ctor())
}

/// Whether `name` is registered.
pub fn is_registered(name: &str) -> bool {
    REGISTRY.lock().contains_key(name)
}

/// Names of every registered firmware, in sorted order.
pub fn registered_names() -> Vec<String> {
    REGISTRY.lock().keys().cloned().collect()
}

/// Remove every registration. Test teardown only.
pub fn clear_registry() {
    REGISTRY.lock().clear();
}

/// Register the built-in firmwares (`echo-server`, `echo-client`,
/// `broadcast`). Idempotent; callers invoke it lazily on first use.
pub fn register_builtin_firmwares() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        register_firmware("echo-server", || Box::new(EchoServerFirmware::new()));
        register_firmware("echo-client", || Box::new(EchoClientFirmware::new()));
        register_firmware("broadcast", || Box::new(BroadcastFirmware::new()));
    });
}

// ============================================================================
// Built-in Firmwares
// ============================================================================

/// Replies `ECHO: <message>` to every received message.
#[derive(Debug)]
pub struct EchoServerFirmware {
    node_id: NodeId,
    requests_served: u32,
}

impl EchoServerFirmware {
    /// Create an echo server.
    pub fn new() -> Self {
        EchoServerFirmware {
            node_id: NodeId::ZERO,
            requests_served: 0,
        }
    }

    /// Number of requests answered.
    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }
}

impl Default for EchoServerFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl Firmware for EchoServerFirmware {
    fn name(&self) -> &str {
        "echo-server"
    }

    fn initialize(&mut self, node_id: NodeId, _config: FirmwareConfig) {
        self.node_id = node_id;
    }

    fn on_receive(&mut self, mesh: &mut MeshHandle, from: NodeId, message: &str) {
        // Do not echo echoes; two servers would ping-pong forever.
        if message.starts_with("ECHO: ") {
            return;
        }
        mesh.send_single(from, format!("ECHO: {}", message));
        self.requests_served += 1;
        tracing::debug!(node = %self.node_id, %from, "echo request served");
    }
}

/// Periodically sends requests to a server node (or broadcasts them) and
/// counts the echo responses.
///
/// Configuration:
/// - `server_node_id`: target server id (0 = broadcast mode)
/// - `request_interval`: seconds between requests (default 5)
#[derive(Debug)]
pub struct EchoClientFirmware {
    node_id: NodeId,
    server: NodeId,
    interval: SimTime,
    next_request: Option<SimTime>,
    requests_sent: u32,
    responses_received: u32,
}

impl EchoClientFirmware {
    /// Create an echo client with default configuration.
    pub fn new() -> Self {
        EchoClientFirmware {
            node_id: NodeId::ZERO,
            server: NodeId::ZERO,
            interval: SimTime::from_secs(5),
            next_request: None,
            requests_sent: 0,
            responses_received: 0,
        }
    }

    /// Number of requests sent so far.
    pub fn requests_sent(&self) -> u32 {
        self.requests_sent
    }

    /// Number of echo responses received so far.
    pub fn responses_received(&self) -> u32 {
        self.responses_received
    }
}

impl Default for EchoClientFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl Firmware for EchoClientFirmware {
    fn name(&self) -> &str {
        "echo-client"
    }

    fn initialize(&mut self, node_id: NodeId, config: FirmwareConfig) {
        self.node_id = node_id;
        self.server = NodeId::new(config.get_parsed("server_node_id", 0u32));
        let interval_s: u64 = config.get_parsed("request_interval", 5u64);
        self.interval = SimTime::from_secs(interval_s);
    }

    fn tick(&mut self, mesh: &mut MeshHandle, now: SimTime) {
        let due = match self.next_request {
            Some(t) => now >= t,
            // First tick after start: send immediately.
            None => true,
        };
        if !due {
            return;
        }

        let message = format!("Request #{}", self.requests_sent);
        if self.server.is_zero() {
            mesh.send_broadcast(message);
        } else {
            mesh.send_single(self.server, message);
        }
        self.requests_sent += 1;
        self.next_request = Some(now + self.interval);
    }

    fn on_receive(&mut self, _mesh: &mut MeshHandle, from: NodeId, message: &str) {
        if message.starts_with("ECHO: ") {
            self.responses_received += 1;
            tracing::debug!(node = %self.node_id, %from, "echo response received");
        }
    }
}

/// Broadcasts a configurable message on a fixed interval.
///
/// Configuration:
/// - `broadcast_interval`: milliseconds between broadcasts (default 5000)
/// - `broadcast_message`: message prefix (default "Hello from node")
#[derive(Debug)]
pub struct BroadcastFirmware {
    node_id: NodeId,
    interval: SimTime,
    message: String,
    next_broadcast: Option<SimTime>,
    messages_sent: u32,
    messages_received: u32,
}

impl BroadcastFirmware {
    /// Create a broadcast firmware with default configuration.
    pub fn new() -> Self {
        BroadcastFirmware {
            node_id: NodeId::ZERO,
            interval: SimTime::from_millis(5000),
            message: "Hello from node".to_string(),
            next_broadcast: None,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Number of broadcasts sent so far.
    pub fn messages_sent(&self) -> u32 {
        self.messages_sent
    }

    /// Number of messages received so far.
    pub fn messages_received(&self) -> u32 {
        self.messages_received
    }
}

impl Default for BroadcastFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl Firmware for BroadcastFirmware {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn initialize(&mut self, node_id: NodeId, config: FirmwareConfig) {
        self.node_id = node_id;
        self.interval = SimTime::from_millis(config.get_parsed("broadcast_interval", 5000u64));
        self.message = config.get("broadcast_message", "Hello from node");
    }

    fn tick(&mut self, mesh: &mut MeshHandle, now: SimTime) {
        let due = match self.next_broadcast {
            Some(t) => now >= t,
            None => true,
        };
        if !due {
            return;
        }
        mesh.send_broadcast(format!("{} {}", self.message, self.node_id));
        self.messages_sent += 1;
        self.next_broadcast = Some(now + self.interval);
    }

    fn on_receive(&mut self, _mesh: &mut MeshHandle, _from: NodeId, _message: &str) {
        self.messages_received += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsim_mesh::{Destination, MeshHandle};
    use std::collections::BTreeMap;

    // Registry tests share process-wide state; serialize them.
    static REGISTRY_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_registry_first_registration_wins() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        clear_registry();
        assert!(register_firmware("fixture-a", || Box::new(EchoServerFirmware::new())));
        assert!(!register_firmware("fixture-a", || Box::new(BroadcastFirmware::new())));

        let fw = create_firmware("fixture-a").expect("fixture registered");
        assert_eq!(fw.name(), "echo-server");
        clear_registry();
    }

    #[test]
    fn test_registry_unknown_name() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        assert!(create_firmware("no-such-firmware").is_none());
        assert!(!is_registered("no-such-firmware"));
    }

    #[test]
    fn test_echo_server_replies() {
        let mut mesh = MeshHandle::new(NodeId::new(2000));
        let mut fw = EchoServerFirmware::new();
        fw.initialize(NodeId::new(2000), FirmwareConfig::new());
        fw.setup(&mut mesh);

        fw.on_receive(&mut mesh, NodeId::new(2001), "hello");
        let out = mesh.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, Destination::Single(NodeId::new(2001)));
        assert_eq!(out[0].payload, "ECHO: hello");
        assert_eq!(fw.requests_served(), 1);

        // Echo responses are not echoed back.
        fw.on_receive(&mut mesh, NodeId::new(2001), "ECHO: hello");
        assert!(mesh.take_outbound().is_empty());
    }

    #[test]
    fn test_echo_client_request_cycle() {
        let mut mesh = MeshHandle::new(NodeId::new(3000));
        let mut fw = EchoClientFirmware::new();
        let mut config = BTreeMap::new();
        config.insert("server_node_id".to_string(), "3001".to_string());
        config.insert("request_interval".to_string(), "2".to_string());
        fw.initialize(NodeId::new(3000), FirmwareConfig::from_map(config));
        fw.setup(&mut mesh);

        fw.tick(&mut mesh, SimTime::ZERO);
        assert_eq!(fw.requests_sent(), 1);
        // Within the interval nothing further is sent.
        fw.tick(&mut mesh, SimTime::from_millis(1500));
        assert_eq!(fw.requests_sent(), 1);
        fw.tick(&mut mesh, SimTime::from_secs(2));
        assert_eq!(fw.requests_sent(), 2);

        let out = mesh.take_outbound();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload, "Request #0");
        assert_eq!(out[0].destination, Destination::Single(NodeId::new(3001)));

        fw.on_receive(&mut mesh, NodeId::new(3001), "ECHO: Request #0");
        assert_eq!(fw.responses_received(), 1);
        // Non-echo traffic is ignored.
        fw.on_receive(&mut mesh, NodeId::new(3001), "unrelated");
        assert_eq!(fw.responses_received(), 1);
    }

    #[test]
    fn test_broadcast_firmware_interval() {
        let mut mesh = MeshHandle::new(NodeId::new(4000));
        let mut fw = BroadcastFirmware::new();
        let mut config = BTreeMap::new();
        config.insert("broadcast_interval".to_string(), "1000".to_string());
        config.insert("broadcast_message".to_string(), "status".to_string());
        fw.initialize(NodeId::new(4000), FirmwareConfig::from_map(config));
        fw.setup(&mut mesh);

        fw.tick(&mut mesh, SimTime::ZERO);
        fw.tick(&mut mesh, SimTime::from_millis(400));
        fw.tick(&mut mesh, SimTime::from_millis(1000));
        assert_eq!(fw.messages_sent(), 2);

        let out = mesh.take_outbound();
        assert_eq!(out[0].destination, Destination::Broadcast);
        assert_eq!(out[0].payload, "status 4000");
    }

    #[test]
    fn test_firmware_config_helpers() {
        let mut values = BTreeMap::new();
        values.insert("interval".to_string(), "250".to_string());
        values.insert("junk".to_string(), "not-a-number".to_string());
        let config = FirmwareConfig::from_map(values);

        assert!(config.has("interval"));
        assert!(!config.has("missing"));
        assert_eq!(config.get("missing", "fallback"), "fallback");
        assert_eq!(config.get_parsed("interval", 0u32), 250);
        assert_eq!(config.get_parsed("junk", 7u32), 7);
    }
}
