//! # meshsim-scenario
//!
//! Scenario document model, loader and validator for MeshSim.
//!
//! A scenario is a YAML document describing simulation parameters, network
//! conditions, nodes (directly or through templates), the initial
//! topology, a fault-injection event timeline and metric-output settings.
//!
//! Loading happens in three steps:
//! 1. parse the YAML into schema structs,
//! 2. resolve into a [`Scenario`] (template expansion, node-id derivation,
//!    default resolution, legacy shorthand handling),
//! 3. [`Scenario::validate`] and, when building a simulation, project the
//!    timeline into typed [`SimEvent`]s with [`Scenario::build_events`].
//!
//! String actions and targets are projected into typed variants exactly
//! once, at load/build time; the engine never sees string-keyed parameter
//! bags.

use std::collections::BTreeMap;
use std::path::Path;

use meshsim_common::NodeId;
use meshsim_events::SimEvent;
use meshsim_net::{LatencyConfig, LatencyDistribution, PacketLossConfig};
use meshsim_node::{NodeSpec, Topology};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

// ============================================================================
// Error Types
// ============================================================================

/// A single validator finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Path of the offending field, e.g. `network.latency.default`.
    pub field: String,
    /// What is wrong.
    pub message: String,
    /// How to fix it.
    pub suggestion: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.suggestion)
    }
}

/// Errors raised while loading or validating a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid YAML for the schema.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value could not be interpreted (unknown action, unknown node
    /// name during projection, ...).
    #[error("Invalid scenario: {0}")]
    Invalid(String),

    /// The validator found problems.
    #[error("Configuration validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),
}

// ============================================================================
// Node Id Derivation
// ============================================================================

/// Derive the numeric node id for a scenario node name.
///
/// 32-bit FNV-1a, masked to 31 bits, with zero remapped to one so the
/// reserved broadcast id can never be produced. Stable across platforms.
pub fn derive_node_id(name: &str) -> NodeId {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    let id = hash & 0x7fff_ffff;
    NodeId::new(if id == 0 { 1 } else { id })
}

// ============================================================================
// YAML Schema (raw document structs)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
struct ScenarioDoc {
    #[serde(default)]
    simulation: SimulationYaml,
    #[serde(default)]
    network: NetworkYaml,
    #[serde(default)]
    nodes: Vec<NodeEntryYaml>,
    #[serde(default)]
    topology: TopologyYaml,
    #[serde(default)]
    events: Vec<EventYaml>,
    #[serde(default)]
    metrics: MetricsYaml,
    /// Unknown top-level sections are collected and warned about.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct SimulationYaml {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    duration: u32,
    #[serde(default = "default_time_scale")]
    time_scale: f32,
    #[serde(default)]
    seed: u32,
}

fn default_time_scale() -> f32 {
    1.0
}

impl Default for SimulationYaml {
    fn default() -> Self {
        SimulationYaml {
            name: String::new(),
            description: String::new(),
            duration: 0,
            time_scale: 1.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NetworkYaml {
    #[serde(default)]
    latency: LatencyYaml,
    #[serde(default)]
    packet_loss: Option<PacketLossYaml>,
    #[serde(default = "default_bandwidth")]
    bandwidth: u64,
}

fn default_bandwidth() -> u64 {
    1_000_000
}

impl Default for NetworkYaml {
    fn default() -> Self {
        NetworkYaml {
            latency: LatencyYaml::default(),
            packet_loss: None,
            bandwidth: default_bandwidth(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LatencyYaml {
    #[serde(default)]
    default: Option<LatencyValuesYaml>,
    #[serde(default)]
    specific_connections: Vec<ConnectionLatencyYaml>,
}

/// Latency fields with per-field fallbacks to the default configuration.
#[derive(Debug, Clone, Default, Deserialize)]
struct LatencyValuesYaml {
    min: Option<u32>,
    max: Option<u32>,
    distribution: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectionLatencyYaml {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    min: Option<u32>,
    max: Option<u32>,
    distribution: Option<String>,
}

/// Either the structured subtree or the legacy scalar shorthand.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PacketLossYaml {
    Structured {
        #[serde(default)]
        default: Option<LossValuesYaml>,
        #[serde(default)]
        specific_connections: Vec<ConnectionLossYaml>,
    },
    Legacy(f32),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LossValuesYaml {
    probability: Option<f32>,
    burst_mode: Option<bool>,
    burst_length: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectionLossYaml {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    probability: Option<f32>,
    burst_mode: Option<bool>,
    burst_length: Option<u32>,
}

/// A `nodes:` list entry: either a concrete node or a template.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NodeEntryYaml {
    Node(NodeYaml),
    Template(TemplateYaml),
}

#[derive(Debug, Clone, Deserialize)]
struct NodeYaml {
    id: String,
    #[serde(default, rename = "type")]
    node_type: String,
    #[serde(default)]
    firmware: Option<String>,
    #[serde(default)]
    position: Option<Vec<i32>>,
    #[serde(default)]
    config: NodeConfigYaml,
}

#[derive(Debug, Clone, Deserialize)]
struct TemplateYaml {
    template: String,
    #[serde(default = "default_template_count")]
    count: u32,
    #[serde(default)]
    id_prefix: Option<String>,
    #[serde(default)]
    firmware: Option<String>,
    #[serde(default)]
    config: NodeConfigYaml,
}

fn default_template_count() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct NodeConfigYaml {
    #[serde(default)]
    mesh_prefix: String,
    #[serde(default)]
    mesh_password: String,
    #[serde(default = "default_mesh_port")]
    mesh_port: u16,
    /// Firmware-specific keys end up here.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_mesh_port() -> u16 {
    5555
}

impl Default for NodeConfigYaml {
    fn default() -> Self {
        NodeConfigYaml {
            mesh_prefix: String::new(),
            mesh_password: String::new(),
            mesh_port: default_mesh_port(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TopologyYaml {
    #[serde(default = "default_topology_type", rename = "type")]
    kind: String,
    #[serde(default)]
    hub: Option<String>,
    #[serde(default = "default_density")]
    density: f32,
    #[serde(default = "default_bidirectional")]
    bidirectional: bool,
    #[serde(default)]
    connections: Vec<(String, String)>,
}

fn default_topology_type() -> String {
    "random".to_string()
}

fn default_density() -> f32 {
    0.3
}

fn default_bidirectional() -> bool {
    true
}

impl Default for TopologyYaml {
    fn default() -> Self {
        TopologyYaml {
            kind: default_topology_type(),
            hub: None,
            density: default_density(),
            bidirectional: default_bidirectional(),
            connections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EventYaml {
    #[serde(default)]
    time: u32,
    action: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    groups: Vec<Vec<String>>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    payload: String,
    #[serde(default = "default_quality")]
    quality: f32,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    id_prefix: Option<String>,
    #[serde(default = "default_graceful")]
    graceful: bool,
    #[serde(default = "default_degrade_latency")]
    latency: u32,
    #[serde(default = "default_degrade_loss")]
    packet_loss: f32,
}

fn default_quality() -> f32 {
    1.0
}

fn default_graceful() -> bool {
    true
}

fn default_degrade_latency() -> u32 {
    500
}

fn default_degrade_loss() -> f32 {
    0.30
}

#[derive(Debug, Clone, Deserialize)]
struct MetricsYaml {
    #[serde(default)]
    output: String,
    #[serde(default = "default_metrics_interval")]
    interval: u32,
    #[serde(default)]
    collect: Vec<String>,
    #[serde(default)]
    export: Vec<String>,
}

fn default_metrics_interval() -> u32 {
    5
}

impl Default for MetricsYaml {
    fn default() -> Self {
        MetricsYaml {
            output: String::new(),
            interval: default_metrics_interval(),
            collect: Vec::new(),
            export: Vec::new(),
        }
    }
}

// ============================================================================
// Resolved Scenario Model
// ============================================================================

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    /// Scenario name.
    pub name: String,
    /// Optional description.
    pub description: String,
    /// Duration in seconds; 0 means run until signalled.
    pub duration_s: u32,
    /// Wall-clock multiplier; 1.0 is real-time.
    pub time_scale: f32,
    /// RNG seed; 0 means nondeterministic.
    pub seed: u32,
}

/// A per-link configuration override, by node names.
#[derive(Debug, Clone)]
pub struct LinkOverride<T> {
    /// Source node name.
    pub from: String,
    /// Destination node name.
    pub to: String,
    /// The configuration for this directed link.
    pub config: T,
}

/// Resolved network conditions.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Latency used by links without an override.
    pub default_latency: LatencyConfig,
    /// Per-link latency overrides.
    pub latency_overrides: Vec<LinkOverride<LatencyConfig>>,
    /// Loss used by links without an override.
    pub default_loss: PacketLossConfig,
    /// Per-link loss overrides.
    pub loss_overrides: Vec<LinkOverride<PacketLossConfig>>,
    /// Reserved.
    pub bandwidth: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            default_latency: LatencyConfig::default(),
            latency_overrides: Vec::new(),
            default_loss: PacketLossConfig::default(),
            loss_overrides: Vec::new(),
            bandwidth: default_bandwidth(),
        }
    }
}

/// Topology kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    /// Spanning tree plus random extra edges.
    Random,
    /// Central hub.
    Star,
    /// Cycle.
    Ring,
    /// Fully connected.
    Mesh,
    /// Explicit connection list.
    Custom,
}

/// Resolved topology section, still in terms of node names.
#[derive(Debug, Clone)]
pub struct TopologySettings {
    /// Topology kind.
    pub kind: TopologyKind,
    /// Hub node name, for star topologies.
    pub hub: Option<String>,
    /// Edge density, for random topologies.
    pub density: f32,
    /// Whether ring links are bidirectional.
    pub bidirectional: bool,
    /// Explicit connections, for custom topologies.
    pub connections: Vec<(String, String)>,
}

/// A node template kept for `add_nodes` events.
#[derive(Debug, Clone)]
pub struct NodeTemplate {
    /// Template name.
    pub name: String,
    /// Default node count.
    pub count: u32,
    /// Prefix for generated node names.
    pub id_prefix: String,
    /// Firmware registry key.
    pub firmware: Option<String>,
    /// Mesh prefix for generated nodes.
    pub mesh_prefix: String,
    /// Mesh password for generated nodes.
    pub mesh_password: String,
    /// Mesh port for generated nodes.
    pub mesh_port: u16,
    /// Firmware-specific configuration.
    pub firmware_config: BTreeMap<String, String>,
}

impl NodeTemplate {
    /// Materialize `count` node specs named `<prefix><i>`.
    pub fn expand(&self, count: u32, id_prefix: &str) -> Vec<NodeSpec> {
        (0..count)
            .map(|i| {
                let name = format!("{}{}", id_prefix, i);
                NodeSpec {
                    id: derive_node_id(&name),
                    name,
                    node_type: self.name.clone(),
                    firmware: self.firmware.clone(),
                    mesh_prefix: self.mesh_prefix.clone(),
                    mesh_password: self.mesh_password.clone(),
                    mesh_port: self.mesh_port,
                    position: None,
                    firmware_config: self.firmware_config.clone(),
                }
            })
            .collect()
    }
}

/// Event actions accepted by the scenario format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    StopNode,
    StartNode,
    RestartNode,
    CrashNode,
    RemoveNode,
    AddNodes,
    PartitionNetwork,
    HealPartition,
    BreakLink,
    RestoreLink,
    InjectMessage,
    SetNetworkQuality,
    ConnectionDrop,
    ConnectionRestore,
    ConnectionDegrade,
}

fn parse_event_action(action: &str) -> Result<EventAction, ScenarioError> {
    match action.to_lowercase().as_str() {
        "stop_node" => Ok(EventAction::StopNode),
        "start_node" => Ok(EventAction::StartNode),
        "restart_node" => Ok(EventAction::RestartNode),
        "crash_node" => Ok(EventAction::CrashNode),
        "remove_node" => Ok(EventAction::RemoveNode),
        "add_nodes" => Ok(EventAction::AddNodes),
        "partition_network" => Ok(EventAction::PartitionNetwork),
        "heal_partition" => Ok(EventAction::HealPartition),
        "break_link" => Ok(EventAction::BreakLink),
        "restore_link" => Ok(EventAction::RestoreLink),
        "inject_message" => Ok(EventAction::InjectMessage),
        "set_network_quality" => Ok(EventAction::SetNetworkQuality),
        "connection_drop" => Ok(EventAction::ConnectionDrop),
        "connection_restore" => Ok(EventAction::ConnectionRestore),
        "connection_degrade" => Ok(EventAction::ConnectionDegrade),
        other => Err(ScenarioError::Invalid(format!(
            "unknown event action: {}",
            other
        ))),
    }
}

/// One parsed timeline entry, still in terms of node names.
#[derive(Debug, Clone)]
pub struct EventSpec {
    /// Scheduled time in seconds.
    pub time_s: u32,
    /// What to do.
    pub action: EventAction,
    /// Single target node name.
    pub target: Option<String>,
    /// Multiple target node names.
    pub targets: Vec<String>,
    /// Free-form description.
    pub description: String,
    /// Partition groups.
    pub groups: Vec<Vec<String>>,
    /// Link/message source.
    pub from: Option<String>,
    /// Link/message destination.
    pub to: Option<String>,
    /// Injected message payload.
    pub payload: String,
    /// Quality for `set_network_quality`.
    pub quality: f32,
    /// Node count for `add_nodes` (0 = template default).
    pub count: u32,
    /// Template name for `add_nodes`.
    pub template: Option<String>,
    /// Name prefix for `add_nodes`.
    pub id_prefix: Option<String>,
    /// Graceful flag for `stop_node`.
    pub graceful: bool,
    /// Latency for `connection_degrade`.
    pub latency_ms: u32,
    /// Loss probability for `connection_degrade`.
    pub packet_loss: f32,
}

/// Export formats for the metrics section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document.
    Json,
    /// Graphviz dot digraph.
    Graphviz,
}

/// Resolved metrics section.
#[derive(Debug, Clone)]
pub struct MetricsSettings {
    /// Output file stem or path; empty uses the runner default.
    pub output: String,
    /// Collection interval in seconds.
    pub interval_s: u32,
    /// Names of metrics to collect.
    pub collect: Vec<String>,
    /// Export formats to produce.
    pub export: Vec<ExportFormat>,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        MetricsSettings {
            output: String::new(),
            interval_s: default_metrics_interval(),
            collect: Vec::new(),
            export: Vec::new(),
        }
    }
}

/// A fully resolved scenario: templates expanded, ids derived, defaults
/// applied.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Simulation parameters.
    pub simulation: SimulationSettings,
    /// Network conditions.
    pub network: NetworkSettings,
    /// Every node, including template-generated ones, in document order.
    pub nodes: Vec<NodeSpec>,
    /// Templates, kept for `add_nodes` events.
    pub templates: Vec<NodeTemplate>,
    /// Initial topology.
    pub topology: TopologySettings,
    /// Fault-injection timeline.
    pub events: Vec<EventSpec>,
    /// Metric-output settings.
    pub metrics: MetricsSettings,
}

// ============================================================================
// Loading
// ============================================================================

/// Load a scenario from a YAML file.
pub fn load_from_file(path: &Path) -> Result<Scenario, ScenarioError> {
    let content = std::fs::read_to_string(path)?;
    load_from_str(&content)
}

/// Parse a scenario from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<Scenario, ScenarioError> {
    let doc: ScenarioDoc = serde_yaml::from_str(yaml)?;

    for key in doc.extra.keys() {
        warn!(section = key.as_str(), "ignoring unknown scenario section");
    }

    let simulation = SimulationSettings {
        name: doc.simulation.name,
        description: doc.simulation.description,
        duration_s: doc.simulation.duration,
        time_scale: doc.simulation.time_scale,
        seed: doc.simulation.seed,
    };

    let network = resolve_network(doc.network)?;

    // Split the node list into concrete nodes and templates, then expand
    // templates in document order.
    let mut nodes = Vec::new();
    let mut templates = Vec::new();
    for entry in doc.nodes {
        match entry {
            NodeEntryYaml::Node(node) => nodes.push(resolve_node(node)),
            NodeEntryYaml::Template(template) => {
                let resolved = resolve_template(template);
                nodes.extend(resolved.expand(resolved.count, &resolved.id_prefix));
                templates.push(resolved);
            }
        }
    }

    let topology = resolve_topology(doc.topology);

    let mut events = Vec::new();
    for event in doc.events {
        events.push(resolve_event(event)?);
    }

    let metrics = resolve_metrics(doc.metrics);

    Ok(Scenario {
        simulation,
        network,
        nodes,
        templates,
        topology,
        events,
        metrics,
    })
}

fn parse_distribution(value: Option<&str>, fallback: LatencyDistribution) -> LatencyDistribution {
    match value.map(|s| s.to_lowercase()) {
        Some(s) => match s.as_str() {
            "uniform" => LatencyDistribution::Uniform,
            "normal" | "gaussian" => LatencyDistribution::Normal,
            "exponential" => LatencyDistribution::Exponential,
            other => {
                warn!(distribution = other, "unknown latency distribution, keeping default");
                fallback
            }
        },
        None => fallback,
    }
}

fn resolve_network(network: NetworkYaml) -> Result<NetworkSettings, ScenarioError> {
    let builtin = LatencyConfig::default();
    let default_latency = match &network.latency.default {
        Some(values) => LatencyConfig {
            min_ms: values.min.unwrap_or(builtin.min_ms),
            max_ms: values.max.unwrap_or(builtin.max_ms),
            distribution: parse_distribution(
                values.distribution.as_deref(),
                builtin.distribution,
            ),
        },
        None => builtin,
    };

    let latency_overrides = network
        .latency
        .specific_connections
        .into_iter()
        .map(|conn| LinkOverride {
            from: conn.from,
            to: conn.to,
            config: LatencyConfig {
                min_ms: conn.min.unwrap_or(default_latency.min_ms),
                max_ms: conn.max.unwrap_or(default_latency.max_ms),
                distribution: parse_distribution(
                    conn.distribution.as_deref(),
                    default_latency.distribution,
                ),
            },
        })
        .collect();

    let mut default_loss = PacketLossConfig::default();
    let mut loss_overrides = Vec::new();
    match network.packet_loss {
        Some(PacketLossYaml::Structured {
            default,
            specific_connections,
        }) => {
            if let Some(values) = default {
                default_loss = PacketLossConfig {
                    probability: values.probability.unwrap_or(0.0),
                    burst_mode: values.burst_mode.unwrap_or(false),
                    burst_length: values.burst_length.unwrap_or(3),
                };
            }
            loss_overrides = specific_connections
                .into_iter()
                .map(|conn| LinkOverride {
                    from: conn.from,
                    to: conn.to,
                    config: PacketLossConfig {
                        probability: conn.probability.unwrap_or(default_loss.probability),
                        burst_mode: conn.burst_mode.unwrap_or(default_loss.burst_mode),
                        burst_length: conn.burst_length.unwrap_or(default_loss.burst_length),
                    },
                })
                .collect();
        }
        Some(PacketLossYaml::Legacy(probability)) => {
            warn!(
                probability,
                "scalar packet_loss is a legacy shorthand; prefer the structured form"
            );
            default_loss = PacketLossConfig {
                probability,
                burst_mode: false,
                burst_length: 3,
            };
        }
        None => {}
    }

    Ok(NetworkSettings {
        default_latency,
        latency_overrides,
        default_loss,
        loss_overrides,
        bandwidth: network.bandwidth,
    })
}

/// Render a YAML scalar as the string a firmware reads from its config.
fn yaml_value_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

fn firmware_config_from(extra: BTreeMap<String, serde_yaml::Value>) -> BTreeMap<String, String> {
    extra
        .into_iter()
        .map(|(key, value)| (key, yaml_value_to_string(&value)))
        .collect()
}

fn resolve_node(node: NodeYaml) -> NodeSpec {
    let position = node.position.as_ref().and_then(|p| {
        if p.len() >= 2 {
            Some((p[0], p[1]))
        } else {
            None
        }
    });
    NodeSpec {
        id: derive_node_id(&node.id),
        name: node.id,
        node_type: node.node_type,
        firmware: node.firmware,
        mesh_prefix: node.config.mesh_prefix,
        mesh_password: node.config.mesh_password,
        mesh_port: node.config.mesh_port,
        position,
        firmware_config: firmware_config_from(node.config.extra),
    }
}

fn resolve_template(template: TemplateYaml) -> NodeTemplate {
    let id_prefix = template
        .id_prefix
        .unwrap_or_else(|| format!("{}-", template.template));
    NodeTemplate {
        name: template.template,
        count: template.count,
        id_prefix,
        firmware: template.firmware,
        mesh_prefix: template.config.mesh_prefix,
        mesh_password: template.config.mesh_password,
        mesh_port: template.config.mesh_port,
        firmware_config: firmware_config_from(template.config.extra),
    }
}

fn resolve_topology(topology: TopologyYaml) -> TopologySettings {
    let kind = match topology.kind.to_lowercase().as_str() {
        "random" => TopologyKind::Random,
        "star" => TopologyKind::Star,
        "ring" => TopologyKind::Ring,
        "mesh" => TopologyKind::Mesh,
        "custom" => TopologyKind::Custom,
        other => {
            warn!(topology = other, "unknown topology type, using random");
            TopologyKind::Random
        }
    };
    TopologySettings {
        kind,
        hub: topology.hub,
        density: topology.density,
        bidirectional: topology.bidirectional,
        connections: topology.connections,
    }
}

fn resolve_event(event: EventYaml) -> Result<EventSpec, ScenarioError> {
    Ok(EventSpec {
        time_s: event.time,
        action: parse_event_action(&event.action)?,
        target: event.target,
        targets: event.targets,
        description: event.description,
        groups: event.groups,
        from: event.from,
        to: event.to,
        payload: event.payload,
        quality: event.quality,
        count: event.count,
        template: event.template,
        id_prefix: event.id_prefix,
        graceful: event.graceful,
        latency_ms: event.latency,
        packet_loss: event.packet_loss,
    })
}

fn resolve_metrics(metrics: MetricsYaml) -> MetricsSettings {
    let mut export = Vec::new();
    for format in metrics.export {
        match format.to_lowercase().as_str() {
            "csv" => export.push(ExportFormat::Csv),
            "json" => export.push(ExportFormat::Json),
            "graphviz" | "dot" => export.push(ExportFormat::Graphviz),
            other => warn!(format = other, "ignoring unknown metrics export format"),
        }
    }
    MetricsSettings {
        output: metrics.output,
        interval_s: metrics.interval,
        collect: metrics.collect,
        export,
    }
}

// ============================================================================
// Validation
// ============================================================================

impl Scenario {
    /// Run the validator, returning every finding.
    pub fn validation_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        self.validate_simulation(&mut errors);
        self.validate_network(&mut errors);
        self.validate_nodes(&mut errors);
        self.validate_topology(&mut errors);
        for event in &self.events {
            self.validate_event(event, &mut errors);
        }

        errors
    }

    /// Validate, producing an error carrying the full finding list.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::Validation(errors))
        }
    }

    fn node_exists(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Name-to-id mapping over the expanded node set.
    pub fn node_ids_by_name(&self) -> BTreeMap<String, NodeId> {
        self.nodes
            .iter()
            .map(|n| (n.name.clone(), n.id))
            .collect()
    }

    fn validate_simulation(&self, errors: &mut Vec<ValidationError>) {
        if self.simulation.name.is_empty() {
            errors.push(ValidationError {
                field: "simulation.name".to_string(),
                message: "Simulation name is required".to_string(),
                suggestion: "Add a descriptive name for your simulation".to_string(),
            });
        }
        if self.simulation.time_scale <= 0.0 {
            errors.push(ValidationError {
                field: "simulation.time_scale".to_string(),
                message: "Time scale must be positive".to_string(),
                suggestion: "Use 1.0 for real-time, >1.0 for faster simulation".to_string(),
            });
        }
    }

    fn validate_network(&self, errors: &mut Vec<ValidationError>) {
        if !self.network.default_latency.valid() {
            errors.push(ValidationError {
                field: "network.latency.default".to_string(),
                message: "Minimum latency cannot be greater than maximum".to_string(),
                suggestion: "Set min <= max".to_string(),
            });
        }
        for (i, conn) in self.network.latency_overrides.iter().enumerate() {
            if conn.from.is_empty() {
                errors.push(ValidationError {
                    field: format!("network.latency.specific_connections[{}].from", i),
                    message: "Source node ID cannot be empty".to_string(),
                    suggestion: "Specify a valid node ID".to_string(),
                });
            }
            if conn.to.is_empty() {
                errors.push(ValidationError {
                    field: format!("network.latency.specific_connections[{}].to", i),
                    message: "Destination node ID cannot be empty".to_string(),
                    suggestion: "Specify a valid node ID".to_string(),
                });
            }
            if !conn.config.valid() {
                errors.push(ValidationError {
                    field: format!("network.latency.specific_connections[{}]", i),
                    message: format!(
                        "Minimum latency cannot be greater than maximum for connection {} -> {}",
                        conn.from, conn.to
                    ),
                    suggestion: "Set min <= max".to_string(),
                });
            }
        }

        if !self.network.default_loss.valid() {
            errors.push(ValidationError {
                field: "network.packet_loss.default".to_string(),
                message: "Invalid packet loss configuration".to_string(),
                suggestion: "Probability must be 0.0-1.0, burst_length must be > 0".to_string(),
            });
        }
        for (i, conn) in self.network.loss_overrides.iter().enumerate() {
            if conn.from.is_empty() {
                errors.push(ValidationError {
                    field: format!("network.packet_loss.specific_connections[{}].from", i),
                    message: "Source node ID cannot be empty".to_string(),
                    suggestion: "Specify a valid node ID".to_string(),
                });
            }
            if conn.to.is_empty() {
                errors.push(ValidationError {
                    field: format!("network.packet_loss.specific_connections[{}].to", i),
                    message: "Destination node ID cannot be empty".to_string(),
                    suggestion: "Specify a valid node ID".to_string(),
                });
            }
            if !conn.config.valid() {
                errors.push(ValidationError {
                    field: format!("network.packet_loss.specific_connections[{}]", i),
                    message: format!(
                        "Invalid packet loss configuration for connection {} -> {}",
                        conn.from, conn.to
                    ),
                    suggestion: "Probability must be 0.0-1.0, burst_length must be > 0".to_string(),
                });
            }
        }

        if self.network.bandwidth == 0 {
            errors.push(ValidationError {
                field: "network.bandwidth".to_string(),
                message: "Bandwidth cannot be zero".to_string(),
                suggestion: "Specify bandwidth in bits per second".to_string(),
            });
        }
    }

    fn validate_nodes(&self, errors: &mut Vec<ValidationError>) {
        for node in &self.nodes {
            if node.name.is_empty() {
                errors.push(ValidationError {
                    field: "node.id".to_string(),
                    message: "Node ID is required".to_string(),
                    suggestion: "Provide a unique identifier for each node".to_string(),
                });
            }
            if node.mesh_prefix.is_empty() {
                errors.push(ValidationError {
                    field: "node.config.mesh_prefix".to_string(),
                    message: format!("Mesh prefix is required for node: {}", node.name),
                    suggestion: "Set mesh_prefix in node configuration".to_string(),
                });
            }
            if node.mesh_password.is_empty() {
                errors.push(ValidationError {
                    field: "node.config.mesh_password".to_string(),
                    message: format!("Mesh password is required for node: {}", node.name),
                    suggestion: "Set mesh_password in node configuration".to_string(),
                });
            }
            if node.mesh_port == 0 {
                errors.push(ValidationError {
                    field: "node.config.mesh_port".to_string(),
                    message: format!("Invalid mesh port for node: {}", node.name),
                    suggestion: "Use default port 5555 or specify a valid port".to_string(),
                });
            }
        }

        let mut seen_names = Vec::new();
        let mut seen_ids: BTreeMap<NodeId, String> = BTreeMap::new();
        for node in &self.nodes {
            if seen_names.contains(&node.name) {
                errors.push(ValidationError {
                    field: "nodes".to_string(),
                    message: format!("Duplicate node ID: {}", node.name),
                    suggestion: "Ensure all node IDs are unique".to_string(),
                });
            }
            seen_names.push(node.name.clone());

            if let Some(existing) = seen_ids.get(&node.id) {
                if existing != &node.name {
                    errors.push(ValidationError {
                        field: "nodes".to_string(),
                        message: format!(
                            "Node IDs '{}' and '{}' hash to the same numeric id {}",
                            existing, node.name, node.id
                        ),
                        suggestion: "Rename one of the colliding nodes".to_string(),
                    });
                }
            } else {
                seen_ids.insert(node.id, node.name.clone());
            }
        }

        if self.nodes.is_empty() {
            errors.push(ValidationError {
                field: "nodes".to_string(),
                message: "No nodes defined".to_string(),
                suggestion: "Add at least one node or template".to_string(),
            });
        }
    }

    fn validate_topology(&self, errors: &mut Vec<ValidationError>) {
        match self.topology.kind {
            TopologyKind::Star => match &self.topology.hub {
                Some(hub) => {
                    if !self.node_exists(hub) {
                        errors.push(ValidationError {
                            field: "topology.hub".to_string(),
                            message: format!("Hub node not found: {}", hub),
                            suggestion: "Ensure hub node ID matches an existing node".to_string(),
                        });
                    }
                }
                None => {
                    errors.push(ValidationError {
                        field: "topology.hub".to_string(),
                        message: "Hub node required for star topology".to_string(),
                        suggestion: "Specify which node should be the central hub".to_string(),
                    });
                }
            },
            TopologyKind::Random => {
                if !(0.0..=1.0).contains(&self.topology.density) {
                    errors.push(ValidationError {
                        field: "topology.density".to_string(),
                        message: "Density must be between 0.0 and 1.0".to_string(),
                        suggestion: "Use 0.3 for sparse, 0.7 for dense networks".to_string(),
                    });
                }
            }
            TopologyKind::Custom => {
                if self.topology.connections.is_empty() {
                    errors.push(ValidationError {
                        field: "topology.connections".to_string(),
                        message: "Custom topology requires connection definitions".to_string(),
                        suggestion: "Add connections array with [node1, node2] pairs".to_string(),
                    });
                }
                for (from, to) in &self.topology.connections {
                    for name in [from, to] {
                        if !self.node_exists(name) {
                            errors.push(ValidationError {
                                field: "topology.connections".to_string(),
                                message: format!(
                                    "Connection references non-existent node: {}",
                                    name
                                ),
                                suggestion: "Ensure all connection nodes exist".to_string(),
                            });
                        }
                    }
                }
            }
            TopologyKind::Ring | TopologyKind::Mesh => {}
        }
    }

    fn validate_event(&self, event: &EventSpec, errors: &mut Vec<ValidationError>) {
        if self.simulation.duration_s > 0 && event.time_s > self.simulation.duration_s {
            errors.push(ValidationError {
                field: "event.time".to_string(),
                message: format!(
                    "Event time {}s exceeds simulation duration {}s",
                    event.time_s, self.simulation.duration_s
                ),
                suggestion: "Ensure all event times are within simulation duration".to_string(),
            });
        }

        if let Some(target) = &event.target {
            // "all" is an accepted pseudo-target for set_network_quality.
            let is_wildcard =
                event.action == EventAction::SetNetworkQuality && target == "all";
            if !target.is_empty() && !is_wildcard && !self.node_exists(target) {
                errors.push(ValidationError {
                    field: "event.target".to_string(),
                    message: format!("Event references non-existent node: {}", target),
                    suggestion: "Ensure target node exists".to_string(),
                });
            }
        }
        for target in &event.targets {
            if !self.node_exists(target) {
                errors.push(ValidationError {
                    field: "event.targets".to_string(),
                    message: format!("Event references non-existent node: {}", target),
                    suggestion: "Ensure target nodes exist".to_string(),
                });
            }
        }
        for name in event.from.iter().chain(event.to.iter()) {
            if !self.node_exists(name) {
                errors.push(ValidationError {
                    field: "event.from".to_string(),
                    message: format!("Event references non-existent node: {}", name),
                    suggestion: "Ensure link endpoints exist".to_string(),
                });
            }
        }
        for group in &event.groups {
            for name in group {
                if !self.node_exists(name) {
                    errors.push(ValidationError {
                        field: "event.groups".to_string(),
                        message: format!("Partition group references non-existent node: {}", name),
                        suggestion: "Ensure all group members exist".to_string(),
                    });
                }
            }
        }

        if event.action == EventAction::SetNetworkQuality
            && !(0.0..=1.0).contains(&event.quality)
        {
            errors.push(ValidationError {
                field: "event.quality".to_string(),
                message: "Network quality must be between 0.0 and 1.0".to_string(),
                suggestion: "Use 0.0 for worst, 1.0 for best quality".to_string(),
            });
        }
    }

    // ========================================================================
    // Projection
    // ========================================================================

    /// Build the initial topology in terms of numeric node ids.
    pub fn build_topology(&self) -> Result<Topology, ScenarioError> {
        let ids = self.node_ids_by_name();
        let lookup = |name: &str| -> Result<NodeId, ScenarioError> {
            ids.get(name).copied().ok_or_else(|| {
                ScenarioError::Invalid(format!("topology references unknown node: {}", name))
            })
        };

        Ok(match self.topology.kind {
            TopologyKind::Random => Topology::Random {
                density: self.topology.density,
            },
            TopologyKind::Star => {
                let hub = self.topology.hub.as_deref().ok_or_else(|| {
                    ScenarioError::Invalid("star topology requires a hub".to_string())
                })?;
                Topology::Star { hub: lookup(hub)? }
            }
            TopologyKind::Ring => Topology::Ring {
                bidirectional: self.topology.bidirectional,
            },
            TopologyKind::Mesh => Topology::Mesh,
            TopologyKind::Custom => {
                let mut connections = Vec::new();
                for (from, to) in &self.topology.connections {
                    connections.push((lookup(from)?, lookup(to)?));
                }
                Topology::Custom { connections }
            }
        })
    }

    /// Project the timeline into typed events, in `(time, document order)`.
    pub fn build_events(&self) -> Result<Vec<(u32, SimEvent)>, ScenarioError> {
        let ids = self.node_ids_by_name();
        let lookup = |name: &str| -> Result<NodeId, ScenarioError> {
            ids.get(name).copied().ok_or_else(|| {
                ScenarioError::Invalid(format!("event references unknown node: {}", name))
            })
        };

        let mut out = Vec::new();
        for event in &self.events {
            // Lifecycle actions accept either a single target or a list.
            let node_targets: Vec<NodeId> = match (&event.target, event.targets.is_empty()) {
                (Some(target), _) if !target.is_empty() && target != "all" => {
                    vec![lookup(target)?]
                }
                (_, false) => event
                    .targets
                    .iter()
                    .map(|t| lookup(t))
                    .collect::<Result<_, _>>()?,
                _ => Vec::new(),
            };

            let link_endpoints = || -> Result<(NodeId, NodeId), ScenarioError> {
                match (&event.from, &event.to) {
                    (Some(from), Some(to)) => Ok((lookup(from)?, lookup(to)?)),
                    _ => Err(ScenarioError::Invalid(format!(
                        "link event at t={} requires from and to",
                        event.time_s
                    ))),
                }
            };

            match event.action {
                EventAction::StartNode => {
                    for id in &node_targets {
                        out.push((event.time_s, SimEvent::NodeStart(*id)));
                    }
                }
                EventAction::StopNode => {
                    for id in &node_targets {
                        out.push((
                            event.time_s,
                            SimEvent::NodeStop {
                                id: *id,
                                graceful: event.graceful,
                            },
                        ));
                    }
                }
                EventAction::RestartNode => {
                    for id in &node_targets {
                        out.push((event.time_s, SimEvent::NodeRestart(*id)));
                    }
                }
                EventAction::CrashNode => {
                    for id in &node_targets {
                        out.push((event.time_s, SimEvent::NodeCrash(*id)));
                    }
                }
                EventAction::RemoveNode => {
                    for id in &node_targets {
                        out.push((event.time_s, SimEvent::RemoveNode(*id)));
                    }
                }
                EventAction::AddNodes => {
                    let template_name = event.template.as_deref().ok_or_else(|| {
                        ScenarioError::Invalid(format!(
                            "add_nodes event at t={} requires a template",
                            event.time_s
                        ))
                    })?;
                    let template = self
                        .templates
                        .iter()
                        .find(|t| t.name == template_name)
                        .ok_or_else(|| {
                            ScenarioError::Invalid(format!(
                                "add_nodes references unknown template: {}",
                                template_name
                            ))
                        })?;
                    let count = if event.count > 0 {
                        event.count
                    } else {
                        template.count
                    };
                    let prefix = event
                        .id_prefix
                        .as_deref()
                        .unwrap_or(template.id_prefix.as_str());
                    out.push((
                        event.time_s,
                        SimEvent::AddNodes {
                            specs: template.expand(count, prefix),
                        },
                    ));
                }
                EventAction::PartitionNetwork => {
                    let mut groups = Vec::new();
                    for group in &event.groups {
                        let mut ids = Vec::new();
                        for name in group {
                            ids.push(lookup(name)?);
                        }
                        groups.push(ids);
                    }
                    out.push((event.time_s, SimEvent::PartitionNetwork { groups }));
                }
                EventAction::HealPartition => {
                    out.push((event.time_s, SimEvent::HealNetwork));
                }
                EventAction::BreakLink | EventAction::ConnectionDrop => {
                    let (a, b) = link_endpoints()?;
                    out.push((event.time_s, SimEvent::LinkDrop { a, b }));
                }
                EventAction::RestoreLink | EventAction::ConnectionRestore => {
                    let (a, b) = link_endpoints()?;
                    out.push((event.time_s, SimEvent::LinkRestore { a, b }));
                }
                EventAction::ConnectionDegrade => {
                    let (a, b) = link_endpoints()?;
                    out.push((
                        event.time_s,
                        SimEvent::LinkDegrade {
                            a,
                            b,
                            latency_ms: event.latency_ms,
                            loss_probability: event.packet_loss,
                        },
                    ));
                }
                EventAction::InjectMessage => {
                    let (from, to) = link_endpoints()?;
                    out.push((
                        event.time_s,
                        SimEvent::InjectMessage {
                            from,
                            to,
                            payload: event.payload.clone(),
                        },
                    ));
                }
                EventAction::SetNetworkQuality => {
                    let target = match &event.target {
                        Some(target) if target != "all" && !target.is_empty() => {
                            Some(lookup(target)?)
                        }
                        _ => None,
                    };
                    out.push((
                        event.time_s,
                        SimEvent::SetNetworkQuality {
                            target,
                            quality: event.quality,
                        },
                    ));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_SCENARIO: &str = r#"
simulation:
  name: basic
  duration: 120
  time_scale: 10.0
  seed: 42

network:
  latency:
    default: { min: 10, max: 50, distribution: normal }
    specific_connections:
      - { from: node-a, to: node-b, min: 100, max: 200, distribution: uniform }
  packet_loss:
    default: { probability: 0.05, burst_mode: true, burst_length: 4 }

nodes:
  - id: node-a
    type: sensor
    firmware: echo-client
    config:
      mesh_prefix: TestMesh
      mesh_password: secret
      server_node_id: "1234"
  - id: node-b
    type: gateway
    config:
      mesh_prefix: TestMesh
      mesh_password: secret
      mesh_port: 5556

topology:
  type: custom
  connections:
    - [node-a, node-b]

events:
  - time: 30
    action: crash_node
    target: node-a
  - time: 60
    action: start_node
    target: node-a

metrics:
  output: results/metrics
  interval: 5
  export: [json, csv]
"#;

    #[test]
    fn test_derive_node_id_is_stable_and_nonzero() {
        let a = derive_node_id("sensor-0");
        let b = derive_node_id("sensor-0");
        assert_eq!(a, b);
        assert!(!a.is_zero());
        assert_ne!(derive_node_id("sensor-0"), derive_node_id("sensor-1"));
    }

    #[test]
    fn test_load_basic_scenario() {
        let scenario = load_from_str(BASIC_SCENARIO).unwrap();
        assert_eq!(scenario.simulation.name, "basic");
        assert_eq!(scenario.simulation.duration_s, 120);
        assert_eq!(scenario.simulation.seed, 42);
        assert_eq!(scenario.nodes.len(), 2);

        let node_a = &scenario.nodes[0];
        assert_eq!(node_a.name, "node-a");
        assert_eq!(node_a.firmware.as_deref(), Some("echo-client"));
        assert_eq!(node_a.mesh_port, 5555);
        assert_eq!(
            node_a.firmware_config.get("server_node_id").map(|s| s.as_str()),
            Some("1234")
        );
        assert_eq!(scenario.nodes[1].mesh_port, 5556);

        assert_eq!(scenario.network.default_latency.min_ms, 10);
        assert_eq!(scenario.network.latency_overrides.len(), 1);
        assert_eq!(scenario.network.latency_overrides[0].config.min_ms, 100);
        assert!(scenario.network.default_loss.burst_mode);
        assert_eq!(scenario.network.default_loss.burst_length, 4);

        assert_eq!(scenario.metrics.export, vec![ExportFormat::Json, ExportFormat::Csv]);
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn test_template_expansion_produces_distinct_ids() {
        let yaml = r#"
simulation: { name: expansion }
nodes:
  - template: sensor
    count: 5
    id_prefix: "sensor-"
    firmware: broadcast
    config:
      mesh_prefix: Mesh
      mesh_password: pw
"#;
        let scenario = load_from_str(yaml).unwrap();
        assert_eq!(scenario.nodes.len(), 5);

        let names: Vec<&str> = scenario.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["sensor-0", "sensor-1", "sensor-2", "sensor-3", "sensor-4"]);

        let mut ids: Vec<NodeId> = scenario.nodes.iter().map(|n| n.id).collect();
        assert!(ids.iter().all(|id| !id.is_zero()));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5, "expanded node ids must be pairwise distinct");

        assert_eq!(scenario.templates.len(), 1);
        assert_eq!(scenario.templates[0].count, 5);
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn test_validation_reports_expected_errors() {
        // Empty name, inverted latency, missing mesh password.
        let yaml = r#"
simulation: { name: "" }
network:
  latency:
    default: { min: 100, max: 50 }
nodes:
  - id: lonely
    config:
      mesh_prefix: Mesh
"#;
        let scenario = load_from_str(yaml).unwrap();
        let errors = scenario.validation_errors();
        assert_eq!(errors.len(), 3);

        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"simulation.name"));
        assert!(fields.contains(&"network.latency.default"));
        assert!(fields.contains(&"node.config.mesh_password"));
        assert!(errors.iter().all(|e| !e.suggestion.is_empty()));
    }

    #[test]
    fn test_validation_rejects_duplicate_names() {
        let yaml = r#"
simulation: { name: dup }
nodes:
  - id: same
    config: { mesh_prefix: Mesh, mesh_password: pw }
  - id: same
    config: { mesh_prefix: Mesh, mesh_password: pw }
"#;
        let scenario = load_from_str(yaml).unwrap();
        let errors = scenario.validation_errors();
        assert!(errors
            .iter()
            .any(|e| e.field == "nodes" && e.message.contains("Duplicate")));
    }

    #[test]
    fn test_validation_rejects_empty_node_set() {
        let scenario = load_from_str("simulation: { name: empty }").unwrap();
        let errors = scenario.validation_errors();
        assert!(errors.iter().any(|e| e.field == "nodes"));
    }

    #[test]
    fn test_validation_star_requires_existing_hub() {
        let yaml = r#"
simulation: { name: star }
nodes:
  - id: a
    config: { mesh_prefix: Mesh, mesh_password: pw }
topology:
  type: star
  hub: missing
"#;
        let scenario = load_from_str(yaml).unwrap();
        assert!(scenario
            .validation_errors()
            .iter()
            .any(|e| e.field == "topology.hub"));
    }

    #[test]
    fn test_validation_event_time_and_targets() {
        let yaml = r#"
simulation: { name: times, duration: 60 }
nodes:
  - id: a
    config: { mesh_prefix: Mesh, mesh_password: pw }
events:
  - time: 90
    action: stop_node
    target: a
  - time: 10
    action: crash_node
    target: ghost
  - time: 20
    action: set_network_quality
    target: all
    quality: 1.5
"#;
        let scenario = load_from_str(yaml).unwrap();
        let errors = scenario.validation_errors();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"event.time"));
        assert!(fields.contains(&"event.target"));
        assert!(fields.contains(&"event.quality"));
    }

    #[test]
    fn test_unknown_action_fails_to_load() {
        let yaml = r#"
simulation: { name: bad }
nodes:
  - id: a
    config: { mesh_prefix: Mesh, mesh_password: pw }
events:
  - time: 5
    action: explode_node
    target: a
"#;
        assert!(matches!(
            load_from_str(yaml),
            Err(ScenarioError::Invalid(_))
        ));
    }

    #[test]
    fn test_legacy_scalar_packet_loss() {
        let yaml = r#"
simulation: { name: legacy }
network:
  packet_loss: 0.25
nodes:
  - id: a
    config: { mesh_prefix: Mesh, mesh_password: pw }
"#;
        let scenario = load_from_str(yaml).unwrap();
        assert!((scenario.network.default_loss.probability - 0.25).abs() < f32::EPSILON);
        assert!(!scenario.network.default_loss.burst_mode);
        assert_eq!(scenario.network.default_loss.burst_length, 3);
    }

    #[test]
    fn test_event_projection() {
        let scenario = load_from_str(BASIC_SCENARIO).unwrap();
        let events = scenario.build_events().unwrap();
        assert_eq!(events.len(), 2);

        let id_a = derive_node_id("node-a");
        assert_eq!(events[0].0, 30);
        assert!(matches!(events[0].1, SimEvent::NodeCrash(id) if id == id_a));
        assert_eq!(events[1].0, 60);
        assert!(matches!(events[1].1, SimEvent::NodeStart(id) if id == id_a));
    }

    #[test]
    fn test_link_event_projection() {
        let yaml = r#"
simulation: { name: links }
nodes:
  - id: a
    config: { mesh_prefix: Mesh, mesh_password: pw }
  - id: b
    config: { mesh_prefix: Mesh, mesh_password: pw }
events:
  - time: 10
    action: connection_degrade
    from: a
    to: b
    latency: 300
    packet_loss: 0.2
  - time: 20
    action: inject_message
    from: a
    to: b
    payload: "probe"
  - time: 30
    action: partition_network
    groups:
      - [a]
      - [b]
"#;
        let scenario = load_from_str(yaml).unwrap();
        let events = scenario.build_events().unwrap();

        assert!(matches!(
            &events[0].1,
            SimEvent::LinkDegrade { latency_ms: 300, .. }
        ));
        assert!(matches!(
            &events[1].1,
            SimEvent::InjectMessage { payload, .. } if payload == "probe"
        ));
        assert!(matches!(
            &events[2].1,
            SimEvent::PartitionNetwork { groups } if groups.len() == 2
        ));
    }

    #[test]
    fn test_add_nodes_projection_uses_template() {
        let yaml = r#"
simulation: { name: growth }
nodes:
  - id: seed
    config: { mesh_prefix: Mesh, mesh_password: pw }
  - template: burst
    count: 2
    id_prefix: "burst-"
    config: { mesh_prefix: Mesh, mesh_password: pw }
events:
  - time: 40
    action: add_nodes
    template: burst
    count: 3
    id_prefix: "late-"
"#;
        let scenario = load_from_str(yaml).unwrap();
        let events = scenario.build_events().unwrap();
        // Timeline has one add_nodes event expanding to three fresh specs.
        let (time, event) = &events[0];
        assert_eq!(*time, 40);
        match event {
            SimEvent::AddNodes { specs } => {
                assert_eq!(specs.len(), 3);
                assert_eq!(specs[0].name, "late-0");
                assert_eq!(specs[2].name, "late-2");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_build_topology_custom() {
        let scenario = load_from_str(BASIC_SCENARIO).unwrap();
        let topology = scenario.build_topology().unwrap();
        match topology {
            Topology::Custom { connections } => {
                assert_eq!(
                    connections,
                    vec![(derive_node_id("node-a"), derive_node_id("node-b"))]
                );
            }
            other => panic!("unexpected topology: {:?}", other),
        }
    }

    #[test]
    fn test_targets_list_expands_lifecycle_events() {
        let yaml = r#"
simulation: { name: multi }
nodes:
  - id: a
    config: { mesh_prefix: Mesh, mesh_password: pw }
  - id: b
    config: { mesh_prefix: Mesh, mesh_password: pw }
events:
  - time: 5
    action: stop_node
    targets: [a, b]
    graceful: false
"#;
        let scenario = load_from_str(yaml).unwrap();
        let events = scenario.build_events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|(t, e)| *t == 5 && matches!(e, SimEvent::NodeStop { graceful: false, .. })));
    }
}
