//! Metrics collection and export.
//!
//! Snapshots of per-node metrics and per-link statistics are collected
//! periodically during a run and exported at the end in the formats the
//! scenario requests: JSON (the full report), CSV (the per-node table)
//! and Graphviz (a dot digraph of nodes and active links).

use std::io::Write;

use meshsim_common::SimTime;
use meshsim_net::{LinkStats, NetworkSimulator};
use meshsim_node::{NodeManager, NodeMetrics};
use serde::Serialize;

use crate::{RunnerError, SimulationStats};

// ============================================================================
// Snapshot Types
// ============================================================================

/// Metrics of one node at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetricsEntry {
    /// Scenario name of the node.
    pub name: String,
    /// Numeric node id.
    pub id: u32,
    /// Node type label.
    pub node_type: String,
    /// Whether the node was running.
    pub running: bool,
    /// Partition tag (0 = unpartitioned).
    pub partition_id: u32,
    /// The node's counters.
    #[serde(flatten)]
    pub metrics: NodeMetrics,
}

/// Statistics of one directed link at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatsEntry {
    /// Source node id.
    pub from: u32,
    /// Destination node id.
    pub to: u32,
    /// Whether the link was active.
    pub active: bool,
    /// The link's statistics view.
    #[serde(flatten)]
    pub stats: LinkStats,
}

/// One periodic metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Simulation time of the snapshot in milliseconds.
    pub time_ms: u64,
    /// Per-node metrics.
    pub nodes: Vec<NodeMetricsEntry>,
    /// Per-link statistics.
    pub links: Vec<LinkStatsEntry>,
}

/// The full end-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    /// Aggregate run statistics.
    pub stats: SimulationStats,
    /// Final per-node metrics.
    pub nodes: Vec<NodeMetricsEntry>,
    /// Final per-link statistics.
    pub links: Vec<LinkStatsEntry>,
    /// Periodic snapshots collected during the run.
    pub snapshots: Vec<MetricsSnapshot>,
}

// ============================================================================
// Collection
// ============================================================================

/// Collect a snapshot of every node and every link with traffic.
pub fn collect_snapshot(
    now: SimTime,
    manager: &NodeManager,
    net: &NetworkSimulator,
) -> MetricsSnapshot {
    let nodes = manager
        .nodes()
        .map(|node| NodeMetricsEntry {
            name: node.spec().name.clone(),
            id: node.node_id().get(),
            node_type: node.spec().node_type.clone(),
            running: node.is_running(),
            partition_id: node.partition_id(),
            metrics: node.metrics().clone(),
        })
        .collect();

    let links = net
        .all_stats()
        .into_iter()
        .map(|(from, to, stats)| LinkStatsEntry {
            from: from.get(),
            to: to.get(),
            active: net.is_link_active(from, to),
            stats,
        })
        .collect();

    MetricsSnapshot {
        time_ms: now.as_millis(),
        nodes,
        links,
    }
}

// ============================================================================
// Export
// ============================================================================

/// Write the full report as pretty JSON.
pub fn export_json(report: &MetricsReport, writer: &mut dyn Write) -> Result<(), RunnerError> {
    let json = serde_json::to_string_pretty(report)?;
    writeln!(writer, "{}", json)?;
    Ok(())
}

/// Write the final per-node metrics as CSV.
pub fn export_csv(report: &MetricsReport, writer: &mut dyn Write) -> Result<(), RunnerError> {
    writeln!(
        writer,
        "name,id,type,running,partition_id,messages_sent,messages_received,\
         bytes_sent,bytes_received,total_uptime_ms,crash_count"
    )?;
    for node in &report.nodes {
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{}",
            node.name,
            node.id,
            node.node_type,
            node.running,
            node.partition_id,
            node.metrics.messages_sent,
            node.metrics.messages_received,
            node.metrics.bytes_sent,
            node.metrics.bytes_received,
            node.metrics.total_uptime_ms,
            node.metrics.crash_count,
        )?;
    }
    Ok(())
}

/// Write the node/link graph as a Graphviz digraph.
///
/// Nodes are labelled with their scenario name; edges carry the link's
/// delivery counts and are dashed while the link is inactive.
pub fn export_graphviz(report: &MetricsReport, writer: &mut dyn Write) -> Result<(), RunnerError> {
    writeln!(writer, "digraph meshsim {{")?;
    writeln!(writer, "    rankdir=LR;")?;
    writeln!(writer, "    node [shape=box];")?;

    for node in &report.nodes {
        let color = if node.running { "black" } else { "gray" };
        writeln!(
            writer,
            "    n{} [label=\"{}\\nsent={} recv={}\" color={}];",
            node.id, node.name, node.metrics.messages_sent, node.metrics.messages_received, color
        )?;
    }

    for link in &report.links {
        let style = if link.active { "solid" } else { "dashed" };
        writeln!(
            writer,
            "    n{} -> n{} [label=\"{}/{}\" style={}];",
            link.from,
            link.to,
            link.stats.delivered_count,
            link.stats.delivered_count + link.stats.dropped_count,
            style
        )?;
    }

    writeln!(writer, "}}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsim_common::{NodeId, SimTime};
    use meshsim_net::LatencyConfig;
    use meshsim_node::NodeSpec;
    use std::collections::BTreeMap;

    fn sample_report() -> MetricsReport {
        let mut manager = NodeManager::new();
        for (id, name) in [(1001, "alpha"), (1002, "beta")] {
            manager
                .create_node(NodeSpec {
                    id: NodeId::new(id),
                    name: name.to_string(),
                    node_type: "sensor".to_string(),
                    firmware: None,
                    mesh_prefix: "Mesh".to_string(),
                    mesh_password: "pw".to_string(),
                    mesh_port: 5555,
                    position: None,
                    firmware_config: BTreeMap::new(),
                })
                .unwrap();
        }

        let mut net = NetworkSimulator::new(7);
        net.set_default_latency(LatencyConfig::fixed(10)).unwrap();
        net.enqueue(NodeId::new(1001), NodeId::new(1002), "x", SimTime::ZERO);

        let snapshot = collect_snapshot(SimTime::from_secs(1), &manager, &net);
        MetricsReport {
            stats: SimulationStats::default(),
            nodes: snapshot.nodes.clone(),
            links: snapshot.links.clone(),
            snapshots: vec![snapshot],
        }
    }

    #[test]
    fn test_csv_export_has_node_rows() {
        let report = sample_report();
        let mut out = Vec::new();
        export_csv(&report, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("name,id,type"));
        assert!(lines[1].starts_with("alpha,1001,sensor"));
    }

    #[test]
    fn test_json_export_round_trips() {
        let report = sample_report();
        let mut out = Vec::new();
        export_json(&report, &mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(value["links"].as_array().unwrap().len(), 1);
        assert_eq!(value["links"][0]["delivered_count"], 1);
    }

    #[test]
    fn test_graphviz_export_shape() {
        let report = sample_report();
        let mut out = Vec::new();
        export_graphviz(&report, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("digraph meshsim {"));
        assert!(text.contains("n1001 [label=\"alpha"));
        assert!(text.contains("n1001 -> n1002"));
        assert!(text.trim_end().ends_with('}'));
    }
}
