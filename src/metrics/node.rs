// ============================================================================
// NODE METRICS
// ============================================================================
// Per-node gauges, fleet totals, node states and per-group rollups, all fed
// by the nodes event.
// ============================================================================

use crate::context::ExporterContext;
use crate::error::ExporterResult;
use crate::metrics::{subscribe_gauge, subscribe_gauge_vec};
use crate::types::{EventKind, Node, NodeGroup, ARCHITECTURES, NODE_STATES};

/// A gauge whose value is read off one node.
struct NodeGauge {
    name: &'static str,
    help: &'static str,
    value: fn(&Node) -> f64,
}

const PER_NODE: [NodeGauge; 11] = [
    NodeGauge {
        name: "anka_node_instance_count",
        help: "Count of Instances running on the Node",
        value: |n| n.vm_count as f64,
    },
    NodeGauge {
        name: "anka_node_instance_capacity",
        help: "Total Instance slots (capacity) on the Node",
        value: |n| n.capacity as f64,
    },
    NodeGauge {
        name: "anka_node_disk_free_space",
        help: "Amount of free disk space on the Node in Bytes",
        value: |n| n.free_disk_space as f64,
    },
    NodeGauge {
        name: "anka_node_disk_total_space",
        help: "Amount of total available disk space on the Node in Bytes",
        value: |n| n.disk_size as f64,
    },
    NodeGauge {
        name: "anka_node_disk_anka_used_space",
        help: "Amount of disk space used by Anka on the Node in Bytes",
        value: |n| n.anka_disk_usage as f64,
    },
    NodeGauge {
        name: "anka_node_cpu_core_count",
        help: "Number of CPU Cores in Node",
        value: |n| n.cpu_count as f64,
    },
    NodeGauge {
        name: "anka_node_cpu_util",
        help: "CPU utilization in node",
        value: |n| n.cpu_util,
    },
    NodeGauge {
        name: "anka_node_ram_gb",
        help: "Total RAM available for the Node in GB",
        value: |n| n.ram as f64,
    },
    NodeGauge {
        name: "anka_node_ram_util",
        help: "Total RAM utilized for the Node",
        value: |n| n.ram_util,
    },
    NodeGauge {
        name: "anka_node_used_virtual_cpu_count",
        help: "Total Used Virtual CPU cores for the Node",
        value: |n| n.used_vcpu_count as f64,
    },
    NodeGauge {
        name: "anka_node_used_virtual_ram_mb",
        help: "Total Used Virtual RAM for the Node in MB",
        value: |n| n.used_vram as f64,
    },
];

/// Summed over every node.
const FLEET: [NodeGauge; 11] = [
    NodeGauge {
        name: "anka_nodes_instance_count",
        help: "Count of Instance slots in use across all Nodes",
        value: |n| n.vm_count as f64,
    },
    NodeGauge {
        name: "anka_nodes_instance_capacity",
        help: "Count of total Instance Capacity across all Nodes",
        value: |n| n.capacity as f64,
    },
    NodeGauge {
        name: "anka_nodes_disk_free_space",
        help: "Amount of free disk space across all Nodes in Bytes",
        value: |n| n.free_disk_space as f64,
    },
    NodeGauge {
        name: "anka_nodes_disk_total_space",
        help: "Amount of total available disk space across all Nodes in Bytes",
        value: |n| n.disk_size as f64,
    },
    NodeGauge {
        name: "anka_nodes_disk_anka_used_space",
        help: "Amount of disk space used by Anka across all Nodes in Bytes",
        value: |n| n.anka_disk_usage as f64,
    },
    NodeGauge {
        name: "anka_nodes_cpu_core_count",
        help: "Count of CPU Cores across all Nodes",
        value: |n| n.cpu_count as f64,
    },
    NodeGauge {
        name: "anka_nodes_cpu_util",
        help: "Total CPU utilization across all Nodes",
        value: |n| n.cpu_util,
    },
    NodeGauge {
        name: "anka_nodes_ram_gb",
        help: "Total RAM available across all Nodes in GB",
        value: |n| n.ram as f64,
    },
    NodeGauge {
        name: "anka_nodes_ram_util",
        help: "Total RAM utilized across all Nodes",
        value: |n| n.ram_util,
    },
    NodeGauge {
        name: "anka_nodes_virtual_cpu_count",
        help: "Total Virtual CPU cores across all Nodes",
        value: |n| n.vcpu_count as f64,
    },
    NodeGauge {
        name: "anka_nodes_virtual_ram_gb",
        help: "Total Virtual RAM across all Nodes",
        value: |n| n.vram as f64,
    },
];

/// Summed over the nodes of each group.
const PER_GROUP: [NodeGauge; 11] = [
    NodeGauge {
        name: "anka_node_group_instance_capacity",
        help: "Total Instance slots (capacity) for the Group and its Nodes",
        value: |n| n.capacity as f64,
    },
    NodeGauge {
        name: "anka_node_group_instance_count",
        help: "Count of Instances slots in use for the Group (and Nodes)",
        value: |n| n.vm_count as f64,
    },
    NodeGauge {
        name: "anka_node_group_disk_free_space",
        help: "Amount of free disk space for the Group (and Nodes) in Bytes",
        value: |n| n.free_disk_space as f64,
    },
    NodeGauge {
        name: "anka_node_group_disk_total_space",
        help: "Amount of total available disk space for the Group (and Nodes) in Bytes",
        value: |n| n.disk_size as f64,
    },
    NodeGauge {
        name: "anka_node_group_disk_anka_used_space",
        help: "Amount of disk space used by Anka for the Group (and Nodes) in Bytes",
        value: |n| n.anka_disk_usage as f64,
    },
    NodeGauge {
        name: "anka_node_group_cpu_core_count",
        help: "Number of CPU Cores for the Group (and Nodes)",
        value: |n| n.cpu_count as f64,
    },
    NodeGauge {
        name: "anka_node_group_cpu_util",
        help: "CPU utilization for the Group (and Nodes)",
        value: |n| n.cpu_util,
    },
    NodeGauge {
        name: "anka_node_group_ram_gb",
        help: "Total RAM available for the Group (and Nodes) in GB",
        value: |n| n.ram as f64,
    },
    NodeGauge {
        name: "anka_node_group_ram_util",
        help: "Total RAM utilized for the Group (and Nodes)",
        value: |n| n.ram_util,
    },
    NodeGauge {
        name: "anka_node_group_virtual_cpu_count",
        help: "Total Virtual CPU cores for the Group (and Nodes)",
        value: |n| n.vcpu_count as f64,
    },
    NodeGauge {
        name: "anka_node_group_virtual_ram_gb",
        help: "Total Virtual RAM for the Group (and Nodes) in GB",
        value: |n| n.vram as f64,
    },
];

const NODE_LABELS: [&str; 3] = ["id", "name", "arch"];

pub fn install(ctx: &ExporterContext) -> ExporterResult<()> {
    install_per_node(ctx)?;
    install_fleet(ctx)?;
    install_states(ctx)?;
    install_groups(ctx)
}

/// Nodes that have registered a name; unnamed nodes are still joining.
fn named(nodes: &[Node]) -> impl Iterator<Item = &Node> {
    nodes.iter().filter(|n| !n.node_name.is_empty())
}

fn install_per_node(ctx: &ExporterContext) -> ExporterResult<()> {
    for gauge in PER_NODE {
        let value = gauge.value;
        subscribe_gauge_vec(ctx, EventKind::Nodes, gauge.name, gauge.help, &NODE_LABELS, move |payload, vec| {
            let nodes = payload.as_nodes()?;
            vec.reset_if_needed(nodes.len());
            for node in named(nodes) {
                vec.set(
                    &[&node.node_id, &node.node_name, &node.host_arch],
                    value(node),
                );
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn install_fleet(ctx: &ExporterContext) -> ExporterResult<()> {
    subscribe_gauge(
        ctx,
        EventKind::Nodes,
        "anka_nodes_count",
        "Count of total Anka Nodes",
        |payload, gauge| {
            gauge.set(payload.as_nodes()?.len() as f64);
            Ok(())
        },
    )?;

    for total in FLEET {
        let value = total.value;
        subscribe_gauge(ctx, EventKind::Nodes, total.name, total.help, move |payload, gauge| {
            gauge.set(payload.as_nodes()?.iter().map(value).sum());
            Ok(())
        })?;
    }
    Ok(())
}

fn install_states(ctx: &ExporterContext) -> ExporterResult<()> {
    subscribe_gauge_vec(
        ctx,
        EventKind::Nodes,
        "anka_node_states_count",
        "Count of Nodes in a particular State (label: arch, state)",
        &["arch", "state"],
        |payload, vec| {
            let nodes = payload.as_nodes()?;
            for arch in ARCHITECTURES {
                for state in NODE_STATES {
                    let count = nodes
                        .iter()
                        .filter(|n| n.host_arch == arch && n.state == state)
                        .count();
                    vec.set(&[arch, state], count as f64);
                }
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::Nodes,
        "anka_node_states",
        "Node state (1 = current state) (label: id, name, state)",
        &["id", "name", "state"],
        |payload, vec| {
            let nodes = payload.as_nodes()?;
            vec.reset_if_needed(nodes.len());
            for node in named(nodes) {
                for state in NODE_STATES {
                    let current = if node.state == state { 1.0 } else { 0.0 };
                    vec.set(&[&node.node_id, &node.node_name, state], current);
                }
            }
            Ok(())
        },
    )
}

/// Distinct groups across all nodes, in first-seen order.
pub(crate) fn unique_groups(nodes: &[Node]) -> Vec<&NodeGroup> {
    let mut groups: Vec<&NodeGroup> = Vec::new();
    for group in nodes.iter().flat_map(|n| n.groups.iter()) {
        if !groups.contains(&group) {
            groups.push(group);
        }
    }
    groups
}

fn members<'a>(nodes: &'a [Node], group: &'a NodeGroup) -> impl Iterator<Item = &'a Node> {
    nodes
        .iter()
        .filter(move |n| n.groups.iter().any(|g| g.id == group.id))
}

fn install_groups(ctx: &ExporterContext) -> ExporterResult<()> {
    subscribe_gauge_vec(
        ctx,
        EventKind::Nodes,
        "anka_node_group_nodes_count",
        "Count of Nodes in a particular Group",
        &["group_name"],
        |payload, vec| {
            let nodes = payload.as_nodes()?;
            let groups = unique_groups(nodes);
            vec.reset_if_needed(groups.len() + nodes.len());
            for group in groups {
                vec.set(&[&group.name], members(nodes, group).count() as f64);
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::Nodes,
        "anka_node_group_states_count",
        "Count of Groups in a particular state (labels: group, state)",
        &["group_name", "state"],
        |payload, vec| {
            let nodes = payload.as_nodes()?;
            let groups = unique_groups(nodes);
            vec.reset_if_needed(groups.len() + nodes.len());
            for group in groups {
                for state in NODE_STATES {
                    let count = members(nodes, group).filter(|n| n.state == state).count();
                    vec.set(&[&group.name, state], count as f64);
                }
            }
            Ok(())
        },
    )?;

    for gauge in PER_GROUP {
        let value = gauge.value;
        subscribe_gauge_vec(ctx, EventKind::Nodes, gauge.name, gauge.help, &["group_name"], move |payload, vec| {
            let nodes = payload.as_nodes()?;
            let groups = unique_groups(nodes);
            vec.reset_if_needed(groups.len() + nodes.len());
            for group in groups {
                vec.set(&[&group.name], members(nodes, group).map(value).sum());
            }
            Ok(())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_util::{context, series, value};
    use crate::types::Payload;
    use pretty_assertions::assert_eq;

    fn node(id: &str, arch: &str, state: &str, groups: &[(&str, &str)]) -> Node {
        Node {
            node_id: id.into(),
            node_name: format!("node-{}", id),
            host_arch: arch.into(),
            state: state.into(),
            cpu_count: 8,
            vm_count: 1,
            capacity: 2,
            cpu_util: 0.25,
            groups: groups
                .iter()
                .map(|(id, name)| NodeGroup {
                    id: (*id).into(),
                    name: (*name).into(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_per_node_and_fleet_values() {
        let ctx = context();
        install(&ctx).unwrap();

        let mut unnamed = node("x", "amd64", "Active", &[]);
        unnamed.node_name.clear();
        let nodes = vec![
            node("a", "arm64", "Active", &[]),
            node("b", "amd64", "Offline", &[]),
            unnamed,
        ];
        ctx.bus.dispatch(&Payload::Nodes(nodes));

        // unnamed nodes count toward totals but get no series of their own
        assert_eq!(series(&ctx.registry, "anka_node_cpu_core_count").len(), 2);
        assert_eq!(
            value(&ctx.registry, "anka_node_instance_capacity", &[("id", "a"), ("arch", "arm64")]),
            Some(2.0)
        );
        assert_eq!(value(&ctx.registry, "anka_nodes_count", &[]), Some(3.0));
        assert_eq!(value(&ctx.registry, "anka_nodes_cpu_core_count", &[]), Some(24.0));
        assert_eq!(value(&ctx.registry, "anka_nodes_cpu_util", &[]), Some(0.75));
    }

    #[test]
    fn test_state_counts_cover_every_combination() {
        let ctx = context();
        install(&ctx).unwrap();

        ctx.bus.dispatch(&Payload::Nodes(vec![
            node("a", "arm64", "Active", &[]),
            node("b", "arm64", "Active", &[]),
            node("c", "amd64", "Offline", &[]),
        ]));

        assert_eq!(
            series(&ctx.registry, "anka_node_states_count").len(),
            ARCHITECTURES.len() * NODE_STATES.len()
        );
        assert_eq!(
            value(&ctx.registry, "anka_node_states_count", &[("arch", "arm64"), ("state", "Active")]),
            Some(2.0)
        );
        assert_eq!(
            value(&ctx.registry, "anka_node_states_count", &[("arch", "amd64"), ("state", "Active")]),
            Some(0.0)
        );
        assert_eq!(
            value(&ctx.registry, "anka_node_states", &[("id", "c"), ("state", "Offline")]),
            Some(1.0)
        );
        assert_eq!(
            value(&ctx.registry, "anka_node_states", &[("id", "c"), ("state", "Active")]),
            Some(0.0)
        );
    }

    #[test]
    fn test_group_rollups() {
        let ctx = context();
        install(&ctx).unwrap();

        ctx.bus.dispatch(&Payload::Nodes(vec![
            node("a", "arm64", "Active", &[("g1", "ci"), ("g2", "release")]),
            node("b", "arm64", "Offline", &[("g1", "ci")]),
            node("c", "arm64", "Active", &[]),
        ]));

        assert_eq!(value(&ctx.registry, "anka_node_group_nodes_count", &[("group_name", "ci")]), Some(2.0));
        assert_eq!(
            value(&ctx.registry, "anka_node_group_nodes_count", &[("group_name", "release")]),
            Some(1.0)
        );
        assert_eq!(
            value(&ctx.registry, "anka_node_group_instance_capacity", &[("group_name", "ci")]),
            Some(4.0)
        );
        assert_eq!(
            value(
                &ctx.registry,
                "anka_node_group_states_count",
                &[("group_name", "ci"), ("state", "Offline")]
            ),
            Some(1.0)
        );
    }

    #[test]
    fn test_unique_groups_keeps_first_seen_order() {
        let nodes = vec![
            node("a", "arm64", "Active", &[("g2", "b"), ("g1", "a")]),
            node("b", "arm64", "Active", &[("g1", "a")]),
        ];
        let ids: Vec<_> = unique_groups(&nodes).iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["g2", "g1"]);
    }
}
