// ============================================================================
// INSTANCE METRICS
// ============================================================================
// Instance counts by state, broken down by architecture, template, group and
// node, plus the age of the oldest instance per template and state.
// ============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::error;

use crate::context::ExporterContext;
use crate::error::ExporterResult;
use crate::metrics::subscribe_gauge_vec;
use crate::types::{EventKind, Instance, InstanceVm, ARCHITECTURES, INSTANCE_STATES};

pub fn install(ctx: &ExporterContext) -> ExporterResult<()> {
    subscribe_gauge_vec(
        ctx,
        EventKind::Instances,
        "anka_instance_state_count",
        "Count of Instances in a particular State (label: arch, state)",
        &["arch", "state"],
        |payload, vec| {
            let instances = payload.as_instances()?;
            for arch in ARCHITECTURES {
                for state in INSTANCE_STATES {
                    let count = instances
                        .iter()
                        .filter(|i| i.vm.arch == arch && i.vm.state == state)
                        .count();
                    vec.set(&[arch, state], count as f64);
                }
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::Instances,
        "anka_instance_state_per_template_count",
        "Count of Instances in a particular state, per Template (label: state, template_uuid, template_name)",
        &["state", "template_uuid", "template_name"],
        |payload, vec| {
            let instances = payload.as_instances()?;
            let templates = template_names(instances);
            vec.reset_if_needed(instances.len() + templates.len());
            for state in INSTANCE_STATES {
                for (uuid, name) in &templates {
                    let count = count_where(instances, state, |vm| vm.template_uuid == *uuid);
                    vec.set(&[state, uuid, name], count as f64);
                }
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::Instances,
        "anka_instance_state_per_group_count",
        "Count of Instances in a particular state, per Group (label: state, group_uuid)",
        &["state", "group_uuid"],
        |payload, vec| {
            let instances = payload.as_instances()?;
            let groups = distinct(instances, |vm| &vm.group_id);
            vec.reset_if_needed(instances.len() + groups.len());
            for state in INSTANCE_STATES {
                for group in &groups {
                    let count = count_where(instances, state, |vm| vm.group_id == *group);
                    vec.set(&[state, group], count as f64);
                }
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::Instances,
        "anka_instance_state_per_node_count",
        "Count of Instances in a particular state, per Node (label: state, node_uuid)",
        &["state", "node_uuid"],
        |payload, vec| {
            let instances = payload.as_instances()?;
            let nodes = distinct(instances, |vm| &vm.node_id);
            vec.reset_if_needed(instances.len() + nodes.len());
            for state in INSTANCE_STATES {
                for node in &nodes {
                    let count = count_where(instances, state, |vm| vm.node_id == *node);
                    vec.set(&[state, node], count as f64);
                }
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::Instances,
        "anka_instance_max_age_per_template_seconds",
        "Age of oldest Instance in a particular state, per Template. Visible only for templates with at least one instance (label: state, template_uuid, template_name)",
        &["state", "template_uuid", "template_name"],
        |payload, vec| {
            let instances = payload.as_instances()?;
            let templates = template_names(instances);
            let now = Utc::now();
            vec.reset_if_needed(instances.len() + templates.len());
            for state in INSTANCE_STATES {
                for (uuid, name) in &templates {
                    let age = max_age(instances, state, uuid, now);
                    vec.set(&[state, uuid, name], age as f64);
                }
            }
            Ok(())
        },
    )
}

fn count_where<F>(instances: &[Instance], state: &str, matches: F) -> usize
where
    F: Fn(&InstanceVm) -> bool,
{
    instances
        .iter()
        .filter(|i| i.vm.state == state && matches(&i.vm))
        .count()
}

/// Distinct non-empty values of `key`, in first-seen order.
fn distinct<'a, F>(instances: &'a [Instance], key: F) -> Vec<&'a str>
where
    F: Fn(&'a InstanceVm) -> &'a String,
{
    let mut seen: Vec<&str> = Vec::new();
    for instance in instances {
        let value = key(&instance.vm).as_str();
        if !value.is_empty() && !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

/// Template UUIDs in first-seen order, each with the last name reported
/// for it.
fn template_names(instances: &[Instance]) -> Vec<(&str, &str)> {
    let mut order: Vec<&str> = Vec::new();
    let mut names: HashMap<&str, &str> = HashMap::new();
    for instance in instances {
        let uuid = instance.vm.template_uuid.as_str();
        if names.insert(uuid, instance.vm.template_name.as_str()).is_none() {
            order.push(uuid);
        }
    }
    order.into_iter().map(|uuid| (uuid, names[uuid])).collect()
}

/// Whole seconds since the oldest matching instance's reference time, or 0.
///
/// Started and Scheduling instances are aged from creation; every other
/// state from the last update. Unparsable timestamps are logged and skipped.
pub(crate) fn max_age(instances: &[Instance], state: &str, template_uuid: &str, now: DateTime<Utc>) -> i64 {
    instances
        .iter()
        .filter(|i| i.vm.state == state && i.vm.template_uuid == template_uuid)
        .filter_map(|i| {
            let (field, raw) = match i.vm.state.as_str() {
                "Started" | "Scheduling" => ("cr_time", &i.vm.cr_time),
                _ => ("ts", &i.vm.ts),
            };
            match DateTime::parse_from_rfc3339(raw) {
                Ok(at) => Some((now - at.with_timezone(&Utc)).num_seconds()),
                Err(e) => {
                    error!(
                        target: "anka_exporter::metrics",
                        instance = %i.instance_id,
                        template = template_uuid,
                        field = field,
                        value = %raw,
                        error = %e,
                        "Unparsable instance timestamp"
                    );
                    None
                }
            }
        })
        .fold(0, i64::max)
}
