//! Metric families published on the scrape endpoint.
//!
//! Every family is built once, registered into the exporter's registry and
//! bound to its event through a closure on the bus. Labeled families go
//! through [`GuardedVec`] so vanished entities do not leave stale series.

pub mod instance;
pub mod node;
pub mod registry;
pub mod status;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use prometheus::{Gauge, GaugeVec, Opts};
use tracing::info;

use crate::cardinality::CardinalityGuard;
use crate::context::ExporterContext;
use crate::error::ExporterResult;
use crate::types::{EventKind, Payload};

/// A labeled gauge paired with the cardinality guard.
pub struct GuardedVec {
    name: &'static str,
    vec: GaugeVec,
    guard: Arc<CardinalityGuard>,
}

impl GuardedVec {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Clear the vector when `count` entities no longer match what was
    /// last written, or the reset TTL has passed.
    pub fn reset_if_needed(&self, count: usize) -> bool {
        self.guard.reset_vec_if_needed(self.name, count, &self.vec)
    }

    pub fn set(&self, labels: &[&str], value: f64) {
        self.vec.with_label_values(labels).set(value);
    }
}

impl Debug for GuardedVec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedVec").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Register a plain gauge and bind `update` to `kind`.
pub(crate) fn subscribe_gauge<F>(
    ctx: &ExporterContext,
    kind: EventKind,
    name: &'static str,
    help: &str,
    update: F,
) -> ExporterResult<()>
where
    F: Fn(&Payload, &Gauge) -> ExporterResult<()> + Send + Sync + 'static,
{
    let gauge = Gauge::new(name, help)?;
    ctx.registry.register(Box::new(gauge.clone()))?;
    ctx.bus.subscribe(kind, name, move |payload| update(payload, &gauge))
}

/// Register a labeled gauge and bind `update` to `kind`.
pub(crate) fn subscribe_gauge_vec<F>(
    ctx: &ExporterContext,
    kind: EventKind,
    name: &'static str,
    help: &str,
    labels: &[&str],
    update: F,
) -> ExporterResult<()>
where
    F: Fn(&Payload, &GuardedVec) -> ExporterResult<()> + Send + Sync + 'static,
{
    let vec = GaugeVec::new(Opts::new(name, help), labels)?;
    ctx.registry.register(Box::new(vec.clone()))?;
    let guarded = GuardedVec {
        name,
        vec,
        guard: ctx.cardinality.clone(),
    };
    ctx.bus.subscribe(kind, name, move |payload| update(payload, &guarded))
}

/// Build and subscribe every metric family.
pub fn install(ctx: &ExporterContext) -> ExporterResult<()> {
    node::install(ctx)?;
    instance::install(ctx)?;
    registry::install(ctx)?;
    status::install(ctx)?;

    info!(
        target: "anka_exporter::metrics",
        nodes = ctx.bus.handler_count(EventKind::Nodes),
        instances = ctx.bus.handler_count(EventKind::Instances),
        registry_disk = ctx.bus.handler_count(EventKind::RegistryDisk),
        registry_templates = ctx.bus.handler_count(EventKind::RegistryTemplates),
        status = ctx.bus.handler_count(EventKind::Status),
        "Metric handlers installed"
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::BTreeMap;

    use prometheus::Registry;

    use crate::config::{CardinalityConfig, PollingConfig};
    use crate::context::ExporterContext;

    pub(crate) fn context() -> ExporterContext {
        ExporterContext::new(&PollingConfig::default(), &CardinalityConfig::default())
    }

    /// Label set and value of every series of `name`
    pub(crate) fn series(registry: &Registry, name: &str) -> Vec<(BTreeMap<String, String>, f64)> {
        registry
            .gather()
            .into_iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().to_vec())
            .map(|metric| {
                let labels = metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                    .collect();
                (labels, metric.get_gauge().get_value())
            })
            .collect()
    }

    /// Value of the series of `name` whose labels include every pair in `labels`
    pub(crate) fn value(registry: &Registry, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        series(registry, name)
            .into_iter()
            .find(|(set, _)| {
                labels
                    .iter()
                    .all(|(k, v)| set.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(_, value)| value)
    }
}
