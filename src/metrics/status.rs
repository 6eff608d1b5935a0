// ============================================================================
// STATUS METRICS
// ============================================================================
// One-hot state gauges for the controller and its registry.
// ============================================================================

use crate::context::ExporterContext;
use crate::error::ExporterResult;
use crate::metrics::subscribe_gauge_vec;
use crate::types::{EventKind, CONTROLLER_STATES, REGISTRY_STATES};

pub fn install(ctx: &ExporterContext) -> ExporterResult<()> {
    subscribe_gauge_vec(
        ctx,
        EventKind::Status,
        "anka_controller_state_count",
        "Status of the Anka Controller",
        &["state"],
        |payload, vec| {
            let status = payload.as_status()?;
            for state in CONTROLLER_STATES {
                vec.set(&[state], if status.status == state { 1.0 } else { 0.0 });
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::Status,
        "anka_registry_state_count",
        "Status of the Anka Registry",
        &["state"],
        |payload, vec| {
            let status = payload.as_status()?;
            for state in REGISTRY_STATES {
                vec.set(&[state], if status.registry_status == state { 1.0 } else { 0.0 });
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_util::{context, value};
    use crate::types::{Payload, Status};

    #[test]
    fn test_one_hot_states() {
        let ctx = context();
        install(&ctx).unwrap();

        ctx.bus.dispatch(&Payload::Status(Status {
            status: "Running".into(),
            registry_status: "FAIL".into(),
            ..Default::default()
        }));

        let registry = &ctx.registry;
        assert_eq!(value(registry, "anka_controller_state_count", &[("state", "Running")]), Some(1.0));
        assert_eq!(value(registry, "anka_controller_state_count", &[("state", "FAIL")]), Some(0.0));
        assert_eq!(value(registry, "anka_registry_state_count", &[("state", "FAIL")]), Some(1.0));
        assert_eq!(value(registry, "anka_registry_state_count", &[("state", "Running")]), Some(0.0));
    }
}
