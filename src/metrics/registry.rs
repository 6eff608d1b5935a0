// ============================================================================
// REGISTRY METRICS
// ============================================================================

use crate::context::ExporterContext;
use crate::error::ExporterResult;
use crate::metrics::{subscribe_gauge, subscribe_gauge_vec};
use crate::types::{EventKind, RegistryDisk};

const DISK: [(&str, &str, fn(&RegistryDisk) -> u64); 3] = [
    (
        "anka_registry_disk_free_space",
        "Anka Build Cloud Registry free disk space",
        |d| d.free,
    ),
    (
        "anka_registry_disk_total_space",
        "Anka Build Cloud Registry total disk size",
        |d| d.total,
    ),
    (
        "anka_registry_disk_used_space",
        "Anka Build Cloud Registry used disk space",
        RegistryDisk::used,
    ),
];

pub fn install(ctx: &ExporterContext) -> ExporterResult<()> {
    for (name, help, value) in DISK {
        subscribe_gauge(ctx, EventKind::RegistryDisk, name, help, move |payload, gauge| {
            gauge.set(value(payload.as_registry_disk()?) as f64);
            Ok(())
        })?;
    }

    subscribe_gauge(
        ctx,
        EventKind::RegistryTemplates,
        "anka_registry_template_count",
        "Count of VM Templates in the Registry",
        |payload, gauge| {
            gauge.set(payload.as_templates()?.len() as f64);
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::RegistryTemplates,
        "anka_registry_template_tags_count",
        "Count of Tags in the Registry for the Template",
        &["template_uuid", "template_name"],
        |payload, vec| {
            let templates = payload.as_templates()?;
            vec.reset_if_needed(templates.len());
            for template in templates {
                vec.set(&[&template.uuid, &template.name], template.tags.len() as f64);
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::RegistryTemplates,
        "anka_registry_template_disk_used",
        "Total disk usage of the Template in the Registry",
        &["template_uuid", "template_name"],
        |payload, vec| {
            let templates = payload.as_templates()?;
            vec.reset_if_needed(templates.len());
            for template in templates {
                vec.set(&[&template.uuid, &template.name], template.size as f64);
            }
            Ok(())
        },
    )?;

    subscribe_gauge_vec(
        ctx,
        EventKind::RegistryTemplates,
        "anka_registry_template_tag_disk_used",
        "Total disk used by the Template's Tag in the Registry",
        &["template_uuid", "template_name", "tag_name"],
        |payload, vec| {
            let templates = payload.as_templates()?;
            vec.reset_if_needed(templates.iter().map(|t| t.tags.len()).sum());
            for template in templates {
                for tag in &template.tags {
                    vec.set(&[&template.uuid, &template.name, &tag.name], tag.size as f64);
                }
            }
            Ok(())
        },
    )
}
