// ============================================================================
// CONTROLLER DATA MODEL
// ============================================================================
// Wire types for the controller REST API and the event kinds the poller
// publishes them under.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ExporterError, ExporterResult};

// ----------------------------------------------------------------------------
// Known Label Values
// ----------------------------------------------------------------------------

pub const NODE_STATES: [&str; 4] = ["Offline", "Inactive (Invalid License)", "Active", "Updating"];

pub const INSTANCE_STATES: [&str; 9] = [
    "Scheduling",
    "Pulling",
    "Started",
    "Stopping",
    "Stopped",
    "Terminating",
    "Terminated",
    "Error",
    "Pushing",
];

pub const ARCHITECTURES: [&str; 2] = ["amd64", "arm64"];

pub const CONTROLLER_STATES: [&str; 2] = ["Running", "FAIL"];

pub const REGISTRY_STATES: [&str; 2] = ["Running", "FAIL"];

// ----------------------------------------------------------------------------
// Event Kinds
// ----------------------------------------------------------------------------

/// Data domain a poll task fetches and handlers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Nodes,
    Instances,
    RegistryDisk,
    RegistryTemplates,
    Status,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Nodes,
        EventKind::Instances,
        EventKind::RegistryDisk,
        EventKind::RegistryTemplates,
        EventKind::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Nodes => "nodes",
            EventKind::Instances => "instances",
            EventKind::RegistryDisk => "registry_disk",
            EventKind::RegistryTemplates => "registry_templates",
            EventKind::Status => "status",
        }
    }

    /// Stable numeric id, starting at 1
    pub fn id(&self) -> u8 {
        match self {
            EventKind::Nodes => 1,
            EventKind::Instances => 2,
            EventKind::RegistryDisk => 3,
            EventKind::RegistryTemplates => 4,
            EventKind::Status => 5,
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for EventKind {
    type Error = ExporterError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.id() == id)
            .ok_or_else(|| ExporterError::UnknownEventKind(id.to_string()))
    }
}

impl FromStr for EventKind {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| ExporterError::UnknownEventKind(s.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Typed Payloads
// ----------------------------------------------------------------------------

/// A successful fetch, tagged with the domain it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Nodes(Vec<Node>),
    Instances(Vec<Instance>),
    RegistryDisk(RegistryDisk),
    RegistryTemplates(Vec<Template>),
    Status(Status),
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Nodes(_) => EventKind::Nodes,
            Payload::Instances(_) => EventKind::Instances,
            Payload::RegistryDisk(_) => EventKind::RegistryDisk,
            Payload::RegistryTemplates(_) => EventKind::RegistryTemplates,
            Payload::Status(_) => EventKind::Status,
        }
    }

    /// Number of top-level entities carried, for logging
    pub fn len(&self) -> usize {
        match self {
            Payload::Nodes(nodes) => nodes.len(),
            Payload::Instances(instances) => instances.len(),
            Payload::RegistryTemplates(templates) => templates.len(),
            Payload::RegistryDisk(_) | Payload::Status(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mismatch(&self, expected: EventKind) -> ExporterError {
        ExporterError::PayloadMismatch {
            expected,
            actual: self.kind(),
        }
    }

    pub fn as_nodes(&self) -> ExporterResult<&[Node]> {
        match self {
            Payload::Nodes(nodes) => Ok(nodes),
            other => Err(other.mismatch(EventKind::Nodes)),
        }
    }

    pub fn as_instances(&self) -> ExporterResult<&[Instance]> {
        match self {
            Payload::Instances(instances) => Ok(instances),
            other => Err(other.mismatch(EventKind::Instances)),
        }
    }

    pub fn as_registry_disk(&self) -> ExporterResult<&RegistryDisk> {
        match self {
            Payload::RegistryDisk(disk) => Ok(disk),
            other => Err(other.mismatch(EventKind::RegistryDisk)),
        }
    }

    pub fn as_templates(&self) -> ExporterResult<&[Template]> {
        match self {
            Payload::RegistryTemplates(templates) => Ok(templates),
            other => Err(other.mismatch(EventKind::RegistryTemplates)),
        }
    }

    pub fn as_status(&self) -> ExporterResult<&Status> {
        match self {
            Payload::Status(status) => Ok(status),
            other => Err(other.mismatch(EventKind::Status)),
        }
    }
}

// ----------------------------------------------------------------------------
// Response Envelope
// ----------------------------------------------------------------------------

/// `{status, message, body}` wrapper around every controller response.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
pub struct Envelope<T> {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub body: Option<T>,
}

// ----------------------------------------------------------------------------
// Nodes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub node_id: String,
    pub node_name: String,
    pub cpu_count: u64,
    /// GB
    pub ram: u64,
    pub vm_count: u64,
    pub used_vcpu_count: u64,
    pub vcpu_count: u64,
    /// MB
    pub used_vram: u64,
    pub vram: u64,
    pub cpu_util: f64,
    pub ram_util: f64,
    pub free_disk_space: u64,
    pub anka_disk_usage: u64,
    pub disk_size: u64,
    pub state: String,
    pub capacity: u64,
    pub groups: Vec<NodeGroup>,
    pub host_arch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroup {
    pub id: String,
    pub name: String,
}

// ----------------------------------------------------------------------------
// Instances
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub instance_id: String,
    pub vm: InstanceVm,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceVm {
    #[serde(rename = "instance_state")]
    pub state: String,
    #[serde(rename = "vmid")]
    pub template_uuid: String,
    /// Filled from the template cache, never sent by the controller
    #[serde(skip_deserializing)]
    pub template_name: String,
    pub group_id: String,
    pub node_id: String,
    pub arch: String,
    /// RFC3339 creation time
    pub cr_time: String,
    /// RFC3339 time of the last state change
    pub ts: String,
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDisk {
    pub total: u64,
    pub free: u64,
}

impl RegistryDisk {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Template {
    #[serde(rename = "id")]
    pub uuid: String,
    pub name: String,
    pub size: u64,
    /// Filled by a per-template tag request or the template cache
    #[serde(skip_deserializing)]
    pub tags: Vec<TemplateTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateTag {
    #[serde(rename = "tag")]
    pub name: String,
    pub size: u64,
}

/// Body of `/api/v1/registry/vm?id=<uuid>`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TemplateTags {
    pub versions: Vec<TemplateTag>,
}

// ----------------------------------------------------------------------------
// Controller Status
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub status: String,
    pub version: String,
    pub registry_address: String,
    pub registry_status: String,
    pub license: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_event_kind_lookup() {
        assert_eq!(EventKind::try_from(1).unwrap(), EventKind::Nodes);
        assert_eq!(EventKind::try_from(5).unwrap(), EventKind::Status);
        assert!(matches!(
            EventKind::try_from(9),
            Err(ExporterError::UnknownEventKind(_))
        ));
        assert_eq!("registry_disk".parse::<EventKind>().unwrap(), EventKind::RegistryDisk);
        assert!("vms".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_payload_accessors_reject_other_kinds() {
        let payload = Payload::Nodes(vec![Node::default()]);
        assert_eq!(payload.as_nodes().unwrap().len(), 1);
        assert!(matches!(
            payload.as_status(),
            Err(ExporterError::PayloadMismatch {
                expected: EventKind::Status,
                actual: EventKind::Nodes
            })
        ));
    }

    #[test]
    fn test_instance_decoding() {
        let raw = r#"{
            "instance_id": "i-1",
            "vm": {
                "instance_state": "Started",
                "vmid": "tpl-1",
                "node_id": "n-1",
                "arch": "arm64",
                "cr_time": "2024-01-01T00:00:00Z",
                "ts": "2024-01-01T00:05:00Z"
            }
        }"#;
        let instance: Instance = serde_json::from_str(raw).unwrap();

        assert_eq!(instance.vm.state, "Started");
        assert_eq!(instance.vm.template_uuid, "tpl-1");
        assert_eq!(instance.vm.template_name, "");
        assert_eq!(instance.vm.group_id, "");
    }

    #[test]
    fn test_envelope_without_body() {
        let envelope: Envelope<Vec<Node>> =
            serde_json::from_str(r#"{"status":"FAIL","message":"Authentication Required"}"#).unwrap();

        assert_eq!(envelope.status, "FAIL");
        assert_eq!(envelope.message, "Authentication Required");
        assert!(envelope.body.is_none());
    }

    #[test]
    fn test_registry_disk_used() {
        let disk = RegistryDisk { total: 100, free: 40 };
        assert_eq!(disk.used(), 60);
    }
}
