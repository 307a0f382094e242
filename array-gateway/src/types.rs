//! Array object model.
//!
//! Plain data types mirroring the objects exposed by the array management API:
//! volumes, storage groups, hosts, masking views, port groups, ports, storage
//! pools, snapshots and asynchronous jobs.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Size of one allocation unit (cylinder) in bytes.
pub const CYLINDER_SIZE_BYTES: i64 = 1_966_080;

/// Convert a byte count to whole cylinders, rounding up.
pub fn bytes_to_cylinders(bytes: i64) -> i64 {
    if bytes <= 0 {
        return 0;
    }
    (bytes + CYLINDER_SIZE_BYTES - 1) / CYLINDER_SIZE_BYTES
}

pub fn cylinders_to_bytes(cylinders: i64) -> i64 {
    cylinders.saturating_mul(CYLINDER_SIZE_BYTES)
}

// ============================================================================
// ObjectKind
// ============================================================================

/// Kind of array-side object, used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Volume,
    StorageGroup,
    MaskingView,
    Host,
    PortGroup,
    Port,
    StoragePool,
    Snapshot,
    Job,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Volume => "volume",
            ObjectKind::StorageGroup => "storage group",
            ObjectKind::MaskingView => "masking view",
            ObjectKind::Host => "host",
            ObjectKind::PortGroup => "port group",
            ObjectKind::Port => "port",
            ObjectKind::StoragePool => "storage pool",
            ObjectKind::Snapshot => "snapshot",
            ObjectKind::Job => "job",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Volumes and storage groups
// ============================================================================

/// A device on the array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Array-assigned device ID (e.g. `00501`)
    pub device_id: String,
    /// Human-readable identifier stored on the array (the CSI volume name)
    pub identifier: String,
    /// Capacity in cylinders
    pub capacity_cylinders: i64,
    /// World wide name of the device
    #[serde(default)]
    pub wwn: String,
    /// Storage groups this device belongs to
    #[serde(default)]
    pub storage_groups: Vec<String>,
}

impl Volume {
    pub fn capacity_bytes(&self) -> i64 {
        cylinders_to_bytes(self.capacity_cylinders)
    }
}

/// Parameters for creating a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub identifier: String,
    pub capacity_cylinders: i64,
    pub storage_group_id: String,
}

/// A named collection of devices sharing a provisioning policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGroup {
    pub id: String,
    /// Storage resource pool, if the group is FAST managed
    #[serde(default)]
    pub storage_pool: Option<String>,
    #[serde(default)]
    pub service_level: Option<String>,
    /// Device IDs of member volumes
    #[serde(default)]
    pub volume_ids: Vec<String>,
    /// Masking views referencing this group
    #[serde(default)]
    pub masking_views: Vec<String>,
}

impl StorageGroup {
    pub fn contains(&self, device_id: &str) -> bool {
        self.volume_ids.iter().any(|id| id == device_id)
    }

    pub fn is_masked(&self) -> bool {
        !self.masking_views.is_empty()
    }
}

// ============================================================================
// Hosts, port groups, masking views
// ============================================================================

/// Initiator protocol of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostType {
    Iscsi,
    FibreChannel,
}

impl HostType {
    /// Classify a single initiator: `iqn.`/`eui.` names are iSCSI, 16 hex
    /// digits are a Fibre Channel WWPN.
    pub fn of_initiator(initiator: &str) -> Option<Self> {
        let lower = initiator.to_ascii_lowercase();
        if lower.starts_with("iqn.") || lower.starts_with("eui.") {
            Some(HostType::Iscsi)
        } else if lower.len() == 16 && lower.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(HostType::FibreChannel)
        } else {
            None
        }
    }
}

impl Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Iscsi => write!(f, "ISCSI"),
            HostType::FibreChannel => write!(f, "FC"),
        }
    }
}

/// Array-side representation of a compute node's initiators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub host_type: HostType,
    pub initiators: Vec<String>,
}

/// A front-end director port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortKey {
    pub director_id: String,
    pub port_id: String,
}

impl Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.director_id, self.port_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub key: PortKey,
    /// iSCSI target name served by this port, if it is an iSCSI port
    #[serde(default)]
    pub iscsi_target: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroup {
    pub id: String,
    pub ports: Vec<PortKey>,
}

/// Binding of a storage group, host and port group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskingView {
    pub id: String,
    pub storage_group_id: String,
    pub host_id: String,
    pub port_group_id: String,
}

// ============================================================================
// Pools, snapshots, jobs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub total_cylinders: i64,
    #[serde(default)]
    pub used_cylinders: i64,
}

impl StoragePool {
    pub fn available_cylinders(&self) -> i64 {
        (self.total_cylinders - self.used_cylinders).max(0)
    }
}

/// Point-in-time copy of a source device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub source_device_id: String,
    pub size_cylinders: i64,
    /// Creation time, seconds since the Unix epoch
    pub created_at: i64,
}

pub type JobId = String;

/// Status of an asynchronous array-side job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Path of the resource the job acts on
    pub resource_link: String,
}
