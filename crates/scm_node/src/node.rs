//! Datanode identity, health/operational state, and the per-node record.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandType;

/// Stable identifier a datanode presents on every registration and heartbeat.
pub type DatanodeId = Uuid;

/// Identifier of a storage container hosted on a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container-{}", self.0)
    }
}

/// Identifier of a replication pipeline a datanode participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PipelineId(pub Uuid);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline-{}", self.0)
    }
}

/// Administrator-visible state of a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeOperationalState {
    InService,
    Decommissioning,
    Decommissioned,
    EnteringMaintenance,
    InMaintenance,
}

impl NodeOperationalState {
    pub const ALL: [NodeOperationalState; 5] = [
        NodeOperationalState::InService,
        NodeOperationalState::Decommissioning,
        NodeOperationalState::Decommissioned,
        NodeOperationalState::EnteringMaintenance,
        NodeOperationalState::InMaintenance,
    ];

    pub fn is_decommission(self) -> bool {
        matches!(
            self,
            NodeOperationalState::Decommissioning | NodeOperationalState::Decommissioned
        )
    }

    pub fn is_maintenance(self) -> bool {
        matches!(
            self,
            NodeOperationalState::EnteringMaintenance | NodeOperationalState::InMaintenance
        )
    }
}

impl fmt::Display for NodeOperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeOperationalState::InService => "IN_SERVICE",
            NodeOperationalState::Decommissioning => "DECOMMISSIONING",
            NodeOperationalState::Decommissioned => "DECOMMISSIONED",
            NodeOperationalState::EnteringMaintenance => "ENTERING_MAINTENANCE",
            NodeOperationalState::InMaintenance => "IN_MAINTENANCE",
        };
        f.write_str(name)
    }
}

/// Liveness of a datanode derived from heartbeat recency, plus the
/// read-only variant a node enters while its metadata layout lags the
/// cluster during an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeHealth {
    Healthy,
    HealthyReadonly,
    Stale,
    Dead,
}

impl NodeHealth {
    pub const ALL: [NodeHealth; 4] = [
        NodeHealth::Healthy,
        NodeHealth::HealthyReadonly,
        NodeHealth::Stale,
        NodeHealth::Dead,
    ];

    /// Demotion rank used by the health scanner. The scanner only ever
    /// moves a node to a strictly higher rank; heartbeats move it back.
    pub(crate) fn demotion_rank(self) -> u8 {
        match self {
            NodeHealth::Healthy | NodeHealth::HealthyReadonly => 0,
            NodeHealth::Stale => 1,
            NodeHealth::Dead => 2,
        }
    }
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeHealth::Healthy => "HEALTHY",
            NodeHealth::HealthyReadonly => "HEALTHY_READONLY",
            NodeHealth::Stale => "STALE",
            NodeHealth::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// Media class of a reported storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Disk,
    Ssd,
    Archive,
    RamDisk,
}

/// One per-volume usage report carried in a node report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageReport {
    pub storage_type: StorageType,
    pub capacity: u64,
    pub used: u64,
    pub remaining: u64,
    pub healthy: bool,
}

/// Identity of a datanode: immutable UUID plus its current addresses.
/// Both address parts may change across re-registrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatanodeIdentity {
    pub uuid: DatanodeId,
    pub host_name: String,
    pub ip_address: String,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
}

impl DatanodeIdentity {
    pub fn new(uuid: DatanodeId, host_name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            uuid,
            host_name: host_name.into(),
            ip_address: ip_address.into(),
            http_port: None,
            https_port: None,
        }
    }
}

impl fmt::Display for DatanodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}/{})", self.uuid, self.host_name, self.ip_address)
    }
}

/// Point-in-time status of a node: operational state, health and the
/// epoch-second at which the operational state expires (0 = never).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub operational_state: NodeOperationalState,
    pub health: NodeHealth,
    pub op_state_expiry_epoch_sec: u64,
}

impl NodeStatus {
    pub fn is_alive(&self) -> bool {
        self.health != NodeHealth::Dead
    }

    pub fn is_in_service(&self) -> bool {
        self.operational_state == NodeOperationalState::InService
    }

    pub fn is_decommission(&self) -> bool {
        self.operational_state.is_decommission()
    }

    pub fn is_maintenance(&self) -> bool {
        self.operational_state.is_maintenance()
    }
}

/// The registry's full view of one datanode.
///
/// `operational_state` is the SCM's authoritative value; the
/// `persisted_op_state` pair mirrors what the datanode last reported as
/// persisted on its own disk. The two drift apart while a state change
/// propagates and are reconciled on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatanodeRecord {
    pub identity: DatanodeIdentity,
    /// Rack path assigned by the network-location resolver, if any.
    pub network_location: Option<String>,
    pub operational_state: NodeOperationalState,
    pub op_state_expiry_epoch_sec: u64,
    pub persisted_op_state: NodeOperationalState,
    pub persisted_op_state_expiry_epoch_sec: u64,
    pub health: NodeHealth,
    pub last_heartbeat_ms: u64,
    pub software_layout_version: i32,
    pub metadata_layout_version: i32,
    pub storage_reports: Vec<StorageReport>,
    pub meta_storage_reports: Vec<StorageReport>,
    /// Per-type queued-command counts from the last command-queue report.
    pub command_counts: HashMap<CommandType, u64>,
    pub containers: HashSet<ContainerId>,
    pub pipelines: HashSet<PipelineId>,
}

impl DatanodeRecord {
    pub fn new(
        identity: DatanodeIdentity,
        network_location: Option<String>,
        software_layout_version: i32,
        metadata_layout_version: i32,
        registered_at_ms: u64,
    ) -> Self {
        Self {
            identity,
            network_location,
            operational_state: NodeOperationalState::InService,
            op_state_expiry_epoch_sec: 0,
            persisted_op_state: NodeOperationalState::InService,
            persisted_op_state_expiry_epoch_sec: 0,
            health: NodeHealth::Healthy,
            last_heartbeat_ms: registered_at_ms,
            software_layout_version,
            metadata_layout_version,
            storage_reports: Vec::new(),
            meta_storage_reports: Vec::new(),
            command_counts: HashMap::new(),
            containers: HashSet::new(),
            pipelines: HashSet::new(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            operational_state: self.operational_state,
            health: self.health,
            op_state_expiry_epoch_sec: self.op_state_expiry_epoch_sec,
        }
    }

    /// Number of data volumes currently reported healthy.
    pub fn healthy_volume_count(&self) -> usize {
        self.storage_reports.iter().filter(|r| r.healthy).count()
    }

    /// Number of metadata volumes in the last node report.
    pub fn metadata_volume_count(&self) -> usize {
        self.meta_storage_reports.len()
    }

    /// DN-reported queued count for one command type, `-1` when the
    /// datanode has never reported that type.
    pub fn reported_command_count(&self, command_type: CommandType) -> i64 {
        self.command_counts
            .get(&command_type)
            .map(|c| *c as i64)
            .unwrap_or(-1)
    }
}
