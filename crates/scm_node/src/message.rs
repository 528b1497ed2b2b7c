//! Typed request/response values exchanged with datanodes.
//!
//! The RPC layer decodes wire messages into these shapes before calling
//! the registry; the shapes are kept stable for wire compatibility.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::command::CommandType;
use crate::node::{DatanodeIdentity, NodeOperationalState, PipelineId, StorageReport};

/// Layout versions a datanode reports on registration and every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutVersionReport {
    pub software_layout_version: i32,
    pub metadata_layout_version: i32,
}

/// Storage usage report: one entry per data volume plus one per metadata
/// volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub storage_reports: Vec<StorageReport>,
    pub metadata_storage_reports: Vec<StorageReport>,
}

/// Per-type counts of commands still queued on the datanode itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandQueueReport {
    pub counts: HashMap<CommandType, u64>,
}

/// Pipeline membership as reported by the datanode at registration.
/// The registry only acknowledges these; pipeline reconciliation is the
/// pipeline manager's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline: PipelineId,
}

/// Peer address of the registering datanode as observed by the RPC
/// transport, when available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host_name: String,
    pub ip_address: String,
}

/// Everything a heartbeat carries into the registry.
#[derive(Debug, Clone)]
pub struct DatanodeHeartbeat {
    pub identity: DatanodeIdentity,
    /// Operational state the datanode has persisted on its own disk.
    pub reported_op_state: NodeOperationalState,
    pub reported_op_state_expiry_epoch_sec: u64,
    pub layout: LayoutVersionReport,
    pub command_queue_report: Option<CommandQueueReport>,
}

/// Outcome code of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterErrorCode {
    Success,
    ErrorNodeNotPermitted,
}

/// Response to a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub error_code: RegisterErrorCode,
    pub datanode: DatanodeIdentity,
    pub cluster_id: String,
}

/// Response to a version probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: u32,
    pub scm_id: String,
    pub cluster_id: String,
}
