//! Datanode registry and command dispatch core of the storage container
//! manager (SCM) control plane.
//!
//! Storage nodes heartbeat into this registry; it tracks each node's
//! identity, health, operational state, layout versions, storage usage
//! and container/pipeline membership, drives the healthy → stale → dead
//! state machine from heartbeat age, reconciles operational-state drift
//! between SCM replicas and the nodes themselves, and hands every node a
//! batch of queued commands on each heartbeat.
//!
//! The RPC transport, pipeline placement, container replication,
//! persistence and leader election all live elsewhere and are consumed
//! through the ports in [`context`].

pub mod command;
pub mod context;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod node;
pub mod stats;
pub mod table;

pub use command::{CommandForDatanode, CommandPayload, CommandQueue, CommandType, ScmCommand};
pub use context::{
    Clock, FinalizationCheckpoint, FlatTopology, LayoutVersionManager, ManualClock,
    NetworkTopology, NodeResolver, PipelineManager, ScmContext, StaticLayoutVersions,
    StorageConfig, SystemClock,
};
pub use error::{NodeError, NotLeaderError};
pub use events::{ChannelEventPublisher, EventPublisher, NodeEvent, NullEventPublisher};
pub use health::{HealthConfig, HealthScannerHandle};
pub use manager::{
    Collaborators, NodeManager, NodeManagerConfig, NodeStatusSummary, SCM_PROTOCOL_VERSION,
};
pub use message::{
    CommandQueueReport, DatanodeHeartbeat, LayoutVersionReport, NodeReport, PeerAddress,
    PipelineReport, RegisterErrorCode, RegisterResponse, VersionResponse,
};
pub use metrics::MetricsSnapshot;
pub use node::{
    ContainerId, DatanodeId, DatanodeIdentity, DatanodeRecord, NodeHealth, NodeOperationalState,
    NodeStatus, PipelineId, StorageReport, StorageType,
};
pub use stats::{DatanodeUsageInfo, NodeStat};
pub use table::NodeTable;
