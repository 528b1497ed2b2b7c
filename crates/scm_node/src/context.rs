//! Ports the registry consumes from the rest of the control plane:
//! consensus context, layout versions, rack topology, pipeline lookups,
//! and the clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{NodeError, NotLeaderError};
use crate::node::{DatanodeId, DatanodeIdentity, PipelineId};

/// Monotonic epoch-millisecond time source.
///
/// Injected so tests and simulations can drive liveness deterministically.
pub trait Clock: Send + Sync {
    fn millis(&self) -> u64;
}

/// Wall-clock backed implementation.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }
}

/// Hand-advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn at(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: u64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Progress of the cluster-wide upgrade finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FinalizationCheckpoint {
    PreFinalize,
    FinalizationStarted,
    MlvEqualsSlv,
    FinalizationComplete,
}

impl FinalizationCheckpoint {
    /// Once the metadata layout version has caught up with the software
    /// layout version on the SCM, lagging datanodes can be told to
    /// finalize.
    pub fn datanodes_should_finalize(self) -> bool {
        self >= FinalizationCheckpoint::MlvEqualsSlv
    }
}

/// View of the consensus layer: whether this SCM replica currently
/// leads, and under which term commands may be stamped.
pub trait ScmContext: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Term to stamp leader-issued commands with. Fails when this
    /// replica is not (or no longer) the leader.
    fn term_of_leader(&self) -> Result<u64, NotLeaderError>;

    fn finalization_checkpoint(&self) -> FinalizationCheckpoint;
}

/// Layout versions the SCM itself is running.
pub trait LayoutVersionManager: Send + Sync {
    fn software_layout_version(&self) -> i32;
    fn metadata_layout_version(&self) -> i32;
}

/// Fixed layout versions, the common case outside an upgrade window.
#[derive(Debug, Clone, Copy)]
pub struct StaticLayoutVersions {
    pub software_layout_version: i32,
    pub metadata_layout_version: i32,
}

impl LayoutVersionManager for StaticLayoutVersions {
    fn software_layout_version(&self) -> i32 {
        self.software_layout_version
    }

    fn metadata_layout_version(&self) -> i32 {
        self.metadata_layout_version
    }
}

/// Rack-awareness topology. Every registered node must have a parent in
/// the topology; a missing parent after insertion is a programming error
/// the registry aborts on.
pub trait NetworkTopology: Send + Sync {
    fn add(&self, node: &DatanodeIdentity, network_location: Option<&str>);

    /// Re-home a node whose addresses or resolved location changed.
    fn update(
        &self,
        old: &DatanodeIdentity,
        new: &DatanodeIdentity,
        network_location: Option<&str>,
    );

    fn contains(&self, node: DatanodeId) -> bool;

    fn parent_of(&self, node: DatanodeId) -> Option<String>;
}

/// Single-rack topology: every node parents under one default rack.
/// Sufficient for clusters without rack awareness configured.
#[derive(Debug, Default)]
pub struct FlatTopology {
    racks: Mutex<HashMap<DatanodeId, String>>,
}

pub const DEFAULT_RACK: &str = "/default-rack";

impl NetworkTopology for FlatTopology {
    fn add(&self, node: &DatanodeIdentity, network_location: Option<&str>) {
        let rack = network_location.unwrap_or(DEFAULT_RACK).to_string();
        self.racks.lock().unwrap().insert(node.uuid, rack);
    }

    fn update(
        &self,
        _old: &DatanodeIdentity,
        new: &DatanodeIdentity,
        network_location: Option<&str>,
    ) {
        self.add(new, network_location);
    }

    fn contains(&self, node: DatanodeId) -> bool {
        self.racks.lock().unwrap().contains_key(&node)
    }

    fn parent_of(&self, node: DatanodeId) -> Option<String> {
        self.racks.lock().unwrap().get(&node).cloned()
    }
}

/// Pipeline membership lookups, used for peer-list computation.
pub trait PipelineManager: Send + Sync {
    /// Member datanodes of a pipeline, or `NodeError::PipelineNotFound`.
    fn pipeline_nodes(&self, pipeline: PipelineId) -> Result<Vec<DatanodeId>, NodeError>;
}

/// Maps a datanode address (hostname or IP, per configuration) to a rack
/// path. `None` means unresolved, which is allowed.
pub type NodeResolver = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Identity of this SCM deployment, reported to datanodes at version
/// probe and registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub cluster_id: String,
    pub scm_id: String,
}
