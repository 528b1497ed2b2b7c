//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use scm_node::{
    Collaborators, DatanodeHeartbeat, DatanodeId, DatanodeIdentity, EventPublisher,
    FinalizationCheckpoint, FlatTopology, LayoutVersionReport, ManualClock, NodeError, NodeEvent,
    NodeManager, NodeManagerConfig, NodeOperationalState, NodeReport, NodeResolver, NotLeaderError,
    PipelineId, PipelineManager, RegisterErrorCode, ScmContext, StaticLayoutVersions,
    StorageConfig, StorageReport, StorageType,
};
use uuid::Uuid;

pub const CLUSTER_ID: &str = "CID-7d1f7c2e";
pub const SCM_ID: &str = "SCM-0a93d2";
pub const SCM_SLV: i32 = 3;
pub const SCM_MLV: i32 = 3;

/// Publisher that records every event for later assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<NodeEvent>>,
}

impl RecordingPublisher {
    /// Drain and return everything recorded so far.
    pub fn take(&self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl EventPublisher for RecordingPublisher {
    fn fire(&self, event: NodeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Consensus context whose leadership, term and finalization checkpoint
/// the test scripts.
pub struct ScriptedContext {
    leader: AtomicBool,
    term: AtomicU64,
    checkpoint: Mutex<FinalizationCheckpoint>,
}

impl Default for ScriptedContext {
    fn default() -> Self {
        Self {
            leader: AtomicBool::new(true),
            term: AtomicU64::new(1),
            checkpoint: Mutex::new(FinalizationCheckpoint::PreFinalize),
        }
    }
}

impl ScriptedContext {
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }

    pub fn set_checkpoint(&self, checkpoint: FinalizationCheckpoint) {
        *self.checkpoint.lock().unwrap() = checkpoint;
    }
}

impl ScmContext for ScriptedContext {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn term_of_leader(&self) -> Result<u64, NotLeaderError> {
        if self.is_leader() {
            Ok(self.term.load(Ordering::SeqCst))
        } else {
            Err(NotLeaderError)
        }
    }

    fn finalization_checkpoint(&self) -> FinalizationCheckpoint {
        *self.checkpoint.lock().unwrap()
    }
}

/// Pipeline manager backed by a scripted membership map.
#[derive(Default)]
pub struct StaticPipelines {
    pipelines: Mutex<HashMap<PipelineId, Vec<DatanodeId>>>,
}

impl StaticPipelines {
    pub fn insert(&self, pipeline: PipelineId, members: Vec<DatanodeId>) {
        self.pipelines.lock().unwrap().insert(pipeline, members);
    }
}

impl PipelineManager for StaticPipelines {
    fn pipeline_nodes(&self, pipeline: PipelineId) -> Result<Vec<DatanodeId>, NodeError> {
        self.pipelines
            .lock()
            .unwrap()
            .get(&pipeline)
            .cloned()
            .ok_or(NodeError::PipelineNotFound(pipeline))
    }
}

pub struct Harness {
    pub manager: Arc<NodeManager>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingPublisher>,
    pub context: Arc<ScriptedContext>,
    pub pipelines: Arc<StaticPipelines>,
}

pub fn harness() -> Harness {
    harness_with(NodeManagerConfig::default(), Box::new(|_| None))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with(config: NodeManagerConfig, resolver: NodeResolver) -> Harness {
    init_tracing();
    let clock = Arc::new(ManualClock::at(0));
    let events = Arc::new(RecordingPublisher::default());
    let context = Arc::new(ScriptedContext::default());
    let pipelines = Arc::new(StaticPipelines::default());

    let manager = NodeManager::new(
        config,
        Collaborators {
            storage: StorageConfig {
                cluster_id: CLUSTER_ID.to_string(),
                scm_id: SCM_ID.to_string(),
            },
            publisher: Arc::clone(&events) as Arc<dyn EventPublisher>,
            topology: Arc::new(FlatTopology::default()),
            scm_context: Arc::clone(&context) as Arc<dyn ScmContext>,
            clock: Arc::clone(&clock) as Arc<dyn scm_node::Clock>,
            layout_versions: Arc::new(StaticLayoutVersions {
                software_layout_version: SCM_SLV,
                metadata_layout_version: SCM_MLV,
            }),
            pipeline_manager: Arc::clone(&pipelines) as Arc<dyn PipelineManager>,
            resolver,
        },
    )
    .expect("valid registry config");

    Harness {
        manager,
        clock,
        events,
        context,
        pipelines,
    }
}

pub fn identity(n: u128, host: &str, ip: &str) -> DatanodeIdentity {
    DatanodeIdentity::new(Uuid::from_u128(n), host, ip)
}

pub fn scm_layout() -> LayoutVersionReport {
    LayoutVersionReport {
        software_layout_version: SCM_SLV,
        metadata_layout_version: SCM_MLV,
    }
}

pub fn layout(slv: i32, mlv: i32) -> LayoutVersionReport {
    LayoutVersionReport {
        software_layout_version: slv,
        metadata_layout_version: mlv,
    }
}

pub fn disk_report(capacity: u64, used: u64) -> NodeReport {
    NodeReport {
        storage_reports: vec![StorageReport {
            storage_type: StorageType::Disk,
            capacity,
            used,
            remaining: capacity - used,
            healthy: true,
        }],
        metadata_storage_reports: vec![StorageReport {
            storage_type: StorageType::Ssd,
            capacity: 64,
            used: 1,
            remaining: 63,
            healthy: true,
        }],
    }
}

pub fn heartbeat(identity: &DatanodeIdentity) -> DatanodeHeartbeat {
    DatanodeHeartbeat {
        identity: identity.clone(),
        reported_op_state: NodeOperationalState::InService,
        reported_op_state_expiry_epoch_sec: 0,
        layout: scm_layout(),
        command_queue_report: None,
    }
}

/// Register a node with a default disk report and assert success.
pub fn register_ok(harness: &Harness, identity: &DatanodeIdentity) {
    let response = harness.manager.register(
        identity.clone(),
        Some(&disk_report(1_000, 100)),
        &[],
        scm_layout(),
        None,
    );
    assert_eq!(response.error_code, RegisterErrorCode::Success);
}
