//! The datanode registry facade: registration, heartbeat processing,
//! report routing, command dispatch, and the read-side query surface.
//!
//! Get-style queries copy node maps and return lists built from those
//! copies. Treat every result as a snapshot that is inconsistent as soon
//! as it is read: counting a partition and then listing it can disagree,
//! and per-state counts need not sum to the total.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::command::{CommandForDatanode, CommandPayload, CommandQueue, CommandType, ScmCommand};
use crate::context::{
    Clock, LayoutVersionManager, NetworkTopology, NodeResolver, PipelineManager, ScmContext,
    StorageConfig,
};
use crate::error::NodeError;
use crate::events::{EventPublisher, NodeEvent};
use crate::health::{self, HealthConfig, HealthScannerHandle};
use crate::message::{
    CommandQueueReport, DatanodeHeartbeat, LayoutVersionReport, NodeReport, PeerAddress,
    PipelineReport, RegisterErrorCode, RegisterResponse, VersionResponse,
};
use crate::metrics::{MetricsSnapshot, NodeManagerMetrics};
use crate::node::{
    ContainerId, DatanodeId, DatanodeIdentity, DatanodeRecord, NodeHealth, NodeOperationalState,
    NodeStatus, PipelineId,
};
use crate::stats::{self, DatanodeUsageInfo, NodeStat};
use crate::table::NodeTable;

/// Version of the SCM/datanode protocol reported by `get_version`.
pub const SCM_PROTOCOL_VERSION: u32 = 1;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    /// Use the hostname instead of the IP address when resolving a
    /// node's network location and deriving its identity from the peer
    /// address.
    pub use_hostname: bool,
    /// Pipelines allowed per metadata volume when deriving a node's
    /// pipeline limit from its reported volumes.
    pub pipelines_per_metadata_volume: u32,
    /// Fixed per-node pipeline limit; zero derives the limit from the
    /// node's reported volumes instead.
    pub datanode_pipeline_limit: u32,
    pub health: HealthConfig,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            use_hostname: false,
            pipelines_per_metadata_volume: 2,
            datanode_pipeline_limit: 0,
            health: HealthConfig::default(),
        }
    }
}

impl NodeManagerConfig {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.health.stale_threshold < self.health.dead_threshold,
            "stale threshold {:?} must be below dead threshold {:?}",
            self.health.stale_threshold,
            self.health.dead_threshold
        );
        anyhow::ensure!(
            !self.health.scan_interval.is_zero(),
            "health scan interval must be non-zero"
        );
        anyhow::ensure!(
            self.pipelines_per_metadata_volume >= 1,
            "pipelines per metadata volume must be at least 1"
        );
        Ok(())
    }
}

/// External collaborators the registry consumes.
pub struct Collaborators {
    pub storage: StorageConfig,
    pub publisher: Arc<dyn EventPublisher>,
    pub topology: Arc<dyn NetworkTopology>,
    pub scm_context: Arc<dyn ScmContext>,
    pub clock: Arc<dyn Clock>,
    pub layout_versions: Arc<dyn LayoutVersionManager>,
    pub pipeline_manager: Arc<dyn PipelineManager>,
    pub resolver: NodeResolver,
}

/// Per-node row of the management status view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatusSummary {
    pub operational_state: String,
    pub health: String,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
}

/// Maintains the authoritative in-memory view of every datanode.
///
/// RPC workers call `register`, `process_heartbeat` and the query methods
/// concurrently; a periodic scanner drives health demotion; command
/// producers feed the per-node outboxes. The registry-wide lock
/// serializes every path that must observe more than one structure at
/// once (notably the heartbeat summary-then-drain pair).
pub struct NodeManager {
    config: NodeManagerConfig,
    storage: StorageConfig,
    table: NodeTable,
    command_queue: CommandQueue,
    /// Registry-wide lock for cross-structure consistency. The node
    /// table and command queue have their own internal locks; this one
    /// orders the paths that span both.
    lock: RwLock<()>,
    publisher: Arc<dyn EventPublisher>,
    topology: Arc<dyn NetworkTopology>,
    scm_context: Arc<dyn ScmContext>,
    clock: Arc<dyn Clock>,
    layout_versions: Arc<dyn LayoutVersionManager>,
    pipeline_manager: Arc<dyn PipelineManager>,
    resolver: NodeResolver,
    metrics: NodeManagerMetrics,
}

impl NodeManager {
    pub fn new(
        config: NodeManagerConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            storage: collaborators.storage,
            table: NodeTable::new(),
            command_queue: CommandQueue::new(),
            lock: RwLock::new(()),
            publisher: collaborators.publisher,
            topology: collaborators.topology,
            scm_context: collaborators.scm_context,
            clock: collaborators.clock,
            layout_versions: collaborators.layout_versions,
            pipeline_manager: collaborators.pipeline_manager,
            resolver: collaborators.resolver,
            metrics: NodeManagerMetrics::default(),
        }))
    }

    pub fn config(&self) -> &NodeManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Version info a datanode fetches before registering.
    pub fn get_version(&self) -> VersionResponse {
        VersionResponse {
            version: SCM_PROTOCOL_VERSION,
            scm_id: self.storage.scm_id.clone(),
            cluster_id: self.storage.cluster_id.clone(),
        }
    }

    /// Start the background health scanner for this registry.
    pub fn spawn_health_scanner(self: &Arc<Self>) -> HealthScannerHandle {
        health::spawn(Arc::clone(self))
    }

    /// Subscribe the registry to a feed of `CommandForDatanode`
    /// messages, forwarding each into the per-node outbox.
    pub fn spawn_command_subscriber(
        self: &Arc<Self>,
        mut commands: tokio::sync::mpsc::UnboundedReceiver<CommandForDatanode>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                manager.on_command_for_datanode(command);
            }
            tracing::debug!("command subscription channel closed");
        })
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a datanode, or refresh its addresses if it is already
    /// known. Never fails the caller: problems are reported through the
    /// response error code.
    pub fn register(
        &self,
        identity: DatanodeIdentity,
        node_report: Option<&NodeReport>,
        pipeline_reports: &[PipelineReport],
        layout: LayoutVersionReport,
        peer: Option<PeerAddress>,
    ) -> RegisterResponse {
        let scm_slv = self.layout_versions.software_layout_version();
        if layout.software_layout_version != scm_slv {
            tracing::warn!(
                datanode = %identity,
                dn_slv = layout.software_layout_version,
                scm_slv,
                "rejecting registration: software layout version mismatch"
            );
            return RegisterResponse {
                error_code: RegisterErrorCode::ErrorNodeNotPermitted,
                datanode: identity,
                cluster_id: self.storage.cluster_id.clone(),
            };
        }

        let mut identity = identity;
        if let Some(peer) = peer {
            // Addresses observed by the transport win over self-reported ones.
            if !self.config.use_hostname {
                identity.host_name = peer.host_name;
            }
            identity.ip_address = peer.ip_address;
        }

        let network_location = self.resolve_location(&identity);
        if !pipeline_reports.is_empty() {
            tracing::trace!(
                datanode = %identity,
                pipelines = pipeline_reports.len(),
                "pipeline reports acknowledged at registration"
            );
        }

        let _guard = self.lock.write().unwrap();
        if !self.table.contains(identity.uuid) {
            self.topology.add(&identity, network_location.as_deref());
            let record = DatanodeRecord::new(
                identity.clone(),
                network_location,
                layout.software_layout_version,
                layout.metadata_layout_version,
                self.clock.millis(),
            );
            match self.table.add(record) {
                Ok(()) => {
                    assert!(
                        self.topology.parent_of(identity.uuid).is_some(),
                        "registered datanode {} has no topology parent",
                        identity.uuid
                    );
                    if let Some(report) = node_report {
                        self.process_node_report(&identity, report);
                    }
                    tracing::info!(datanode = %identity, "registered datanode");
                    self.publisher.fire(NodeEvent::NewNode(identity.clone()));
                }
                Err(err) => {
                    // Lost a race with a concurrent registration; benign.
                    tracing::trace!(datanode = %identity, error = %err, "datanode already registered");
                }
            }
        } else {
            match self.table.get(identity.uuid) {
                Ok(existing) => {
                    let changed = existing.identity.host_name != identity.host_name
                        || existing.identity.ip_address != identity.ip_address;
                    if changed {
                        tracing::info!(
                            datanode = %identity.uuid,
                            old = %existing.identity,
                            new = %identity,
                            "updating datanode addresses"
                        );
                        self.topology
                            .update(&existing.identity, &identity, network_location.as_deref());
                        let _ = self.table.update_identity(
                            identity.clone(),
                            network_location,
                            layout.software_layout_version,
                            layout.metadata_layout_version,
                        );
                        assert!(
                            self.topology.parent_of(identity.uuid).is_some(),
                            "updated datanode {} has no topology parent",
                            identity.uuid
                        );
                        if let Some(report) = node_report {
                            self.process_node_report(&identity, report);
                        }
                        self.publisher
                            .fire(NodeEvent::NodeAddressUpdate(identity.clone()));
                    }
                }
                Err(err) => {
                    tracing::error!(datanode = %identity, error = %err, "registered datanode vanished from the table");
                }
            }
        }

        RegisterResponse {
            error_code: RegisterErrorCode::Success,
            datanode: identity,
            cluster_id: self.storage.cluster_id.clone(),
        }
    }

    fn resolve_location(&self, identity: &DatanodeIdentity) -> Option<String> {
        let input = if self.config.use_hostname {
            &identity.host_name
        } else {
            &identity.ip_address
        };
        (self.resolver)(input.as_str())
    }

    // ------------------------------------------------------------------
    // Heartbeat processing
    // ------------------------------------------------------------------

    /// Process one heartbeat and return the commands queued for the
    /// node. Recoverable problems never fail the caller; an
    /// unregistered node gets an empty batch and a failure metric.
    pub fn process_heartbeat(&self, heartbeat: &DatanodeHeartbeat) -> Vec<ScmCommand> {
        let datanode = heartbeat.identity.uuid;
        let now = self.clock.millis();

        let recovered = match self.table.mutate(datanode, |record| {
            record.last_heartbeat_ms = now;
            if matches!(record.health, NodeHealth::Stale | NodeHealth::Dead) {
                let previous = record.health;
                record.health = NodeHealth::Healthy;
                Some(previous)
            } else {
                None
            }
        }) {
            Ok(recovered) => recovered,
            Err(err) => {
                self.metrics.inc_heartbeats_failed();
                tracing::error!(
                    datanode = %heartbeat.identity,
                    error = %err,
                    "ignoring heartbeat from an unregistered datanode"
                );
                return Vec::new();
            }
        };
        if let Some(previous) = recovered {
            tracing::info!(
                datanode = %heartbeat.identity,
                previous_health = %previous,
                "datanode resumed heartbeating"
            );
            self.publisher.fire(NodeEvent::NodeHealthy(datanode));
        }

        self.process_layout_report(&heartbeat.identity, &heartbeat.layout);
        if let Err(err) = self.update_datanode_op_state(heartbeat) {
            tracing::warn!(
                datanode = %heartbeat.identity,
                error = %err,
                "operational state reconciliation failed"
            );
        }

        // The summary must be captured before the drain under one write
        // lock so the queue report merge sees exactly what this response
        // is about to deliver.
        let _guard = self.lock.write().unwrap();
        let summary = self.command_queue.summary(datanode);
        let commands = self.command_queue.drain(datanode);
        if let Some(report) = &heartbeat.command_queue_report {
            self.ingest_command_queue_report(&heartbeat.identity, report, &summary);
        }
        self.metrics.inc_heartbeats_processed();
        commands
    }

    /// Reconcile the operational state the datanode reports against the
    /// registry's value.
    ///
    /// On the leader the registry wins: drift queues a term-stamped
    /// command telling the node to adopt the stored state. On a follower
    /// the datanode wins: the stored state is overwritten with the
    /// reported one. Either way the record's persisted-state mirror is
    /// refreshed to what the node said it has on disk.
    fn update_datanode_op_state(&self, heartbeat: &DatanodeHeartbeat) -> Result<(), NodeError> {
        let datanode = heartbeat.identity.uuid;
        let stored = self.get_node_status(datanode)?;
        let drifted = heartbeat.reported_op_state != stored.operational_state
            || heartbeat.reported_op_state_expiry_epoch_sec != stored.op_state_expiry_epoch_sec;

        if drifted {
            if self.scm_context.is_leader() {
                tracing::info!(
                    datanode = %heartbeat.identity,
                    reported_state = %heartbeat.reported_op_state,
                    reported_expiry = heartbeat.reported_op_state_expiry_epoch_sec,
                    stored_state = %stored.operational_state,
                    stored_expiry = stored.op_state_expiry_epoch_sec,
                    "scheduling a command to update the operational state persisted on the datanode"
                );
                match self.scm_context.term_of_leader() {
                    Ok(term) => self.add_datanode_command(
                        datanode,
                        ScmCommand::with_term(
                            term,
                            CommandPayload::SetNodeOperationalState {
                                state: stored.operational_state,
                                expiry_epoch_sec: stored.op_state_expiry_epoch_sec,
                            },
                        ),
                    ),
                    Err(err) => {
                        tracing::warn!(
                            datanode = %heartbeat.identity,
                            error = %err,
                            "skip sending set-node-operational-state command"
                        );
                    }
                }
            } else {
                tracing::info!(
                    datanode = %heartbeat.identity,
                    reported_state = %heartbeat.reported_op_state,
                    reported_expiry = heartbeat.reported_op_state_expiry_epoch_sec,
                    stored_state = %stored.operational_state,
                    stored_expiry = stored.op_state_expiry_epoch_sec,
                    "adopting the operational state reported to this follower"
                );
                self.set_node_operational_state(
                    datanode,
                    heartbeat.reported_op_state,
                    heartbeat.reported_op_state_expiry_epoch_sec,
                )?;
            }
        }

        // The persisted mirror always tracks the node's last-known
        // on-disk state, drift or not.
        self.table.mutate(datanode, |record| {
            record.persisted_op_state = heartbeat.reported_op_state;
            record.persisted_op_state_expiry_epoch_sec =
                heartbeat.reported_op_state_expiry_epoch_sec;
        })
    }

    // ------------------------------------------------------------------
    // Report routing
    // ------------------------------------------------------------------

    /// Replace the node's storage picture with a fresh report.
    pub fn process_node_report(&self, identity: &DatanodeIdentity, report: &NodeReport) {
        tracing::debug!(datanode = %identity.host_name, "processing node report");
        match self.table.mutate(identity.uuid, |record| {
            record.storage_reports = report.storage_reports.clone();
            record.meta_storage_reports = report.metadata_storage_reports.clone();
        }) {
            Ok(()) => self.metrics.inc_node_reports_processed(),
            Err(err) => {
                self.metrics.inc_node_reports_failed();
                tracing::warn!(
                    datanode = %identity,
                    error = %err,
                    "got a node report from an unregistered datanode"
                );
            }
        }
    }

    /// Record the layout versions a node reports and drive upgrade
    /// finalization: nodes whose metadata layout lags the cluster are
    /// held read-only and, on the leader, told to finalize.
    pub fn process_layout_report(&self, identity: &DatanodeIdentity, layout: &LayoutVersionReport) {
        let datanode = identity.uuid;
        let scm_slv = self.layout_versions.software_layout_version();
        if layout.software_layout_version > scm_slv {
            // A node from a future software version should never have
            // been admitted. Keep it but flag the inconsistency.
            tracing::error!(
                datanode = %identity.host_name,
                dn_slv = layout.software_layout_version,
                scm_slv,
                "datanode reports a software layout version newer than the SCM"
            );
        }

        if self
            .table
            .mutate(datanode, |record| {
                record.software_layout_version = layout.software_layout_version;
                record.metadata_layout_version = layout.metadata_layout_version;
            })
            .is_err()
        {
            tracing::warn!(
                datanode = %identity,
                "got a layout report from an unregistered datanode"
            );
            return;
        }

        let checkpoint = self.scm_context.finalization_checkpoint();
        if !checkpoint.datanodes_should_finalize() {
            return;
        }
        // Past the point where SCM metadata layout stops moving, so the
        // comparison below is stable.
        let scm_mlv = self.layout_versions.metadata_layout_version();
        if layout.metadata_layout_version < scm_mlv {
            tracing::warn!(
                datanode = %identity.host_name,
                dn_mlv = layout.metadata_layout_version,
                scm_mlv,
                "datanode cannot join pipelines until it finalizes its metadata layout"
            );
            let _ = self.table.mutate(datanode, |record| {
                if record.health == NodeHealth::Healthy {
                    record.health = NodeHealth::HealthyReadonly;
                }
            });
            if self.scm_context.is_leader() {
                match self.scm_context.term_of_leader() {
                    Ok(term) => {
                        // Re-sending finalize is harmless; the node
                        // ignores duplicates.
                        self.publish_datanode_command(CommandForDatanode {
                            datanode,
                            command: ScmCommand::with_term(
                                term,
                                CommandPayload::FinalizeNewLayoutVersion {
                                    software_layout_version: layout.software_layout_version,
                                    metadata_layout_version: layout.software_layout_version,
                                },
                            ),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            datanode = %identity,
                            error = %err,
                            "skip sending finalize command"
                        );
                    }
                }
            }
        } else {
            let recovered = self
                .table
                .mutate(datanode, |record| {
                    if record.health == NodeHealth::HealthyReadonly {
                        record.health = NodeHealth::Healthy;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if recovered {
                tracing::info!(
                    datanode = %identity.host_name,
                    "datanode finalized its metadata layout, leaving read-only"
                );
                self.publisher.fire(NodeEvent::NodeHealthy(datanode));
            }
        }
    }

    /// Merge the node's reported queue counts with what this heartbeat
    /// response is about to deliver. Caller holds the registry write
    /// lock.
    fn ingest_command_queue_report(
        &self,
        identity: &DatanodeIdentity,
        report: &CommandQueueReport,
        to_be_sent: &HashMap<CommandType, usize>,
    ) {
        tracing::debug!(datanode = %identity.host_name, "processing command queue report");
        match self.table.mutate(identity.uuid, |record| {
            record.command_counts = report
                .counts
                .iter()
                .map(|(command_type, count)| {
                    let queued = to_be_sent.get(command_type).copied().unwrap_or(0) as u64;
                    (*command_type, count.saturating_add(queued))
                })
                .collect();
        }) {
            Ok(()) => {
                self.metrics.inc_command_queue_reports_processed();
                self.publisher
                    .fire(NodeEvent::DatanodeCommandCountUpdated(identity.uuid));
            }
            Err(err) => {
                self.metrics.inc_command_queue_reports_failed();
                tracing::warn!(
                    datanode = %identity,
                    error = %err,
                    "got a command queue report from an unregistered datanode"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    /// Queue a command for delivery on the node's next heartbeat.
    pub fn add_datanode_command(&self, datanode: DatanodeId, command: ScmCommand) {
        let _guard = self.lock.write().unwrap();
        self.command_queue.add(datanode, command);
    }

    /// Entry point for the `CommandForDatanode` subscription feed.
    pub fn on_command_for_datanode(&self, command: CommandForDatanode) {
        tracing::debug!(
            datanode = %command.datanode,
            command_type = %command.command.command_type(),
            "queueing command from the event feed"
        );
        self.add_datanode_command(command.datanode, command.command);
    }

    /// Announce a command on the event bus and queue it locally.
    fn publish_datanode_command(&self, command: CommandForDatanode) {
        self.publisher
            .fire(NodeEvent::DatanodeCommand(command.clone()));
        self.on_command_for_datanode(command);
    }

    /// Tell every healthy in-service datanode to refresh its volume
    /// usage immediately. Leader-only; silently skipped elsewhere.
    pub fn refresh_all_healthy_dn_usage_info(&self) {
        let term = match self.scm_context.term_of_leader() {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(error = %err, "skip sending refresh-volume-usage commands");
                return;
            }
        };
        for record in self.get_nodes(
            Some(NodeOperationalState::InService),
            Some(NodeHealth::Healthy),
        ) {
            self.add_datanode_command(
                record.identity.uuid,
                ScmCommand::with_term(term, CommandPayload::RefreshVolumeUsage),
            );
        }
    }

    /// Remove and return every command queued for the node. This is a
    /// drain, not a peek; it takes the write lock.
    pub fn drain_command_queue(&self, datanode: DatanodeId) -> Vec<ScmCommand> {
        let _guard = self.lock.write().unwrap();
        self.command_queue.drain(datanode)
    }

    /// SCM-side queued count for one command type.
    pub fn command_queue_count(&self, datanode: DatanodeId, command_type: CommandType) -> usize {
        let _guard = self.lock.read().unwrap();
        self.command_queue.count_by_type(datanode, command_type)
    }

    /// Pending counts by type for the commands queued on this SCM.
    pub fn command_queue_summary(&self, datanode: DatanodeId) -> HashMap<CommandType, usize> {
        let _guard = self.lock.read().unwrap();
        self.command_queue.summary(datanode)
    }

    /// DN-reported queued count from the last heartbeat, `-1` when the
    /// node never reported the type.
    pub fn node_queued_command_count(
        &self,
        datanode: DatanodeId,
        command_type: CommandType,
    ) -> Result<i64, NodeError> {
        let _guard = self.lock.read().unwrap();
        Ok(self.table.get(datanode)?.reported_command_count(command_type))
    }

    /// Total pending commands of one type: queued here plus reported by
    /// the node (unreported counts as zero).
    pub fn total_datanode_command_count(
        &self,
        datanode: DatanodeId,
        command_type: CommandType,
    ) -> Result<usize, NodeError> {
        let _guard = self.lock.read().unwrap();
        self.total_command_count_locked(datanode, command_type)
    }

    /// Totals for several types under a single read-lock acquisition so
    /// the counts are mutually consistent.
    pub fn total_datanode_command_counts(
        &self,
        datanode: DatanodeId,
        command_types: &[CommandType],
    ) -> Result<HashMap<CommandType, usize>, NodeError> {
        let _guard = self.lock.read().unwrap();
        let mut counts = HashMap::with_capacity(command_types.len());
        for command_type in command_types {
            counts.insert(
                *command_type,
                self.total_command_count_locked(datanode, *command_type)?,
            );
        }
        Ok(counts)
    }

    fn total_command_count_locked(
        &self,
        datanode: DatanodeId,
        command_type: CommandType,
    ) -> Result<usize, NodeError> {
        let reported = self.table.get(datanode)?.reported_command_count(command_type);
        let reported = if reported < 0 {
            tracing::warn!(
                datanode = %datanode,
                command_type = %command_type,
                "no command count information reported, assuming zero"
            );
            0
        } else {
            reported as usize
        };
        Ok(self.command_queue.count_by_type(datanode, command_type) + reported)
    }

    // ------------------------------------------------------------------
    // Node queries and admin operations
    // ------------------------------------------------------------------

    pub fn is_node_registered(&self, datanode: DatanodeId) -> bool {
        self.table.contains(datanode)
    }

    /// All nodes known to the registry, as a snapshot.
    pub fn get_all_nodes(&self) -> Vec<DatanodeRecord> {
        self.table.all()
    }

    /// Nodes matching the given states; `None` is a wildcard.
    pub fn get_nodes(
        &self,
        op_state: Option<NodeOperationalState>,
        health: Option<NodeHealth>,
    ) -> Vec<DatanodeRecord> {
        self.table.list(op_state, health)
    }

    /// Count of nodes matching the given states; `None` is a wildcard.
    pub fn node_count(
        &self,
        op_state: Option<NodeOperationalState>,
        health: Option<NodeHealth>,
    ) -> usize {
        self.table.count(op_state, health)
    }

    pub fn get_node(&self, datanode: DatanodeId) -> Option<DatanodeRecord> {
        match self.table.get(datanode) {
            Ok(record) => Some(record),
            Err(_) => {
                tracing::warn!(datanode = %datanode, "cannot find node for uuid");
                None
            }
        }
    }

    /// Nodes registered under an address (hostname or IP).
    pub fn nodes_by_address(&self, address: &str) -> Vec<DatanodeRecord> {
        if address.is_empty() {
            tracing::warn!("address lookup with an empty address");
            return Vec::new();
        }
        self.table
            .by_address(address)
            .into_iter()
            .filter_map(|id| self.table.get(id).ok())
            .collect()
    }

    pub fn get_node_status(&self, datanode: DatanodeId) -> Result<NodeStatus, NodeError> {
        Ok(self.table.get(datanode)?.status())
    }

    /// Set the authoritative operational state of a node. `NodeNotFound`
    /// propagates to the admin caller.
    pub fn set_node_operational_state(
        &self,
        datanode: DatanodeId,
        state: NodeOperationalState,
        expiry_epoch_sec: u64,
    ) -> Result<(), NodeError> {
        self.table.mutate(datanode, |record| {
            record.operational_state = state;
            record.op_state_expiry_epoch_sec = expiry_epoch_sec;
        })
    }

    /// Last heartbeat time in epoch millis, `-1` for unknown nodes.
    pub fn last_heartbeat_millis(&self, datanode: DatanodeId) -> i64 {
        self.table
            .get(datanode)
            .map(|record| record.last_heartbeat_ms as i64)
            .unwrap_or(-1)
    }

    /// Flip every healthy node to read-only. Upgrade/ops hook.
    pub fn force_nodes_to_healthy_readonly(&self) {
        for id in self.table.uuids() {
            let _ = self.table.mutate(id, |record| {
                if record.health == NodeHealth::Healthy {
                    record.health = NodeHealth::HealthyReadonly;
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Health scanning
    // ------------------------------------------------------------------

    /// One sweep of the health state machine: demote nodes whose
    /// heartbeats aged past the stale/dead thresholds. Promotions happen
    /// only on heartbeat reception, so demotion is monotonic between
    /// heartbeats. Events fire before the locks are released.
    pub fn run_health_check(&self) {
        let _guard = self.lock.write().unwrap();
        let now = self.clock.millis();
        let stale_ms = millis(self.config.health.stale_threshold);
        let dead_ms = millis(self.config.health.dead_threshold);

        for id in self.table.uuids() {
            let _ = self.table.mutate(id, |record| {
                let age = now.saturating_sub(record.last_heartbeat_ms);
                let target = if age > dead_ms {
                    NodeHealth::Dead
                } else if age > stale_ms {
                    NodeHealth::Stale
                } else {
                    return;
                };
                if target.demotion_rank() > record.health.demotion_rank() {
                    let previous = record.health;
                    record.health = target;
                    tracing::warn!(
                        datanode = %record.identity,
                        previous = %previous,
                        current = %target,
                        age_ms = age,
                        "datanode health demoted"
                    );
                    let event = if target == NodeHealth::Dead {
                        NodeEvent::NodeDead(id)
                    } else {
                        NodeEvent::NodeStale(id)
                    };
                    self.publisher.fire(event);
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Aggregated stats over nodes still counting towards capacity
    /// (healthy, read-only and stale; never dead).
    pub fn cluster_stat(&self) -> NodeStat {
        stats::cluster_stat(&self.table.all())
    }

    /// Per-node stat, `None` when the node is unknown.
    pub fn node_stat(&self, datanode: DatanodeId) -> Option<NodeStat> {
        self.table.get(datanode).ok().map(|r| stats::node_stat(&r))
    }

    /// Stats of every live or stale node.
    pub fn node_stats(&self) -> HashMap<DatanodeId, NodeStat> {
        self.table
            .all()
            .into_iter()
            .filter(|record| {
                matches!(
                    record.health,
                    NodeHealth::Healthy | NodeHealth::HealthyReadonly | NodeHealth::Stale
                )
            })
            .map(|record| (record.identity.uuid, stats::node_stat(&record)))
            .collect()
    }

    /// Usage info of one node, including its container count.
    pub fn usage_info(&self, datanode: DatanodeId) -> Option<DatanodeUsageInfo> {
        let record = self.table.get(datanode).ok()?;
        Some(DatanodeUsageInfo {
            stat: stats::node_stat(&record),
            container_count: record.containers.len(),
            identity: record.identity,
        })
    }

    /// Healthy in-service nodes ordered by utilization ratio, most used
    /// first when `most_used`, least used first otherwise.
    pub fn most_or_least_used_datanodes(&self, most_used: bool) -> Vec<DatanodeUsageInfo> {
        let mut infos: Vec<DatanodeUsageInfo> = self
            .get_nodes(
                Some(NodeOperationalState::InService),
                Some(NodeHealth::Healthy),
            )
            .into_iter()
            .map(|record| DatanodeUsageInfo {
                stat: stats::node_stat(&record),
                container_count: record.containers.len(),
                identity: record.identity,
            })
            .collect();
        stats::sort_by_utilization(&mut infos, most_used);
        infos
    }

    /// Pipeline limit for one node: the configured override when set,
    /// otherwise derived from the reported metadata volumes provided the
    /// node has at least one healthy data volume.
    pub fn pipeline_limit(&self, datanode: DatanodeId) -> usize {
        if self.config.datanode_pipeline_limit > 0 {
            return self.config.datanode_pipeline_limit as usize;
        }
        match self.table.get(datanode) {
            Ok(record) if record.healthy_volume_count() > 0 => {
                self.config.pipelines_per_metadata_volume as usize
                    * record.metadata_volume_count()
            }
            Ok(_) => 0,
            Err(_) => {
                tracing::warn!(datanode = %datanode, "cannot compute pipeline limit, datanode not found");
                0
            }
        }
    }

    /// Minimum pipeline limit across the given nodes; `None` for an
    /// empty list.
    pub fn min_pipeline_limit(&self, datanodes: &[DatanodeId]) -> Option<usize> {
        datanodes
            .iter()
            .map(|id| self.pipeline_limit(*id))
            .min()
    }

    /// Minimum healthy-volume count across the given nodes; unknown
    /// nodes are skipped, `None` when nothing remains.
    pub fn min_healthy_volume_num(&self, datanodes: &[DatanodeId]) -> Option<usize> {
        datanodes
            .iter()
            .filter_map(|id| match self.table.get(*id) {
                Ok(record) => Some(record.healthy_volume_count()),
                Err(_) => {
                    tracing::warn!(datanode = %id, "skipping unknown datanode in volume count");
                    None
                }
            })
            .min()
    }

    /// Healthy volumes across all healthy in-service nodes.
    pub fn total_healthy_volume_count(&self) -> usize {
        self.get_nodes(
            Some(NodeOperationalState::InService),
            Some(NodeHealth::Healthy),
        )
        .iter()
        .map(|record| record.healthy_volume_count())
        .sum()
    }

    /// Union of the member sets of every pipeline the node participates
    /// in, minus the node itself. Unknown pipelines are skipped.
    pub fn peer_list(&self, datanode: DatanodeId) -> Result<HashSet<DatanodeId>, NodeError> {
        let record = self.table.get(datanode)?;
        let mut peers = HashSet::new();
        for pipeline in &record.pipelines {
            match self.pipeline_manager.pipeline_nodes(*pipeline) {
                Ok(members) => peers.extend(members),
                Err(NodeError::PipelineNotFound(_)) => {}
                Err(err) => {
                    tracing::warn!(pipeline = %pipeline, error = %err, "pipeline lookup failed");
                }
            }
        }
        peers.remove(&datanode);
        Ok(peers)
    }

    // ------------------------------------------------------------------
    // Container and pipeline membership
    // ------------------------------------------------------------------

    pub fn add_container(
        &self,
        datanode: DatanodeId,
        container: ContainerId,
    ) -> Result<(), NodeError> {
        self.table.mutate(datanode, |record| {
            record.containers.insert(container);
        })
    }

    pub fn remove_container(
        &self,
        datanode: DatanodeId,
        container: ContainerId,
    ) -> Result<(), NodeError> {
        self.table.mutate(datanode, |record| {
            record.containers.remove(&container);
        })
    }

    pub fn set_containers(
        &self,
        datanode: DatanodeId,
        containers: HashSet<ContainerId>,
    ) -> Result<(), NodeError> {
        self.table.mutate(datanode, |record| {
            record.containers = containers;
        })
    }

    /// Copy of the node's container set; safe to mutate without side
    /// effects.
    pub fn containers(&self, datanode: DatanodeId) -> Result<HashSet<ContainerId>, NodeError> {
        Ok(self.table.get(datanode)?.containers)
    }

    /// Record pipeline membership on each member node. Unknown members
    /// are skipped; membership truth lives with the pipeline manager.
    pub fn add_pipeline(&self, pipeline: PipelineId, members: &[DatanodeId]) {
        for member in members {
            if self
                .table
                .mutate(*member, |record| {
                    record.pipelines.insert(pipeline);
                })
                .is_err()
            {
                tracing::warn!(
                    pipeline = %pipeline,
                    datanode = %member,
                    "pipeline member is not registered"
                );
            }
        }
    }

    pub fn remove_pipeline(&self, pipeline: PipelineId, members: &[DatanodeId]) {
        for member in members {
            let _ = self.table.mutate(*member, |record| {
                record.pipelines.remove(&pipeline);
            });
        }
    }

    pub fn pipelines(&self, datanode: DatanodeId) -> Result<HashSet<PipelineId>, NodeError> {
        Ok(self.table.get(datanode)?.pipelines)
    }

    pub fn pipelines_count(&self, datanode: DatanodeId) -> usize {
        self.table
            .get(datanode)
            .map(|record| record.pipelines.len())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Management surface
    // ------------------------------------------------------------------

    /// Node counts keyed by operational state then health, zero-filled
    /// over every combination.
    pub fn node_count_by_state(&self) -> BTreeMap<String, BTreeMap<String, usize>> {
        let mut counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for op_state in NodeOperationalState::ALL {
            let row = counts.entry(op_state.to_string()).or_default();
            for health in NodeHealth::ALL {
                row.insert(health.to_string(), 0);
            }
        }
        for record in self.table.all() {
            let status = record.status();
            if let Some(count) = counts
                .get_mut(&status.operational_state.to_string())
                .and_then(|row| row.get_mut(&status.health.to_string()))
            {
                *count += 1;
            }
        }
        counts
    }

    /// Aggregated usage by storage type and node category.
    pub fn node_info(&self) -> BTreeMap<String, u64> {
        stats::usage_by_state(&self.table.all())
    }

    /// JSON snapshot of every node record, for the admin surface.
    pub fn nodes_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.table.all())?)
    }

    /// Per-node status rows keyed by hostname.
    pub fn node_status_info(&self) -> BTreeMap<String, NodeStatusSummary> {
        self.table
            .all()
            .into_iter()
            .map(|record| {
                let status = record.status();
                (
                    record.identity.host_name.clone(),
                    NodeStatusSummary {
                        operational_state: status.operational_state.to_string(),
                        health: status.health.to_string(),
                        http_port: record.identity.http_port,
                        https_port: record.identity.https_port,
                    },
                )
            })
            .collect()
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
