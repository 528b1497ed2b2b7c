//! Outbound datanode commands and the per-datanode dispatch queue.
//!
//! Commands accumulate in a per-datanode FIFO and are handed to the node
//! in one batch when its next heartbeat is processed. The queue is not
//! durable: commands lost on an SCM restart are re-derived by the layers
//! that planned them.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::node::{ContainerId, DatanodeId, NodeOperationalState, PipelineId};

/// Discriminant of a command, used for per-type counting on both the SCM
/// and datanode side of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    ReplicateContainer,
    DeleteContainer,
    CloseContainer,
    DeleteBlocks,
    ClosePipeline,
    SetNodeOperationalState,
    FinalizeNewLayoutVersion,
    RefreshVolumeUsage,
}

impl CommandType {
    pub const ALL: [CommandType; 8] = [
        CommandType::ReplicateContainer,
        CommandType::DeleteContainer,
        CommandType::CloseContainer,
        CommandType::DeleteBlocks,
        CommandType::ClosePipeline,
        CommandType::SetNodeOperationalState,
        CommandType::FinalizeNewLayoutVersion,
        CommandType::RefreshVolumeUsage,
    ];
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Type-specific payload of an outbound command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    ReplicateContainer {
        container: ContainerId,
        sources: Vec<DatanodeId>,
    },
    DeleteContainer {
        container: ContainerId,
        force: bool,
    },
    CloseContainer {
        container: ContainerId,
    },
    DeleteBlocks {
        transaction_ids: Vec<u64>,
    },
    ClosePipeline {
        pipeline: PipelineId,
    },
    SetNodeOperationalState {
        state: NodeOperationalState,
        expiry_epoch_sec: u64,
    },
    FinalizeNewLayoutVersion {
        software_layout_version: i32,
        metadata_layout_version: i32,
    },
    RefreshVolumeUsage,
}

impl CommandPayload {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandPayload::ReplicateContainer { .. } => CommandType::ReplicateContainer,
            CommandPayload::DeleteContainer { .. } => CommandType::DeleteContainer,
            CommandPayload::CloseContainer { .. } => CommandType::CloseContainer,
            CommandPayload::DeleteBlocks { .. } => CommandType::DeleteBlocks,
            CommandPayload::ClosePipeline { .. } => CommandType::ClosePipeline,
            CommandPayload::SetNodeOperationalState { .. } => CommandType::SetNodeOperationalState,
            CommandPayload::FinalizeNewLayoutVersion { .. } => {
                CommandType::FinalizeNewLayoutVersion
            }
            CommandPayload::RefreshVolumeUsage => CommandType::RefreshVolumeUsage,
        }
    }
}

/// One command addressed to a datanode, stamped with the leader term it
/// was issued under so the node can fence stale leaders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmCommand {
    pub term: u64,
    pub payload: CommandPayload,
}

impl ScmCommand {
    pub fn new(payload: CommandPayload) -> Self {
        Self { term: 0, payload }
    }

    pub fn with_term(term: u64, payload: CommandPayload) -> Self {
        Self { term, payload }
    }

    pub fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }
}

/// A command paired with its destination, as carried on the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandForDatanode {
    pub datanode: DatanodeId,
    pub command: ScmCommand,
}

/// Per-datanode FIFO of commands awaiting the next heartbeat.
///
/// Callers serialize access through the registry-wide lock; the internal
/// mutex only makes the structure safe to share.
#[derive(Debug, Default)]
pub struct CommandQueue {
    queues: Mutex<HashMap<DatanodeId, VecDeque<ScmCommand>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command to the datanode's queue.
    pub fn add(&self, datanode: DatanodeId, command: ScmCommand) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(datanode).or_default().push_back(command);
    }

    /// Atomically remove and return every queued command for the
    /// datanode, in insertion order.
    pub fn drain(&self, datanode: DatanodeId) -> Vec<ScmCommand> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .remove(&datanode)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Snapshot of pending counts by command type. During heartbeat
    /// processing this is captured before `drain` so the datanode's
    /// inbound command-queue report can be merged with what is about to
    /// be sent.
    pub fn summary(&self, datanode: DatanodeId) -> HashMap<CommandType, usize> {
        let queues = self.queues.lock().unwrap();
        let mut counts = HashMap::new();
        if let Some(queue) = queues.get(&datanode) {
            for command in queue {
                *counts.entry(command.command_type()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Number of queued commands of one type for the datanode.
    pub fn count_by_type(&self, datanode: DatanodeId, command_type: CommandType) -> usize {
        let queues = self.queues.lock().unwrap();
        queues
            .get(&datanode)
            .map(|q| q.iter().filter(|c| c.command_type() == command_type).count())
            .unwrap_or(0)
    }

    /// Total queued commands for the datanode.
    pub fn len(&self, datanode: DatanodeId) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(&datanode).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn close_container(id: u64) -> ScmCommand {
        ScmCommand::new(CommandPayload::CloseContainer {
            container: ContainerId(id),
        })
    }

    #[test]
    fn drain_returns_commands_in_insertion_order() {
        let queue = CommandQueue::new();
        let dn = Uuid::new_v4();
        queue.add(dn, close_container(1));
        queue.add(dn, close_container(2));
        queue.add(dn, ScmCommand::new(CommandPayload::RefreshVolumeUsage));

        let drained = queue.drain(dn);
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], close_container(1));
        assert_eq!(drained[1], close_container(2));
        assert_eq!(drained[2].command_type(), CommandType::RefreshVolumeUsage);

        assert!(queue.drain(dn).is_empty());
        assert_eq!(queue.len(dn), 0);
    }

    #[test]
    fn summary_counts_by_type_without_draining() {
        let queue = CommandQueue::new();
        let dn = Uuid::new_v4();
        queue.add(dn, close_container(1));
        queue.add(dn, close_container(2));
        queue.add(dn, ScmCommand::new(CommandPayload::RefreshVolumeUsage));

        let summary = queue.summary(dn);
        assert_eq!(summary.get(&CommandType::CloseContainer), Some(&2));
        assert_eq!(summary.get(&CommandType::RefreshVolumeUsage), Some(&1));
        assert_eq!(queue.len(dn), 3);
        assert_eq!(queue.count_by_type(dn, CommandType::CloseContainer), 2);
        assert_eq!(queue.count_by_type(dn, CommandType::DeleteBlocks), 0);
    }

    #[test]
    fn queues_are_isolated_per_datanode() {
        let queue = CommandQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.add(a, close_container(1));

        assert!(queue.drain(b).is_empty());
        assert_eq!(queue.drain(a).len(), 1);
    }
}
