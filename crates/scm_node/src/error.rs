//! Typed errors surfaced by the datanode registry.

use thiserror::Error;

use crate::node::{DatanodeId, PipelineId};

/// Errors that can occur in registry operations.
///
/// `NodeNotFound` is expected in normal operation (an unregistered node
/// heartbeating) and is never fatal; `NodeAlreadyExists` marks a benign
/// duplicate registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Datanode is not present in the registry
    #[error("datanode {0} is not registered")]
    NodeNotFound(DatanodeId),

    /// Datanode is already present in the registry
    #[error("datanode {0} is already registered")]
    NodeAlreadyExists(DatanodeId),

    /// Pipeline is unknown to the pipeline manager
    #[error("pipeline {0} not found")]
    PipelineNotFound(PipelineId),
}

/// Returned by the consensus context when a leader-only operation is
/// attempted on a replica that is not (or no longer) the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("current SCM is not the leader")]
pub struct NotLeaderError;
