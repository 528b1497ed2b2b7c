//! Domain events published by the registry and the inbound command feed.
//!
//! Events may be fired while registry locks are held, so a publisher must
//! be one-way: it records or forwards the event without calling back into
//! the registry. The channel publisher below satisfies that by design;
//! subscribers drain the receiver on their own task.

use tokio::sync::mpsc;

use crate::command::CommandForDatanode;
use crate::node::{DatanodeId, DatanodeIdentity};

/// State changes the registry announces to downstream subscribers.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    NewNode(DatanodeIdentity),
    NodeAddressUpdate(DatanodeIdentity),
    NodeStale(DatanodeId),
    NodeDead(DatanodeId),
    NodeHealthy(DatanodeId),
    DatanodeCommand(CommandForDatanode),
    DatanodeCommandCountUpdated(DatanodeId),
}

/// Event sink the registry publishes into.
pub trait EventPublisher: Send + Sync {
    fn fire(&self, event: NodeEvent);
}

/// Publisher that forwards events onto an unbounded channel. Dropped
/// receivers are tolerated: a registry must not fail because nobody is
/// listening.
#[derive(Debug, Clone)]
pub struct ChannelEventPublisher {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl ChannelEventPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventPublisher for ChannelEventPublisher {
    fn fire(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}

/// Publisher that drops every event. Useful for embeddings that do not
/// subscribe to registry events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventPublisher;

impl EventPublisher for NullEventPublisher {
    fn fire(&self, _event: NodeEvent) {}
}
