//! Registry-side processing counters.
//!
//! Plain atomics, snapshotted on demand. Exporter wiring is the
//! embedding process's concern.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct NodeManagerMetrics {
    heartbeats_processed: AtomicU64,
    heartbeats_failed: AtomicU64,
    node_reports_processed: AtomicU64,
    node_reports_failed: AtomicU64,
    command_queue_reports_processed: AtomicU64,
    command_queue_reports_failed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub heartbeats_processed: u64,
    pub heartbeats_failed: u64,
    pub node_reports_processed: u64,
    pub node_reports_failed: u64,
    pub command_queue_reports_processed: u64,
    pub command_queue_reports_failed: u64,
}

impl NodeManagerMetrics {
    pub(crate) fn inc_heartbeats_processed(&self) {
        self.heartbeats_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_heartbeats_failed(&self) {
        self.heartbeats_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_node_reports_processed(&self) {
        self.node_reports_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_node_reports_failed(&self) {
        self.node_reports_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_command_queue_reports_processed(&self) {
        self.command_queue_reports_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_command_queue_reports_failed(&self) {
        self.command_queue_reports_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            heartbeats_processed: self.heartbeats_processed.load(Ordering::Relaxed),
            heartbeats_failed: self.heartbeats_failed.load(Ordering::Relaxed),
            node_reports_processed: self.node_reports_processed.load(Ordering::Relaxed),
            node_reports_failed: self.node_reports_failed.load(Ordering::Relaxed),
            command_queue_reports_processed: self
                .command_queue_reports_processed
                .load(Ordering::Relaxed),
            command_queue_reports_failed: self
                .command_queue_reports_failed
                .load(Ordering::Relaxed),
        }
    }
}
