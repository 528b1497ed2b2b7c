//! Read-only aggregation over node records.
//!
//! Everything here is a pure function over record snapshots so the
//! arithmetic stays testable without a wired-up manager. The manager
//! exposes these through its accessor methods.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::node::{DatanodeIdentity, DatanodeRecord, NodeHealth, StorageType};

/// Aggregated capacity/used/remaining, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub capacity: u64,
    pub used: u64,
    pub remaining: u64,
}

impl NodeStat {
    pub fn merge(&mut self, other: NodeStat) {
        self.capacity = self.capacity.saturating_add(other.capacity);
        self.used = self.used.saturating_add(other.used);
        self.remaining = self.remaining.saturating_add(other.remaining);
    }
}

/// Per-node usage summary used by placement and balancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatanodeUsageInfo {
    pub identity: DatanodeIdentity,
    pub stat: NodeStat,
    pub container_count: usize,
}

impl DatanodeUsageInfo {
    /// Fraction of capacity in use; zero-capacity nodes sort as empty.
    pub fn utilization(&self) -> f64 {
        if self.stat.capacity == 0 {
            0.0
        } else {
            self.stat.used as f64 / self.stat.capacity as f64
        }
    }
}

/// Sum one record's storage reports.
pub fn node_stat(record: &DatanodeRecord) -> NodeStat {
    let mut stat = NodeStat::default();
    for report in &record.storage_reports {
        stat.merge(NodeStat {
            capacity: report.capacity,
            used: report.used,
            remaining: report.remaining,
        });
    }
    stat
}

/// Cluster totals over nodes that still count towards capacity:
/// healthy (including read-only) and stale, but never dead.
pub fn cluster_stat(records: &[DatanodeRecord]) -> NodeStat {
    let mut total = NodeStat::default();
    for record in records {
        match record.health {
            NodeHealth::Healthy | NodeHealth::HealthyReadonly | NodeHealth::Stale => {
                total.merge(node_stat(record));
            }
            NodeHealth::Dead => {}
        }
    }
    total
}

/// Order usage infos by utilization ratio, descending when `most_used`,
/// with the UUID as a deterministic tiebreak.
pub fn sort_by_utilization(infos: &mut [DatanodeUsageInfo], most_used: bool) {
    infos.sort_by(|a, b| {
        let ordering = a
            .utilization()
            .partial_cmp(&b.utilization())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.identity.uuid.cmp(&b.identity.uuid));
        if most_used {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

const USAGE_METRICS: [&str; 6] = [
    "DiskCapacity",
    "DiskUsed",
    "DiskRemaining",
    "SSDCapacity",
    "SSDUsed",
    "SSDRemaining",
];

const USAGE_PREFIXES: [&str; 3] = ["", "Maintenance", "Decommissioned"];

/// Aggregate disk and SSD usage by node category. Keys are the metric
/// names prefixed with the category (online nodes use the bare name);
/// every key is present even when zero. Dead in-service nodes are
/// skipped: they hold no usable capacity and are not yet drained.
pub fn usage_by_state(records: &[DatanodeRecord]) -> BTreeMap<String, u64> {
    let mut usage = BTreeMap::new();
    for prefix in USAGE_PREFIXES {
        for metric in USAGE_METRICS {
            usage.insert(format!("{prefix}{metric}"), 0u64);
        }
    }

    for record in records {
        let status = record.status();
        let prefix = if status.is_maintenance() {
            "Maintenance"
        } else if status.is_decommission() {
            "Decommissioned"
        } else if status.is_alive() {
            ""
        } else {
            continue;
        };

        for report in &record.storage_reports {
            let media = match report.storage_type {
                StorageType::Disk => "Disk",
                StorageType::Ssd => "SSD",
                _ => continue,
            };
            for (metric, value) in [
                ("Capacity", report.capacity),
                ("Used", report.used),
                ("Remaining", report.remaining),
            ] {
                if let Some(total) = usage.get_mut(&format!("{prefix}{media}{metric}")) {
                    *total = total.saturating_add(value);
                }
            }
        }
    }
    usage
}
