//! Keyed store of datanode records with address and status indexes.
//!
//! Every read query copies out of the maps: results are snapshots and go
//! stale as soon as they are returned. Counting a partition and then
//! listing it can disagree; callers must not treat that as an error.
//!
//! Cross-structure consistency (for example heartbeat drain plus report
//! ingest) is the registry lock's job in `manager`; the locks here only
//! keep each individual structure coherent.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use crate::error::NodeError;
use crate::node::{
    DatanodeId, DatanodeIdentity, DatanodeRecord, NodeHealth, NodeOperationalState,
};

#[derive(Debug, Default)]
struct StatusIndex {
    by_health: HashMap<NodeHealth, HashSet<DatanodeId>>,
    by_op_state: HashMap<NodeOperationalState, HashSet<DatanodeId>>,
}

impl StatusIndex {
    fn insert(&mut self, id: DatanodeId, health: NodeHealth, op_state: NodeOperationalState) {
        self.by_health.entry(health).or_default().insert(id);
        self.by_op_state.entry(op_state).or_default().insert(id);
    }

    fn remove(&mut self, id: DatanodeId, health: NodeHealth, op_state: NodeOperationalState) {
        if let Some(set) = self.by_health.get_mut(&health) {
            set.remove(&id);
            if set.is_empty() {
                self.by_health.remove(&health);
            }
        }
        if let Some(set) = self.by_op_state.get_mut(&op_state) {
            set.remove(&id);
            if set.is_empty() {
                self.by_op_state.remove(&op_state);
            }
        }
    }
}

/// Primary map plus secondary indexes.
///
/// Lock order inside this type is fixed: `nodes`, then `address_index`,
/// then `status_index`. The address index additionally has its own lock
/// so registrar address swaps never nest inside the status lock.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: RwLock<HashMap<DatanodeId, DatanodeRecord>>,
    address_index: Mutex<HashMap<String, HashSet<DatanodeId>>>,
    status_index: RwLock<StatusIndex>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record, indexing its addresses and status.
    pub fn add(&self, record: DatanodeRecord) -> Result<(), NodeError> {
        let id = record.identity.uuid;
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&id) {
            return Err(NodeError::NodeAlreadyExists(id));
        }
        self.index_addresses(id, &record.identity);
        self.status_index
            .write()
            .unwrap()
            .insert(id, record.health, record.operational_state);
        nodes.insert(id, record);
        Ok(())
    }

    /// Remove a record and every index entry pointing at it.
    pub fn remove(&self, id: DatanodeId) -> Result<DatanodeRecord, NodeError> {
        let mut nodes = self.nodes.write().unwrap();
        let record = nodes.remove(&id).ok_or(NodeError::NodeNotFound(id))?;
        self.unindex_addresses(id, &record.identity);
        self.status_index
            .write()
            .unwrap()
            .remove(id, record.health, record.operational_state);
        Ok(record)
    }

    /// Snapshot of one record.
    pub fn get(&self, id: DatanodeId) -> Result<DatanodeRecord, NodeError> {
        self.nodes
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(NodeError::NodeNotFound(id))
    }

    pub fn contains(&self, id: DatanodeId) -> bool {
        self.nodes.read().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }

    pub fn uuids(&self) -> Vec<DatanodeId> {
        self.nodes.read().unwrap().keys().copied().collect()
    }

    /// Apply a mutation to a record in place, fixing the status indexes
    /// if the closure changed health or operational state. The closure
    /// runs (and may publish events) before any lock here is released,
    /// so observers never see a half-updated record.
    pub fn mutate<R>(
        &self,
        id: DatanodeId,
        f: impl FnOnce(&mut DatanodeRecord) -> R,
    ) -> Result<R, NodeError> {
        let mut nodes = self.nodes.write().unwrap();
        let record = nodes.get_mut(&id).ok_or(NodeError::NodeNotFound(id))?;
        let before = (record.health, record.operational_state);
        let out = f(record);
        let after = (record.health, record.operational_state);
        if before != after {
            let mut status = self.status_index.write().unwrap();
            status.remove(id, before.0, before.1);
            status.insert(id, after.0, after.1);
        }
        Ok(out)
    }

    /// Replace a record's identity (and resolved location and layout)
    /// after an address change, swapping the address index entries.
    pub fn update_identity(
        &self,
        identity: DatanodeIdentity,
        network_location: Option<String>,
        software_layout_version: i32,
        metadata_layout_version: i32,
    ) -> Result<DatanodeIdentity, NodeError> {
        let id = identity.uuid;
        let mut nodes = self.nodes.write().unwrap();
        let record = nodes.get_mut(&id).ok_or(NodeError::NodeNotFound(id))?;
        let old_identity = std::mem::replace(&mut record.identity, identity);
        record.network_location = network_location;
        record.software_layout_version = software_layout_version;
        record.metadata_layout_version = metadata_layout_version;

        let new_identity = record.identity.clone();
        self.unindex_addresses(id, &old_identity);
        self.index_addresses(id, &new_identity);
        Ok(old_identity)
    }

    /// Records matching the given states; `None` on either axis is a
    /// wildcard. The result is a snapshot.
    pub fn list(
        &self,
        op_state: Option<NodeOperationalState>,
        health: Option<NodeHealth>,
    ) -> Vec<DatanodeRecord> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|r| op_state.map_or(true, |s| r.operational_state == s))
            .filter(|r| health.map_or(true, |h| r.health == h))
            .cloned()
            .collect()
    }

    /// All records, as a snapshot.
    pub fn all(&self) -> Vec<DatanodeRecord> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    /// Count of records matching the given states, answered from the
    /// status indexes. Counts over a partition taken one call at a time
    /// may not sum to `len()`; that is the documented snapshot drift.
    pub fn count(
        &self,
        op_state: Option<NodeOperationalState>,
        health: Option<NodeHealth>,
    ) -> usize {
        match (op_state, health) {
            (None, None) => self.len(),
            (Some(s), None) => {
                let index = self.status_index.read().unwrap();
                index.by_op_state.get(&s).map_or(0, HashSet::len)
            }
            (None, Some(h)) => {
                let index = self.status_index.read().unwrap();
                index.by_health.get(&h).map_or(0, HashSet::len)
            }
            (Some(s), Some(h)) => {
                let index = self.status_index.read().unwrap();
                match (index.by_op_state.get(&s), index.by_health.get(&h)) {
                    (Some(by_state), Some(by_health)) => {
                        by_state.intersection(by_health).count()
                    }
                    _ => 0,
                }
            }
        }
    }

    /// UUIDs registered under the given hostname or IP address.
    pub fn by_address(&self, address: &str) -> HashSet<DatanodeId> {
        self.address_index
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    fn index_addresses(&self, id: DatanodeId, identity: &DatanodeIdentity) {
        let mut index = self.address_index.lock().unwrap();
        for addr in [&identity.host_name, &identity.ip_address] {
            if !addr.is_empty() {
                index.entry(addr.clone()).or_default().insert(id);
            }
        }
    }

    fn unindex_addresses(&self, id: DatanodeId, identity: &DatanodeIdentity) {
        let mut index = self.address_index.lock().unwrap();
        for addr in [&identity.host_name, &identity.ip_address] {
            if let Some(set) = index.get_mut(addr.as_str()) {
                set.remove(&id);
                if set.is_empty() {
                    index.remove(addr.as_str());
                }
            }
        }
    }

    #[cfg(test)]
    fn address_index_snapshot(&self) -> HashMap<String, HashSet<DatanodeId>> {
        self.address_index.lock().unwrap().clone()
    }
}
