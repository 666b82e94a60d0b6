// Copyright 2024 Blobmap Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Data nodes, disks, replicas and partitions
//!
//! Resources form a fixed hierarchy (node > disk > replica, partition >
//! replica) and each owns its own state policy. Handles given out by the
//! cluster map only expose read accessors; every mutation goes through
//! [`ClusterMap`](crate::ClusterMap).

use crate::error::Result;
use crate::policy::{PolicyStatus, ResourceStatePolicy};
use crate::port::{Port, PortSet, SslEnabledDatacenters};
use crate::types::{DataNodeKey, Liveness, PartitionId, PartitionState};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Capabilities shared by every data node implementation
pub trait DataNodeId: Send + Sync + fmt::Debug {
    fn hostname(&self) -> &str;

    /// Plaintext port, part of the node identity
    fn port(&self) -> u16;

    fn ssl_port(&self) -> Option<u16>;

    /// All ports, plaintext first
    fn ports(&self) -> Vec<Port>;

    fn datacenter(&self) -> &str;

    fn rack_id(&self) -> Option<&str>;

    /// Version of the last topology change applied to this node
    fn xid(&self) -> i64;

    fn ssl_enabled_datacenters(&self) -> Vec<String>;

    /// Port peers must use to reach this node
    fn connect_endpoint(&self) -> Result<Port>;

    fn state(&self) -> Liveness;

    fn disk_ids(&self) -> Vec<Arc<dyn DiskId>>;

    fn key(&self) -> DataNodeKey {
        DataNodeKey::new(self.hostname(), self.port())
    }
}

/// Capabilities shared by every disk implementation
pub trait DiskId: Send + Sync + fmt::Debug {
    fn node_key(&self) -> DataNodeKey;

    fn mount_path(&self) -> &str;

    fn capacity_bytes(&self) -> u64;

    /// Down when either the disk or its node is down
    fn state(&self) -> Liveness;
}

/// Capabilities shared by every replica implementation
pub trait ReplicaId: Send + Sync + fmt::Debug {
    fn partition_id(&self) -> PartitionId;

    fn node_key(&self) -> DataNodeKey;

    fn mount_path(&self) -> &str;

    fn is_sealed(&self) -> bool;

    /// Down when the replica, its disk or its node is down
    fn state(&self) -> Liveness;
}

/// Serializes topology changes to one resource and rejects xid regressions
#[derive(Debug)]
pub(crate) struct XidGate {
    applied: Mutex<i64>,
}

impl XidGate {
    pub(crate) fn new(initial: i64) -> Self {
        Self {
            applied: Mutex::new(initial),
        }
    }

    pub(crate) fn current(&self) -> i64 {
        *self.applied.lock()
    }

    /// Run `apply` unless `xid` is older than the last applied change.
    ///
    /// Returns `Ok(None)` for stale changes. The recorded xid only moves when
    /// `apply` succeeds.
    pub(crate) fn advance<T>(&self, xid: i64, apply: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
        let mut applied = self.applied.lock();
        if xid < *applied {
            return Ok(None);
        }
        let out = apply()?;
        *applied = xid;
        Ok(Some(out))
    }
}

/// A storage host in the cluster
pub struct DataNode {
    key: DataNodeKey,
    datacenter: String,
    ports: PortSet,
    rack_id: Option<String>,
    state: Arc<dyn ResourceStatePolicy>,
    ssl_enabled: Arc<SslEnabledDatacenters>,
    disks: Vec<Arc<Disk>>,
    xid: XidGate,
}

impl DataNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        hostname: String,
        datacenter: String,
        ports: PortSet,
        rack_id: Option<String>,
        xid: i64,
        state: Arc<dyn ResourceStatePolicy>,
        ssl_enabled: Arc<SslEnabledDatacenters>,
        disks: Vec<Arc<Disk>>,
    ) -> Self {
        Self {
            key: DataNodeKey::new(hostname, ports.plaintext().number()),
            datacenter,
            ports,
            rack_id,
            state,
            ssl_enabled,
            disks,
            xid: XidGate::new(xid),
        }
    }

    pub fn node_key(&self) -> &DataNodeKey {
        &self.key
    }

    pub fn port_set(&self) -> PortSet {
        self.ports
    }

    pub fn disks(&self) -> &[Arc<Disk>] {
        &self.disks
    }

    pub fn disk(&self, mount_path: &str) -> Option<&Arc<Disk>> {
        self.disks.iter().find(|disk| disk.mount_path == mount_path)
    }

    pub fn is_available(&self) -> bool {
        !self.state.is_down()
    }

    pub fn policy_status(&self) -> PolicyStatus {
        self.state.status()
    }

    pub(crate) fn policy(&self) -> &Arc<dyn ResourceStatePolicy> {
        &self.state
    }

    pub(crate) fn xid_gate(&self) -> &XidGate {
        &self.xid
    }

    /// True when both registrations describe the same node
    pub(crate) fn same_attributes(&self, other: &DataNode) -> bool {
        self.key == other.key
            && self.datacenter == other.datacenter
            && self.ports == other.ports
            && self.rack_id == other.rack_id
            && self.disks.len() == other.disks.len()
            && self
                .disks
                .iter()
                .zip(&other.disks)
                .all(|(a, b)| a.mount_path == b.mount_path && a.capacity_bytes == b.capacity_bytes)
    }
}

impl DataNodeId for DataNode {
    fn hostname(&self) -> &str {
        &self.key.hostname
    }

    fn port(&self) -> u16 {
        self.key.port
    }

    fn ssl_port(&self) -> Option<u16> {
        self.ports.ssl().map(|port| port.number())
    }

    fn ports(&self) -> Vec<Port> {
        self.ports.to_vec()
    }

    fn datacenter(&self) -> &str {
        &self.datacenter
    }

    fn rack_id(&self) -> Option<&str> {
        self.rack_id.as_deref()
    }

    fn xid(&self) -> i64 {
        self.xid.current()
    }

    fn ssl_enabled_datacenters(&self) -> Vec<String> {
        self.ssl_enabled.to_vec()
    }

    fn connect_endpoint(&self) -> Result<Port> {
        self.ports.connect_port(&self.key, &self.datacenter, &self.ssl_enabled)
    }

    fn state(&self) -> Liveness {
        Liveness::from_down(self.state.is_down())
    }

    fn disk_ids(&self) -> Vec<Arc<dyn DiskId>> {
        self.disks
            .iter()
            .map(|disk| Arc::clone(disk) as Arc<dyn DiskId>)
            .collect()
    }
}

impl PartialEq for DataNode {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DataNode {}

impl Hash for DataNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Ord for DataNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for DataNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataNode")
            .field("key", &self.key)
            .field("datacenter", &self.datacenter)
            .field("ports", &self.ports)
            .field("rack_id", &self.rack_id)
            .field("xid", &self.xid.current())
            .field("disks", &self.disks.len())
            .finish()
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.datacenter, self.key)
    }
}

/// A disk mounted on a data node
#[derive(Debug)]
pub struct Disk {
    node: DataNodeKey,
    mount_path: String,
    capacity_bytes: u64,
    state: Arc<dyn ResourceStatePolicy>,
    node_state: Arc<dyn ResourceStatePolicy>,
}

impl Disk {
    pub(crate) fn new(
        node: DataNodeKey,
        mount_path: String,
        capacity_bytes: u64,
        state: Arc<dyn ResourceStatePolicy>,
        node_state: Arc<dyn ResourceStatePolicy>,
    ) -> Self {
        Self {
            node,
            mount_path,
            capacity_bytes,
            state,
            node_state,
        }
    }

    pub fn node(&self) -> &DataNodeKey {
        &self.node
    }

    pub fn is_available(&self) -> bool {
        !self.node_state.is_down() && !self.state.is_down()
    }

    pub fn policy_status(&self) -> PolicyStatus {
        self.state.status()
    }

    pub(crate) fn policy(&self) -> &Arc<dyn ResourceStatePolicy> {
        &self.state
    }
}

impl DiskId for Disk {
    fn node_key(&self) -> DataNodeKey {
        self.node.clone()
    }

    fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn state(&self) -> Liveness {
        Liveness::from_down(!self.is_available())
    }
}

/// A physical copy of a partition on one disk
#[derive(Debug)]
pub struct Replica {
    partition: PartitionId,
    disk: Arc<Disk>,
    state: Arc<dyn ResourceStatePolicy>,
    sealed: AtomicBool,
}

impl Replica {
    pub(crate) fn new(partition: PartitionId, disk: Arc<Disk>, state: Arc<dyn ResourceStatePolicy>, sealed: bool) -> Self {
        Self {
            partition,
            disk,
            state,
            sealed: AtomicBool::new(sealed),
        }
    }

    pub fn node(&self) -> &DataNodeKey {
        &self.disk.node
    }

    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    /// Eligible when the replica, its disk and its node are all available
    pub fn is_available(&self) -> bool {
        !self.state.is_down() && self.disk.is_available()
    }

    pub fn policy_status(&self) -> PolicyStatus {
        self.state.status()
    }

    pub(crate) fn policy(&self) -> &Arc<dyn ResourceStatePolicy> {
        &self.state
    }

    pub(crate) fn set_sealed(&self, sealed: bool) -> bool {
        self.sealed.swap(sealed, AtomicOrdering::AcqRel)
    }
}

impl ReplicaId for Replica {
    fn partition_id(&self) -> PartitionId {
        self.partition
    }

    fn node_key(&self) -> DataNodeKey {
        self.disk.node.clone()
    }

    fn mount_path(&self) -> &str {
        &self.disk.mount_path
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(AtomicOrdering::Acquire)
    }

    fn state(&self) -> Liveness {
        Liveness::from_down(!self.is_available())
    }
}

/// A logical shard and the replicas holding its data
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    class: String,
    replicas: RwLock<Vec<Arc<Replica>>>,
    locally_read_only: AtomicBool,
    xid: XidGate,
}

impl Partition {
    pub(crate) fn new(id: PartitionId, class: String, replicas: Vec<Arc<Replica>>) -> Self {
        Self {
            id,
            class,
            replicas: RwLock::new(replicas),
            locally_read_only: AtomicBool::new(false),
            xid: XidGate::new(i64::MIN),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Class from the layout, before any override
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas.read().clone()
    }

    pub fn replica_on(&self, node: &DataNodeKey) -> Option<Arc<Replica>> {
        self.replicas.read().iter().find(|replica| replica.node() == node).cloned()
    }

    /// State derived from replica seal signals: sealed anywhere means read-only
    pub fn derived_state(&self) -> PartitionState {
        let sealed = self.locally_read_only.load(AtomicOrdering::Acquire)
            || self.replicas.read().iter().any(|replica| replica.is_sealed());
        if sealed {
            PartitionState::ReadOnly
        } else {
            PartitionState::ReadWrite
        }
    }

    pub(crate) fn mark_read_only(&self) -> bool {
        !self.locally_read_only.swap(true, AtomicOrdering::AcqRel)
    }

    pub(crate) fn xid_gate(&self) -> &XidGate {
        &self.xid
    }

    /// Adds the replica unless the node already hosts one; returns whether it was added
    pub(crate) fn add_replica(&self, replica: Arc<Replica>) -> bool {
        let mut replicas = self.replicas.write();
        if replicas.iter().any(|existing| existing.node() == replica.node()) {
            return false;
        }
        replicas.push(replica);
        true
    }

    pub(crate) fn remove_replica(&self, node: &DataNodeKey) -> Option<Arc<Replica>> {
        let mut replicas = self.replicas.write();
        let pos = replicas.iter().position(|replica| replica.node() == node)?;
        Some(replicas.remove(pos))
    }
}
