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

//! Cluster map aggregator
//!
//! [`ClusterMap`] owns every data node, disk, replica and partition along with
//! their state policies. Observations, topology updates and queries all go
//! through it; callers only ever get `Arc` handles with read accessors.

use crate::clock::{Clock, SystemClock};
use crate::config::ClusterMapConfig;
use crate::error::{ClusterMapError, Result};
use crate::layout::{NodeLayout, PartitionLayout, TopologyLayout};
use crate::override_store::PartitionOverrideStore;
use crate::policy::{PolicyFactoryRegistry, ResourceStatePolicy, ResourceStatePolicyFactory};
use crate::port::{PortSet, SslEnabledDatacenters};
use crate::resolver::{HostnameResolver, SystemResolver, validate_hostname};
use crate::resource::{DataNode, Disk, Partition, Replica, XidGate};
use crate::snapshot::ClusterSnapshot;
use crate::types::{DataNodeKey, Outcome, PartitionId, PartitionState, ReplicaEventType, ResourceId, ResourceKind};
use crate::update::{TopologyChange, TopologyUpdate, UpdateOutcome};
use hashbrown::{HashMap, HashSet};
use metrics::counter;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of admitting a data node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,

    /// Same identity and attributes as an existing node; nothing changed
    Duplicate,

    /// Node xid above the configured ceiling; skipped
    AboveCeiling,
}

/// Assembles a [`ClusterMap`] from configuration, collaborators and a layout
#[derive(Debug)]
pub struct ClusterMapBuilder {
    config: ClusterMapConfig,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn HostnameResolver>,
    registry: PolicyFactoryRegistry,
    override_store: Option<Arc<dyn PartitionOverrideStore>>,
}

impl ClusterMapBuilder {
    pub fn new(config: ClusterMapConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            resolver: Arc::new(SystemResolver),
            registry: PolicyFactoryRegistry::default(),
            override_store: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn HostnameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn policy_registry(mut self, registry: PolicyFactoryRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn override_store(mut self, store: Arc<dyn PartitionOverrideStore>) -> Self {
        self.override_store = Some(store);
        self
    }

    pub fn config(&self) -> &ClusterMapConfig {
        &self.config
    }

    /// Validate the configuration and admit every node and partition of `layout`.
    ///
    /// Any configuration error aborts the build.
    pub fn build(self, layout: &TopologyLayout) -> Result<ClusterMap> {
        self.config.validate()?;
        layout.validate()?;

        if self.config.enable_partition_override && self.override_store.is_none() {
            return Err(ClusterMapError::invalid_config(
                "partition override is enabled but no override store was provided",
            ));
        }

        let policies = self.registry.create(&self.config, self.clock.clone())?;
        let ssl_enabled = Arc::new(SslEnabledDatacenters::new(&self.config.ssl_enabled_datacenters));

        info!(
            cluster = %self.config.cluster_name,
            datacenter = %self.config.datacenter_name,
            policy_factory = %policies.name(),
            partition_override = self.config.enable_partition_override,
            "Building cluster map"
        );

        let map = ClusterMap {
            config: Arc::new(self.config),
            clock: self.clock,
            policies,
            resolver: self.resolver,
            override_store: self.override_store,
            ssl_enabled,
            ssl_xid: XidGate::new(i64::MIN),
            nodes: RwLock::new(BTreeMap::new()),
            partitions: RwLock::new(HashMap::new()),
        };

        let mut skipped = HashSet::new();
        for dc in &layout.datacenters {
            for node in &dc.nodes {
                if map.add_data_node(&dc.name, node)? == Admission::AboveCeiling {
                    skipped.insert(node.key());
                }
            }
        }

        for partition in &layout.partitions {
            if partition.replicas.iter().any(|replica| skipped.contains(&replica.key())) {
                let mut partition = partition.clone();
                partition.replicas.retain(|replica| !skipped.contains(&replica.key()));
                map.add_partition(&partition)?;
            } else {
                map.add_partition(partition)?;
            }
        }

        info!(
            nodes = map.nodes.read().len(),
            partitions = map.partitions.read().len(),
            skipped = skipped.len(),
            "Cluster map ready"
        );
        Ok(map)
    }
}

/// Live view of the cluster topology and resource health
#[derive(Debug)]
pub struct ClusterMap {
    config: Arc<ClusterMapConfig>,
    clock: Arc<dyn Clock>,
    policies: Arc<dyn ResourceStatePolicyFactory>,
    resolver: Arc<dyn HostnameResolver>,
    override_store: Option<Arc<dyn PartitionOverrideStore>>,
    ssl_enabled: Arc<SslEnabledDatacenters>,
    ssl_xid: XidGate,
    nodes: RwLock<BTreeMap<DataNodeKey, Arc<DataNode>>>,
    partitions: RwLock<HashMap<PartitionId, Arc<Partition>>>,
}

impl ClusterMap {
    pub fn config(&self) -> &ClusterMapConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy_factory_name(&self) -> &str {
        self.policies.name()
    }

    /// Admit a data node declared in `datacenter`.
    ///
    /// Re-admitting a node with identical attributes is a no-op; the same
    /// identity with different attributes is an identity conflict.
    pub fn add_data_node(&self, datacenter: &str, layout: &NodeLayout) -> Result<Admission> {
        if layout.xid > self.config.current_xid {
            warn!(
                node = %layout.key(),
                xid = layout.xid,
                ceiling = self.config.current_xid,
                "Skipping data node above xid ceiling"
            );
            counter!("blobmap_clustermap_nodes_skipped_total").increment(1);
            return Ok(Admission::AboveCeiling);
        }

        if layout.port == 0 {
            return Err(ClusterMapError::MissingPlaintextPort {
                hostname: layout.hostname.clone(),
            });
        }
        let ports = PortSet::new(&layout.hostname, layout.port, layout.ssl_port)?;
        if self.config.resolve_hostnames {
            validate_hostname(self.resolver.as_ref(), &layout.hostname)?;
        }

        let key = layout.key();
        let node_state = self.policies.create(ResourceKind::DataNode, &key.to_string());

        let mut mounts = HashSet::new();
        let mut disks = Vec::with_capacity(layout.disks.len());
        for disk in &layout.disks {
            if !mounts.insert(disk.mount_path.as_str()) {
                return Err(ClusterMapError::malformed(format!(
                    "mount path {} declared twice on {key}",
                    disk.mount_path
                )));
            }
            let id = ResourceId::Disk {
                node: key.clone(),
                mount_path: disk.mount_path.clone(),
            };
            disks.push(Arc::new(Disk::new(
                key.clone(),
                disk.mount_path.clone(),
                disk.capacity_bytes,
                self.policies.create(ResourceKind::Disk, &id.to_string()),
                node_state.clone(),
            )));
        }

        let node = DataNode::new(
            layout.hostname.clone(),
            datacenter.to_string(),
            ports,
            layout.rack_id.clone(),
            layout.xid,
            node_state,
            self.ssl_enabled.clone(),
            disks,
        );

        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&key) {
            if existing.same_attributes(&node) {
                debug!(node = %key, "Data node already registered");
                return Ok(Admission::Duplicate);
            }
            return Err(ClusterMapError::IdentityConflict { node: key });
        }

        info!(
            node = %key,
            datacenter = %datacenter,
            disks = node.disks().len(),
            xid = layout.xid,
            "Admitted data node"
        );
        nodes.insert(key, Arc::new(node));
        Ok(Admission::Added)
    }

    /// Add a partition whose replicas reference admitted nodes and disks.
    ///
    /// Returns false if the partition is already known.
    pub fn add_partition(&self, layout: &PartitionLayout) -> Result<bool> {
        if self.partitions.read().contains_key(&layout.id) {
            return Ok(false);
        }

        let mut replicas = Vec::with_capacity(layout.replicas.len());
        for replica in &layout.replicas {
            let disk = self.require_disk(&replica.key(), &replica.mount_path).map_err(|_| {
                ClusterMapError::malformed(format!(
                    "partition {} references unknown disk {}{}",
                    layout.id,
                    replica.key(),
                    replica.mount_path
                ))
            })?;
            replicas.push(self.new_replica(layout.id, disk, false));
        }

        let class = layout
            .class
            .clone()
            .unwrap_or_else(|| self.config.default_partition_class.clone());
        let partition = Partition::new(layout.id, class, replicas);
        if layout.state == PartitionState::ReadOnly {
            partition.mark_read_only();
        }

        let mut partitions = self.partitions.write();
        if partitions.contains_key(&layout.id) {
            return Ok(false);
        }
        debug!(partition = %layout.id, class = %partition.class(), "Added partition");
        partitions.insert(layout.id, Arc::new(partition));
        Ok(true)
    }

    pub fn data_node(&self, key: &DataNodeKey) -> Option<Arc<DataNode>> {
        self.nodes.read().get(key).cloned()
    }

    /// All data nodes ordered by port, then hostname
    pub fn data_nodes(&self) -> Vec<Arc<DataNode>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Node entry of this process, if it hosts data
    pub fn local_data_node(&self) -> Option<Arc<DataNode>> {
        let port = self.config.port?;
        self.data_node(&DataNodeKey::new(self.config.host_name.clone(), port))
    }

    pub fn partition(&self, id: PartitionId) -> Option<Arc<Partition>> {
        self.partitions.read().get(&id).cloned()
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current SSL-required datacenters, sorted
    pub fn ssl_enabled_datacenters(&self) -> Vec<String> {
        self.ssl_enabled.to_vec()
    }

    /// Whether the addressed resource is currently usable
    pub fn is_available(&self, resource: &ResourceId) -> Result<bool> {
        Ok(match resource {
            ResourceId::Node(node) => self.require_node(node)?.is_available(),
            ResourceId::Disk { node, mount_path } => self.require_disk(node, mount_path)?.is_available(),
            ResourceId::Replica { partition, node } => self.require_replica(*partition, node)?.is_available(),
        })
    }

    pub fn on_node_event(&self, node: &DataNodeKey, outcome: Outcome) -> Result<()> {
        let node = self.require_node(node)?;
        record(node.policy().as_ref(), outcome);
        Ok(())
    }

    pub fn on_disk_event(&self, node: &DataNodeKey, mount_path: &str, outcome: Outcome) -> Result<()> {
        let disk = self.require_disk(node, mount_path)?;
        record(disk.policy().as_ref(), outcome);
        Ok(())
    }

    pub fn on_replica_event(&self, partition: PartitionId, node: &DataNodeKey, outcome: Outcome) -> Result<()> {
        let replica = self.require_replica(partition, node)?;
        record(replica.policy().as_ref(), outcome);
        Ok(())
    }

    /// Forward one observation to the resource it concerns
    pub fn on_event(&self, resource: &ResourceId, outcome: Outcome) -> Result<()> {
        match resource {
            ResourceId::Node(node) => self.on_node_event(node, outcome),
            ResourceId::Disk { node, mount_path } => self.on_disk_event(node, mount_path, outcome),
            ResourceId::Replica { partition, node } => self.on_replica_event(*partition, node, outcome),
        }
    }

    /// Route a request-layer event about a replica to the node, disk,
    /// replica or partition it concerns.
    pub fn on_replica_io_event(&self, partition: PartitionId, node: &DataNodeKey, event: ReplicaEventType) -> Result<()> {
        let replica = self.require_replica(partition, node)?;
        match event {
            ReplicaEventType::NodeResponse => self.on_node_event(node, Outcome::Success)?,
            ReplicaEventType::NodeTimeout => self.on_node_event(node, Outcome::Error)?,
            ReplicaEventType::DiskOk => record(replica.disk().policy().as_ref(), Outcome::Success),
            ReplicaEventType::DiskError => record(replica.disk().policy().as_ref(), Outcome::Error),
            ReplicaEventType::ReplicaAvailable => record(replica.policy().as_ref(), Outcome::Success),
            ReplicaEventType::ReplicaUnavailable => record(replica.policy().as_ref(), Outcome::Error),
            ReplicaEventType::PartitionReadOnly => {
                if self.config.enable_partition_override {
                    debug!(partition = %partition, "Ignoring read-only signal under partition override");
                } else if self.require_partition(partition)?.mark_read_only() {
                    info!(partition = %partition, replica = %node, "Partition marked read-only");
                }
            }
        }
        Ok(())
    }

    /// Every replica of the partition, regardless of state
    pub fn get_replicas_for_partition(&self, id: PartitionId) -> Result<Vec<Arc<Replica>>> {
        Ok(self.require_partition(id)?.replicas())
    }

    /// Replicas whose node, disk and own policy are all up, evaluated now
    pub fn get_eligible_replicas(&self, id: PartitionId) -> Result<Vec<Arc<Replica>>> {
        let mut replicas = self.require_partition(id)?.replicas();
        replicas.retain(|replica| replica.is_available());
        Ok(replicas)
    }

    /// Effective write state of a partition
    pub fn partition_state(&self, id: PartitionId) -> Result<PartitionState> {
        let partition = self.require_partition(id)?;
        Ok(match self.override_for(id) {
            Some(entry) => entry.state,
            None if self.config.enable_partition_override => PartitionState::ReadWrite,
            None => partition.derived_state(),
        })
    }

    /// Effective class of a partition
    pub fn partition_class(&self, id: PartitionId) -> Result<String> {
        let partition = self.require_partition(id)?;
        Ok(self
            .override_for(id)
            .and_then(|entry| entry.class)
            .unwrap_or_else(|| partition.class().to_string()))
    }

    /// Sorted list of the effective classes of all partitions
    pub fn partition_classes(&self) -> Vec<String> {
        let classes: BTreeSet<String> = self
            .partition_ids()
            .into_iter()
            .filter_map(|id| self.partition_class(id).ok())
            .collect();
        classes.into_iter().collect()
    }

    /// Read-write partitions of `class` (all classes when `None`).
    ///
    /// Partitions with every replica available are preferred; if none
    /// qualify, every read-write partition of the class is returned.
    pub fn get_writable_partitions(&self, class: Option<&str>) -> Vec<PartitionId> {
        let mut writable = Vec::new();
        let mut healthy = Vec::new();

        for id in self.partition_ids() {
            if let Some(class) = class
                && self.partition_class(id).ok().as_deref() != Some(class)
            {
                continue;
            }
            if self.partition_state(id).ok() != Some(PartitionState::ReadWrite) {
                continue;
            }
            writable.push(id);

            let all_up = self
                .partition(id)
                .map(|partition| {
                    let replicas = partition.replicas();
                    !replicas.is_empty() && replicas.iter().all(|replica| replica.is_available())
                })
                .unwrap_or(false);
            if all_up {
                healthy.push(id);
            }
        }

        if healthy.is_empty() { writable } else { healthy }
    }

    /// Merge a versioned topology change.
    ///
    /// Changes above the xid ceiling and changes older than the last one
    /// applied to the same resource are dropped and reported in the outcome.
    pub fn apply_topology_update(&self, update: &TopologyUpdate) -> Result<UpdateOutcome> {
        let xid = update.xid;
        if xid > self.config.current_xid {
            warn!(
                xid,
                ceiling = self.config.current_xid,
                change = %update.change,
                "Dropping topology update above xid ceiling"
            );
            counter!("blobmap_clustermap_updates_rejected_total", "reason" => "above_ceiling").increment(1);
            return Ok(UpdateOutcome::AboveCeiling);
        }

        let applied = match &update.change {
            TopologyChange::SslEnabledDatacenters { datacenters } => self.ssl_xid.advance(xid, || {
                self.ssl_enabled.replace(datacenters);
                info!(xid, datacenters = ?self.ssl_enabled.to_vec(), "Updated ssl-enabled datacenters");
                Ok(())
            })?,
            TopologyChange::SealedPartitions { node, partitions } => {
                if self.config.enable_partition_override {
                    debug!(node = %node, xid, "Ignoring seal update under partition override");
                    return Ok(UpdateOutcome::Ignored);
                }
                let node = self.require_node(node)?;
                node.xid_gate().advance(xid, || {
                    self.apply_sealed(node.node_key(), partitions);
                    Ok(())
                })?
            }
            TopologyChange::NodeLiveness { node, live } => {
                let node = self.require_node(node)?;
                node.xid_gate().advance(xid, || {
                    if *live {
                        node.policy().on_hard_up();
                    } else {
                        node.policy().on_hard_down();
                    }
                    Ok(())
                })?
            }
            TopologyChange::ReplicaAdded {
                partition,
                node,
                mount_path,
            } => {
                let disk = self.require_disk(node, mount_path)?;
                let target = self.partition_or_insert(*partition);
                if target.replica_on(node).is_some() {
                    debug!(partition = %partition, node = %node, xid, "Ignoring add for existing replica");
                    return Ok(UpdateOutcome::Ignored);
                }
                target.xid_gate().advance(xid, || {
                    if target.add_replica(self.new_replica(*partition, disk, false)) {
                        info!(partition = %partition, node = %node, mount_path = %mount_path, xid, "Replica added");
                    }
                    Ok(())
                })?
            }
            TopologyChange::ReplicaRemoved { partition, node } => {
                let target = self.require_partition(*partition)?;
                target.xid_gate().advance(xid, || {
                    target
                        .remove_replica(node)
                        .ok_or_else(|| ClusterMapError::UnknownReplica {
                            partition: *partition,
                            node: node.clone(),
                        })?;
                    info!(partition = %partition, node = %node, xid, "Replica removed");
                    Ok(())
                })?
            }
        };

        match applied {
            Some(()) => Ok(UpdateOutcome::Applied),
            None => {
                warn!(xid, change = %update.change, "Dropping stale topology update");
                counter!("blobmap_clustermap_updates_rejected_total", "reason" => "stale").increment(1);
                Ok(UpdateOutcome::Stale)
            }
        }
    }

    /// Render the current state without mutating it
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot::capture(self)
    }

    fn apply_sealed(&self, node: &DataNodeKey, sealed: &[PartitionId]) {
        let sealed: HashSet<PartitionId> = sealed.iter().copied().collect();
        for partition in self.partitions.read().values() {
            let Some(replica) = partition.replica_on(node) else {
                continue;
            };
            let now_sealed = sealed.contains(&partition.id());
            if replica.set_sealed(now_sealed) != now_sealed {
                info!(partition = %partition.id(), node = %node, sealed = now_sealed, "Replica seal state changed");
            }
        }
        for id in &sealed {
            if !self.partitions.read().contains_key(id) {
                debug!(partition = %id, node = %node, "Seal reported for unknown partition");
            }
        }
    }

    fn partition_or_insert(&self, id: PartitionId) -> Arc<Partition> {
        if let Some(partition) = self.partition(id) {
            return partition;
        }
        let mut partitions = self.partitions.write();
        partitions
            .entry(id)
            .or_insert_with(|| {
                info!(partition = %id, "Partition created by topology update");
                Arc::new(Partition::new(id, self.config.default_partition_class.clone(), Vec::new()))
            })
            .clone()
    }

    fn new_replica(&self, partition: PartitionId, disk: Arc<Disk>, sealed: bool) -> Arc<Replica> {
        let id = ResourceId::Replica {
            partition,
            node: disk.node().clone(),
        };
        let state = self.policies.create(ResourceKind::Replica, &id.to_string());
        Arc::new(Replica::new(partition, disk, state, sealed))
    }

    fn override_for(&self, id: PartitionId) -> Option<crate::override_store::PartitionOverride> {
        if !self.config.enable_partition_override {
            return None;
        }
        self.override_store.as_ref()?.partition_override(id)
    }

    fn require_node(&self, key: &DataNodeKey) -> Result<Arc<DataNode>> {
        self.data_node(key)
            .ok_or_else(|| ClusterMapError::UnknownDataNode(key.clone()))
    }

    fn require_disk(&self, node: &DataNodeKey, mount_path: &str) -> Result<Arc<Disk>> {
        self.require_node(node)?
            .disk(mount_path)
            .cloned()
            .ok_or_else(|| ClusterMapError::UnknownDisk {
                node: node.clone(),
                mount_path: mount_path.to_string(),
            })
    }

    fn require_partition(&self, id: PartitionId) -> Result<Arc<Partition>> {
        self.partition(id).ok_or(ClusterMapError::UnknownPartition(id))
    }

    fn require_replica(&self, partition: PartitionId, node: &DataNodeKey) -> Result<Arc<Replica>> {
        self.require_partition(partition)?
            .replica_on(node)
            .ok_or_else(|| ClusterMapError::UnknownReplica {
                partition,
                node: node.clone(),
            })
    }
}

fn record(policy: &dyn ResourceStatePolicy, outcome: Outcome) {
    match outcome {
        Outcome::Success => policy.on_success(),
        Outcome::Error => policy.on_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::layout::{DatacenterLayout, ReplicaLayout};
    use crate::override_store::{InMemoryOverrideStore, PartitionOverride};
    use crate::port::Port;
    use crate::resource::DataNodeId;
    use std::time::Duration;

    fn config() -> ClusterMapConfig {
        let mut config = ClusterMapConfig::new("blobs", "dc1", "h1");
        config.resolve_hostnames = false;
        config.port = Some(7000);
        config
    }

    fn replica(hostname: &str, mount_path: &str) -> ReplicaLayout {
        ReplicaLayout {
            hostname: hostname.to_string(),
            port: 7000,
            mount_path: mount_path.to_string(),
        }
    }

    fn layout() -> TopologyLayout {
        TopologyLayout {
            datacenters: vec![
                DatacenterLayout {
                    name: "dc1".into(),
                    nodes: vec![
                        NodeLayout::new("h1", 7000).with_ssl_port(7443).with_disk("/mnt0", 1 << 40),
                        NodeLayout::new("h2", 7000).with_disk("/mnt0", 1 << 40),
                    ],
                },
                DatacenterLayout {
                    name: "dc2".into(),
                    nodes: vec![NodeLayout::new("h3", 7000).with_ssl_port(7443).with_disk("/mnt0", 1 << 40)],
                },
            ],
            partitions: vec![
                PartitionLayout {
                    id: PartitionId(1),
                    class: None,
                    state: PartitionState::ReadWrite,
                    replicas: vec![replica("h1", "/mnt0"), replica("h2", "/mnt0"), replica("h3", "/mnt0")],
                },
                PartitionLayout {
                    id: PartitionId(2),
                    class: Some("small".into()),
                    state: PartitionState::ReadWrite,
                    replicas: vec![replica("h1", "/mnt0"), replica("h3", "/mnt0")],
                },
            ],
        }
    }

    fn build(config: ClusterMapConfig) -> (Arc<ManualClock>, ClusterMap) {
        let clock = Arc::new(ManualClock::starting_now());
        let map = ClusterMapBuilder::new(config)
            .clock(clock.clone())
            .build(&layout())
            .unwrap();
        (clock, map)
    }

    fn key(hostname: &str) -> DataNodeKey {
        DataNodeKey::new(hostname, 7000)
    }

    #[test]
    fn test_build_admits_layout() {
        let (_, map) = build(config());

        assert_eq!(map.data_nodes().len(), 3);
        assert_eq!(map.partition_ids(), vec![PartitionId(1), PartitionId(2)]);
        assert_eq!(map.local_data_node().unwrap().key(), key("h1"));
        assert_eq!(
            map.partition_class(PartitionId(1)).unwrap(),
            crate::config::DEFAULT_PARTITION_CLASS
        );
        assert_eq!(
            map.partition_classes(),
            vec![crate::config::DEFAULT_PARTITION_CLASS.to_string(), "small".to_string()]
        );
    }

    #[test]
    fn test_node_down_after_threshold() {
        let (clock, map) = build(config());
        let node = ResourceId::Node(key("h2"));

        map.on_event(&node, Outcome::Error).unwrap();
        map.on_event(&node, Outcome::Error).unwrap();
        assert!(map.is_available(&node).unwrap());

        map.on_event(&node, Outcome::Error).unwrap();
        assert!(!map.is_available(&node).unwrap());

        clock.advance(Duration::from_millis(map.config().datanode_retry_backoff_ms));
        assert!(map.is_available(&node).unwrap());
    }

    #[test]
    fn test_eligible_replicas_follow_disk_and_node() {
        let (_, map) = build(config());

        assert_eq!(map.get_eligible_replicas(PartitionId(1)).unwrap().len(), 3);

        map.on_disk_event(&key("h2"), "/mnt0", Outcome::Error).unwrap();
        let eligible: Vec<_> = map
            .get_eligible_replicas(PartitionId(1))
            .unwrap()
            .iter()
            .map(|replica| replica.node().clone())
            .collect();
        assert_eq!(eligible, vec![key("h1"), key("h3")]);

        for _ in 0..3 {
            map.on_node_event(&key("h3"), Outcome::Error).unwrap();
        }
        assert_eq!(map.get_eligible_replicas(PartitionId(1)).unwrap().len(), 1);
        assert_eq!(map.get_replicas_for_partition(PartitionId(1)).unwrap().len(), 3);

        map.on_node_event(&key("h3"), Outcome::Success).unwrap();
        assert_eq!(map.get_eligible_replicas(PartitionId(1)).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_resources_are_errors() {
        let (_, map) = build(config());

        assert!(matches!(
            map.is_available(&ResourceId::Node(key("nope"))),
            Err(ClusterMapError::UnknownDataNode(_))
        ));
        assert!(matches!(
            map.on_disk_event(&key("h1"), "/mnt9", Outcome::Error),
            Err(ClusterMapError::UnknownDisk { .. })
        ));
        assert!(matches!(
            map.get_eligible_replicas(PartitionId(99)),
            Err(ClusterMapError::UnknownPartition(_))
        ));
        assert!(matches!(
            map.on_replica_event(PartitionId(2), &key("h2"), Outcome::Error),
            Err(ClusterMapError::UnknownReplica { .. })
        ));
    }

    #[test]
    fn test_update_above_ceiling_is_noop() {
        let mut config = config();
        config.current_xid = 100;
        let (_, map) = build(config);

        let update = TopologyUpdate::new(
            101,
            TopologyChange::SslEnabledDatacenters {
                datacenters: vec!["dc1".into()],
            },
        );
        assert_eq!(map.apply_topology_update(&update).unwrap(), UpdateOutcome::AboveCeiling);
        assert!(map.ssl_enabled_datacenters().is_empty());

        let update = TopologyUpdate::new(100, update.change.clone());
        assert_eq!(map.apply_topology_update(&update).unwrap(), UpdateOutcome::Applied);
        assert_eq!(map.ssl_enabled_datacenters(), vec!["dc1"]);
    }

    #[test]
    fn test_ssl_update_changes_connect_endpoint() {
        let (_, map) = build(config());
        let h1 = map.data_node(&key("h1")).unwrap();
        let h2 = map.data_node(&key("h2")).unwrap();
        assert_eq!(h1.connect_endpoint().unwrap(), Port::plaintext(7000));

        let update = TopologyUpdate::new(
            1,
            TopologyChange::SslEnabledDatacenters {
                datacenters: vec!["dc1".into()],
            },
        );
        map.apply_topology_update(&update).unwrap();

        assert_eq!(h1.connect_endpoint().unwrap(), Port::ssl(7443));
        assert!(matches!(
            h2.connect_endpoint(),
            Err(ClusterMapError::UnavailableEndpoint { .. })
        ));
    }

    #[test]
    fn test_stale_update_not_applied() {
        let (_, map) = build(config());
        let sealed = |xid, partitions: Vec<u64>| {
            TopologyUpdate::new(
                xid,
                TopologyChange::SealedPartitions {
                    node: key("h1"),
                    partitions: partitions.into_iter().map(PartitionId).collect(),
                },
            )
        };

        assert!(map.apply_topology_update(&sealed(5, vec![1])).unwrap().is_applied());
        assert_eq!(map.partition_state(PartitionId(1)).unwrap(), PartitionState::ReadOnly);
        assert_eq!(map.get_writable_partitions(None), vec![PartitionId(2)]);

        assert_eq!(map.apply_topology_update(&sealed(4, vec![])).unwrap(), UpdateOutcome::Stale);
        assert_eq!(map.partition_state(PartitionId(1)).unwrap(), PartitionState::ReadOnly);

        assert!(map.apply_topology_update(&sealed(6, vec![])).unwrap().is_applied());
        assert_eq!(map.partition_state(PartitionId(1)).unwrap(), PartitionState::ReadWrite);
    }

    #[test]
    fn test_node_liveness_update_hard_down() {
        let (clock, map) = build(config());
        let down = TopologyUpdate::new(
            1,
            TopologyChange::NodeLiveness {
                node: key("h2"),
                live: false,
            },
        );
        map.apply_topology_update(&down).unwrap();

        clock.advance(Duration::from_secs(3600));
        assert!(!map.is_available(&ResourceId::Node(key("h2"))).unwrap());
        assert!(
            !map.is_available(&ResourceId::Disk {
                node: key("h2"),
                mount_path: "/mnt0".into()
            })
            .unwrap()
        );

        let up = TopologyUpdate::new(
            2,
            TopologyChange::NodeLiveness {
                node: key("h2"),
                live: true,
            },
        );
        map.apply_topology_update(&up).unwrap();
        assert!(map.is_available(&ResourceId::Node(key("h2"))).unwrap());
    }

    #[test]
    fn test_replica_set_changes() {
        let (_, map) = build(config());

        let added = TopologyUpdate::new(
            1,
            TopologyChange::ReplicaAdded {
                partition: PartitionId(2),
                node: key("h2"),
                mount_path: "/mnt0".into(),
            },
        );
        assert!(map.apply_topology_update(&added).unwrap().is_applied());
        assert_eq!(map.get_replicas_for_partition(PartitionId(2)).unwrap().len(), 3);

        let duplicate = TopologyUpdate::new(5, added.change.clone());
        assert_eq!(map.apply_topology_update(&duplicate).unwrap(), UpdateOutcome::Ignored);
        assert_eq!(map.partition(PartitionId(2)).unwrap().xid_gate().current(), 1);
        assert_eq!(map.get_replicas_for_partition(PartitionId(2)).unwrap().len(), 3);

        let removed = TopologyUpdate::new(
            2,
            TopologyChange::ReplicaRemoved {
                partition: PartitionId(2),
                node: key("h1"),
            },
        );
        assert!(map.apply_topology_update(&removed).unwrap().is_applied());
        assert!(map.get_replicas_for_partition(PartitionId(2)).unwrap().iter().all(|r| r.node() != &key("h1")));

        let again = TopologyUpdate::new(3, removed.change.clone());
        assert!(map.apply_topology_update(&again).is_err());

        let fresh = TopologyUpdate::new(
            4,
            TopologyChange::ReplicaAdded {
                partition: PartitionId(7),
                node: key("h3"),
                mount_path: "/mnt0".into(),
            },
        );
        map.apply_topology_update(&fresh).unwrap();
        assert_eq!(map.partition_ids(), vec![PartitionId(1), PartitionId(2), PartitionId(7)]);
    }

    #[test]
    fn test_override_enabled_requires_store() {
        let mut config = config();
        config.enable_partition_override = true;

        let err = ClusterMapBuilder::new(config).build(&layout()).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_override_store_is_authoritative() {
        let mut config = config();
        config.enable_partition_override = true;
        let store: InMemoryOverrideStore = [(
            PartitionId(1),
            PartitionOverride {
                state: PartitionState::ReadOnly,
                class: Some("archive".into()),
            },
        )]
        .into_iter()
        .collect();

        let map = ClusterMapBuilder::new(config)
            .override_store(Arc::new(store))
            .build(&layout())
            .unwrap();

        assert_eq!(map.partition_state(PartitionId(1)).unwrap(), PartitionState::ReadOnly);
        assert_eq!(map.partition_class(PartitionId(1)).unwrap(), "archive");
        assert_eq!(map.partition_state(PartitionId(2)).unwrap(), PartitionState::ReadWrite);
        assert_eq!(map.partition_class(PartitionId(2)).unwrap(), "small");

        let sealed = TopologyUpdate::new(
            1,
            TopologyChange::SealedPartitions {
                node: key("h1"),
                partitions: vec![PartitionId(2)],
            },
        );
        assert_eq!(map.apply_topology_update(&sealed).unwrap(), UpdateOutcome::Ignored);
        assert_eq!(map.partition_state(PartitionId(2)).unwrap(), PartitionState::ReadWrite);

        map.on_replica_io_event(PartitionId(2), &key("h1"), ReplicaEventType::PartitionReadOnly)
            .unwrap();
        assert_eq!(map.partition_state(PartitionId(2)).unwrap(), PartitionState::ReadWrite);
    }

    #[test]
    fn test_replica_io_events_route_to_policies() {
        let (_, map) = build(config());
        let p = PartitionId(1);

        map.on_replica_io_event(p, &key("h1"), ReplicaEventType::ReplicaUnavailable)
            .unwrap();
        let replica = map.partition(p).unwrap().replica_on(&key("h1")).unwrap();
        assert!(!replica.is_available());
        assert!(replica.disk().is_available());

        map.on_replica_io_event(p, &key("h1"), ReplicaEventType::ReplicaAvailable)
            .unwrap();
        assert!(replica.is_available());

        map.on_replica_io_event(p, &key("h2"), ReplicaEventType::DiskError).unwrap();
        assert!(
            !map.is_available(&ResourceId::Disk {
                node: key("h2"),
                mount_path: "/mnt0".into()
            })
            .unwrap()
        );
        map.on_replica_io_event(p, &key("h2"), ReplicaEventType::DiskOk).unwrap();

        for _ in 0..3 {
            map.on_replica_io_event(p, &key("h3"), ReplicaEventType::NodeTimeout)
                .unwrap();
        }
        assert!(!map.is_available(&ResourceId::Node(key("h3"))).unwrap());
        map.on_replica_io_event(p, &key("h3"), ReplicaEventType::NodeResponse)
            .unwrap();
        assert!(map.is_available(&ResourceId::Node(key("h3"))).unwrap());

        map.on_replica_io_event(p, &key("h3"), ReplicaEventType::PartitionReadOnly)
            .unwrap();
        assert_eq!(map.partition_state(p).unwrap(), PartitionState::ReadOnly);
    }

    #[test]
    fn test_writable_partitions_prefer_healthy() {
        let (_, map) = build(config());

        assert_eq!(map.get_writable_partitions(Some("small")), vec![PartitionId(2)]);
        assert_eq!(map.get_writable_partitions(None), vec![PartitionId(1), PartitionId(2)]);

        map.on_disk_event(&key("h2"), "/mnt0", Outcome::Error).unwrap();
        assert_eq!(map.get_writable_partitions(None), vec![PartitionId(2)]);

        map.on_disk_event(&key("h1"), "/mnt0", Outcome::Error).unwrap();
        assert_eq!(map.get_writable_partitions(None), vec![PartitionId(1), PartitionId(2)]);
    }

    #[test]
    fn test_duplicate_and_conflicting_admission() {
        let (_, map) = build(config());

        let same = NodeLayout::new("h2", 7000).with_disk("/mnt0", 1 << 40);
        assert_eq!(map.add_data_node("dc1", &same).unwrap(), Admission::Duplicate);

        let conflicting = NodeLayout::new("h2", 7000).with_disk("/mnt1", 1 << 40);
        assert!(matches!(
            map.add_data_node("dc1", &conflicting),
            Err(ClusterMapError::IdentityConflict { .. })
        ));
    }

    #[test]
    fn test_node_above_ceiling_skipped_with_its_replicas() {
        let mut config = config();
        config.current_xid = 10;
        let mut layout = layout();
        layout.datacenters[1].nodes[0].xid = 11;

        let map = ClusterMapBuilder::new(config).build(&layout).unwrap();
        assert!(map.data_node(&key("h3")).is_none());
        assert_eq!(map.get_replicas_for_partition(PartitionId(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_plaintext_port_is_fatal() {
        let (_, map) = build(config());
        let err = map.add_data_node("dc1", &NodeLayout::new("h9", 0)).unwrap_err();
        assert!(matches!(err, ClusterMapError::MissingPlaintextPort { .. }));
    }
}
