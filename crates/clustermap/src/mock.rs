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

//! In-memory data nodes, disks and replicas for tests of code that consumes
//! the identity traits.
//!
//! Mock state never changes on its own: resources stay down or timed out
//! until told otherwise.

use crate::error::Result;
use crate::port::{Port, PortSet, SslEnabledDatacenters};
use crate::resource::{DataNodeId, DiskId, ReplicaId};
use crate::types::{DataNodeKey, Liveness, PartitionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

const MOCK_DISK_CAPACITY: u64 = 1 << 40;

#[derive(Debug)]
pub struct MockDataNode {
    key: DataNodeKey,
    ports: PortSet,
    datacenter: String,
    rack_id: Option<String>,
    xid: AtomicI64,
    ssl_enabled: SslEnabledDatacenters,
    disks: Vec<Arc<MockDisk>>,
    down: Arc<AtomicBool>,
    timed_out: AtomicBool,
}

impl MockDataNode {
    pub fn new<S: AsRef<str>>(hostname: &str, ports: Vec<Port>, mount_paths: &[S], datacenter: &str) -> Result<Self> {
        let ports = PortSet::from_ports(hostname, ports)?;
        let key = DataNodeKey::new(hostname, ports.plaintext().number());
        let down = Arc::new(AtomicBool::new(false));
        let disks = mount_paths
            .iter()
            .map(|mount_path| {
                Arc::new(MockDisk {
                    node: key.clone(),
                    mount_path: mount_path.as_ref().to_string(),
                    capacity_bytes: MOCK_DISK_CAPACITY,
                    down: AtomicBool::new(false),
                    node_down: down.clone(),
                })
            })
            .collect();

        Ok(Self {
            key,
            ports,
            datacenter: datacenter.to_string(),
            rack_id: None,
            xid: AtomicI64::new(i64::MIN),
            ssl_enabled: SslEnabledDatacenters::default(),
            disks,
            down,
            timed_out: AtomicBool::new(false),
        })
    }

    pub fn with_rack_id(mut self, rack_id: impl Into<String>) -> Self {
        self.rack_id = Some(rack_id.into());
        self
    }

    pub fn set_ssl_enabled_datacenters<I, S>(&self, datacenters: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ssl_enabled.replace(datacenters);
    }

    pub fn set_xid(&self, xid: i64) {
        self.xid.store(xid, Ordering::Release);
    }

    pub fn mock_disks(&self) -> &[Arc<MockDisk>] {
        &self.disks
    }

    pub fn mock_disk(&self, mount_path: &str) -> Option<&Arc<MockDisk>> {
        self.disks.iter().find(|disk| disk.mount_path == mount_path)
    }

    pub fn force_down(&self) {
        self.down.store(true, Ordering::Release);
    }

    pub fn force_up(&self) {
        self.down.store(false, Ordering::Release);
    }

    /// Report the node as down until the next response
    pub fn force_timeout(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    pub fn on_node_response(&self) {
        self.timed_out.store(false, Ordering::Release);
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }
}

impl DataNodeId for MockDataNode {
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
        self.xid.load(Ordering::Acquire)
    }

    fn ssl_enabled_datacenters(&self) -> Vec<String> {
        self.ssl_enabled.to_vec()
    }

    fn connect_endpoint(&self) -> Result<Port> {
        self.ports.connect_port(&self.key, &self.datacenter, &self.ssl_enabled)
    }

    fn state(&self) -> Liveness {
        Liveness::from_down(self.down.load(Ordering::Acquire) || self.is_timed_out())
    }

    fn disk_ids(&self) -> Vec<Arc<dyn DiskId>> {
        self.disks
            .iter()
            .map(|disk| Arc::clone(disk) as Arc<dyn DiskId>)
            .collect()
    }
}

#[derive(Debug)]
pub struct MockDisk {
    node: DataNodeKey,
    mount_path: String,
    capacity_bytes: u64,
    down: AtomicBool,
    node_down: Arc<AtomicBool>,
}

impl MockDisk {
    pub fn force_down(&self) {
        self.down.store(true, Ordering::Release);
    }

    pub fn force_up(&self) {
        self.down.store(false, Ordering::Release);
    }
}

impl DiskId for MockDisk {
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
        Liveness::from_down(self.down.load(Ordering::Acquire) || self.node_down.load(Ordering::Acquire))
    }
}

#[derive(Debug)]
pub struct MockReplica {
    partition: PartitionId,
    disk: Arc<MockDisk>,
    sealed: AtomicBool,
    down: AtomicBool,
}

impl MockReplica {
    pub fn new(partition: PartitionId, disk: Arc<MockDisk>) -> Self {
        Self {
            partition,
            disk,
            sealed: AtomicBool::new(false),
            down: AtomicBool::new(false),
        }
    }

    pub fn set_sealed(&self, sealed: bool) {
        self.sealed.store(sealed, Ordering::Release);
    }

    pub fn force_down(&self) {
        self.down.store(true, Ordering::Release);
    }

    pub fn force_up(&self) {
        self.down.store(false, Ordering::Release);
    }
}

impl ReplicaId for MockReplica {
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
        self.sealed.load(Ordering::Acquire)
    }

    fn state(&self) -> Liveness {
        let down = self.down.load(Ordering::Acquire) || !self.disk.state().is_up();
        Liveness::from_down(down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterMapError;
    use crate::snapshot::node_snapshot;

    fn node(ports: Vec<Port>) -> MockDataNode {
        MockDataNode::new("h1", ports, &["/mnt0", "/mnt1"], "dc1").unwrap()
    }

    #[test]
    fn test_connect_endpoint_scenario() {
        let n1 = node(vec![Port::plaintext(7000)]);

        n1.set_ssl_enabled_datacenters(["dc2"]);
        assert_eq!(n1.connect_endpoint().unwrap(), Port::plaintext(7000));

        n1.set_ssl_enabled_datacenters(["dc1"]);
        assert!(matches!(
            n1.connect_endpoint(),
            Err(ClusterMapError::UnavailableEndpoint { .. })
        ));

        let n2 = node(vec![Port::plaintext(7000), Port::ssl(7443)]);
        n2.set_ssl_enabled_datacenters(["dc1"]);
        assert_eq!(n2.connect_endpoint().unwrap(), Port::ssl(7443));
    }

    #[test]
    fn test_missing_plaintext_port() {
        let err = MockDataNode::new("h1", vec![Port::ssl(7443)], &["/mnt0"], "dc1").unwrap_err();
        assert!(matches!(err, ClusterMapError::MissingPlaintextPort { .. }));
    }

    #[test]
    fn test_force_down_propagates_to_disks_and_replicas() {
        let n1 = node(vec![Port::plaintext(7000)]);
        let replica = MockReplica::new(PartitionId(5), n1.mock_disk("/mnt1").unwrap().clone());
        assert_eq!(replica.state(), Liveness::Up);

        n1.force_down();
        assert_eq!(n1.state(), Liveness::Down);
        assert!(n1.disk_ids().iter().all(|disk| disk.state() == Liveness::Down));
        assert_eq!(replica.state(), Liveness::Down);

        n1.force_up();
        n1.mock_disk("/mnt1").unwrap().force_down();
        assert_eq!(n1.state(), Liveness::Up);
        assert_eq!(replica.state(), Liveness::Down);
        assert_eq!(replica.node_key(), DataNodeKey::new("h1", 7000));
    }

    #[test]
    fn test_timeout_until_response() {
        let n1 = node(vec![Port::plaintext(7000)]);

        n1.force_timeout();
        assert!(n1.is_timed_out());
        assert_eq!(n1.state(), Liveness::Down);

        n1.on_node_response();
        assert_eq!(n1.state(), Liveness::Up);
    }

    #[test]
    fn test_mock_snapshot() {
        let n1 = node(vec![Port::plaintext(7000), Port::ssl(7443)]).with_rack_id("r1");
        n1.set_xid(12);
        n1.mock_disk("/mnt0").unwrap().force_down();

        let snapshot = node_snapshot(&n1);
        assert_eq!(snapshot.ports.connect_to, Some(7000));
        assert_eq!(snapshot.rack_id.as_deref(), Some("r1"));
        assert_eq!(snapshot.xid, 12);
        assert_eq!(snapshot.disks[0].liveness, Liveness::Down);
        assert_eq!(snapshot.disks[1].liveness, Liveness::Up);
    }
}
