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

//! Static topology layout
//!
//! The layout is the bootstrap description of the cluster: datacenters with
//! their nodes and disks, and partitions with the replicas placing them on
//! those disks. It is read once as JSON and validated before admission.

use crate::error::{ClusterMapError, Result};
use crate::types::{DataNodeKey, PartitionId, PartitionState};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyLayout {
    #[serde(default)]
    pub datacenters: Vec<DatacenterLayout>,

    #[serde(default)]
    pub partitions: Vec<PartitionLayout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatacenterLayout {
    pub name: String,

    #[serde(default)]
    pub nodes: Vec<NodeLayout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLayout {
    pub hostname: String,

    /// Plaintext port
    pub port: u16,

    #[serde(default)]
    pub ssl_port: Option<u16>,

    #[serde(default)]
    pub rack_id: Option<String>,

    #[serde(default = "default_xid")]
    pub xid: i64,

    #[serde(default)]
    pub disks: Vec<DiskLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayout {
    pub mount_path: String,

    #[serde(default)]
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionLayout {
    pub id: PartitionId,

    /// Falls back to the configured default class
    #[serde(default)]
    pub class: Option<String>,

    #[serde(default)]
    pub state: PartitionState,

    #[serde(default)]
    pub replicas: Vec<ReplicaLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLayout {
    pub hostname: String,
    pub port: u16,
    pub mount_path: String,
}

fn default_xid() -> i64 {
    i64::MIN
}

impl NodeLayout {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ssl_port: None,
            rack_id: None,
            xid: default_xid(),
            disks: Vec::new(),
        }
    }

    pub fn with_ssl_port(mut self, port: u16) -> Self {
        self.ssl_port = Some(port);
        self
    }

    pub fn with_disk(mut self, mount_path: impl Into<String>, capacity_bytes: u64) -> Self {
        self.disks.push(DiskLayout {
            mount_path: mount_path.into(),
            capacity_bytes,
        });
        self
    }

    pub fn with_xid(mut self, xid: i64) -> Self {
        self.xid = xid;
        self
    }

    pub fn key(&self) -> DataNodeKey {
        DataNodeKey::new(self.hostname.clone(), self.port)
    }
}

impl ReplicaLayout {
    pub fn key(&self) -> DataNodeKey {
        DataNodeKey::new(self.hostname.clone(), self.port)
    }
}

impl TopologyLayout {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let layout: Self = serde_json::from_str(content)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ClusterMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Structural checks that do not depend on configuration
    pub fn validate(&self) -> Result<()> {
        let mut datacenters = HashSet::new();
        let mut nodes = HashSet::new();

        for dc in &self.datacenters {
            if dc.name.trim().is_empty() {
                return Err(ClusterMapError::malformed("datacenter with empty name"));
            }
            if !datacenters.insert(dc.name.as_str()) {
                return Err(ClusterMapError::malformed(format!("datacenter {} declared twice", dc.name)));
            }

            for node in &dc.nodes {
                if node.hostname.trim().is_empty() {
                    return Err(ClusterMapError::malformed(format!("node with empty hostname in {}", dc.name)));
                }
                if node.port == 0 {
                    return Err(ClusterMapError::MissingPlaintextPort {
                        hostname: node.hostname.clone(),
                    });
                }
                if !nodes.insert(node.key()) {
                    return Err(ClusterMapError::malformed(format!("node {} declared twice", node.key())));
                }

                let mut mounts = HashSet::new();
                for disk in &node.disks {
                    if !disk.mount_path.starts_with('/') {
                        return Err(ClusterMapError::malformed(format!(
                            "mount path {:?} on {} must be absolute",
                            disk.mount_path,
                            node.key()
                        )));
                    }
                    if !mounts.insert(disk.mount_path.as_str()) {
                        return Err(ClusterMapError::malformed(format!(
                            "mount path {} declared twice on {}",
                            disk.mount_path,
                            node.key()
                        )));
                    }
                }
            }
        }

        let mut partitions = HashSet::new();
        for partition in &self.partitions {
            if !partitions.insert(partition.id) {
                return Err(ClusterMapError::malformed(format!("partition {} declared twice", partition.id)));
            }
            let mut replica_nodes = HashSet::new();
            for replica in &partition.replicas {
                if !replica_nodes.insert(replica.key()) {
                    return Err(ClusterMapError::malformed(format!(
                        "partition {} has two replicas on {}",
                        partition.id,
                        replica.key()
                    )));
                }
            }
        }

        Ok(())
    }
}
