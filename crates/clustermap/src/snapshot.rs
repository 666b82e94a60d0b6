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

//! Point-in-time documents describing the cluster map
//!
//! Snapshots are plain values: capturing one reads every resource
//! independently and never mutates policy state.

use crate::clock::Clock;
use crate::cluster_map::ClusterMap;
use crate::resource::{DataNodeId, DiskId, ReplicaId};
use crate::types::{Liveness, PartitionId, PartitionState};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub cluster_name: String,
    pub local_datacenter: String,
    pub captured_at: DateTime<Utc>,
    pub ssl_enabled_datacenters: Vec<String>,
    pub nodes: Vec<NodeSnapshot>,
    pub partitions: Vec<PartitionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub hostname: String,
    pub datacenter: String,
    pub ssl_enabled_datacenters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rack_id: Option<String>,
    pub ports: PortsSnapshot,
    pub xid: i64,
    pub liveness: Liveness,
    pub disks: Vec<DiskSnapshot>,
}

/// Ports of a node and the one peers connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortsSnapshot {
    #[serde(rename = "PLAINTEXT")]
    pub plaintext: u16,

    #[serde(rename = "SSL", skip_serializing_if = "Option::is_none")]
    pub ssl: Option<u16>,

    /// Null when the node has no usable endpoint
    #[serde(rename = "connectTo")]
    pub connect_to: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSnapshot {
    pub mount_path: String,
    pub capacity_bytes: u64,
    pub liveness: Liveness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSnapshot {
    pub id: PartitionId,
    pub class: String,
    pub state: PartitionState,
    pub replicas: Vec<ReplicaSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    pub hostname: String,
    pub port: u16,
    pub mount_path: String,
    pub sealed: bool,
    pub liveness: Liveness,
}

/// Render one data node, whatever its implementation
pub fn node_snapshot(node: &dyn DataNodeId) -> NodeSnapshot {
    NodeSnapshot {
        hostname: node.hostname().to_string(),
        datacenter: node.datacenter().to_string(),
        ssl_enabled_datacenters: node.ssl_enabled_datacenters(),
        rack_id: node.rack_id().map(str::to_string),
        ports: PortsSnapshot {
            plaintext: node.port(),
            ssl: node.ssl_port(),
            connect_to: node.connect_endpoint().ok().map(|port| port.number()),
        },
        xid: node.xid(),
        liveness: node.state(),
        disks: node
            .disk_ids()
            .iter()
            .map(|disk| DiskSnapshot {
                mount_path: disk.mount_path().to_string(),
                capacity_bytes: disk.capacity_bytes(),
                liveness: disk.state(),
            })
            .collect(),
    }
}

impl ClusterSnapshot {
    pub fn capture(map: &ClusterMap) -> Self {
        let config = map.config();

        let partitions = map
            .partition_ids()
            .into_iter()
            .filter_map(|id| {
                let partition = map.partition(id)?;
                Some(PartitionSnapshot {
                    id,
                    class: map.partition_class(id).ok()?,
                    state: map.partition_state(id).ok()?,
                    replicas: partition
                        .replicas()
                        .iter()
                        .map(|replica| ReplicaSnapshot {
                            hostname: replica.node().hostname.clone(),
                            port: replica.node().port,
                            mount_path: replica.mount_path().to_string(),
                            sealed: replica.is_sealed(),
                            liveness: replica.state(),
                        })
                        .collect(),
                })
            })
            .collect();

        Self {
            cluster_name: config.cluster_name.clone(),
            local_datacenter: config.datacenter_name.clone(),
            captured_at: map.clock().now(),
            ssl_enabled_datacenters: map.ssl_enabled_datacenters(),
            nodes: map
                .data_nodes()
                .iter()
                .map(|node| node_snapshot(node.as_ref()))
                .collect(),
            partitions,
        }
    }

    pub fn node(&self, hostname: &str, port: u16) -> Option<&NodeSnapshot> {
        self.nodes
            .iter()
            .find(|node| node.hostname == hostname && node.ports.plaintext == port)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
