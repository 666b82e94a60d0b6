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

//! Topology updates delivered by coordination feeds

use crate::types::{DataNodeKey, PartitionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A versioned change to one part of the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub xid: i64,

    #[serde(flatten)]
    pub change: TopologyChange,
}

/// Delta carried by a [`TopologyUpdate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyChange {
    /// Replace the cluster-wide set of SSL-required datacenters
    SslEnabledDatacenters { datacenters: Vec<String> },

    /// Full list of sealed partitions reported by one node.
    /// Replicas on the node not listed are unsealed.
    SealedPartitions {
        node: DataNodeKey,
        partitions: Vec<PartitionId>,
    },

    /// Hard liveness signal for a node
    NodeLiveness { node: DataNodeKey, live: bool },

    ReplicaAdded {
        partition: PartitionId,
        node: DataNodeKey,
        mount_path: String,
    },

    ReplicaRemoved { partition: PartitionId, node: DataNodeKey },
}

impl TopologyUpdate {
    pub fn new(xid: i64, change: TopologyChange) -> Self {
        Self { xid, change }
    }
}

impl fmt::Display for TopologyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyChange::SslEnabledDatacenters { .. } => f.write_str("ssl_enabled_datacenters"),
            TopologyChange::SealedPartitions { node, .. } => write!(f, "sealed_partitions({node})"),
            TopologyChange::NodeLiveness { node, .. } => write!(f, "node_liveness({node})"),
            TopologyChange::ReplicaAdded { partition, node, .. } => write!(f, "replica_added({partition}@{node})"),
            TopologyChange::ReplicaRemoved { partition, node } => write!(f, "replica_removed({partition}@{node})"),
        }
    }
}

/// What happened to a topology update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied,

    /// Xid above the configured ceiling; dropped
    AboveCeiling,

    /// Older than a change already applied to the same resource
    Stale,

    /// Nothing to do: seal signals under partition override, or a replica that already exists
    Ignored,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}
