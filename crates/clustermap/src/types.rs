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

//! Core value types shared by the cluster map

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Logical shard identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PartitionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identity of a data node: hostname plus plaintext port.
///
/// Ordering compares the port first and breaks ties on the hostname, which
/// keeps iteration over the topology deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataNodeKey {
    pub hostname: String,
    pub port: u16,
}

impl DataNodeKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl Ord for DataNodeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.port
            .cmp(&other.port)
            .then_with(|| self.hostname.cmp(&other.hostname))
    }
}

impl PartialOrd for DataNodeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DataNodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Kind of hardware resource tracked by a state policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    DataNode,
    Disk,
    Replica,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::DataNode => "datanode",
            ResourceKind::Disk => "disk",
            ResourceKind::Replica => "replica",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a single resource in the topology
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceId {
    Node(DataNodeKey),
    Disk { node: DataNodeKey, mount_path: String },
    Replica { partition: PartitionId, node: DataNodeKey },
}

impl ResourceId {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceId::Node(_) => ResourceKind::DataNode,
            ResourceId::Disk { .. } => ResourceKind::Disk,
            ResourceId::Replica { .. } => ResourceKind::Replica,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Node(node) => write!(f, "{node}"),
            ResourceId::Disk { node, mount_path } => write!(f, "{node}{mount_path}"),
            ResourceId::Replica { partition, node } => write!(f, "{node}/partition-{partition}"),
        }
    }
}

/// Result of an I/O operation against a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
}

/// Externally visible liveness of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liveness {
    Up,
    Down,
}

impl Liveness {
    #[inline]
    pub fn from_down(down: bool) -> Self {
        if down { Liveness::Down } else { Liveness::Up }
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        matches!(self, Liveness::Up)
    }
}

/// Write state of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    /// Partition accepts new writes
    #[default]
    ReadWrite,

    /// Partition is sealed and excluded from new-write routing
    ReadOnly,
}

/// Events reported by the request layer after talking to a replica.
///
/// Each event is routed to the state policy of the resource it concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaEventType {
    /// The node answered the request
    NodeResponse,

    /// The request to the node timed out
    NodeTimeout,

    /// The disk hosting the replica reported an I/O error
    DiskError,

    /// The disk hosting the replica served the request
    DiskOk,

    /// The replica rejected a write because its partition is read-only
    PartitionReadOnly,

    /// The replica could not serve the request
    ReplicaUnavailable,

    /// The replica served the request
    ReplicaAvailable,
}
