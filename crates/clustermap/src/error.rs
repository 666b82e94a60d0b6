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

//! Cluster map error types

use crate::types::{DataNodeKey, PartitionId};
use thiserror::Error;

/// Errors raised by the cluster map
#[derive(Debug, Error)]
pub enum ClusterMapError {
    /// Configuration is invalid
    #[error("Invalid cluster map configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Numeric configuration value outside its accepted range
    #[error("Config {key} = {value} is outside the accepted range [{min}, {max}]")]
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Node declared without a plaintext port
    #[error("No plaintext port found for data node {hostname}")]
    MissingPlaintextPort { hostname: String },

    /// Topology layout is structurally invalid
    #[error("Malformed topology layout: {reason}")]
    MalformedLayout { reason: String },

    /// Declared hostname does not match the resolver
    #[error("Hostname {hostname} failed validation: {reason}")]
    HostnameValidation { hostname: String, reason: String },

    /// Secure endpoint requested for a node without an SSL port
    #[error("No SSL port exists for data node {node} in ssl-enabled datacenter {datacenter}")]
    UnavailableEndpoint { node: DataNodeKey, datacenter: String },

    /// Two registrations share an identity but disagree on attributes
    #[error("Data node {node} registered twice with conflicting attributes")]
    IdentityConflict { node: DataNodeKey },

    #[error("Data node {0} not found in cluster map")]
    UnknownDataNode(DataNodeKey),

    #[error("Disk {mount_path} not found on data node {node}")]
    UnknownDisk { node: DataNodeKey, mount_path: String },

    #[error("Partition {0} not found in cluster map")]
    UnknownPartition(PartitionId),

    #[error("No replica of partition {partition} on data node {node}")]
    UnknownReplica { partition: PartitionId, node: DataNodeKey },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse topology layout: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterMapError {
    /// Returns true for errors that must abort startup
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ClusterMapError::InvalidConfiguration { .. }
                | ClusterMapError::OutOfRange { .. }
                | ClusterMapError::MissingPlaintextPort { .. }
                | ClusterMapError::MalformedLayout { .. }
                | ClusterMapError::HostnameValidation { .. }
                | ClusterMapError::IdentityConflict { .. }
                | ClusterMapError::Io { .. }
                | ClusterMapError::Toml(_)
                | ClusterMapError::Json(_)
        )
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        ClusterMapError::InvalidConfiguration { reason: reason.into() }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ClusterMapError::MalformedLayout { reason: reason.into() }
    }
}

pub type Result<T, E = ClusterMapError> = std::result::Result<T, E>;
