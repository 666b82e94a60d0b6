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

//! Cluster map configuration
//!
//! Every value is read once at startup and stays constant for the lifetime of
//! the process. [`ClusterMapConfig::validate`] must pass before a cluster map
//! is built from it.

use crate::error::{ClusterMapError, Result};
use crate::types::ResourceKind;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the built-in fixed threshold / fixed backoff policy factory
pub const FIXED_BACKOFF_POLICY_FACTORY: &str = "fixed-backoff";

/// Partition class assigned when the layout does not name one
pub const DEFAULT_PARTITION_CLASS: &str = "max-replicas-all-datacenters";

const MINUTE_MS: u64 = 60 * 1000;

/// How the cluster map learns about topology changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAgentsFactory {
    /// Static layout only, no live updates
    #[default]
    Static,

    /// Static layout refreshed by per-datacenter coordination feeds
    Coordinated,
}

/// Coordination service endpoint for one datacenter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterEndpoint {
    pub name: String,

    #[serde(default)]
    pub id: u8,

    /// Connect string of the coordination service (e.g. "zk1.example.com:2199")
    pub connect_str: String,
}

/// Threshold and backoff applied to one kind of resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyParams {
    /// Consecutive errors before the resource is considered down
    pub error_threshold: u32,

    /// Time to wait after the last error before the resource is retried
    pub retry_backoff: Duration,
}

/// Configuration for the cluster map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMapConfig {
    /// Name of the resource state policy factory
    #[serde(default = "default_policy_factory")]
    pub resource_state_policy_factory: String,

    /// Consecutive errors tolerated for a data node
    #[serde(default = "default_datanode_error_threshold")]
    pub datanode_error_threshold: u32,

    /// Wait before a down data node is retried (ms)
    #[serde(default = "default_datanode_retry_backoff_ms")]
    pub datanode_retry_backoff_ms: u64,

    /// Consecutive errors tolerated for a disk
    #[serde(default = "default_one")]
    pub disk_error_threshold: u32,

    /// Wait before a down disk is retried (ms)
    #[serde(default = "default_ten_minutes_ms")]
    pub disk_retry_backoff_ms: u64,

    /// Consecutive errors tolerated for a replica
    #[serde(default = "default_one")]
    pub replica_error_threshold: u32,

    /// Wait before a down replica is retried (ms)
    #[serde(default = "default_ten_minutes_ms")]
    pub replica_retry_backoff_ms: u64,

    /// Datacenters the local node must reach over SSL.
    /// Accepts a list or a comma-separated string.
    #[serde(default, deserialize_with = "deserialize_datacenter_list")]
    pub ssl_enabled_datacenters: Vec<String>,

    #[serde(default)]
    pub cluster_agents_factory: ClusterAgentsFactory,

    /// Coordination service endpoints, one per datacenter
    #[serde(default)]
    pub datacenters: Vec<DatacenterEndpoint>,

    pub cluster_name: String,

    /// Datacenter of the local node
    pub datacenter_name: String,

    /// Host name of the local node
    pub host_name: String,

    /// Port of the local node; absent for processes that do not host data
    #[serde(default)]
    pub port: Option<u16>,

    /// Validate node host names against the resolver on admission.
    ///
    /// Disabling this also disables any check that a node entry for
    /// `host1.example.com` is really deployed on that host.
    #[serde(default = "default_true")]
    pub resolve_hostnames: bool,

    #[serde(default = "default_partition_class")]
    pub default_partition_class: String,

    /// Topology changes with an xid above this value are ignored
    #[serde(default = "default_current_xid")]
    pub current_xid: i64,

    /// Source partition state and class from the override store
    #[serde(default)]
    pub enable_partition_override: bool,

    /// Keep consuming live updates from remote datacenters after bootstrap
    #[serde(default = "default_true")]
    pub listen_cross_colo: bool,
}

fn default_policy_factory() -> String {
    FIXED_BACKOFF_POLICY_FACTORY.to_string()
}

fn default_datanode_error_threshold() -> u32 {
    3
}

fn default_datanode_retry_backoff_ms() -> u64 {
    5 * MINUTE_MS
}

fn default_one() -> u32 {
    1
}

fn default_ten_minutes_ms() -> u64 {
    10 * MINUTE_MS
}

fn default_true() -> bool {
    true
}

fn default_partition_class() -> String {
    DEFAULT_PARTITION_CLASS.to_string()
}

fn default_current_xid() -> i64 {
    i64::MAX
}

fn deserialize_datacenter_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }

    let names = match Raw::deserialize(deserializer)? {
        Raw::List(names) => names,
        Raw::Csv(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(normalize_datacenters(names))
}

pub(crate) fn normalize_datacenters<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = names
        .into_iter()
        .map(|name| name.as_ref().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

impl ClusterMapConfig {
    /// Create a configuration with every optional value at its default
    pub fn new(cluster_name: impl Into<String>, datacenter_name: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            resource_state_policy_factory: default_policy_factory(),
            datanode_error_threshold: default_datanode_error_threshold(),
            datanode_retry_backoff_ms: default_datanode_retry_backoff_ms(),
            disk_error_threshold: default_one(),
            disk_retry_backoff_ms: default_ten_minutes_ms(),
            replica_error_threshold: default_one(),
            replica_retry_backoff_ms: default_ten_minutes_ms(),
            ssl_enabled_datacenters: Vec::new(),
            cluster_agents_factory: ClusterAgentsFactory::default(),
            datacenters: Vec::new(),
            cluster_name: cluster_name.into(),
            datacenter_name: datacenter_name.into(),
            host_name: host_name.into(),
            port: None,
            resolve_hostnames: true,
            default_partition_class: default_partition_class(),
            current_xid: default_current_xid(),
            enable_partition_override: false,
            listen_cross_colo: true,
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ClusterMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Check every value against its accepted range
    pub fn validate(&self) -> Result<()> {
        check_range("datanode_error_threshold", self.datanode_error_threshold as i64, 1, 100)?;
        check_range(
            "datanode_retry_backoff_ms",
            self.datanode_retry_backoff_ms as i64,
            1,
            (20 * MINUTE_MS) as i64,
        )?;
        check_range("disk_error_threshold", self.disk_error_threshold as i64, 1, 100)?;
        check_range("disk_retry_backoff_ms", self.disk_retry_backoff_ms as i64, 1, (30 * MINUTE_MS) as i64)?;
        check_range(
            "replica_error_threshold",
            self.replica_error_threshold as i64,
            1,
            i32::MAX as i64,
        )?;
        check_range(
            "replica_retry_backoff_ms",
            self.replica_retry_backoff_ms as i64,
            1,
            (30 * MINUTE_MS) as i64,
        )?;

        for (key, value) in [
            ("cluster_name", &self.cluster_name),
            ("datacenter_name", &self.datacenter_name),
            ("host_name", &self.host_name),
            ("resource_state_policy_factory", &self.resource_state_policy_factory),
            ("default_partition_class", &self.default_partition_class),
        ] {
            if value.trim().is_empty() {
                return Err(ClusterMapError::invalid_config(format!("{key} must not be empty")));
            }
        }

        if self.port == Some(0) {
            return Err(ClusterMapError::invalid_config("port must be non-zero when set"));
        }

        if self.cluster_agents_factory == ClusterAgentsFactory::Coordinated {
            if self.datacenters.is_empty() {
                return Err(ClusterMapError::invalid_config(
                    "coordinated cluster agents need at least one datacenter endpoint",
                ));
            }
            if !self.datacenters.iter().any(|dc| dc.name == self.datacenter_name) {
                return Err(ClusterMapError::invalid_config(format!(
                    "no coordination endpoint configured for local datacenter {}",
                    self.datacenter_name
                )));
            }
        }

        Ok(())
    }

    /// Policy parameters for one kind of resource
    pub fn policy_params(&self, kind: ResourceKind) -> PolicyParams {
        let (error_threshold, backoff_ms) = match kind {
            ResourceKind::DataNode => (self.datanode_error_threshold, self.datanode_retry_backoff_ms),
            ResourceKind::Disk => (self.disk_error_threshold, self.disk_retry_backoff_ms),
            ResourceKind::Replica => (self.replica_error_threshold, self.replica_retry_backoff_ms),
        };
        PolicyParams {
            error_threshold,
            retry_backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Returns true if `datacenter` is the local one
    pub fn is_local_datacenter(&self, datacenter: &str) -> bool {
        self.datacenter_name == datacenter
    }
}

fn check_range(key: &'static str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(ClusterMapError::OutOfRange { key, value, min, max });
    }
    Ok(())
}
