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

//! # Blobmap Cluster Map
//!
//! In-memory model of a blob store cluster: datacenters, data nodes, disks,
//! partitions and replicas, with the health of every hardware resource
//! tracked by its own state policy.
//!
//! ## Features
//!
//! - **Hysteresis state policies**: a resource goes down after a run of
//!   consecutive errors and becomes eligible for a retry once its backoff has
//!   elapsed; expiry is evaluated lazily against a [`Clock`]
//! - **Secure endpoint selection**: SSL-required datacenters never fall back
//!   to plaintext
//! - **Versioned topology updates**: changes above the xid ceiling or older
//!   than the last applied change are dropped
//! - **Partition override**: an external store can take over partition state
//!   and class
//! - **Snapshots**: JSON documents of the whole map, optionally streamed by a
//!   [`SnapshotCollector`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use blobmap_clustermap::{ClusterMapBuilder, ClusterMapConfig, Outcome, ResourceId, TopologyLayout};
//!
//! fn main() -> blobmap_clustermap::Result<()> {
//!     let config = ClusterMapConfig::load("clustermap.toml")?;
//!     let layout = TopologyLayout::load("layout.json")?;
//!     let map = ClusterMapBuilder::new(config).build(&layout)?;
//!
//!     for node in map.data_nodes() {
//!         let id = ResourceId::Node(node.node_key().clone());
//!         map.on_event(&id, Outcome::Success)?;
//!     }
//!     println!("{}", map.snapshot().to_json()?);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod cluster_map;
pub mod config;
pub mod error;
pub mod layout;
pub mod metrics_collector;
pub mod mock;
pub mod override_store;
pub mod policy;
pub mod port;
pub mod resolver;
pub mod resource;
pub mod snapshot;
pub mod types;
pub mod update;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster_map::{Admission, ClusterMap, ClusterMapBuilder};
pub use config::{ClusterAgentsFactory, ClusterMapConfig, DatacenterEndpoint, PolicyParams};
pub use error::{ClusterMapError, Result};
pub use layout::{DatacenterLayout, DiskLayout, NodeLayout, PartitionLayout, ReplicaLayout, TopologyLayout};
pub use metrics_collector::{LivenessCounts, SnapshotCollector};
pub use override_store::{InMemoryOverrideStore, PartitionOverride, PartitionOverrideStore};
pub use policy::{
    FixedBackoffPolicy, FixedBackoffPolicyFactory, PolicyFactoryRegistry, PolicyStatus, ResourceStatePolicy,
    ResourceStatePolicyFactory,
};
pub use port::{Port, PortKind, PortSet, SslEnabledDatacenters};
pub use resolver::{HostnameResolver, StaticResolver, SystemResolver};
pub use resource::{DataNode, DataNodeId, Disk, DiskId, Partition, Replica, ReplicaId};
pub use snapshot::{ClusterSnapshot, NodeSnapshot};
pub use types::*;
pub use update::{TopologyChange, TopologyUpdate, UpdateOutcome};
