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

//! Cluster Manager - wires the cluster map to its topology feeds
//!
//! The manager builds the [`ClusterMap`] from the static layout, replays the
//! bootstrap updates of every datacenter, then keeps applying live updates
//! from the feeds selected by `listen_cross_colo`.

use crate::topology_source::TopologySource;
use anyhow::{Context, Result, bail};
use blobmap_clustermap::{
    ClusterAgentsFactory, ClusterMap, ClusterMapBuilder, ClusterSnapshot, SnapshotCollector, TopologyLayout, TopologyUpdate,
    UpdateOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns the cluster map and the tasks feeding it
#[derive(Debug)]
pub struct ClusterManager {
    map: Arc<ClusterMap>,
    subscribed: Vec<String>,
    feed_tasks: Vec<JoinHandle<()>>,
    collector: Option<SnapshotCollector>,
}

impl ClusterManager {
    /// Build the cluster map and start consuming topology feeds.
    ///
    /// With the `static` cluster agents factory the sources are ignored and
    /// the map reflects the layout only.
    pub async fn initialize(
        builder: ClusterMapBuilder,
        layout: &TopologyLayout,
        sources: Vec<Arc<dyn TopologySource>>,
    ) -> Result<Self> {
        let config = builder.config().clone();
        info!(
            cluster = %config.cluster_name,
            datacenter = %config.datacenter_name,
            agents = ?config.cluster_agents_factory,
            "Initializing Cluster Manager"
        );

        let map = Arc::new(builder.build(layout).context("Failed to build cluster map")?);

        let mut manager = Self {
            map,
            subscribed: Vec::new(),
            feed_tasks: Vec::new(),
            collector: None,
        };

        if config.cluster_agents_factory == ClusterAgentsFactory::Static {
            if !sources.is_empty() {
                warn!(sources = sources.len(), "Static cluster agents ignore topology sources");
            }
            info!("Cluster Manager initialized from static layout");
            return Ok(manager);
        }

        if !sources
            .iter()
            .any(|source| config.is_local_datacenter(source.datacenter()))
        {
            bail!("No topology source for local datacenter {}", config.datacenter_name);
        }

        for source in &sources {
            if !config.datacenters.iter().any(|dc| dc.name == source.datacenter()) {
                warn!(datacenter = %source.datacenter(), "Topology source for unconfigured datacenter");
            }
            let updates = source
                .bootstrap()
                .with_context(|| format!("Failed to bootstrap topology of {}", source.datacenter()))?;
            let applied = apply_all(&manager.map, source.datacenter(), &updates);
            info!(
                datacenter = %source.datacenter(),
                updates = updates.len(),
                applied,
                "Bootstrapped topology"
            );
        }

        for source in &sources {
            let datacenter = source.datacenter().to_string();
            if !config.listen_cross_colo && !config.is_local_datacenter(&datacenter) {
                debug!(datacenter = %datacenter, "Skipping live updates from remote datacenter");
                continue;
            }
            let receiver = source
                .subscribe()
                .with_context(|| format!("Failed to subscribe to topology of {datacenter}"))?;
            manager
                .feed_tasks
                .push(tokio::spawn(run_feed(Arc::clone(&manager.map), datacenter.clone(), receiver)));
            manager.subscribed.push(datacenter);
        }

        info!(subscribed = ?manager.subscribed, "Cluster Manager initialized");
        Ok(manager)
    }

    pub fn map(&self) -> &Arc<ClusterMap> {
        &self.map
    }

    /// Datacenters whose live updates are being applied
    pub fn subscribed_datacenters(&self) -> &[String] {
        &self.subscribed
    }

    pub fn cluster_name(&self) -> &str {
        &self.map.config().cluster_name
    }

    /// Start periodic snapshot collection, or join the running collector
    pub fn start_snapshot_collector(&mut self, interval: Duration) -> watch::Receiver<ClusterSnapshot> {
        let map = Arc::clone(&self.map);
        let collector = self.collector.get_or_insert_with(|| SnapshotCollector::new(map, interval));
        let receiver = collector.subscribe();
        collector.start();
        receiver
    }

    pub async fn shutdown(&mut self) {
        info!("Shutting down Cluster Manager");

        for handle in self.feed_tasks.drain(..) {
            handle.abort();
        }
        self.subscribed.clear();
        if let Some(mut collector) = self.collector.take() {
            collector.stop();
        }

        info!("Cluster Manager shutdown complete");
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        for handle in self.feed_tasks.drain(..) {
            handle.abort();
        }
    }
}

fn apply_all(map: &ClusterMap, datacenter: &str, updates: &[TopologyUpdate]) -> usize {
    updates
        .iter()
        .filter(|update| apply_one(map, datacenter, update))
        .count()
}

fn apply_one(map: &ClusterMap, datacenter: &str, update: &TopologyUpdate) -> bool {
    match map.apply_topology_update(update) {
        Ok(UpdateOutcome::Applied) => true,
        Ok(outcome) => {
            debug!(datacenter = %datacenter, xid = update.xid, ?outcome, "Topology update not applied");
            false
        }
        Err(e) => {
            warn!(datacenter = %datacenter, xid = update.xid, change = %update.change, "Failed to apply topology update: {}", e);
            false
        }
    }
}

async fn run_feed(map: Arc<ClusterMap>, datacenter: String, mut receiver: mpsc::Receiver<TopologyUpdate>) {
    debug!(datacenter = %datacenter, "Topology feed started");
    while let Some(update) = receiver.recv().await {
        apply_one(&map, &datacenter, &update);
    }
    info!(datacenter = %datacenter, "Topology feed closed");
}
