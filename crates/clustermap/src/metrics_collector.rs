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

//! Periodic snapshot collection
//!
//! `SnapshotCollector` renders a [`ClusterSnapshot`] on a fixed interval,
//! streams it through a watch channel and reports node and disk liveness
//! through the `metrics` crate so Prometheus/OTLP backends can pull it.

use crate::cluster_map::ClusterMap;
use crate::snapshot::ClusterSnapshot;
use metrics::gauge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

/// Up/down counts derived from one snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessCounts {
    pub nodes_up: usize,
    pub nodes_down: usize,
    pub disks_up: usize,
    pub disks_down: usize,
}

impl LivenessCounts {
    pub fn from_snapshot(snapshot: &ClusterSnapshot) -> Self {
        let mut counts = Self::default();
        for node in &snapshot.nodes {
            if node.liveness.is_up() {
                counts.nodes_up += 1;
            } else {
                counts.nodes_down += 1;
            }
            for disk in &node.disks {
                if disk.liveness.is_up() {
                    counts.disks_up += 1;
                } else {
                    counts.disks_down += 1;
                }
            }
        }
        counts
    }
}

/// Periodic collector that streams snapshots through a watch channel.
#[derive(Debug)]
pub struct SnapshotCollector {
    map: Arc<ClusterMap>,
    interval: Duration,
    sender: watch::Sender<ClusterSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotCollector {
    /// Build a collector seeded with an initial snapshot.
    pub fn new(map: Arc<ClusterMap>, interval: Duration) -> Self {
        let snapshot = Self::capture(&map);
        let (sender, _) = watch::channel(snapshot);

        Self {
            map,
            interval: interval.max(Duration::from_millis(100)),
            sender,
            task: None,
        }
    }

    /// Start the background task if not running yet.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        info!(interval_ms = self.interval.as_millis() as u64, "Starting snapshot collector");
        let map = Arc::clone(&self.map);
        let interval = self.interval;
        let sender = self.sender.clone();

        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let snapshot = Self::capture(&map);
                // Kept current without subscribers so `latest` and the gauges stay fresh.
                sender.send_replace(snapshot);
                debug!("Snapshot collected");
            }
        });

        self.task = Some(handle);
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.task.take() {
            info!("Stopping snapshot collector");
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterSnapshot> {
        self.sender.subscribe()
    }

    /// Most recent snapshot
    pub fn latest(&self) -> ClusterSnapshot {
        self.sender.borrow().clone()
    }

    fn capture(map: &ClusterMap) -> ClusterSnapshot {
        let snapshot = map.snapshot();
        let counts = LivenessCounts::from_snapshot(&snapshot);

        gauge!("blobmap_clustermap_nodes_up").set(counts.nodes_up as f64);
        gauge!("blobmap_clustermap_nodes_down").set(counts.nodes_down as f64);
        gauge!("blobmap_clustermap_disks_up").set(counts.disks_up as f64);
        gauge!("blobmap_clustermap_disks_down").set(counts.disks_down as f64);
        gauge!("blobmap_clustermap_partitions_total").set(snapshot.partitions.len() as f64);

        snapshot
    }
}

impl Drop for SnapshotCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster_map::ClusterMapBuilder;
    use crate::config::ClusterMapConfig;
    use crate::layout::{DatacenterLayout, NodeLayout, TopologyLayout};
    use crate::types::{DataNodeKey, Outcome};
    use tokio::time::timeout;

    fn map() -> Arc<ClusterMap> {
        let mut config = ClusterMapConfig::new("blobs", "dc1", "h1");
        config.resolve_hostnames = false;
        let layout = TopologyLayout {
            datacenters: vec![DatacenterLayout {
                name: "dc1".into(),
                nodes: vec![
                    NodeLayout::new("h1", 7000).with_disk("/mnt0", 10).with_disk("/mnt1", 10),
                    NodeLayout::new("h2", 7000).with_disk("/mnt0", 10),
                ],
            }],
            partitions: Vec::new(),
        };
        Arc::new(
            ClusterMapBuilder::new(config)
                .clock(Arc::new(ManualClock::starting_now()))
                .build(&layout)
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_streams_snapshots() {
        let map = map();
        let mut collector = SnapshotCollector::new(map.clone(), Duration::from_secs(1));
        let mut rx = collector.subscribe();
        assert_eq!(LivenessCounts::from_snapshot(&collector.latest()).nodes_up, 2);

        map.on_disk_event(&DataNodeKey::new("h1", 7000), "/mnt1", Outcome::Error)
            .unwrap();
        collector.start();
        assert!(collector.is_running());

        timeout(Duration::from_secs(3), rx.changed())
            .await
            .expect("collector did not emit snapshot")
            .unwrap();

        let counts = LivenessCounts::from_snapshot(&rx.borrow());
        assert_eq!(
            counts,
            LivenessCounts {
                nodes_up: 2,
                nodes_down: 0,
                disks_up: 2,
                disks_down: 1,
            }
        );

        collector.stop();
        assert!(!collector.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_keeps_running_without_subscribers() {
        let map = map();
        let mut collector = SnapshotCollector::new(map.clone(), Duration::from_secs(1));
        drop(collector.subscribe());
        collector.start();

        for _ in 0..map.config().datanode_error_threshold {
            map.on_node_event(&DataNodeKey::new("h2", 7000), Outcome::Error).unwrap();
        }
        sleep(Duration::from_millis(3500)).await;

        assert!(collector.is_running());
        let counts = LivenessCounts::from_snapshot(&collector.latest());
        assert_eq!(counts.nodes_down, 1);
        assert_eq!(counts.disks_down, 1);
    }
}
