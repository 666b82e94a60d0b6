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

//! Per-datacenter topology feeds
//!
//! A [`TopologySource`] hands out the updates needed to catch up with a
//! datacenter's coordination state, then a live stream of later changes.

use anyhow::{Context, Result, anyhow, bail};
use blobmap_clustermap::TopologyUpdate;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use tokio::sync::mpsc;

/// Capacity of the live update channel of a [`ChannelTopologySource`]
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Topology feed of one datacenter
pub trait TopologySource: Send + Sync + fmt::Debug {
    fn datacenter(&self) -> &str;

    /// Updates describing the current state, in xid order
    fn bootstrap(&self) -> Result<Vec<TopologyUpdate>>;

    /// Live updates published after the bootstrap. May only be taken once.
    fn subscribe(&self) -> Result<mpsc::Receiver<TopologyUpdate>>;
}

/// Source fed in-process through an mpsc channel
#[derive(Debug)]
pub struct ChannelTopologySource {
    datacenter: String,
    bootstrap: Mutex<Vec<TopologyUpdate>>,
    sender: mpsc::Sender<TopologyUpdate>,
    receiver: Mutex<Option<mpsc::Receiver<TopologyUpdate>>>,
}

impl ChannelTopologySource {
    pub fn new(datacenter: impl Into<String>) -> Self {
        Self::with_capacity(datacenter, DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(datacenter: impl Into<String>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            datacenter: datacenter.into(),
            bootstrap: Mutex::new(Vec::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn with_bootstrap(self, updates: Vec<TopologyUpdate>) -> Self {
        *self.bootstrap.lock() = updates;
        self
    }

    /// Push a live update to the subscriber
    pub async fn publish(&self, update: TopologyUpdate) -> Result<()> {
        self.sender
            .send(update)
            .await
            .map_err(|_| anyhow!("topology feed for {} is closed", self.datacenter))
    }

    /// True once the subscriber has gone away
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn is_subscribed(&self) -> bool {
        self.receiver.lock().is_none()
    }
}

impl TopologySource for ChannelTopologySource {
    fn datacenter(&self) -> &str {
        &self.datacenter
    }

    fn bootstrap(&self) -> Result<Vec<TopologyUpdate>> {
        let mut updates = self.bootstrap.lock().clone();
        updates.sort_by_key(|update| update.xid);
        Ok(updates)
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<TopologyUpdate>> {
        match self.receiver.lock().take() {
            Some(receiver) => Ok(receiver),
            None => bail!("topology feed for {} already has a subscriber", self.datacenter),
        }
    }
}

/// Read a JSON array of topology updates
pub fn load_updates(path: impl AsRef<Path>) -> Result<Vec<TopologyUpdate>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse topology updates in {}", path.display()))
}
