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

use anyhow::Context;
use blobmap::{ChannelTopologySource, ClusterManager, TopologySource, load_updates};
use blobmap_clustermap::{ClusterAgentsFactory, ClusterMapBuilder, ClusterMapConfig, TopologyLayout};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Blobmap cluster map inspector
#[derive(Parser, Debug)]
#[command(name = "blobmap", version, about)]
struct Args {
    /// Path to the cluster map configuration (TOML)
    #[arg(short, long, default_value = "clustermap.toml")]
    config: PathBuf,

    /// Path to the static topology layout (JSON)
    #[arg(short, long, default_value = "layout.json")]
    layout: PathBuf,

    /// Topology updates (JSON array) to replay for the local datacenter
    #[arg(short, long)]
    updates: Option<PathBuf>,

    /// Print the cluster map snapshot as JSON
    #[arg(long)]
    snapshot: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClusterMapConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    let layout = TopologyLayout::load(&args.layout)
        .with_context(|| format!("Failed to load topology layout from {}", args.layout.display()))?;

    let mut sources: Vec<Arc<dyn TopologySource>> = Vec::new();
    if let Some(path) = &args.updates {
        let updates = load_updates(path)?;
        tracing::info!(path = %path.display(), updates = updates.len(), "Loaded topology updates");
        sources.push(Arc::new(
            ChannelTopologySource::new(config.datacenter_name.clone()).with_bootstrap(updates),
        ));
    }

    if config.cluster_agents_factory == ClusterAgentsFactory::Coordinated && sources.is_empty() {
        tracing::warn!("No topology updates given; serving the static layout only");
        config.cluster_agents_factory = ClusterAgentsFactory::Static;
    }

    let mut manager = ClusterManager::initialize(ClusterMapBuilder::new(config), &layout, sources).await?;
    let map = manager.map();

    if args.snapshot {
        println!("{}", map.snapshot().to_json()?);
    } else {
        let local = map
            .local_data_node()
            .map(|node| node.to_string())
            .unwrap_or_else(|| "none".to_string());
        tracing::info!(
            cluster = %manager.cluster_name(),
            nodes = map.data_nodes().len(),
            partitions = map.partition_ids().len(),
            writable = map.get_writable_partitions(None).len(),
            local = %local,
            "Cluster map loaded"
        );
    }

    manager.shutdown().await;
    Ok(())
}
