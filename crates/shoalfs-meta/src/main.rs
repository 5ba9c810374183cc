//! ShoalFS metadata node binary.
//!
//! Loads the node config, starts every expected partition, and waits for
//! a shutdown signal. The client transport and data-node RPC clients are
//! wired in by the deployment; this binary only hosts the partitions.

use std::path::PathBuf;

use anyhow::Context;
use shoalfs_meta::config::{NodeConfig, PartitionMeta};
use shoalfs_meta::manager::PartitionManager;

fn load_expected(cfg: &NodeConfig) -> anyhow::Result<Vec<PartitionMeta>> {
    // Until the cluster manager assigns partitions, serve whatever the
    // meta root already holds.
    let mut expected = Vec::new();
    if cfg.meta_root.exists() {
        for entry in std::fs::read_dir(&cfg.meta_root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("partition_") {
                if let Ok(meta) = PartitionMeta::load(&entry.path()) {
                    expected.push(meta);
                }
            }
        }
    }
    expected.sort_by_key(|m| m.partition_id);
    Ok(expected)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/shoalfs/meta.json"));
    let cfg = if config_path.exists() {
        NodeConfig::load(&config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        tracing::warn!(path = %config_path.display(), "config file missing; using defaults");
        NodeConfig::default()
    };

    let now_ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let expected = load_expected(&cfg)?;
    let manager = PartitionManager::new(cfg);
    manager
        .start_partitions(&expected, now_ts)
        .context("starting partitions")?;
    tracing::info!(
        partitions = manager.len(),
        addr = %manager.config().listen_addr,
        "shoal-meta up"
    );

    tokio::signal::ctrl_c().await.context("signal wait")?;
    tracing::info!("shutdown signal received");
    manager.stop_all();
    Ok(())
}
