//! Expiry Reaper Task
//!
//! Background task that periodically reaps expired entries on every node of
//! a cluster. Reads already treat expired entries as absent; the sweep keeps
//! memory and `size` honest for keys nobody reads again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cluster::Cluster;

/// Spawns a background task that sweeps each node's expired entries.
///
/// Each node is swept on the blocking pool, one entry lock at a time, so a
/// sweep never stalls the runtime or holds a key longer than its own check.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cluster = Arc::new(Cluster::start(&config)?);
/// let reaper = spawn_reaper_task(cluster.clone(), config.sweep_interval());
/// // Later, during shutdown:
/// reaper.abort();
/// ```
pub fn spawn_reaper_task(cluster: Arc<Cluster>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting expiry reaper with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            for cache in cluster.nodes() {
                let node = cache.id();
                let removed = tokio::task::spawn_blocking(move || cache.sweep_expired())
                    .await
                    .unwrap_or_default();

                if removed > 0 {
                    info!(%node, "Expiry sweep: removed {} expired entries", removed);
                } else {
                    debug!(%node, "Expiry sweep: no expired entries found");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn cluster() -> Arc<Cluster> {
        Arc::new(
            Cluster::start(&Config {
                cluster_size: 2,
                ..Config::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_reaper_removes_expired_entries_on_every_node() {
        let cluster = cluster();
        let cache = cluster.node(0).unwrap();
        cache
            .with_expiry_policy(Duration::from_millis(50))
            .put_async("expire_soon", "value")
            .await
            .unwrap();
        assert!(cluster.nodes().iter().all(|node| node.len() == 1));

        let handle = spawn_reaper_task(cluster.clone(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(300)).await;

        for node in cluster.nodes() {
            assert_eq!(node.len(), 0, "expired entry should have been reaped");
            assert_eq!(node.metrics().removals, 0);
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_reaper_preserves_valid_entries() {
        let cluster = cluster();
        let cache = cluster.node(1).unwrap();
        cache
            .with_expiry_policy(Duration::from_secs(3600))
            .put_async("long_lived", "value")
            .await
            .unwrap();
        cache.put_async("eternal", "value").await.unwrap();

        let handle = spawn_reaper_task(cluster.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;

        for node in cluster.nodes() {
            assert_eq!(node.keys(), vec!["eternal", "long_lived"]);
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_reaper_can_be_aborted() {
        let handle = spawn_reaper_task(cluster(), Duration::from_millis(10));

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
