//! Idle Reaper (spec §4.7): a periodic background task that terminates
//! instances belonging to users who have gone quiet past the idle
//! threshold.
//!
//! Grounded on `daemon/pool.rs::run_maintenance`'s `tokio::time::interval`
//! background-loop shape, generalized from in-process GC to cross-system
//! cleanup (warm pool, cloud termination, session purge) bounded to a
//! batch size per tick the way the teacher bounds container GC per pass.

use crate::capacity::CapacityController;
use crate::cloud::CloudAdapter;
use crate::config::Config;
use crate::store::StateStore;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct IdleReaper {
    cloud: Arc<dyn CloudAdapter>,
    store: Arc<dyn StateStore>,
    capacity: Arc<CapacityController>,
    config: Arc<Config>,
}

impl IdleReaper {
    pub fn new(
        cloud: Arc<dyn CloudAdapter>,
        store: Arc<dyn StateStore>,
        capacity: Arc<CapacityController>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cloud,
            store,
            capacity,
            config,
        }
    }

    /// Spawns the fixed-interval background task. The returned handle may
    /// be aborted at shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.cleanup_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                self.tick(now_ms()).await;
            }
        })
    }

    /// One reaper pass (spec §4.7). Exposed directly so tests and the
    /// `reconcile` CLI subcommand can drive it without waiting on the
    /// interval.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: i64) {
        let cutoff = now - self.config.idle_timeout_ms;
        let idle = match self.store.list_idle(cutoff).await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "failed to list idle users, skipping tick");
                return;
            }
        };

        let batch = idle.into_iter().take(self.config.reaper_batch_size);
        let mut reaped = 0usize;

        for user_id in batch {
            match self.store.get_workspace(&user_id).await {
                Ok(Some(ws)) if !ws.is_running() => continue,
                Ok(Some(ws)) => {
                    self.reap_one(&user_id, &ws.instance_id).await;
                    reaped += 1;
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(user_id, error = %e, "failed to load workspace during reap");
                }
            }
        }

        if reaped > 0 {
            info!(reaped, "idle reap tick complete");
        }

        if let Err(e) = self.capacity.reconcile().await {
            warn!(error = %e, "post-reap capacity reconcile failed");
        }
    }

    async fn reap_one(&self, user_id: &str, instance_id: &str) {
        // Defensive: the instance should never be in the warm pool while
        // bound to a RUNNING user, but a prior partial failure could have
        // left it there.
        if let Err(e) = self.store.pool_remove(instance_id).await {
            warn!(user_id, instance_id, error = %e, "failed defensive pool removal during reap");
        }

        if let Err(e) = self.cloud.terminate_in_asg_decrementing(instance_id).await {
            warn!(user_id, instance_id, error = %e, "failed to terminate idle instance, will retry next tick");
            return;
        }

        if let Err(e) = self.store.cleanup(user_id, instance_id).await {
            warn!(user_id, instance_id, error = %e, "failed to clean up session after reap");
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudAdapter;
    use crate::model::{WorkspaceRecord, WorkspaceState};
    use crate::store::memory::MemoryStore;

    fn reaper(cloud: Arc<MockCloudAdapter>, store: Arc<MemoryStore>) -> IdleReaper {
        let config = Arc::new(Config::for_test());
        let capacity = Arc::new(CapacityController::new(cloud.clone(), store.clone(), config.clone()));
        IdleReaper::new(cloud, store, capacity, config)
    }

    #[tokio::test]
    async fn reaps_users_past_idle_threshold() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let id = cloud.launch();
        store
            .set_workspace_if_absent(
                "alice",
                WorkspaceRecord {
                    instance_id: id.clone(),
                    public_endpoint: "1.2.3.4".to_string(),
                    custom_domain: None,
                    state: WorkspaceState::Running,
                    last_seen: 100,
                    ts: 100,
                },
            )
            .await
            .unwrap();

        let r = reaper(cloud.clone(), store.clone());
        // idle_timeout_ms default is 300_000; now=500_000 makes last_seen=100 stale.
        r.tick(500_000).await;

        assert!(store.get_workspace("alice").await.unwrap().is_none());
        assert_eq!(store.active_count().await.unwrap(), 0);
        let desc = cloud.describe_instance(&id).await.unwrap();
        assert_eq!(desc.state, crate::model::InstanceState::Terminated);
    }

    #[tokio::test]
    async fn live_users_are_not_reaped() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let id = cloud.launch();
        store
            .set_workspace_if_absent(
                "alice",
                WorkspaceRecord {
                    instance_id: id.clone(),
                    public_endpoint: "1.2.3.4".to_string(),
                    custom_domain: None,
                    state: WorkspaceState::Running,
                    last_seen: 499_900,
                    ts: 100,
                },
            )
            .await
            .unwrap();

        let r = reaper(cloud.clone(), store.clone());
        r.tick(500_000).await;
        assert!(store.get_workspace("alice").await.unwrap().is_some());
    }
}
