//! Lifecycle Reactor (spec §4.6): consumes asynchronous ASG lifecycle
//! events. Handlers are idempotent and expected to be called after the
//! triggering HTTP request has already been acknowledged (spec §4.6,
//! §4.10 "ack before completing").
//!
//! Grounded on the teacher's `daemon/pool.rs::warm_up`/`run_maintenance`
//! for the poll-with-backoff-then-insert shape, and on `backend/
//! kubernetes_pool.rs::replenish()` for tagging a freshly-ready instance
//! UNASSIGNED before pool insertion.

use crate::cloud::CloudAdapter;
use crate::config::Config;
use crate::model::tags;
use crate::store::StateStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub struct LifecycleReactor {
    cloud: Arc<dyn CloudAdapter>,
    store: Arc<dyn StateStore>,
    config: Arc<Config>,
}

impl LifecycleReactor {
    pub fn new(cloud: Arc<dyn CloudAdapter>, store: Arc<dyn StateStore>, config: Arc<Config>) -> Self {
        Self { cloud, store, config }
    }

    /// Polls `describeInstance` up to `readinessMaxAttempts` times with
    /// linear backoff. On success, tags the instance UNASSIGNED and adds
    /// it to the warm pool. On exhaustion, logs fatally and leaves the
    /// instance for the ASG's own health check -- the reactor never
    /// terminates a slow-booting instance itself (spec §4.6).
    #[instrument(skip(self))]
    pub async fn on_instance_launch(&self, instance_id: &str) {
        for attempt in 1..=self.config.readiness_max_attempts {
            match self.cloud.describe_instance(instance_id).await {
                Ok(desc) if desc.is_ready() => {
                    let mut warm_tags = HashMap::new();
                    warm_tags.insert(tags::OWNER.to_string(), tags::UNASSIGNED.to_string());
                    warm_tags.insert(tags::WARM_SPARE.to_string(), "true".to_string());

                    if let Err(e) = self.cloud.set_tags(instance_id, warm_tags).await {
                        warn!(instance_id, error = %e, "failed to tag newly-ready instance as unassigned");
                    }
                    if let Err(e) = self.store.pool_add(instance_id).await {
                        error!(instance_id, error = %e, "failed to add ready instance to warm pool");
                        return;
                    }
                    info!(instance_id, attempt, "instance ready, added to warm pool");
                    return;
                }
                Ok(_) => {
                    if attempt < self.config.readiness_max_attempts {
                        tokio::time::sleep(self.backoff_with_jitter()).await;
                    }
                }
                Err(e) => {
                    warn!(instance_id, attempt, error = %e, "readiness poll failed");
                    if attempt < self.config.readiness_max_attempts {
                        tokio::time::sleep(self.backoff_with_jitter()).await;
                    }
                }
            }
        }

        error!(
            instance_id,
            attempts = self.config.readiness_max_attempts,
            "instance did not reach readiness in time, leaving to ASG health check"
        );
    }

    /// Backoff spacing with +/-20% jitter, so a batch of instances launched
    /// together don't all re-poll `describeInstance` in lockstep.
    fn backoff_with_jitter(&self) -> std::time::Duration {
        use rand::Rng;
        let base = self.config.readiness_backoff_ms as f64;
        let factor = rand::thread_rng().gen_range(0.8..1.2);
        std::time::Duration::from_millis((base * factor) as u64)
    }

    /// Idempotent, always safe on an unknown instance. Removes the
    /// instance from the warm pool defensively and purges any orphaned
    /// session (spec §4.6).
    #[instrument(skip(self))]
    pub async fn on_instance_terminate(&self, instance_id: &str) {
        if let Err(e) = self.store.pool_remove(instance_id).await {
            warn!(instance_id, error = %e, "failed to remove terminated instance from pool");
        }

        match self.store.get_user_for_instance(instance_id).await {
            Ok(Some(user_id)) => {
                if let Err(e) = self.store.cleanup(&user_id, instance_id).await {
                    warn!(instance_id, user_id, error = %e, "failed to clean up session for terminated instance");
                } else {
                    info!(instance_id, user_id, "session cleaned up after instance termination");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(instance_id, error = %e, "failed to resolve owner of terminated instance"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudAdapter;
    use crate::store::memory::MemoryStore;

    fn reactor(cloud: Arc<MockCloudAdapter>, store: Arc<MemoryStore>) -> LifecycleReactor {
        let mut config = Config::for_test();
        config.readiness_backoff_ms = 1;
        LifecycleReactor::new(cloud, store, Arc::new(config))
    }

    #[tokio::test]
    async fn ready_instance_joins_pool() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let id = cloud.launch();
        let r = reactor(cloud.clone(), store.clone());
        r.on_instance_launch(&id).await;
        assert_eq!(store.pool_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminate_cleans_orphaned_session() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let id = cloud.launch();
        store
            .set_workspace_if_absent(
                "alice",
                crate::model::WorkspaceRecord {
                    instance_id: id.clone(),
                    public_endpoint: "1.2.3.4".to_string(),
                    custom_domain: None,
                    state: crate::model::WorkspaceState::Running,
                    last_seen: 1,
                    ts: 1,
                },
            )
            .await
            .unwrap();

        let r = reactor(cloud.clone(), store.clone());
        r.on_instance_terminate(&id).await;
        assert!(store.get_user_for_instance(&id).await.unwrap().is_none());
        assert!(store.get_workspace("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminate_on_unknown_instance_is_a_no_op() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let r = reactor(cloud, store);
        r.on_instance_terminate("i-never-existed").await;
    }
}
