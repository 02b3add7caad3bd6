//! Capacity Controller (spec §4.5): the single writer of `desiredCapacity`
//! for upward movement, and the only component that computes the target.
//!
//! Grounded on `warpgrid-autoscale/src/scaler.rs`'s `Autoscaler::decide`
//! shape (compute a target from observed load, compare to current, act
//! only on divergence) adapted from a metric-driven decision to the
//! spec's fixed `active + headroom` formula, and on the teacher's
//! `backend/kubernetes_pool.rs::replenish()` for "protect active members
//! before shrinking a labeled pool."

use crate::cloud::CloudAdapter;
use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::model::tags;
use crate::store::StateStore;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct CapacityController {
    cloud: Arc<dyn CloudAdapter>,
    store: Arc<dyn StateStore>,
    config: Arc<Config>,
}

impl CapacityController {
    pub fn new(cloud: Arc<dyn CloudAdapter>, store: Arc<dyn StateStore>, config: Arc<Config>) -> Self {
        Self { cloud, store, config }
    }

    /// Computes `target = min(active + warmSpareTarget, maxInstances)` and
    /// reconciles the ASG toward it. Re-entrant and idempotent: repeated
    /// calls with unchanged inputs are no-ops once `target == current`.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<(), OrchestratorError> {
        let active = self.store.active_count().await? as i32;
        let target = (active + self.config.warm_spare_target).min(self.config.max_instances);
        let asg = self.cloud.describe_asg(&self.config.asg_name).await?;
        let current = asg.desired_capacity;

        if target > current {
            info!(target, current, active, "raising desired capacity");
            self.cloud
                .set_desired_capacity(&self.config.asg_name, target)
                .await?;
            return Ok(());
        }

        if target < current {
            let pool_size = self.store.pool_size().await? as i32;
            if pool_size > self.config.warm_spare_target {
                self.safe_scale_down(&asg, target).await?;
            }
        }

        Ok(())
    }

    /// Protects every active instance before handing a lower desired
    /// capacity to the ASG, so the provider's own selection never tears
    /// down a bound workspace (spec §4.5 step-by-step).
    async fn safe_scale_down(
        &self,
        asg: &crate::model::AsgDescription,
        target: i32,
    ) -> Result<(), OrchestratorError> {
        let mut active_ids = Vec::new();
        for id in &asg.instances {
            match self.store.get_user_for_instance(id).await {
                Ok(Some(_)) => active_ids.push(id.clone()),
                Ok(None) => {
                    // Session Store is authoritative; fall back to tags
                    // only when it has no opinion (self-healing path,
                    // spec §9 open question on reboot recovery).
                    if let Ok(desc) = self.cloud.describe_instance(id).await {
                        if desc.owner().is_some_and(|o| o != tags::UNASSIGNED) {
                            active_ids.push(id.clone());
                        }
                    }
                }
                Err(e) => warn!(instance_id = %id, error = %e, "failed to resolve instance owner during scale-down"),
            }
        }

        let results = self.cloud.set_scale_in_protection(&active_ids, true).await?;
        for r in &results {
            if let Err(msg) = &r.result {
                warn!(instance_id = %r.instance_id, error = %msg, "scale-in protection failed, retried next reconcile");
            }
        }

        info!(target, active = active_ids.len(), "scaling down");
        self.cloud.set_desired_capacity(&self.config.asg_name, target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudAdapter;
    use crate::store::memory::MemoryStore;

    fn controller(cloud: Arc<MockCloudAdapter>, store: Arc<MemoryStore>, config: Config) -> CapacityController {
        CapacityController::new(cloud, store, Arc::new(config))
    }

    #[tokio::test]
    async fn raises_capacity_to_target() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 10));
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::for_test();
        config.warm_spare_target = 1;
        let c = controller(cloud.clone(), store, config);
        c.reconcile().await.unwrap();
        let asg = cloud.describe_asg("test-asg").await.unwrap();
        assert_eq!(asg.desired_capacity, 1);
    }

    #[tokio::test]
    async fn no_op_when_target_equals_current() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 2, 10));
        cloud.set_desired_capacity("test-asg", 2).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::for_test();
        config.warm_spare_target = 2;
        let c = controller(cloud.clone(), store, config);
        c.reconcile().await.unwrap();
        let asg = cloud.describe_asg("test-asg").await.unwrap();
        assert_eq!(asg.desired_capacity, 2);
    }
}
