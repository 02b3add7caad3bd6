//! Allocator (spec §4.4): orchestrates a single allocation request through
//! idempotency check, warm-spare claim, validation, tagging, protection,
//! persistence, and capacity reconcile, with compensating rollback on any
//! intermediate failure.
//!
//! Grounded on the teacher's `daemon/pool.rs::acquire_with_mode`, which
//! releases a warm-pool slot, moves it into an in-use map, and on any
//! downstream failure returns the slot rather than leaking it — the same
//! claim-then-compensate shape, generalized here to a tag/protect/persist
//! chain against two external systems instead of one in-process map.

use crate::cloud::CloudAdapter;
use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::model::{tags, WorkspaceRecord, WorkspaceState};
use crate::store::{SetOutcome, StateStore};
use crate::capacity::CapacityController;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Result of a successful or in-progress allocation (spec §4.4).
#[derive(Debug, Clone)]
pub enum AllocationOutcome {
    Bound {
        instance_id: String,
        public_endpoint: String,
        custom_domain: Option<String>,
    },
    Processing,
}

/// Outcome of the critical section (spec §4.4 steps 4-9), distinguishing
/// "lost the per-user race" from every other failure: the former still
/// compensates but resolves to the winner's record instead of an error.
enum BindOutcome {
    Success(AllocationOutcome),
    LostRace(WorkspaceRecord),
    Failed(OrchestratorError),
}

pub struct Allocator {
    cloud: Arc<dyn CloudAdapter>,
    store: Arc<dyn StateStore>,
    capacity: Arc<CapacityController>,
    config: Arc<Config>,
}

impl Allocator {
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

    /// Bounds the whole request to `allocationTimeoutMs` (spec §5): a
    /// deadline exceeded mid-flight surfaces as a retryable
    /// `TransientUpstream` rather than hanging the caller indefinitely.
    #[instrument(skip(self))]
    pub async fn allocate(&self, user_id: &str, now_ms: i64) -> Result<AllocationOutcome, OrchestratorError> {
        let deadline = std::time::Duration::from_millis(self.config.allocation_timeout_ms);
        match tokio::time::timeout(deadline, self.allocate_inner(user_id, now_ms)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(user_id, deadline_ms = self.config.allocation_timeout_ms, "allocation deadline exceeded");
                Err(OrchestratorError::TransientUpstream(format!(
                    "allocation for {user_id} exceeded {}ms deadline",
                    self.config.allocation_timeout_ms
                )))
            }
        }
    }

    async fn allocate_inner(&self, user_id: &str, now_ms: i64) -> Result<AllocationOutcome, OrchestratorError> {
        // Step 1: idempotency.
        if let Some(existing) = self.store.get_workspace(user_id).await? {
            if existing.is_running() && !existing.public_endpoint.is_empty() {
                return Ok(AllocationOutcome::Bound {
                    instance_id: existing.instance_id,
                    public_endpoint: existing.public_endpoint,
                    custom_domain: existing.custom_domain,
                });
            }
        }

        // Step 2: claim.
        let instance_id = match self.store.pool_pop().await? {
            Some(id) => id,
            None => {
                self.capacity.reconcile().await?;
                return Ok(AllocationOutcome::Processing);
            }
        };

        // Step 3: validate. A describe failure here (not-found, transient,
        // fatal) is just as much a leak risk as a failure in the critical
        // section below -- the instance is already off `ws:pool` and must
        // be compensated rather than dropped via `?` (spec §4.10).
        let desc = match self.cloud.describe_instance(&instance_id).await {
            Ok(desc) => desc,
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "failed to describe claimed instance, compensating");
                self.compensate(&instance_id).await;
                return Err(e.into());
            }
        };
        if !desc.is_ready() {
            warn!(instance_id = %instance_id, "claimed instance failed readiness, terminating");
            if let Err(e) = self.cloud.terminate_in_asg_decrementing(&instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "failed to terminate bad instance");
            }
            return Err(OrchestratorError::BadInstance(instance_id));
        }
        let public_endpoint = desc.public_endpoint.clone().unwrap_or_default();

        // Steps 4-9 are the critical section; any failure triggers
        // compensation in reverse order (spec §4.4 step 10).
        match self.bind_and_persist(user_id, &instance_id, &public_endpoint, now_ms).await {
            BindOutcome::Success(outcome) => {
                // Step 8: reconcile (best-effort, logged on failure -- a
                // failed top-up here doesn't invalidate the grant already
                // made to the caller).
                if let Err(e) = self.capacity.reconcile().await {
                    warn!(error = %e, "post-allocation capacity reconcile failed");
                }
                Ok(outcome)
            }
            BindOutcome::LostRace(winner) => {
                self.compensate(&instance_id).await;
                Ok(AllocationOutcome::Bound {
                    instance_id: winner.instance_id,
                    public_endpoint: winner.public_endpoint,
                    custom_domain: winner.custom_domain,
                })
            }
            BindOutcome::Failed(e) => {
                self.compensate(&instance_id).await;
                Err(e)
            }
        }
    }

    async fn bind_and_persist(
        &self,
        user_id: &str,
        instance_id: &str,
        public_endpoint: &str,
        now_ms: i64,
    ) -> BindOutcome {
        // Step 4: bind external side effects (storage attach, proxy route)
        // is delegated to collaborators outside the core; the core has
        // nothing to invoke here (spec §1 scope).

        // Step 5: tag.
        let mut owner_tags = HashMap::new();
        owner_tags.insert(tags::OWNER.to_string(), user_id.to_string());
        owner_tags.insert(tags::WARM_SPARE.to_string(), "false".to_string());
        if let Err(e) = self.cloud.set_tags(instance_id, owner_tags).await {
            return BindOutcome::Failed(e.into());
        }

        // Step 6: protect.
        let results = match self
            .cloud
            .set_scale_in_protection(&[instance_id.to_string()], true)
            .await
        {
            Ok(r) => r,
            Err(e) => return BindOutcome::Failed(e.into()),
        };
        if let Some(r) = results.first() {
            if let Err(msg) = &r.result {
                return BindOutcome::Failed(OrchestratorError::TransientUpstream(msg.clone()));
            }
        }

        // Step 7: persist, conditional on absence of a RUNNING record.
        let record = WorkspaceRecord {
            instance_id: instance_id.to_string(),
            public_endpoint: public_endpoint.to_string(),
            custom_domain: None,
            state: WorkspaceState::Running,
            last_seen: now_ms,
            ts: now_ms,
        };

        match self.store.set_workspace_if_absent(user_id, record).await {
            Ok(SetOutcome::Written) => {
                info!(user_id, instance_id, "allocation bound");
                BindOutcome::Success(AllocationOutcome::Bound {
                    instance_id: instance_id.to_string(),
                    public_endpoint: public_endpoint.to_string(),
                    custom_domain: None,
                })
            }
            Ok(SetOutcome::Conflict(existing)) => {
                // Another concurrent call for the same user won the race;
                // this caller's claimed instance is surplus and must be
                // compensated by the caller, who then returns the winner's
                // record (spec §4.4 step 7).
                BindOutcome::LostRace(existing)
            }
            Err(e) => BindOutcome::Failed(e.into()),
        }
    }

    /// Best-effort, individually-logged inverse of steps 5-6 (spec §4.4
    /// step 10): unprotect, retag unassigned, return to the pool. A
    /// `BadInstance` classification at step 3 never reaches here -- it
    /// terminates directly instead of re-entering the pool.
    #[instrument(skip(self))]
    async fn compensate(&self, instance_id: &str) {
        if let Err(e) = self
            .cloud
            .set_scale_in_protection(&[instance_id.to_string()], false)
            .await
        {
            warn!(instance_id, error = %e, "compensation: failed to remove scale-in protection");
        }

        let mut reset_tags = HashMap::new();
        reset_tags.insert(tags::OWNER.to_string(), tags::UNASSIGNED.to_string());
        reset_tags.insert(tags::WARM_SPARE.to_string(), "true".to_string());
        if let Err(e) = self.cloud.set_tags(instance_id, reset_tags).await {
            warn!(instance_id, error = %e, "compensation: failed to retag as unassigned");
        }

        if let Err(e) = self.store.pool_add(instance_id).await {
            warn!(instance_id, error = %e, "compensation: failed to reinsert into warm pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudAdapter;
    use crate::store::memory::MemoryStore;

    fn allocator(cloud: Arc<MockCloudAdapter>, store: Arc<MemoryStore>) -> Allocator {
        let config = Arc::new(Config::for_test());
        let capacity = Arc::new(CapacityController::new(cloud.clone(), store.clone(), config.clone()));
        Allocator::new(cloud, store, capacity, config)
    }

    #[tokio::test]
    async fn happy_path_binds_and_protects() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let id = cloud.launch();
        store.seed_pool(&id);

        let a = allocator(cloud.clone(), store.clone());
        let outcome = a.allocate("alice", 1000).await.unwrap();
        match outcome {
            AllocationOutcome::Bound { instance_id, .. } => assert_eq!(instance_id, id),
            AllocationOutcome::Processing => panic!("expected bound"),
        }
        assert!(cloud.is_protected(&id));
        let ws = store.get_workspace("alice").await.unwrap().unwrap();
        assert!(ws.is_running());
    }

    #[tokio::test]
    async fn idempotent_repeat_returns_same_record() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let id = cloud.launch();
        store.seed_pool(&id);

        let a = allocator(cloud.clone(), store.clone());
        let first = a.allocate("alice", 1000).await.unwrap();
        let second = a.allocate("alice", 2000).await.unwrap();
        match (first, second) {
            (
                AllocationOutcome::Bound { instance_id: a, .. },
                AllocationOutcome::Bound { instance_id: b, .. },
            ) => assert_eq!(a, b),
            _ => panic!("expected both bound"),
        }
    }

    #[tokio::test]
    async fn shortage_returns_processing_and_raises_capacity() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let a = allocator(cloud.clone(), store.clone());
        let outcome = a.allocate("alice", 1000).await.unwrap();
        assert!(matches!(outcome, AllocationOutcome::Processing));
    }

    #[tokio::test]
    async fn bad_instance_is_terminated_not_recycled() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let id = cloud.launch();
        cloud.set_state(&id, crate::model::InstanceState::Pending);
        store.seed_pool(&id);

        let a = allocator(cloud.clone(), store.clone());
        let result = a.allocate("dave", 1000).await;
        assert!(matches!(result, Err(OrchestratorError::BadInstance(_))));
        assert_eq!(store.pool_size().await.unwrap(), 0);
        let desc = cloud.describe_instance(&id).await.unwrap();
        assert_eq!(desc.state, crate::model::InstanceState::Terminated);
    }

    #[tokio::test]
    async fn lost_race_compensates_and_returns_winner() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        let winner_id = cloud.launch();
        let loser_id = cloud.launch();

        // Simulate the winner having already persisted before this call's
        // step 7 runs.
        store
            .set_workspace_if_absent(
                "alice",
                WorkspaceRecord {
                    instance_id: winner_id.clone(),
                    public_endpoint: "9.9.9.9".to_string(),
                    custom_domain: None,
                    state: WorkspaceState::Running,
                    last_seen: 1,
                    ts: 1,
                },
            )
            .await
            .unwrap();
        store.seed_pool(&loser_id);

        let a = allocator(cloud.clone(), store.clone());
        let outcome = a.allocate("alice", 2000).await.unwrap();
        match outcome {
            AllocationOutcome::Bound { instance_id, .. } => assert_eq!(instance_id, winner_id),
            AllocationOutcome::Processing => panic!("expected bound to winner"),
        }
        // The loser's claimed instance is compensated back into the pool.
        assert_eq!(store.pool_size().await.unwrap(), 1);
        assert!(!cloud.is_protected(&loser_id));
    }

    #[tokio::test]
    async fn describe_failure_after_claim_compensates_instead_of_leaking() {
        let cloud = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let store = Arc::new(MemoryStore::new());
        // Seeded directly into the pool without ever being `launch()`ed, so
        // `describe_instance` reports `CloudError::NotFound`.
        store.seed_pool("i-ghost");

        let a = allocator(cloud.clone(), store.clone());
        let result = a.allocate("dave", 1000).await;
        assert!(matches!(result, Err(OrchestratorError::BadInstance(_))));
        // Compensation ran rather than leaking the claim silently.
        assert_eq!(store.pool_size().await.unwrap(), 1);
    }

    /// `CloudAdapter` wrapper that sleeps before every call, used to force
    /// the allocation deadline in `allocation_deadline_is_enforced`.
    struct SlowCloudAdapter {
        inner: Arc<MockCloudAdapter>,
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl CloudAdapter for SlowCloudAdapter {
        async fn describe_instance(
            &self,
            id: &str,
        ) -> Result<crate::model::InstanceDescription, crate::errors::CloudError> {
            tokio::time::sleep(self.delay).await;
            self.inner.describe_instance(id).await
        }

        async fn set_tags(
            &self,
            id: &str,
            tags: HashMap<String, String>,
        ) -> Result<(), crate::errors::CloudError> {
            self.inner.set_tags(id, tags).await
        }

        async fn set_scale_in_protection(
            &self,
            ids: &[String],
            protect: bool,
        ) -> Result<Vec<crate::cloud::ProtectionResult>, crate::errors::CloudError> {
            self.inner.set_scale_in_protection(ids, protect).await
        }

        async fn describe_asg(
            &self,
            asg_name: &str,
        ) -> Result<crate::model::AsgDescription, crate::errors::CloudError> {
            self.inner.describe_asg(asg_name).await
        }

        async fn set_desired_capacity(&self, asg_name: &str, n: i32) -> Result<(), crate::errors::CloudError> {
            self.inner.set_desired_capacity(asg_name, n).await
        }

        async fn terminate_in_asg_decrementing(&self, id: &str) -> Result<(), crate::errors::CloudError> {
            self.inner.terminate_in_asg_decrementing(id).await
        }
    }

    #[tokio::test]
    async fn allocation_deadline_is_enforced() {
        let mock = Arc::new(MockCloudAdapter::new("test-asg", 0, 5));
        let id = mock.launch();
        let store = Arc::new(MemoryStore::new());
        store.seed_pool(&id);

        let slow = Arc::new(SlowCloudAdapter {
            inner: mock,
            delay: std::time::Duration::from_millis(50),
        });
        let mut config = Config::for_test();
        config.allocation_timeout_ms = 5;
        let config = Arc::new(config);
        let capacity = Arc::new(CapacityController::new(slow.clone(), store.clone(), config.clone()));
        let a = Allocator::new(slow, store, capacity, config);

        let result = a.allocate("dave", 1000).await;
        assert!(matches!(result, Err(OrchestratorError::TransientUpstream(_))));
    }
}
