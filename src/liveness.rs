//! Liveness Gateway (spec §4.8): the sole externally-triggered mutator of
//! `lastSeen`. No authentication beyond knowledge of the instance ID --
//! the call is expected to originate from the instance itself (spec §4.8,
//! network-boundary trust).
//!
//! Grounded on the teacher's `daemon/health.rs::check_vm_health`, a thin
//! single-purpose probe handler with the same shape: resolve an identity,
//! touch one piece of state, return.

use crate::errors::OrchestratorError;
use crate::store::StateStore;
use std::sync::Arc;
use tracing::instrument;

pub struct LivenessGateway {
    store: Arc<dyn StateStore>,
}

impl LivenessGateway {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn ping(&self, instance_id: &str, now_ms: i64) -> Result<(), OrchestratorError> {
        let user_id = self
            .store
            .get_user_for_instance(instance_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no user bound to {instance_id}")))?;

        self.store.update_ping(&user_id, now_ms).await?;
        Ok(())
    }
}
