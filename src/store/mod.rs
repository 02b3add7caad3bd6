//! State Store abstraction (spec §2.1, §4.2, §4.3): the Warm Pool Manager
//! and Session Store are two views over one remote store that supports
//! atomic multi-key transactions, sorted sets, unordered sets, and hashes.
//!
//! Grounded on the teacher's `ContainerPool` (`pool.rs`) for the
//! pop/add/remove/size shape of a warm pool, and on `daemon/pool.rs`'s
//! explicit lock-ordering discipline for why multi-key mutations here are
//! pushed into single atomic units rather than emulated with two calls.

pub mod memory;
pub mod redis_store;

use crate::errors::StoreError;
use crate::model::WorkspaceRecord;
use async_trait::async_trait;

/// Outcome of a conditional per-user workspace write (spec §4.4 step 7).
#[derive(Debug, Clone)]
pub enum SetOutcome {
    /// No RUNNING record existed for the user; the new record is now current.
    Written,
    /// A RUNNING record already existed; it is returned unchanged.
    Conflict(WorkspaceRecord),
}

/// The State Store surface the orchestrator core depends on. A single
/// implementation backs both the Warm Pool Manager and the Session Store
/// views described in spec §4.2/§4.3, since both live behind one atomic
/// transactional store.
#[async_trait]
pub trait StateStore: Send + Sync {
    // --- Warm Pool Manager (spec §4.2) ---

    /// Atomic removal of one member; never returns the same instance to two
    /// concurrent callers.
    async fn pool_pop(&self) -> Result<Option<String>, StoreError>;

    /// Idempotent insert.
    async fn pool_add(&self, instance_id: &str) -> Result<(), StoreError>;

    /// Idempotent delete.
    async fn pool_remove(&self, instance_id: &str) -> Result<(), StoreError>;

    async fn pool_size(&self) -> Result<u64, StoreError>;

    // --- Session Store (spec §4.3) ---

    async fn get_workspace(&self, user_id: &str) -> Result<Option<WorkspaceRecord>, StoreError>;

    /// Writes `record` plus the inverse `inst->user` mapping and the
    /// liveness-index entry in one atomic unit, but only if no RUNNING
    /// record currently exists for `user_id` (spec §4.4 step 7).
    async fn set_workspace_if_absent(
        &self,
        user_id: &str,
        record: WorkspaceRecord,
    ) -> Result<SetOutcome, StoreError>;

    async fn get_user_for_instance(&self, instance_id: &str) -> Result<Option<String>, StoreError>;

    /// Advances `lastSeen` in both the hash and the liveness index
    /// atomically and sets `state=RUNNING`. Fails `NotFound` if no
    /// workspace exists for `user_id`.
    async fn update_ping(&self, user_id: &str, now_ms: i64) -> Result<(), StoreError>;

    /// Range query on the liveness index: users whose score is `<= cutoff`.
    async fn list_idle(&self, cutoff_ms: i64) -> Result<Vec<String>, StoreError>;

    /// Cardinality of the liveness index.
    async fn active_count(&self) -> Result<u64, StoreError>;

    /// In one atomic unit: set workspace `state=STOPPED`, remove `user_id`
    /// from the liveness index, delete the `inst->user` mapping, then
    /// delete the workspace hash itself (spec §4.3, §4.9: STOPPED is a
    /// transient step en route to purge).
    async fn cleanup(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError>;
}
