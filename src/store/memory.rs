//! In-memory `StateStore` fake for unit and integration tests (spec §8).
//!
//! Grounded on the teacher's in-memory test doubles in `backend/mod.rs`;
//! here the fake must additionally reproduce the State Store's atomicity
//! guarantees (spec §4.3, §9), which a single `std::sync::Mutex` around one
//! struct gives for free without needing Lua.

use super::{SetOutcome, StateStore};
use crate::errors::StoreError;
use crate::model::{WorkspaceRecord, WorkspaceState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    workspaces: HashMap<String, WorkspaceRecord>,
    inverse: HashMap<String, String>,
    pings: HashMap<String, i64>,
    pool: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed the warm pool directly.
    pub fn seed_pool(&self, instance_id: &str) {
        self.inner.lock().unwrap().pool.insert(instance_id.to_string());
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn pool_pop(&self) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.pool.iter().next().cloned();
        if let Some(ref id) = id {
            inner.pool.remove(id);
        }
        Ok(id)
    }

    async fn pool_add(&self, instance_id: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().pool.insert(instance_id.to_string());
        Ok(())
    }

    async fn pool_remove(&self, instance_id: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().pool.remove(instance_id);
        Ok(())
    }

    async fn pool_size(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().unwrap().pool.len() as u64)
    }

    async fn get_workspace(&self, user_id: &str) -> Result<Option<WorkspaceRecord>, StoreError> {
        Ok(self.inner.lock().unwrap().workspaces.get(user_id).cloned())
    }

    async fn set_workspace_if_absent(
        &self,
        user_id: &str,
        record: WorkspaceRecord,
    ) -> Result<SetOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.workspaces.get(user_id) {
            if existing.state == WorkspaceState::Running {
                return Ok(SetOutcome::Conflict(existing.clone()));
            }
        }
        inner
            .inverse
            .insert(record.instance_id.clone(), user_id.to_string());
        inner.pings.insert(user_id.to_string(), record.last_seen);
        inner.workspaces.insert(user_id.to_string(), record);
        Ok(SetOutcome::Written)
    }

    async fn get_user_for_instance(&self, instance_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().unwrap().inverse.get(instance_id).cloned())
    }

    async fn update_ping(&self, user_id: &str, now_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.workspaces.contains_key(user_id) {
            return Err(StoreError::NotFound(format!("no workspace for {user_id}")));
        }
        if let Some(ws) = inner.workspaces.get_mut(user_id) {
            ws.last_seen = now_ms;
            ws.state = WorkspaceState::Running;
        }
        inner.pings.insert(user_id.to_string(), now_ms);
        Ok(())
    }

    async fn list_idle(&self, cutoff_ms: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pings
            .iter()
            .filter(|(_, &score)| score <= cutoff_ms)
            .map(|(u, _)| u.clone())
            .collect())
    }

    async fn active_count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().unwrap().pings.len() as u64)
    }

    async fn cleanup(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pings.remove(user_id);
        inner.inverse.remove(instance_id);
        inner.workspaces.remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(instance_id: &str, now: i64) -> WorkspaceRecord {
        WorkspaceRecord {
            instance_id: instance_id.to_string(),
            public_endpoint: "1.2.3.4".to_string(),
            custom_domain: None,
            state: WorkspaceState::Running,
            last_seen: now,
            ts: now,
        }
    }

    #[tokio::test]
    async fn pop_never_returns_same_instance_twice() {
        let store = MemoryStore::new();
        store.seed_pool("i-1");
        let a = store.pool_pop().await.unwrap();
        let b = store.pool_pop().await.unwrap();
        assert_eq!(a, Some("i-1".to_string()));
        assert_eq!(b, None);
    }

    #[tokio::test]
    async fn set_workspace_if_absent_serializes_per_user() {
        let store = MemoryStore::new();
        let outcome = store
            .set_workspace_if_absent("alice", record("i-1", 1000))
            .await
            .unwrap();
        assert!(matches!(outcome, SetOutcome::Written));

        let outcome = store
            .set_workspace_if_absent("alice", record("i-2", 2000))
            .await
            .unwrap();
        match outcome {
            SetOutcome::Conflict(existing) => assert_eq!(existing.instance_id, "i-1"),
            SetOutcome::Written => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn cleanup_removes_all_traces() {
        let store = MemoryStore::new();
        store
            .set_workspace_if_absent("alice", record("i-1", 1000))
            .await
            .unwrap();
        store.cleanup("alice", "i-1").await.unwrap();
        assert!(store.get_workspace("alice").await.unwrap().is_none());
        assert!(store.get_user_for_instance("i-1").await.unwrap().is_none());
        assert_eq!(store.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_idle_filters_by_cutoff() {
        let store = MemoryStore::new();
        store
            .set_workspace_if_absent("alice", record("i-1", 1000))
            .await
            .unwrap();
        store
            .set_workspace_if_absent("bob", record("i-2", 9000))
            .await
            .unwrap();
        let idle = store.list_idle(5000).await.unwrap();
        assert_eq!(idle, vec!["alice".to_string()]);
    }
}
