//! In-memory `CloudAdapter` fake for tests (spec §8's testable properties
//! require exercising the allocator/reconcile paths without live AWS).
//!
//! Grounded on the teacher's test doubles in `backend/mod.rs`'s
//! `#[cfg(test)]` section, which stands up an in-memory `Sandbox` rather
//! than shelling out to Docker/Firecracker for unit coverage.

use super::{CloudAdapter, ProtectionResult};
use crate::errors::CloudError;
use crate::model::{AsgDescription, InstanceDescription, InstanceState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

struct MockInstance {
    state: InstanceState,
    public_endpoint: Option<String>,
    tags: HashMap<String, String>,
    protected: bool,
}

struct Inner {
    instances: HashMap<String, MockInstance>,
    asg: AsgDescription,
    next_seq: u64,
}

/// Fully in-process stand-in for an AWS account: instances are created by
/// `MockCloudAdapter::launch`, never by `set_desired_capacity` directly,
/// mirroring how an ASG only actually launches instances once its launch
/// template completes out-of-band.
pub struct MockCloudAdapter {
    inner: Mutex<Inner>,
}

impl MockCloudAdapter {
    pub fn new(asg_name: &str, min_size: i32, max_size: i32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
                asg: AsgDescription {
                    desired_capacity: min_size,
                    min_size,
                    max_size,
                    instances: Vec::new(),
                },
                next_seq: 0,
            }),
        }
    }

    /// Simulates the ASG launch template firing: adds a new, already-running
    /// instance with a synthesized endpoint. Tests call this after bumping
    /// `desired_capacity` to simulate launch completion.
    pub fn launch(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let id = format!("i-mock{:06}", inner.next_seq);
        inner.asg.instances.push(id.clone());
        inner.instances.insert(
            id.clone(),
            MockInstance {
                state: InstanceState::Running,
                public_endpoint: Some(format!("10.0.0.{}", inner.next_seq % 254 + 1)),
                tags: HashMap::new(),
                protected: false,
            },
        );
        id
    }

    pub fn set_state(&self, id: &str, state: InstanceState) {
        if let Some(inst) = self.inner.lock().unwrap().instances.get_mut(id) {
            inst.state = state;
        }
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(id)
            .map(|i| i.protected)
            .unwrap_or(false)
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }
}

#[async_trait]
impl CloudAdapter for MockCloudAdapter {
    async fn describe_instance(&self, id: &str) -> Result<InstanceDescription, CloudError> {
        let inner = self.inner.lock().unwrap();
        let inst = inner
            .instances
            .get(id)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        Ok(InstanceDescription {
            instance_id: id.to_string(),
            state: inst.state,
            public_endpoint: inst.public_endpoint.clone(),
            tags: inst.tags.clone(),
        })
    }

    async fn set_tags(&self, id: &str, tags: HashMap<String, String>) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        let inst = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        inst.tags.extend(tags);
        Ok(())
    }

    async fn set_scale_in_protection(
        &self,
        ids: &[String],
        protect: bool,
    ) -> Result<Vec<ProtectionResult>, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = match inner.instances.get_mut(id) {
                Some(inst) => {
                    inst.protected = protect;
                    Ok(())
                }
                None => Err(format!("instance {id} not found")),
            };
            results.push(ProtectionResult {
                instance_id: id.clone(),
                result,
            });
        }
        Ok(results)
    }

    async fn describe_asg(&self, _asg_name: &str) -> Result<AsgDescription, CloudError> {
        Ok(self.inner.lock().unwrap().asg.clone())
    }

    async fn set_desired_capacity(&self, _asg_name: &str, n: i32) -> Result<(), CloudError> {
        self.inner.lock().unwrap().asg.desired_capacity = n;
        Ok(())
    }

    async fn terminate_in_asg_decrementing(&self, id: &str) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.instances.contains_key(id) {
            return Err(CloudError::NotFound(id.to_string()));
        }
        inner.instances.get_mut(id).unwrap().state = InstanceState::Terminated;
        inner.asg.instances.retain(|i| i != id);
        inner.asg.desired_capacity = (inner.asg.desired_capacity - 1).max(inner.asg.min_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_then_describe_is_ready() {
        let adapter = MockCloudAdapter::new("test-asg", 0, 10);
        let id = adapter.launch();
        let desc = adapter.describe_instance(&id).await.unwrap();
        assert!(desc.is_ready());
    }

    #[tokio::test]
    async fn terminate_decrements_capacity_not_below_min() {
        let adapter = MockCloudAdapter::new("test-asg", 1, 10);
        adapter.set_desired_capacity("test-asg", 1).await.unwrap();
        let id = adapter.launch();
        adapter.terminate_in_asg_decrementing(&id).await.unwrap();
        let asg = adapter.describe_asg("test-asg").await.unwrap();
        assert_eq!(asg.desired_capacity, 1);
        assert!(adapter.describe_instance(&id).await.unwrap().state == InstanceState::Terminated);
    }

    #[tokio::test]
    async fn scale_in_protection_toggles_per_instance() {
        let adapter = MockCloudAdapter::new("test-asg", 0, 10);
        let id = adapter.launch();
        let results = adapter
            .set_scale_in_protection(&[id.clone()], true)
            .await
            .unwrap();
        assert!(results[0].result.is_ok());
        assert!(adapter.is_protected(&id));
    }
}
