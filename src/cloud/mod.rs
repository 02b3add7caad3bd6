//! Cloud Adapter (spec §4.1): a thin, stateless abstraction over the
//! provider's instance/tag/ASG surface. Grounded on the `Sandbox` trait in
//! the teacher's `backend/mod.rs` (an `#[async_trait] Send + Sync` trait
//! with one production and one test implementation per backend).

pub mod aws;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use crate::errors::CloudError;
use crate::model::{AsgDescription, InstanceDescription};
use async_trait::async_trait;
use std::collections::HashMap;

/// Per-instance result of a batch scale-in-protection call (spec §4.1).
#[derive(Debug, Clone)]
pub struct ProtectionResult {
    pub instance_id: String,
    pub result: Result<(), String>,
}

/// The Cloud Adapter surface. Every operation is idempotent where the
/// underlying API allows, and is safe to call concurrently from multiple
/// request paths without external serialization (spec §4.1).
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn describe_instance(&self, id: &str) -> Result<InstanceDescription, CloudError>;

    async fn set_tags(&self, id: &str, tags: HashMap<String, String>) -> Result<(), CloudError>;

    async fn set_scale_in_protection(
        &self,
        ids: &[String],
        protect: bool,
    ) -> Result<Vec<ProtectionResult>, CloudError>;

    async fn describe_asg(&self, asg_name: &str) -> Result<AsgDescription, CloudError>;

    /// Idempotent on the target value; returns immediately without awaiting
    /// settlement (spec §4.1).
    async fn set_desired_capacity(&self, asg_name: &str, n: i32) -> Result<(), CloudError>;

    /// Atomic at the cloud boundary: terminates the instance and
    /// decrements the ASG's desired capacity in one call (spec §4.1).
    async fn terminate_in_asg_decrementing(&self, id: &str) -> Result<(), CloudError>;
}
