//! Production `CloudAdapter` backed by `aws-sdk-ec2` + `aws-sdk-autoscaling`.
//!
//! Grounded on the `aws-sdk-*` dependency family pulled in by
//! `examples/RisingwaveLabs-risingwave`'s connector crate, applied here to
//! EC2 instance/tag description and Auto Scaling Group control. Every SDK
//! error is classified into the `CloudError` kinds spec §4.1/§7 require;
//! the SDK itself is held as two cheaply-`Clone`able clients, the same way
//! the teacher holds a `Copy` `ContainerRuntime` enum through `ContainerPool`
//! so every concurrent caller gets its own handle without synchronization.

use super::{CloudAdapter, ProtectionResult};
use crate::errors::CloudError;
use crate::model::{AsgDescription, InstanceDescription, InstanceState};
use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AutoscalingClient;
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct AwsCloudAdapter {
    ec2: Ec2Client,
    autoscaling: AutoscalingClient,
}

impl AwsCloudAdapter {
    /// Build an adapter from the default AWS config chain (env vars,
    /// shared config file, IMDS). Called once at `serve` startup.
    pub async fn from_env() -> Self {
        let shared_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            ec2: Ec2Client::new(&shared_config),
            autoscaling: AutoscalingClient::new(&shared_config),
        }
    }

    pub fn new(ec2: Ec2Client, autoscaling: AutoscalingClient) -> Self {
        Self { ec2, autoscaling }
    }

    fn classify_ec2_error<E: std::fmt::Display>(context: &str, err: E) -> CloudError {
        let msg = err.to_string();
        if msg.contains("InvalidInstanceID.NotFound") {
            CloudError::NotFound(format!("{context}: {msg}"))
        } else if msg.contains("RequestLimitExceeded") || msg.contains("Throttling") {
            CloudError::Transient(format!("{context}: {msg}"))
        } else if msg.contains("UnauthorizedOperation") || msg.contains("AccessDenied") {
            CloudError::PermissionDenied(format!("{context}: {msg}"))
        } else {
            CloudError::Fatal(format!("{context}: {msg}"))
        }
    }
}

fn parse_instance_state(raw: Option<&str>) -> InstanceState {
    match raw {
        Some("pending") => InstanceState::Pending,
        Some("running") => InstanceState::Running,
        Some("shutting-down") => InstanceState::ShuttingDown,
        Some("terminated") => InstanceState::Terminated,
        Some("stopping") => InstanceState::Stopping,
        Some("stopped") => InstanceState::Stopped,
        _ => InstanceState::Unknown,
    }
}

#[async_trait]
impl CloudAdapter for AwsCloudAdapter {
    #[instrument(skip(self))]
    async fn describe_instance(&self, id: &str) -> Result<InstanceDescription, CloudError> {
        let resp = self
            .ec2
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| Self::classify_ec2_error("describe_instances", e))?;

        let instance = resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .ok_or_else(|| CloudError::NotFound(format!("instance {id} not found")))?;

        let state = parse_instance_state(instance.state().and_then(|s| s.name()).map(|n| n.as_str()));
        let public_endpoint = instance.public_ip_address().map(|s| s.to_string());

        let tags = instance
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
            .collect::<HashMap<_, _>>();

        Ok(InstanceDescription {
            instance_id: id.to_string(),
            state,
            public_endpoint,
            tags,
        })
    }

    #[instrument(skip(self, tags))]
    async fn set_tags(&self, id: &str, tags: HashMap<String, String>) -> Result<(), CloudError> {
        let ec2_tags: Vec<_> = tags
            .into_iter()
            .map(|(k, v)| aws_sdk_ec2::types::Tag::builder().key(k).value(v).build())
            .collect();

        self.ec2
            .create_tags()
            .resources(id)
            .set_tags(Some(ec2_tags))
            .send()
            .await
            .map_err(|e| Self::classify_ec2_error("create_tags", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_scale_in_protection(
        &self,
        ids: &[String],
        protect: bool,
    ) -> Result<Vec<ProtectionResult>, CloudError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // The ASG name isn't known to this call; AWS's
        // SetInstanceProtection resolves it from the instance's current
        // membership, so we issue one call per unique ASG the instances
        // report via DescribeAutoScalingInstances.
        let described = self
            .autoscaling
            .describe_auto_scaling_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| Self::classify_ec2_error("describe_auto_scaling_instances", e))?;

        let mut by_asg: HashMap<String, Vec<String>> = HashMap::new();
        for inst in described.auto_scaling_instances() {
            if let (Some(asg), Some(id)) = (inst.auto_scaling_group_name(), inst.instance_id()) {
                by_asg.entry(asg.to_string()).or_default().push(id.to_string());
            }
        }

        let mut results = Vec::with_capacity(ids.len());
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for (asg, group_ids) in by_asg {
            let call = self
                .autoscaling
                .set_instance_protection()
                .auto_scaling_group_name(&asg)
                .set_instance_ids(Some(group_ids.clone()))
                .protected_from_scale_in(protect)
                .send()
                .await;

            match call {
                Ok(_) => {
                    for id in &group_ids {
                        seen.insert(id.clone());
                        results.push(ProtectionResult {
                            instance_id: id.clone(),
                            result: Ok(()),
                        });
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    warn!(asg, error = %msg, "scale-in protection call failed for group");
                    for id in &group_ids {
                        seen.insert(id.clone());
                        results.push(ProtectionResult {
                            instance_id: id.clone(),
                            result: Err(msg.clone()),
                        });
                    }
                }
            }
        }

        // Instances not reported by DescribeAutoScalingInstances (e.g. not
        // yet a group member, or already gone) are per-id failures, not a
        // fatal batch failure: tags remain the authoritative fallback.
        for id in ids {
            if !seen.contains(id) {
                results.push(ProtectionResult {
                    instance_id: id.clone(),
                    result: Err("instance not found in any auto scaling group".to_string()),
                });
            }
        }

        Ok(results)
    }

    #[instrument(skip(self))]
    async fn describe_asg(&self, asg_name: &str) -> Result<AsgDescription, CloudError> {
        let resp = self
            .autoscaling
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(asg_name)
            .send()
            .await
            .map_err(|e| Self::classify_ec2_error("describe_auto_scaling_groups", e))?;

        let group = resp
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| CloudError::NotFound(format!("asg {asg_name} not found")))?;

        Ok(AsgDescription {
            desired_capacity: group.desired_capacity().unwrap_or(0),
            min_size: group.min_size().unwrap_or(0),
            max_size: group.max_size().unwrap_or(0),
            instances: group
                .instances()
                .iter()
                .filter_map(|i| i.instance_id().map(|s| s.to_string()))
                .collect(),
        })
    }

    #[instrument(skip(self))]
    async fn set_desired_capacity(&self, asg_name: &str, n: i32) -> Result<(), CloudError> {
        debug!(asg_name, desired = n, "setting ASG desired capacity");
        self.autoscaling
            .set_desired_capacity()
            .auto_scaling_group_name(asg_name)
            .desired_capacity(n)
            .honor_cooldown(false)
            .send()
            .await
            .map_err(|e| Self::classify_ec2_error("set_desired_capacity", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn terminate_in_asg_decrementing(&self, id: &str) -> Result<(), CloudError> {
        self.autoscaling
            .terminate_instance_in_auto_scaling_group()
            .instance_id(id)
            .should_decrement_desired_capacity(true)
            .send()
            .await
            .map_err(|e| Self::classify_ec2_error("terminate_instance_in_auto_scaling_group", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requires real AWS credentials on the default chain and an
    /// `AWS_TEST_INSTANCE_ID` env var naming an instance the caller owns
    /// and is allowed to tag.
    #[tokio::test]
    #[ignore] // Requires an AWS account
    async fn describe_and_tag_a_real_instance() {
        let instance_id = std::env::var("AWS_TEST_INSTANCE_ID")
            .expect("set AWS_TEST_INSTANCE_ID to a real instance you own");
        let adapter = AwsCloudAdapter::from_env().await;

        let before = adapter
            .describe_instance(&instance_id)
            .await
            .expect("describe_instance should succeed against a live account");
        assert_ne!(before.state, InstanceState::Unknown);

        let mut tags = HashMap::new();
        tags.insert("workspace-orchestrator-smoke-test".to_string(), "true".to_string());
        adapter
            .set_tags(&instance_id, tags)
            .await
            .expect("set_tags should succeed against a live account");

        let after = adapter.describe_instance(&instance_id).await.unwrap();
        assert_eq!(
            after.tags.get("workspace-orchestrator-smoke-test").map(String::as_str),
            Some("true")
        );
    }
}
