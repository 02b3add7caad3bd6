//! Core data model (spec §3): the workspace record, instance description,
//! and the per-user state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-user workspace state (spec §3, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkspaceState {
    Pending,
    Running,
    Stopped,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceState::Pending => write!(f, "PENDING"),
            WorkspaceState::Running => write!(f, "RUNNING"),
            WorkspaceState::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl FromStr for WorkspaceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WorkspaceState::Pending),
            "RUNNING" => Ok(WorkspaceState::Running),
            "STOPPED" => Ok(WorkspaceState::Stopped),
            other => Err(format!("unknown workspace state '{other}'")),
        }
    }
}

/// Per-user workspace record (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub instance_id: String,
    pub public_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    pub state: WorkspaceState,
    /// epoch-ms of the most recent liveness signal.
    pub last_seen: i64,
    /// epoch-ms of creation.
    pub ts: i64,
}

impl WorkspaceRecord {
    pub fn is_running(&self) -> bool {
        self.state == WorkspaceState::Running
    }
}

/// Cloud-reported instance state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Terminating,
    Terminated,
    ShuttingDown,
    Stopped,
    Stopping,
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Stopped => "stopped",
            InstanceState::Stopping => "stopping",
            InstanceState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Standard tag keys the orchestrator reads and writes on every instance.
pub mod tags {
    pub const OWNER: &str = "Owner";
    pub const WARM_SPARE: &str = "WarmSpare";
    pub const MANAGED_BY: &str = "ManagedBy";
    pub const MANAGED_BY_VALUE: &str = "workspace-orchestrator";
    pub const UNASSIGNED: &str = "UNASSIGNED";
}

/// Description of an instance as observed through the Cloud Adapter.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_endpoint: Option<String>,
    pub tags: std::collections::HashMap<String, String>,
}

impl InstanceDescription {
    /// Readiness criterion from spec §4.6 / GLOSSARY: running and reachable.
    pub fn is_ready(&self) -> bool {
        self.state == InstanceState::Running
            && self
                .public_endpoint
                .as_ref()
                .is_some_and(|ep| !ep.is_empty())
    }

    pub fn owner(&self) -> Option<&str> {
        self.tags.get(tags::OWNER).map(|s| s.as_str())
    }

    pub fn is_unassigned(&self) -> bool {
        self.owner().is_none_or(|o| o == tags::UNASSIGNED)
    }
}

/// ASG snapshot returned by `describeAsg` (spec §4.1).
#[derive(Debug, Clone)]
pub struct AsgDescription {
    pub desired_capacity: i32,
    pub min_size: i32,
    pub max_size: i32,
    pub instances: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn workspace_state_round_trips() {
        for s in [
            WorkspaceState::Pending,
            WorkspaceState::Running,
            WorkspaceState::Stopped,
        ] {
            let parsed: WorkspaceState = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn workspace_state_rejects_unknown() {
        assert!("BOOTING".parse::<WorkspaceState>().is_err());
    }

    #[test]
    fn instance_readiness_requires_endpoint() {
        let mut i = InstanceDescription {
            instance_id: "i-1".into(),
            state: InstanceState::Running,
            public_endpoint: Some(String::new()),
            tags: HashMap::new(),
        };
        assert!(!i.is_ready());
        i.public_endpoint = Some("1.2.3.4".into());
        assert!(i.is_ready());
        i.state = InstanceState::Pending;
        assert!(!i.is_ready());
    }

    #[test]
    fn instance_ownership_from_tags() {
        let mut tags = HashMap::new();
        let i = InstanceDescription {
            instance_id: "i-1".into(),
            state: InstanceState::Running,
            public_endpoint: None,
            tags: tags.clone(),
        };
        assert!(i.is_unassigned());
        tags.insert(tags::OWNER.to_string(), "UNASSIGNED".to_string());
        let i = InstanceDescription {
            tags: tags.clone(),
            ..i
        };
        assert!(i.is_unassigned());
        tags.insert(tags::OWNER.to_string(), "alice".to_string());
        let i = InstanceDescription { tags, ..i };
        assert!(!i.is_unassigned());
        assert_eq!(i.owner(), Some("alice"));
    }
}
