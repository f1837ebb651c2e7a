use serde::{Deserialize, Serialize};

use crate::time;

/// Host resources released when a VM's process goes away. Ordered: the
/// cleanup ladder walks these top to bottom, and DbConfig is skipped when any
/// non-DB resource failed so an operator can retry with full state intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    Tap,
    FilterChain,
    ControlSocket,
    AgentSocket,
    PidFile,
    DbConfig,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tap => "TAP",
            Self::FilterChain => "FILTER_CHAIN",
            Self::ControlSocket => "CONTROL_SOCKET",
            Self::AgentSocket => "AGENT_SOCKET",
            Self::PidFile => "PID_FILE",
            Self::DbConfig => "DB_CONFIG",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Pending,
    Retrying,
    Success,
    Failed,
    /// Step not attempted because an upstream resource failed.
    Skipped,
}

/// Tracked state of one resource within a cleanup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCleanup {
    pub kind: ResourceKind,
    /// Device name, path, or VM id the step operates on.
    pub identifier: String,
    pub status: ResourceStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: String,
}

impl ResourceCleanup {
    pub fn new(kind: ResourceKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            status: ResourceStatus::Pending,
            attempts: 0,
            last_error: None,
            updated_at: time::utc_now(),
        }
    }

    pub fn mark(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = time::utc_now();
    }
}

/// Aggregate result of one cleanup run for one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub vm_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub resources: Vec<ResourceCleanup>,
}

impl CleanupReport {
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            started_at: time::utc_now(),
            finished_at: None,
            resources: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(time::utc_now());
    }

    pub fn failed_count(&self) -> usize {
        self.resources
            .iter()
            .filter(|r| r.status == ResourceStatus::Failed)
            .count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.resources
            .iter()
            .all(|r| matches!(r.status, ResourceStatus::Success | ResourceStatus::Skipped))
            && self.failed_count() == 0
    }

    pub fn status_of(&self, kind: ResourceKind) -> Option<ResourceStatus> {
        self.resources.iter().find(|r| r.kind == kind).map(|r| r.status)
    }
}
