use thiserror::Error;

/// Errors surfaced by the lifecycle orchestrator and its collaborators.
///
/// Each variant carries a human-readable message; when a lower-level failure
/// is re-wrapped (e.g. a TAP failure during Create), the original message is
/// preserved inside the new one.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM not found: {0}")]
    VmNotFound(String),
    #[error("VM already running: {0}")]
    AlreadyRunning(String),
    #[error("VM already stopped: {0}")]
    AlreadyStopped(String),
    #[error("create failed: {0}")]
    CreateFailed(String),
    #[error("start failed: {0}")]
    StartFailed(String),
    #[error("stop failed: {0}")]
    StopFailed(String),
    #[error("cleanup failed: {0}")]
    CleanupFailed(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("control protocol error: {0}")]
    Qmp(String),
    #[error("disk error: {0}")]
    Disk(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("firewall error: {0}")]
    Firewall(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("version conflict: {0}")]
    VersionConflict(String),
}

impl VmError {
    /// Stable machine-readable code for events and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::VmNotFound(_) => "VM_NOT_FOUND",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::AlreadyStopped(_) => "ALREADY_STOPPED",
            Self::CreateFailed(_) => "CREATE_FAILED",
            Self::StartFailed(_) => "START_FAILED",
            Self::StopFailed(_) => "STOP_FAILED",
            Self::CleanupFailed(_) => "CLEANUP_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Qmp(_) => "QMP_ERROR",
            Self::Disk(_) => "DISK_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Firewall(_) => "FIREWALL_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Process(_) => "PROCESS_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            Self::ResourceUnavailable(_) => "RESOURCE_UNAVAILABLE",
            Self::VersionConflict(_) => "VERSION_CONFLICT",
        }
    }
}

/// Validation errors from the firewall rule translator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),
    #[error("invalid subnet mask: {0}")]
    InvalidSubnetMask(String),
    #[error("invalid rule: {0}")]
    RuleInvalid(String),
}

impl RuleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedProtocol(_) => "UNSUPPORTED_PROTOCOL",
            Self::InvalidPortRange(_) => "INVALID_PORT_RANGE",
            Self::InvalidIpAddress(_) => "INVALID_IP_ADDRESS",
            Self::InvalidSubnetMask(_) => "INVALID_SUBNET_MASK",
            Self::RuleInvalid(_) => "RULE_INVALID",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(VmError::VmNotFound("x".into()).code(), "VM_NOT_FOUND");
        assert_eq!(VmError::Qmp("x".into()).code(), "QMP_ERROR");
        assert_eq!(
            VmError::ConcurrentModification("x".into()).code(),
            "CONCURRENT_MODIFICATION"
        );
        assert_eq!(
            RuleError::InvalidSubnetMask("x".into()).code(),
            "INVALID_SUBNET_MASK"
        );
    }

    #[test]
    fn test_error_display_preserves_message() {
        let err = VmError::CreateFailed("tap create failed: device busy".into());
        assert!(err.to_string().contains("device busy"));
    }
}
