//! The cleanup ladder: an explicit plan of tagged steps with per-step
//! bounded retry.
//!
//! Both failure paths (create/start unwinding and crash recovery) build
//! their step vectors here and run them through the one executor, so the two
//! ladders cannot drift apart. Every step is idempotent by construction.

use std::pin::Pin;
use std::time::Duration;

use tracing::{info, warn};

use infinivirt_core::cleanup::{CleanupReport, ResourceCleanup, ResourceKind, ResourceStatus};
use infinivirt_core::paths::HostPaths;
use infinivirt_core::retry::RetryPolicy;
use infinivirt_host::{filter::FilterService, tap};

use crate::process;
use crate::store::VmStore;

/// Backoff for each cleanup step: 1 s, 2 s, capped at 10 s, three attempts.
pub const CLEANUP_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    base_delay: Duration::from_secs(1),
    factor: 2,
    cap: Duration::from_secs(10),
};

pub type StepFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
pub type StepFn<'a> = Box<dyn FnMut() -> StepFuture<'a> + Send + 'a>;

pub struct CleanupStep<'a> {
    pub kind: ResourceKind,
    pub identifier: String,
    pub op: StepFn<'a>,
}

impl<'a> CleanupStep<'a> {
    pub fn new(kind: ResourceKind, identifier: impl Into<String>, op: StepFn<'a>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            op,
        }
    }
}

/// Walk the steps in order, each under bounded retry.
///
/// The DB step is skipped when any upstream host resource ended FAILED: the
/// remaining runtime config is what an operator needs to retry cleanup by
/// hand.
pub async fn execute_cleanup(
    vm_id: &str,
    steps: Vec<CleanupStep<'_>>,
    policy: RetryPolicy,
) -> CleanupReport {
    let mut report = CleanupReport::new(vm_id);
    let mut host_failure = false;

    for mut step in steps {
        let mut tracked = ResourceCleanup::new(step.kind, step.identifier.clone());

        if step.kind == ResourceKind::DbConfig && host_failure {
            warn!(vm_id, "skipping DB cleanup, host resources still pending");
            tracked.mark(ResourceStatus::Skipped);
            report.resources.push(tracked);
            continue;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tracked.attempts = attempt;
            match (step.op)().await {
                Ok(()) => {
                    tracked.mark(ResourceStatus::Success);
                    break;
                }
                Err(e) => {
                    tracked.last_error = Some(format!("{:#}", e));
                    if attempt >= policy.max_attempts {
                        tracked.mark(ResourceStatus::Failed);
                        if step.kind != ResourceKind::DbConfig {
                            host_failure = true;
                        }
                        warn!(
                            vm_id,
                            kind = %step.kind,
                            identifier = %tracked.identifier,
                            error = %e,
                            "cleanup step failed"
                        );
                        break;
                    }
                    tracked.mark(ResourceStatus::Retrying);
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
        report.resources.push(tracked);
    }

    report.finish();
    info!(
        vm_id,
        failed = report.failed_count(),
        "cleanup run finished"
    );
    report
}

/// Shared inputs for building a cleanup plan.
pub struct CleanupContext<'a> {
    pub vm_id: &'a str,
    pub internal_name: &'a str,
    pub tap_device: Option<&'a str>,
    pub paths: &'a HostPaths,
    pub filter: &'a FilterService,
    pub store: &'a dyn VmStore,
}

/// Crash-recovery plan: detach everything the dead process held, but keep
/// the TAP device and the filter chain for the next start.
pub fn crash_cleanup_steps<'a>(ctx: &CleanupContext<'a>) -> Vec<CleanupStep<'a>> {
    let mut steps = Vec::new();

    if let Some(tap_device) = ctx.tap_device {
        steps.push(CleanupStep::new(
            ResourceKind::Tap,
            tap_device,
            Box::new(move || Box::pin(tap::bring_down(tap_device))),
        ));
    }

    let vm_id = ctx.vm_id;
    let filter = ctx.filter;
    steps.push(CleanupStep::new(
        ResourceKind::FilterChain,
        infinivirt_core::naming::chain_name(vm_id),
        Box::new(move || Box::pin(filter.detach_jump_rules(vm_id))),
    ));

    steps.push(unlink_step(
        ResourceKind::ControlSocket,
        ctx.paths.control_socket_path(ctx.internal_name),
    ));
    steps.push(unlink_step(
        ResourceKind::AgentSocket,
        ctx.paths.agent_socket_path(ctx.internal_name),
    ));
    steps.push(unlink_step(
        ResourceKind::AgentSocket,
        ctx.paths.service_socket_path(ctx.internal_name),
    ));
    steps.push(pid_file_step(ctx.paths.pid_file_path(ctx.internal_name)));

    let store = ctx.store;
    steps.push(CleanupStep::new(
        ResourceKind::DbConfig,
        vm_id,
        Box::new(move || {
            Box::pin(async move {
                store
                    .clear_volatile_machine_configuration(vm_id)
                    .map_err(|e| anyhow::anyhow!("{}", e))
            })
        }),
    ));

    steps
}

/// Unlink a socket or similar artifact; a missing file is success.
fn unlink_step<'a>(kind: ResourceKind, path: std::path::PathBuf) -> CleanupStep<'a> {
    let identifier = path.display().to_string();
    CleanupStep::new(
        kind,
        identifier,
        Box::new(move || {
            let path = path.clone();
            Box::pin(async move {
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(anyhow::anyhow!("unlink {} failed: {}", path.display(), e)),
                }
            })
        }),
    )
}

/// Unlink the PID file only when the recorded process is dead. A PID file
/// pointing at a live process is never deleted.
fn pid_file_step<'a>(path: std::path::PathBuf) -> CleanupStep<'a> {
    let identifier = path.display().to_string();
    CleanupStep::new(
        ResourceKind::PidFile,
        identifier,
        Box::new(move || {
            let path = path.clone();
            Box::pin(async move {
                match process::read_pid_file(&path) {
                    None => {
                        // Absent or unparseable: nothing live behind it.
                        match std::fs::remove_file(&path) {
                            Ok(()) => Ok(()),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                            Err(e) => {
                                Err(anyhow::anyhow!("unlink {} failed: {}", path.display(), e))
                            }
                        }
                    }
                    Some(pid) if process::is_pid_alive(pid) => Err(anyhow::anyhow!(
                        "pid file {} points at live process {}",
                        path.display(),
                        pid
                    )),
                    Some(_) => {
                        std::fs::remove_file(&path)
                            .map_err(|e| anyhow::anyhow!("unlink {} failed: {}", path.display(), e))
                    }
                }
            })
        }),
    )
}
