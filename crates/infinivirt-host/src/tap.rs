//! TAP device lifecycle.
//!
//! Kernel netlink operations are not idempotent and briefly hold device
//! names after teardown, so create and delete both run under busy-retry,
//! with settle pauses where the kernel needs time to release resources.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use infinivirt_core::naming;
use infinivirt_core::retry::{RetryPolicy, is_busy_error, retry_if};

use crate::exec;

/// Pause after bringing a link down before deleting it.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

const CREATE_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(500));
const DESTROY_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(300));

/// Whether a TAP device with this name currently exists.
pub async fn exists(tap: &str) -> Result<bool> {
    exec::succeeds("ip", &["link", "show", tap]).await
}

/// Create the TAP device for a VM and attach it to `bridge`.
///
/// An orphan device left by a previous incarnation is destroyed first.
/// Returns the device name derived from the VM id.
pub async fn create(vm_id: &str, bridge: Option<&str>) -> Result<String> {
    let tap = naming::tap_name(vm_id);

    if exists(&tap).await? {
        warn!(tap, "orphan TAP device found, destroying before create");
        destroy(&tap).await?;
    }

    retry_if(CREATE_RETRY, "tap create", is_busy_error, || async {
        exec::run_ok("ip", &["tuntap", "add", "dev", &tap, "mode", "tap"]).await
    })
    .await
    .with_context(|| format!("Failed to create TAP device {}", tap))?;

    configure(&tap, bridge).await?;

    info!(tap, bridge = bridge.unwrap_or("-"), "TAP device created");
    Ok(tap)
}

/// Bring the link up and, when a bridge is given, enslave it.
pub async fn configure(tap: &str, bridge: Option<&str>) -> Result<()> {
    exec::run_ok("ip", &["link", "set", tap, "up"])
        .await
        .with_context(|| format!("Failed to bring up TAP device {}", tap))?;

    if let Some(bridge) = bridge {
        exec::run_ok("ip", &["link", "set", tap, "master", bridge])
            .await
            .with_context(|| format!("Failed to attach {} to bridge {}", tap, bridge))?;
    }
    Ok(())
}

/// Bring the link down. Missing devices are benign.
pub async fn bring_down(tap: &str) -> Result<()> {
    let output = exec::run("ip", &["link", "set", tap, "down"]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_device(&stderr) {
            debug!(tap, "TAP device already gone on bring-down");
            return Ok(());
        }
        anyhow::bail!("ip link set {} down failed: {}", tap, stderr.trim());
    }
    Ok(())
}

/// Destroy a TAP device: link down, settle, delete under busy-retry.
/// A device that no longer exists is logged, not raised.
pub async fn destroy(tap: &str) -> Result<()> {
    bring_down(tap).await?;
    tokio::time::sleep(SETTLE_DELAY).await;

    let result = retry_if(DESTROY_RETRY, "tap delete", is_busy_error, || async {
        let output = exec::run("ip", &["link", "del", tap]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_device(&stderr) {
                debug!(tap, "TAP device already gone on delete");
                return Ok(());
            }
            anyhow::bail!("ip link del {} failed: {}", tap, stderr.trim());
        }
        Ok(())
    })
    .await;

    match result {
        Ok(()) => {
            info!(tap, "TAP device destroyed");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to destroy TAP device {}", tap)),
    }
}

fn is_missing_device(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("cannot find device") || s.contains("no such device")
}
