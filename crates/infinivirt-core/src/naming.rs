use anyhow::{Result, bail};

/// Maximum Linux interface name length (IFNAMSIZ - 1).
const IFNAMSIZ_MAX: usize = 15;

/// Maximum nft chain name length accepted by the kernel.
const CHAIN_NAME_MAX: usize = 31;

/// Strip everything but ASCII alphanumerics.
fn sanitize(id: &str) -> String {
    id.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Per-VM filter chain name: `vm_` + first 8 sanitized chars of the VM id.
///
/// Deterministic for a given id, so stop/start cycles land on the same chain.
pub fn chain_name(vm_id: &str) -> String {
    let mut name = format!("vm_{}", sanitize(vm_id).chars().take(8).collect::<String>());
    name.truncate(CHAIN_NAME_MAX);
    name
}

/// TAP device name: `vnet-` + sanitized prefix of the VM id, capped at the
/// kernel's 15-byte interface-name limit.
pub fn tap_name(vm_id: &str) -> String {
    let room = IFNAMSIZ_MAX - "vnet-".len();
    format!(
        "vnet-{}",
        sanitize(vm_id).chars().take(room).collect::<String>()
    )
}

/// Validate an internal VM name: it seeds every host artifact path, so it
/// must be non-empty and filesystem-safe.
pub fn validate_internal_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        bail!("internal name must be 1-63 characters, got {}", name.len());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("internal name must be alphanumeric plus '-'/'_': {:?}", name);
    }
    if name.starts_with('-') {
        bail!("internal name must not start with a hyphen: {:?}", name);
    }
    Ok(())
}
