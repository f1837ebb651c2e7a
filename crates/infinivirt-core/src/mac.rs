use md5::{Digest, Md5};

/// QEMU/KVM locally-administered OUI.
const MAC_PREFIX: &str = "52:54:00";

/// Derive a stable MAC address from a VM id.
///
/// The low three octets come from the id itself when it carries at least six
/// hex digits; shorter ids are hashed so that any id still maps to a stable
/// address. Same id, same MAC, across restarts.
pub fn derive_mac(vm_id: &str) -> String {
    let hex: String = vm_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(6)
        .collect();

    let tail = if hex.len() >= 6 {
        hex.to_lowercase()
    } else {
        let digest = Md5::digest(vm_id.as_bytes());
        format!("{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2])
    };

    format!(
        "{}:{}:{}:{}",
        MAC_PREFIX,
        &tail[0..2],
        &tail[2..4],
        &tail[4..6]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_is_stable() {
        assert_eq!(derive_mac("vm-abc123"), derive_mac("vm-abc123"));
        assert_eq!(derive_mac("x"), derive_mac("x"));
    }

    #[test]
    fn test_mac_prefix() {
        for id in ["vm-abc123", "x", "deadbeefcafe", ""] {
            assert!(derive_mac(id).starts_with("52:54:00:"));
        }
    }

    #[test]
    fn test_mac_uses_hex_digits_from_id() {
        // "vm-abc123" carries exactly six hex digits: a, b, c, 1, 2, 3.
        assert_eq!(derive_mac("vm-abc123"), "52:54:00:ab:c1:23");
        assert_eq!(derive_mac("DEADBEEF"), "52:54:00:de:ad:be");
    }

    #[test]
    fn test_short_id_falls_back_to_hash() {
        let mac = derive_mac("vm");
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        // Distinct short ids should not collide on the obvious cases.
        assert_ne!(derive_mac("vm"), derive_mac("mv"));
    }
}
