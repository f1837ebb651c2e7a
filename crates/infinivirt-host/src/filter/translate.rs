//! Abstract firewall rule → nft expression tokens.
//!
//! Pure translation, no host access. INOUT must already be expanded by the
//! caller; at this level a rule faces exactly one direction. IN means
//! traffic towards the VM, which in the bridge forward hook is the TAP's
//! *output* direction, hence `oifname` for IN and `iifname` for OUT.

use std::net::Ipv4Addr;

use infinivirt_core::error::RuleError;
use infinivirt_core::firewall::{AddressMatch, FirewallRule, PortRange, RuleDirection};

const MAX_COMMENT_LEN: usize = 64;

/// Translate one directed rule into nft tokens for the given TAP device.
pub fn translate(rule: &FirewallRule, tap: &str) -> Result<Vec<String>, RuleError> {
    let protocol = rule.protocol.to_lowercase();
    if !matches!(protocol.as_str(), "tcp" | "udp" | "icmp" | "all") {
        return Err(RuleError::UnsupportedProtocol(rule.protocol.clone()));
    }

    let has_ports = rule.src_ports.is_some() || rule.dst_ports.is_some();
    if has_ports && !matches!(protocol.as_str(), "tcp" | "udp") {
        return Err(RuleError::RuleInvalid(format!(
            "ports are only valid for tcp/udp, got {}",
            protocol
        )));
    }

    let mut tokens: Vec<String> = Vec::new();

    match rule.direction {
        RuleDirection::In => {
            tokens.push("oifname".to_string());
            tokens.push(format!("\"{}\"", tap));
        }
        RuleDirection::Out => {
            tokens.push("iifname".to_string());
            tokens.push(format!("\"{}\"", tap));
        }
        RuleDirection::InOut => {
            return Err(RuleError::RuleInvalid(
                "INOUT must be expanded before translation".to_string(),
            ));
        }
    }

    if let Some(src) = &rule.src {
        tokens.push("ip".to_string());
        tokens.push("saddr".to_string());
        tokens.push(address_token(src)?);
    }
    if let Some(dst) = &rule.dst {
        tokens.push("ip".to_string());
        tokens.push("daddr".to_string());
        tokens.push(address_token(dst)?);
    }

    match protocol.as_str() {
        "tcp" | "udp" => {
            if let Some(range) = &rule.src_ports {
                tokens.push(protocol.clone());
                tokens.push("sport".to_string());
                tokens.push(port_token(range)?);
            }
            if let Some(range) = &rule.dst_ports {
                tokens.push(protocol.clone());
                tokens.push("dport".to_string());
                tokens.push(port_token(range)?);
            }
            if !has_ports {
                tokens.push("ip".to_string());
                tokens.push("protocol".to_string());
                tokens.push(protocol.clone());
            }
        }
        "icmp" => {
            tokens.push("ip".to_string());
            tokens.push("protocol".to_string());
            tokens.push("icmp".to_string());
        }
        // "all": no protocol selector
        _ => {}
    }

    if let Some(states) = &rule.conn_states
        && !states.is_empty()
    {
        tokens.push("ct".to_string());
        tokens.push("state".to_string());
        if states.len() == 1 {
            tokens.push(states[0].keyword().to_string());
        } else {
            let joined = states
                .iter()
                .map(|s| s.keyword())
                .collect::<Vec<_>>()
                .join(", ");
            tokens.push(format!("{{ {} }}", joined));
        }
    }

    tokens.push(rule.action.keyword().to_string());

    if !rule.name.is_empty() {
        tokens.push("comment".to_string());
        tokens.push(format!("\"{}\"", comment_text(&rule.name)));
    }

    Ok(tokens)
}

fn address_token(addr: &AddressMatch) -> Result<String, RuleError> {
    let ip: Ipv4Addr = addr
        .address
        .parse()
        .map_err(|_| RuleError::InvalidIpAddress(addr.address.clone()))?;

    match &addr.mask {
        None => Ok(ip.to_string()),
        Some(mask) => {
            let prefix = mask_to_prefix(mask)?;
            Ok(format!("{}/{}", ip, prefix))
        }
    }
}

/// Accept CIDR prefix lengths 0..=32 or contiguous dotted-decimal masks.
fn mask_to_prefix(mask: &str) -> Result<u8, RuleError> {
    if let Ok(prefix) = mask.parse::<u32>() {
        if prefix > 32 {
            return Err(RuleError::InvalidSubnetMask(mask.to_string()));
        }
        return Ok(prefix as u8);
    }

    let parsed: Ipv4Addr = mask
        .parse()
        .map_err(|_| RuleError::InvalidSubnetMask(mask.to_string()))?;
    let bits = u32::from(parsed);

    // Contiguous iff the complement is of the form 0..01..1.
    let inv = !bits;
    if inv & inv.wrapping_add(1) != 0 {
        return Err(RuleError::InvalidSubnetMask(mask.to_string()));
    }
    Ok(bits.count_ones() as u8)
}

fn port_token(range: &PortRange) -> Result<String, RuleError> {
    if range.start > 65535 || range.end > 65535 {
        return Err(RuleError::InvalidPortRange(format!(
            "{}-{}",
            range.start, range.end
        )));
    }
    if range.start > range.end {
        return Err(RuleError::InvalidPortRange(format!(
            "{}-{}",
            range.start, range.end
        )));
    }
    if range.start == range.end {
        Ok(range.start.to_string())
    } else {
        Ok(format!("{}-{}", range.start, range.end))
    }
}

fn comment_text(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '"')
        .take(MAX_COMMENT_LEN)
        .collect()
}
