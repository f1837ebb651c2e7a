use serde::{Deserialize, Serialize};

/// Terminal verdict of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
}

impl RuleAction {
    /// nft statement keyword (lowercased).
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
            Self::Reject => "reject",
        }
    }
}

/// Traffic direction relative to the VM. `InOut` is expanded into one IN and
/// one OUT rule by the filter service before translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleDirection {
    In,
    Out,
    InOut,
}

/// Connection-tracking states matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Established,
    New,
    Related,
    Invalid,
}

impl ConnState {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Established => "established",
            Self::New => "new",
            Self::Related => "related",
            Self::Invalid => "invalid",
        }
    }
}

/// Inclusive port range. Stored wide so that out-of-range input from the
/// store can be rejected by the translator instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u32,
    pub end: u32,
}

impl PortRange {
    pub fn single(port: u32) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

/// IPv4 address with an optional mask (CIDR prefix length or dotted-decimal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMatch {
    pub address: String,
    #[serde(default)]
    pub mask: Option<String>,
}

/// One abstract firewall rule as stored per VM or per department.
///
/// `protocol` stays free-form here; the translator validates it against the
/// closed set and the merge compares it case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub id: String,
    pub name: String,
    pub action: RuleAction,
    pub direction: RuleDirection,
    pub protocol: String,
    #[serde(default)]
    pub src: Option<AddressMatch>,
    #[serde(default)]
    pub dst: Option<AddressMatch>,
    #[serde(default)]
    pub src_ports: Option<PortRange>,
    #[serde(default)]
    pub dst_ports: Option<PortRange>,
    #[serde(default)]
    pub conn_states: Option<Vec<ConnState>>,
    /// Lower is evaluated earlier.
    pub priority: i32,
    #[serde(default)]
    pub overrides_dept: bool,
}

impl FirewallRule {
    /// The synthetic tail rule guaranteeing return traffic for accepted
    /// flows: INOUT, all protocols, established/related, ACCEPT, at the
    /// lowest evaluation priority.
    pub fn default_return_traffic() -> Self {
        Self {
            id: "default-return".to_string(),
            name: "allow established/related return traffic".to_string(),
            action: RuleAction::Accept,
            direction: RuleDirection::InOut,
            protocol: "all".to_string(),
            src: None,
            dst: None,
            src_ports: None,
            dst_ports: None,
            conn_states: Some(vec![ConnState::Established, ConnState::Related]),
            priority: 9999,
            overrides_dept: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serde_uppercase() {
        assert_eq!(serde_json::to_string(&RuleAction::Accept).unwrap(), "\"ACCEPT\"");
        let a: RuleAction = serde_json::from_str("\"REJECT\"").unwrap();
        assert_eq!(a, RuleAction::Reject);
    }

    #[test]
    fn test_direction_serde() {
        assert_eq!(
            serde_json::to_string(&RuleDirection::InOut).unwrap(),
            "\"INOUT\""
        );
    }

    #[test]
    fn test_default_return_rule_shape() {
        let r = FirewallRule::default_return_traffic();
        assert_eq!(r.priority, 9999);
        assert_eq!(r.direction, RuleDirection::InOut);
        assert_eq!(r.protocol, "all");
        assert_eq!(
            r.conn_states.as_deref(),
            Some(&[ConnState::Established, ConnState::Related][..])
        );
        assert_eq!(r.action, RuleAction::Accept);
    }

    #[test]
    fn test_rule_json_field_names() {
        let r = FirewallRule::default_return_traffic();
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"overridesDept\":false"));
        assert!(json.contains("\"connStates\""));
    }
}
