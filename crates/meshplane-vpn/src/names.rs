//! Resource name rules.
//!
//! Store keys join names with `/` and list by prefix, so every account,
//! Global VPN, cluster and device name must be a DNS-1123 label: 1 to 63
//! lowercase alphanumerics or `-`, starting and ending with an alphanumeric.

use crate::error::{VpnError, VpnResult};

const MAX_LABEL_LEN: usize = 63;

/// Suffix of the longest system device name derived from a VPN name.
const LONGEST_SYSTEM_SUFFIX: &str = "-cluster-local";

pub(crate) fn validate_name(kind: &str, name: &str) -> VpnResult<()> {
    if name.is_empty() || name.len() > MAX_LABEL_LEN {
        return Err(VpnError::InvalidConfig(format!(
            "{kind} name {name:?} must be 1 to {MAX_LABEL_LEN} characters"
        )));
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !name.chars().all(valid_char) || name.starts_with('-') || name.ends_with('-') {
        return Err(VpnError::InvalidConfig(format!(
            "{kind} name {name:?} must be lowercase alphanumerics or '-', \
             starting and ending with an alphanumeric"
        )));
    }
    Ok(())
}

/// A VPN name must leave room for the system device names built from it.
pub(crate) fn validate_vpn_name(name: &str) -> VpnResult<()> {
    validate_name("global vpn", name)?;
    if name.len() + LONGEST_SYSTEM_SUFFIX.len() > MAX_LABEL_LEN {
        return Err(VpnError::InvalidConfig(format!(
            "global vpn name {name:?} must be at most {} characters",
            MAX_LABEL_LEN - LONGEST_SYSTEM_SUFFIX.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_labels() {
        let longest = "x".repeat(63);
        for name in ["a", "mesh", "eu-west-1", "0abc", longest.as_str()] {
            assert!(validate_name("cluster", name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_separators_and_malformed_labels() {
        let too_long = "x".repeat(64);
        for name in ["", "m/x", "Mesh", "-a", "a-", "a.b", "a b", too_long.as_str()] {
            let err = validate_name("cluster", name).unwrap_err();
            assert!(matches!(err, VpnError::InvalidConfig(_)), "{name}");
        }
    }

    #[test]
    fn vpn_names_leave_room_for_system_devices() {
        assert!(validate_vpn_name(&"v".repeat(49)).is_ok());
        assert!(validate_vpn_name(&"v".repeat(50)).is_err());
        assert!(validate_vpn_name("m/x").is_err());
    }
}
