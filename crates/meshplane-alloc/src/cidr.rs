//! CIDR arithmetic for the two allocation domains.
//!
//! Layout of a Global VPN's base CIDR:
//!
//! ```text
//! network ┬ device IPs: offsets 1 .. reserved (or .. broadcast when reserved = 0)
//!         └ cluster blocks: offset reserved + n * 2^(32 - suffix)
//! ```
//!
//! A VPN with no reservation is device-only: the device range covers the
//! whole base CIDR, so no cluster block is ever handed out.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{AllocError, AllocResult};

/// Number of addresses in a block with the given prefix length.
pub fn block_size(prefix_len: u8) -> u64 {
    1u64 << (32 - u32::from(prefix_len.min(32)))
}

fn addr_at(base: Ipv4Net, offset: u64) -> Option<Ipv4Addr> {
    let addr = u64::from(u32::from(base.network())).checked_add(offset)?;
    u32::try_from(addr).ok().map(Ipv4Addr::from)
}

/// The `index`-th device IP as a `/32`, or `None` once the device range is used up.
pub fn device_ip_at(base: Ipv4Net, reserved: u64, index: u64) -> Option<Ipv4Net> {
    let size = block_size(base.prefix_len());
    let broadcast_offset = size.checked_sub(1)?;
    let limit = if reserved == 0 {
        broadcast_offset
    } else {
        reserved.min(broadcast_offset)
    };
    let offset = index.checked_add(1)?;
    if offset >= limit {
        return None;
    }
    Ipv4Net::new(addr_at(base, offset)?, 32).ok()
}

/// The `index`-th cluster block, or `None` once it would leave the base CIDR.
///
/// Always `None` for a device-only layout (`reserved == 0`).
pub fn cluster_cidr_at(base: Ipv4Net, suffix: u8, reserved: u64, index: u64) -> Option<Ipv4Net> {
    if reserved == 0 || suffix < base.prefix_len() || suffix > 32 {
        return None;
    }
    let size = block_size(suffix);
    let offset = index.checked_mul(size)?.checked_add(reserved)?;
    if offset.checked_add(size)? > block_size(base.prefix_len()) {
        return None;
    }
    Ipv4Net::new(addr_at(base, offset)?, suffix).ok()
}

/// Check that a base CIDR, cluster suffix and reserved prefix form a usable layout.
pub fn validate_layout(base: Ipv4Net, suffix: u8, reserved: u64) -> AllocResult<()> {
    if base != base.trunc() {
        return Err(AllocError::InvalidLayout(format!(
            "{base} is not a network address (expected {})",
            base.trunc()
        )));
    }
    if suffix < base.prefix_len() || suffix > 32 {
        return Err(AllocError::InvalidLayout(format!(
            "cluster suffix /{suffix} must lie between /{} and /32",
            base.prefix_len()
        )));
    }
    if reserved >= block_size(base.prefix_len()) {
        return Err(AllocError::InvalidLayout(format!(
            "{reserved} reserved addresses do not fit in {base}"
        )));
    }
    if reserved % block_size(suffix) != 0 {
        return Err(AllocError::InvalidLayout(format!(
            "{reserved} reserved addresses are not a multiple of the /{suffix} block size"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn device_ips_skip_network_address() {
        let base = net("10.0.0.0/16");
        assert_eq!(device_ip_at(base, 256, 0), Some(net("10.0.0.1/32")));
        assert_eq!(device_ip_at(base, 256, 1), Some(net("10.0.0.2/32")));
        assert_eq!(device_ip_at(base, 256, 254), Some(net("10.0.0.255/32")));
        assert_eq!(device_ip_at(base, 256, 255), None);
    }

    #[test]
    fn device_ips_without_reservation_use_whole_cidr() {
        let base = net("10.0.0.0/30");
        assert_eq!(device_ip_at(base, 0, 0), Some(net("10.0.0.1/32")));
        assert_eq!(device_ip_at(base, 0, 1), Some(net("10.0.0.2/32")));
        // 10.0.0.3 is the broadcast address.
        assert_eq!(device_ip_at(base, 0, 2), None);
    }

    #[test]
    fn device_ips_in_tiny_cidrs() {
        assert_eq!(device_ip_at(net("10.0.0.0/32"), 0, 0), None);
        assert_eq!(device_ip_at(net("10.0.0.0/31"), 0, 0), None);
    }

    #[test]
    fn cluster_blocks_start_after_reservation() {
        let base = net("10.0.0.0/16");
        assert_eq!(cluster_cidr_at(base, 24, 256, 0), Some(net("10.0.1.0/24")));
        assert_eq!(cluster_cidr_at(base, 24, 256, 1), Some(net("10.0.2.0/24")));
        assert_eq!(cluster_cidr_at(base, 24, 256, 254), Some(net("10.0.255.0/24")));
        assert_eq!(cluster_cidr_at(base, 24, 256, 255), None);
    }

    #[test]
    fn cluster_blocks_reject_bad_suffix() {
        let base = net("10.0.0.0/16");
        assert_eq!(cluster_cidr_at(base, 8, 0, 0), None);
        assert_eq!(cluster_cidr_at(base, 33, 0, 0), None);
    }

    #[test]
    fn unreserved_layout_has_no_cluster_blocks() {
        let base = net("10.0.0.0/24");
        assert_eq!(cluster_cidr_at(base, 28, 0, 0), None);
        assert_eq!(device_ip_at(base, 0, 252), Some(net("10.0.0.253/32")));
    }

    #[test]
    fn device_range_ends_where_cluster_blocks_begin() {
        let base = net("10.0.0.0/24");
        let first_block = cluster_cidr_at(base, 28, 16, 0).unwrap();
        assert_eq!(first_block, net("10.0.0.16/28"));
        let last_device = device_ip_at(base, 16, 14).unwrap();
        assert_eq!(last_device, net("10.0.0.15/32"));
        assert!(!first_block.contains(&last_device.addr()));
        assert_eq!(device_ip_at(base, 16, 15), None);
    }

    #[test]
    fn layout_validation() {
        assert!(validate_layout(net("100.64.0.0/10"), 24, 65536).is_ok());
        assert!(validate_layout(net("10.0.0.0/30"), 32, 0).is_ok());
        assert!(validate_layout(net("10.0.0.1/16"), 24, 256).is_err());
        assert!(validate_layout(net("10.0.0.0/16"), 12, 256).is_err());
        assert!(validate_layout(net("10.0.0.0/16"), 24, 100).is_err());
        assert!(validate_layout(net("10.0.0.0/24"), 28, 256).is_err());
    }
}
