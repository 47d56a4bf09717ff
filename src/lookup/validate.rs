//! Local address validation.
//!
//! Only syntax and range are checked here. Anything that passes is left to
//! the upstream service to geolocate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::types::ValidationError;

/// Check that `host` is a globally routable IP address.
pub fn validate(host: &str) -> Result<IpAddr, ValidationError> {
    let addr: IpAddr = host
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidAddress)?;

    if is_global(&addr) {
        Ok(addr)
    } else {
        Err(ValidationError::PrivateRange)
    }
}

/// Loose equality for hosts echoed back by the upstream service: addresses are
/// compared after parsing so `::1` and `0:0:0:0:0:0:0:1` match.
pub fn same_host(a: &str, b: &str) -> bool {
    match (a.trim().parse::<IpAddr>(), b.trim().parse::<IpAddr>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.trim() == b.trim(),
    }
}

pub fn is_global(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        // "this network" 0.0.0.0/8
        || a == 0
        // shared address space 100.64.0.0/10
        || (a == 100 && (b & 0b1100_0000) == 0b0100_0000)
        // IETF protocol assignments 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // benchmarking 198.18.0.0/15
        || (a == 198 && (b & 0xfe) == 18)
        // reserved 240.0.0.0/4
        || a >= 240)
}

fn is_global_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_global_v4(&v4);
    }
    let seg = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // unique local fc00::/7
        || (seg[0] & 0xfe00) == 0xfc00
        // link local fe80::/10
        || (seg[0] & 0xffc0) == 0xfe80
        // deprecated site local fec0::/10
        || (seg[0] & 0xffc0) == 0xfec0
        // documentation 2001:db8::/32
        || (seg[0] == 0x2001 && seg[1] == 0x0db8)
        // discard-only 100::/64
        || (seg[0] == 0x0100 && seg[1] == 0 && seg[2] == 0 && seg[3] == 0)
        // local-use translation 64:ff9b:1::/48
        || (seg[0] == 0x0064 && seg[1] == 0xff9b && seg[2] == 0x0001))
}
