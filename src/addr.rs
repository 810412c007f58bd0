use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::ScanError;

/// RFC1918 blocks. Loopback, link-local and CGNAT space are deliberately absent.
const PRIVATE_V4: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Parse a dotted-quad IPv4 string, tolerating surrounding whitespace.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, ScanError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ScanError::InvalidAddress(s.to_string()))
}

pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    PRIVATE_V4
        .iter()
        .filter_map(|&(net, prefix)| Ipv4Net::new(net, prefix).ok())
        .any(|net| net.contains(&ip))
}

/// Parse `s` and require it to be inside private address space.
pub fn parse_private_ipv4(s: &str) -> Result<Ipv4Addr, ScanError> {
    let ip = parse_ipv4(s)?;
    if !is_private_ipv4(ip) {
        return Err(ScanError::PublicAddress(ip));
    }
    Ok(ip)
}

/// Big-endian numeric form of an address, used for ordering hosts.
pub fn sort_key(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}
