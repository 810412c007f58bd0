use std::collections::BTreeSet;

pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = 65535;

/// Expand a port specification into a sorted, deduplicated list of TCP ports.
///
/// Supported tokens, comma separated:
/// - single port number: `80`
/// - inclusive range in either order: `1000-1010`, `500-100`
///
/// Range ends are clamped into `1..=65535`. Malformed tokens and out-of-range
/// single ports are dropped. An absent or blank spec, or one where nothing
/// survives parsing, means every port.
pub fn parse_port_spec(spec: Option<&str>) -> Vec<u16> {
    let Some(spec) = spec.map(str::trim).filter(|s| !s.is_empty()) else {
        return all_ports();
    };

    let mut out = BTreeSet::new();
    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some((a, b)) = token.split_once('-') {
            let (Some(a), Some(b)) = (parse_bound(a), parse_bound(b)) else {
                continue;
            };
            let (lo, hi) = (clamp_port(a.min(b)), clamp_port(a.max(b)));
            out.extend(lo..=hi);
            continue;
        }

        if let Some(p) = parse_bound(token) {
            if (i64::from(MIN_PORT)..=i64::from(MAX_PORT)).contains(&p) {
                out.insert(p as u16);
            }
        }
    }

    if out.is_empty() {
        return all_ports();
    }
    out.into_iter().collect()
}

/// `1..=65535`.
pub fn all_ports() -> Vec<u16> {
    (MIN_PORT..=MAX_PORT).collect()
}

/// Integer overflow saturates; anything that is not a number is `None`.
fn parse_bound(s: &str) -> Option<i64> {
    let s = s.trim();
    match s.parse::<i64>() {
        Ok(v) => Some(v),
        Err(_) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => Some(i64::MAX),
        Err(_) => None,
    }
}

fn clamp_port(v: i64) -> u16 {
    v.clamp(i64::from(MIN_PORT), i64::from(MAX_PORT)) as u16
}
