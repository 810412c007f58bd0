use netdesk_probe::addr::{parse_private_ipv4, sort_key};
use netdesk_probe::error::ScanError;
use std::net::Ipv4Addr;

#[test]
fn private_target_accepted() {
    assert_eq!(parse_private_ipv4("10.0.0.5"), Ok(Ipv4Addr::new(10, 0, 0, 5)));
    assert_eq!(parse_private_ipv4("172.20.1.1"), Ok(Ipv4Addr::new(172, 20, 1, 1)));
}

#[test]
fn public_target_rejected() {
    assert_eq!(
        parse_private_ipv4("8.8.8.8"),
        Err(ScanError::PublicAddress(Ipv4Addr::new(8, 8, 8, 8)))
    );
}

#[test]
fn malformed_target_rejected() {
    assert!(matches!(parse_private_ipv4("10.0.0.500"), Err(ScanError::InvalidAddress(_))));
}

#[test]
fn sort_key_orders_numerically_not_lexically() {
    let a = sort_key(Ipv4Addr::new(192, 168, 1, 9));
    let b = sort_key(Ipv4Addr::new(192, 168, 1, 10));
    assert!(a < b);
}
