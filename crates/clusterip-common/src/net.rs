//! IPv4 address validation

use std::net::Ipv4Addr;

/// Parse an IPv4 dotted-quad literal, ignoring surrounding spaces.
///
/// Octets with leading zeros are rejected, so `"01.2.3.4"` is not accepted.
pub fn parse_ipv4(value: &str) -> Option<Ipv4Addr> {
    value.trim_matches(' ').parse::<Ipv4Addr>().ok()
}

/// Check whether `value` is a valid IPv4 literal (after trimming spaces)
pub fn is_valid_ipv4(value: &str) -> bool {
    parse_ipv4(value).is_some()
}
