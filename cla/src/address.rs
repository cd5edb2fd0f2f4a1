//! CLA address helpers.
//!
//! A CLA address is `"<scheme>://<connect-address>"`; the scheme names the
//! transport and the connect address is whatever that transport dials.

use crate::ClaError;

/// Build a CLA address from a scheme and a connect address.
pub fn make_cla_addr(scheme: &str, connect_addr: &str) -> String {
    format!("{}://{}", scheme, connect_addr)
}

/// Split a CLA address into its scheme and connect address.
pub fn split_cla_addr(cla_addr: &str) -> Result<(&str, &str), ClaError> {
    cla_addr
        .split_once("://")
        .filter(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty())
        .ok_or_else(|| ClaError::Address(cla_addr.to_string()))
}

/// Strip the scheme, returning only the connect address.
pub fn connect_addr(cla_addr: &str) -> Result<&str, ClaError> {
    split_cla_addr(cla_addr).map(|(_, rest)| rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let addr = make_cla_addr("mtcp", "10.0.0.7:4556");
        assert_eq!(addr, "mtcp://10.0.0.7:4556");
        assert_eq!(split_cla_addr(&addr).unwrap(), ("mtcp", "10.0.0.7:4556"));
        assert_eq!(connect_addr(&addr).unwrap(), "10.0.0.7:4556");
    }

    #[test]
    fn test_malformed_addresses() {
        for bad in ["", "mtcp", "://peer", "mtcp://", "mtcp:peer"] {
            assert!(split_cla_addr(bad).is_err(), "{:?}", bad);
        }
    }
}
