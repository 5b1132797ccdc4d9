//! Custom filters for configuration templates
//!
//! - `default`: Provide fallback for undefined values
//! - `required`: Fail if value is undefined
//! - `ip_literal`: Bracket IPv6 addresses so they can be followed by `:port`

use std::net::IpAddr;

use minijinja::{Error, ErrorKind, Value};

/// Default filter - returns fallback if value is undefined or none
///
/// Usage: `{{ value | default("fallback") }}`
pub fn default_filter(value: Value, fallback: Value) -> Value {
    if value.is_undefined() || value.is_none() {
        fallback
    } else {
        value
    }
}

/// Required filter - fails if value is undefined
///
/// Usage: `{{ value | required }}`
pub fn required(value: Value) -> Result<Value, Error> {
    if value.is_undefined() {
        Err(Error::new(
            ErrorKind::UndefinedError,
            "required value is undefined",
        ))
    } else {
        Ok(value)
    }
}

/// IP literal filter - wraps IPv6 addresses in brackets
///
/// Hostnames and IPv4 addresses are returned unchanged, as are IPv6
/// addresses that are already bracketed.
///
/// Usage: `{{ server.address | ip_literal }}:{{ port }}`
pub fn ip_literal(value: &str) -> String {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V6(addr)) => format!("[{}]", addr),
        _ => value.to_string(),
    }
}
