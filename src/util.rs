//! # Utility Functions and Helper Module
//!
//! Small helpers shared across the engine: high-precision timestamps used
//! for message stamping and reply deadlines, and the validation rules for
//! bus names and well-known names.
//!
//! ## Key Functionality Categories
//!
//! - **Timestamps**: wall-clock and monotonic nanosecond readings
//! - **Validation**: bus-name and well-known-name syntax checks with
//!   clear error values

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Longest accepted well-known name, in bytes.
pub const NAME_MAX_LEN: usize = 255;

/// Get current timestamp as nanoseconds since Unix epoch
///
/// Provides high-precision timing information stamped into message
/// timestamp items. If the system time is before the Unix epoch (very
/// rare), returns 0 to provide a safe fallback rather than panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Get a monotonic timestamp in nanoseconds.
///
/// Reply deadlines and timeout sweeps compare against this clock, never
/// against wall time, so clock steps cannot fire or starve timeouts.
pub fn monotonic_ns() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Validate a well-known name.
///
/// Names are dot-separated, non-empty labels of `[A-Za-z0-9_-]`, at least
/// two labels, at most [`NAME_MAX_LEN`] bytes. The leading label may not
/// start with a digit.
pub fn validate_well_known_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(Error::InvalidArgument("name length out of bounds"));
    }
    if !name.contains('.') {
        return Err(Error::InvalidArgument("name needs at least two labels"));
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err(Error::InvalidArgument("empty name label"));
        }
        if !label.chars().all(valid_name_char) {
            return Err(Error::InvalidArgument("invalid character in name"));
        }
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(Error::InvalidArgument("name starts with a digit"));
    }
    Ok(())
}

/// Validate a bus name against its creator uid.
///
/// The external name of a bus must begin with `"<uid>-"` where `<uid>` is
/// the creator's user id in decimal, followed by at least one valid name
/// character.
pub fn validate_bus_name(name: &str, creator_uid: u32) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(Error::InvalidArgument("bus name length out of bounds"));
    }
    let prefix = format!("{}-", creator_uid);
    let rest = name
        .strip_prefix(&prefix)
        .ok_or(Error::InvalidArgument("bus name must start with <uid>-"))?;
    if rest.is_empty() || !rest.chars().all(|c| valid_name_char(c) || c == '.') {
        return Err(Error::InvalidArgument("invalid character in bus name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The monotonic clock never moves backwards between readings.
    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    /// Well-known names need two labels and clean characters.
    #[test]
    fn well_known_name_rules() {
        assert!(validate_well_known_name("com.example.Service").is_ok());
        assert!(validate_well_known_name("com").is_err());
        assert!(validate_well_known_name("com..example").is_err());
        assert!(validate_well_known_name("com.exa mple").is_err());
        assert!(validate_well_known_name("8com.example").is_err());
        let long = format!("a.{}", "b".repeat(NAME_MAX_LEN));
        assert!(validate_well_known_name(&long).is_err());
    }

    /// Bus names must carry the decimal creator uid prefix.
    #[test]
    fn bus_name_needs_uid_prefix() {
        assert!(validate_bus_name("1000-system", 1000).is_ok());
        assert!(validate_bus_name("1000-", 1000).is_err());
        assert!(validate_bus_name("1001-system", 1000).is_err());
        assert!(validate_bus_name("system", 1000).is_err());
    }
}
