//! Common helper functions for AGA Live.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum length of a stream or user identifier.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Checks that a stream/user/connection identifier is safe to route on.
pub fn is_valid_identifier(value: &str) -> bool {
    let len = value.len();
    if !(1..=MAX_IDENTIFIER_LEN).contains(&len) {
        return false;
    }
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Reads and parses an environment variable. Unset or blank means `default`,
/// anything unparsable is a [`Error::Config`].
pub fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map_err(|e| Error::config(name, format!("{value:?}: {e}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_accepts_uuid_and_object_ids() {
        assert!(is_valid_identifier("3f1d8d2e-5d3b-4b8a-9c1e-2b7f9a0c4d11"));
        assert!(is_valid_identifier("65a1f0c2e4b0a1b2c3d4e5f6"));
        assert!(is_valid_identifier("stream.live:1"));
    }

    #[test]
    fn test_identifier_rejects_empty_and_oversized() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)));
        assert!(is_valid_identifier(&"a".repeat(MAX_IDENTIFIER_LEN)));
    }

    #[test]
    fn test_identifier_rejects_separators_and_whitespace() {
        assert!(!is_valid_identifier("room/1"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("émoji"));
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("AGA_TEST_UNSET_VARIABLE_FOR_PARSE", 42u64).unwrap(), 42);
        assert!(!env_bool("AGA_TEST_UNSET_VARIABLE_FOR_BOOL", false));
    }

    #[test]
    fn test_env_parse_rejects_malformed_values() {
        std::env::set_var("AGA_TEST_MALFORMED_FOR_PARSE", "ten");
        let err = env_parse("AGA_TEST_MALFORMED_FOR_PARSE", 1u32).unwrap_err();
        assert!(matches!(&err, Error::Config { name, .. } if name == "AGA_TEST_MALFORMED_FOR_PARSE"));
        assert!(err.to_string().contains("\"ten\""));

        std::env::set_var("AGA_TEST_MALFORMED_FOR_PARSE", " 7 ");
        assert_eq!(env_parse("AGA_TEST_MALFORMED_FOR_PARSE", 1u32).unwrap(), 7);
        std::env::remove_var("AGA_TEST_MALFORMED_FOR_PARSE");
    }
}
