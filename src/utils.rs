//! Utility functions for hex validation and formatting.

use anyhow::{Context, Result};

use crate::types::HASH_SIZE;

fn is_valid_hex_string(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}

fn strip_hex_prefix(input: &str) -> &str {
    input
        .trim()
        .strip_prefix("0x")
        .or_else(|| input.trim().strip_prefix("0X"))
        .unwrap_or_else(|| input.trim())
}

/// Validates and strips hex prefix from a string.
///
/// # Arguments
///
/// * `input` - The hex string to validate (may include "0x" or "0X" prefix)
/// * `expected_len` - Expected length of the hex string after stripping prefix
///
/// # Errors
/// Returns an error if:
/// - The hex string has incorrect length
/// - The hex string contains non-hex characters
///
/// # Examples
///
/// ```
/// use rln_membership_sync::utils::validate_and_strip_hex;
///
/// let result = validate_and_strip_hex("0x1234abcd", 8).unwrap();
/// assert_eq!(result, "1234abcd");
/// ```
pub fn validate_and_strip_hex(input: &str, expected_len: usize) -> Result<String> {
    let stripped = strip_hex_prefix(input);

    if stripped.len() != expected_len {
        return Err(anyhow::anyhow!(
            "Invalid hex string: must be {} characters (got {})",
            expected_len,
            stripped.len()
        ));
    }

    if !is_valid_hex_string(stripped) {
        return Err(anyhow::anyhow!(
            "Invalid hex string: contains non-hex characters"
        ));
    }

    Ok(stripped.to_string())
}

/// Parses a 32-byte value written as 64 hex characters (prefix optional).
///
/// # Examples
///
/// ```
/// use rln_membership_sync::utils::parse_bytes32;
///
/// let value = parse_bytes32(&format!("0x{}", "ab".repeat(32))).unwrap();
/// assert_eq!(value, [0xab; 32]);
/// ```
pub fn parse_bytes32(input: &str) -> Result<[u8; HASH_SIZE]> {
    let stripped = validate_and_strip_hex(input, HASH_SIZE * 2)?;
    let bytes = hex::decode(stripped).context("Failed to decode 32-byte value from hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Decoded value must be {} bytes", HASH_SIZE))
}

/// Serde adapter storing `[u8; 32]` fields as lowercase hex strings.
pub mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::HASH_SIZE;

    pub fn serialize<S: Serializer>(bytes: &[u8; HASH_SIZE], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; HASH_SIZE], D::Error> {
        let value = String::deserialize(deserializer)?;
        super::parse_bytes32(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_and_strip_hex_valid() {
        let result = validate_and_strip_hex("0x1234abcd", 8);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "1234abcd");
    }

    #[test]
    fn test_validate_and_strip_hex_uppercase_prefix() {
        let result = validate_and_strip_hex("0X1234ABCD", 8);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "1234ABCD");
    }

    #[test]
    fn test_validate_and_strip_hex_with_whitespace() {
        let result = validate_and_strip_hex("  0x1234abcd  ", 8);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "1234abcd");
    }

    #[test]
    fn test_validate_and_strip_hex_wrong_length() {
        let result = validate_and_strip_hex("0x1234abcd", 10);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("must be 10 characters"));
    }

    #[test]
    fn test_validate_and_strip_hex_invalid_characters() {
        let result = validate_and_strip_hex("0x1234xyzw", 8);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("non-hex characters"));
    }

    #[test]
    fn test_parse_bytes32_roundtrip_with_hex_encode() {
        let value = [0x5au8; HASH_SIZE];
        let parsed = parse_bytes32(&hex::encode(value)).unwrap();
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_parse_bytes32_rejects_short_input() {
        assert!(parse_bytes32("0xabcd").is_err());
    }
}
