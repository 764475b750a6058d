//! Utility functions for the wearable-ble crate.

/// Format bytes as space separated upper-case hex.
///
/// # Example
///
/// ```
/// use wearable_ble::to_hex_string;
///
/// assert_eq!(to_hex_string(&[0x01, 0xAB, 0x0F]), "01 AB 0F");
/// ```
pub fn to_hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse hex byte tokens separated by whitespace or commas.
///
/// Each token may carry a `0x` prefix. Returns `None` if any token is not a
/// one or two digit hex number.
///
/// # Example
///
/// ```
/// use wearable_ble::parse_hex_bytes;
///
/// assert_eq!(parse_hex_bytes("0x01 ab,F"), Some(vec![0x01, 0xAB, 0x0F]));
/// assert_eq!(parse_hex_bytes("zz"), None);
/// ```
pub fn parse_hex_bytes(input: &str) -> Option<Vec<u8>> {
    input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            if digits.is_empty() || digits.len() > 2 {
                return None;
            }
            u8::from_str_radix(digits, 16).ok()
        })
        .collect()
}
