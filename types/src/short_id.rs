use anyhow::{Result, bail};

const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Encodes a sequence counter value as a compact base-62 string.
///
/// Most significant digit first, no padding. Any value below 62^10 fits in
/// ten characters, which covers every realistic counter.
pub fn encode_short_id(seq: u64) -> String {
    if seq == 0 {
        return "0".into();
    }
    let mut digits = vec![];
    let mut remaining = seq;
    while remaining > 0 {
        digits.push(ALPHABET[(remaining % 62) as usize]);
        remaining /= 62;
    }
    digits.reverse();
    String::from_utf8(digits).expect("alphabet is ascii")
}

/// Decodes a base-62 short id back to the counter value that produced it.
pub fn decode_short_id(short_id: &str) -> Result<u64> {
    if short_id.is_empty() {
        bail!("empty short id");
    }
    let mut value: u64 = 0;
    for byte in short_id.bytes() {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'z' => byte - b'a' + 10,
            b'A'..=b'Z' => byte - b'A' + 36,
            other => bail!("invalid short id character {:?}", other as char),
        };
        value = value
            .checked_mul(62)
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or_else(|| anyhow::anyhow!("short id {short_id} overflows u64"))?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero() {
        assert_eq!(encode_short_id(0), "0");
        assert_eq!(decode_short_id("0").unwrap(), 0);
    }

    #[test]
    fn test_successor_ordering() {
        assert_eq!(encode_short_id(1), "1");
        assert_eq!(encode_short_id(61), "Z");
        assert_eq!(encode_short_id(62), "10");
        assert_eq!(decode_short_id("10").unwrap(), 62);
    }

    #[test]
    fn test_round_trip_large() {
        for seq in [63, 3843, 1_000_000, u64::MAX] {
            assert_eq!(decode_short_id(&encode_short_id(seq)).unwrap(), seq);
        }
    }

    #[test]
    fn test_bounded_length() {
        // ten characters cover any counter a namespace can realistically reach
        assert!(encode_short_id(62u64.pow(10) - 1).len() <= 10);
        assert!(encode_short_id(u64::MAX).len() <= 11);
    }

    #[test]
    fn test_invalid_characters() {
        assert!(decode_short_id("abc-def").is_err());
        assert!(decode_short_id("").is_err());
    }
}
