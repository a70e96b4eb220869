//! SHA-256 integrity digests over wire payloads.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Joins payloads when computing a batch digest.
pub const BATCH_DELIMITER: &str = "\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChecksumError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("malformed checksum: {0}")]
    Malformed(String),
}

/// Lowercase hex SHA-256 of the payload's UTF-8 bytes.
#[must_use]
pub fn compute(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

pub fn verify(payload: &str, expected: &str) -> Result<(), ChecksumError> {
    let expected = normalize(expected)?;
    let actual = compute(payload);
    if actual != expected {
        return Err(ChecksumError::Mismatch { expected, actual });
    }
    Ok(())
}

#[must_use]
pub fn is_valid(payload: &str, expected: &str) -> bool {
    verify(payload, expected).is_ok()
}

/// Digest over every payload of a transmission batch, in order.
#[must_use]
pub fn compute_batch<'a, I>(payloads: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for (i, payload) in payloads.into_iter().enumerate() {
        if i > 0 {
            hasher.update(BATCH_DELIMITER.as_bytes());
        }
        hasher.update(payload.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn verify_batch<'a, I>(payloads: I, expected: &str) -> Result<(), ChecksumError>
where
    I: IntoIterator<Item = &'a str>,
{
    let expected = normalize(expected)?;
    let actual = compute_batch(payloads);
    if actual != expected {
        return Err(ChecksumError::Mismatch { expected, actual });
    }
    Ok(())
}

fn normalize(checksum: &str) -> Result<String, ChecksumError> {
    let trimmed = checksum.trim();
    let decoded = hex::decode(trimmed).map_err(|e| ChecksumError::Malformed(e.to_string()))?;
    if decoded.len() != 32 {
        return Err(ChecksumError::Malformed(format!(
            "expected 32 bytes, got {}",
            decoded.len()
        )));
    }
    Ok(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(
            compute("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn untouched_payload_validates() {
        let payload = r#"{"orderId":"o-1","status":"VOID"}"#;
        let sum = compute(payload);
        assert!(is_valid(payload, &sum));
        assert!(is_valid(payload, &sum.to_ascii_uppercase()));
    }

    #[test]
    fn single_byte_change_fails() {
        let payload = r#"{"orderId":"o-1","status":"VOID"}"#;
        let sum = compute(payload);

        let mut bytes = payload.as_bytes().to_vec();
        for i in 0..bytes.len() {
            let original = bytes[i];
            bytes[i] = original ^ 0x01;
            let tampered = String::from_utf8_lossy(&bytes).into_owned();
            assert!(!is_valid(&tampered, &sum), "flip at {i} went undetected");
            bytes[i] = original;
        }
    }

    #[test]
    fn malformed_checksum_is_not_a_mismatch() {
        assert!(matches!(verify("x", "zz"), Err(ChecksumError::Malformed(_))));
        assert!(matches!(verify("x", "abcd"), Err(ChecksumError::Malformed(_))));
    }

    #[test]
    fn batch_checksum_depends_on_order_and_boundaries() {
        let a = compute_batch(["one", "two"]);
        assert_ne!(a, compute_batch(["two", "one"]));
        assert_ne!(a, compute_batch(["onetwo"]));
        assert_eq!(a, compute("one\ntwo"));
        assert!(verify_batch(["one", "two"], &a).is_ok());
        assert!(verify_batch(["one", "tw0"], &a).is_err());
    }
}
