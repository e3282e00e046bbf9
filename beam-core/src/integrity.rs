//! Integrity: whole-payload SHA-256, carried as lower-case hex in file metadata.

use sha2::{Digest, Sha256};

/// Hash a payload. Returns 32-byte digest.
pub fn hash_payload(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Hex form used on the wire.
pub fn checksum_hex(payload: &[u8]) -> String {
    hex::encode(hash_payload(payload))
}

/// Verify payload against an announced hex checksum (either case). Malformed hex never matches.
pub fn verify_payload(payload: &[u8], expected_hex: &str) -> bool {
    match hex::decode(expected_hex.trim()) {
        Ok(expected) => expected.as_slice() == hash_payload(payload).as_slice(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest_of_empty_payload() {
        assert_eq!(
            checksum_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn verify_rejects_tampered() {
        let hex = checksum_hex(b"hello chunk");
        assert!(verify_payload(b"hello chunk", &hex));
        assert!(verify_payload(b"hello chunk", &hex.to_uppercase()));
        assert!(!verify_payload(b"tampered", &hex));
    }

    #[test]
    fn malformed_checksum_never_matches() {
        assert!(!verify_payload(b"", "not hex"));
        assert!(!verify_payload(b"", "e3b0"));
    }
}
