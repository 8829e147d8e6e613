//! Webhook signature verification (HMAC-SHA256).
//!
//! The platform signs each delivery with a shared secret and puts the
//! signature in the `X-Hub-Signature-256` header as `sha256=<hex>`.
//! Verification happens before any parsing or queue work.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses a `sha256=<hex>` header value into raw bytes. Returns `None` for
/// malformed headers; never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 of a payload. Used by tests to build valid
/// deliveries.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a raw signature as a `sha256=<hex>` header value.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a delivery against the shared secret using a constant-time
/// comparison.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_verifies() {
        let payload = b"{\"action\":\"opened\"}";
        let secret = b"shhh";
        let header = format_signature_header(&compute_signature(payload, secret));
        assert!(verify_signature(payload, &header, secret));
    }

    #[test]
    fn wrong_secret_rejected() {
        let payload = b"payload";
        let header = format_signature_header(&compute_signature(payload, b"right"));
        assert!(!verify_signature(payload, &header, b"wrong"));
    }

    #[test]
    fn tampered_payload_rejected() {
        let header = format_signature_header(&compute_signature(b"original", b"secret"));
        assert!(!verify_signature(b"modified", &header, b"secret"));
    }

    #[test]
    fn malformed_headers_rejected() {
        for header in ["", "sha256=", "sha256=zz", "sha1=abcd12", "abcd12"] {
            assert!(
                !verify_signature(b"payload", header, b"secret"),
                "header {header:?} should not verify"
            );
        }
    }

    #[test]
    fn wrong_algorithm_prefix_not_parsed() {
        assert!(parse_signature_header("sha1=abcd1234").is_none());
        assert_eq!(
            parse_signature_header("sha256=abcd1234"),
            Some(vec![0xab, 0xcd, 0x12, 0x34])
        );
    }

    proptest! {
        #[test]
        fn sign_then_verify_always_succeeds(payload: Vec<u8>, secret: Vec<u8>) {
            let header = format_signature_header(&compute_signature(&payload, &secret));
            prop_assert!(verify_signature(&payload, &header, &secret));
        }

        #[test]
        fn different_secret_always_fails(payload: Vec<u8>, s1: Vec<u8>, s2: Vec<u8>) {
            prop_assume!(s1 != s2);
            let header = format_signature_header(&compute_signature(&payload, &s1));
            prop_assert!(!verify_signature(&payload, &header, &s2));
        }

        #[test]
        fn arbitrary_header_never_panics(header: String, payload: Vec<u8>, secret: Vec<u8>) {
            let _ = parse_signature_header(&header);
            let _ = verify_signature(&payload, &header, &secret);
        }
    }
}
