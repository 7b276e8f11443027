//! Shared byte-encoding helpers for the three id flavors this crate mints:
//! exprId (`expr:…`), DisplayID (`opal:…`), and transport id (`transport:…`).
//!
//! All three follow the same shape: hash some canonical bytes, truncate,
//! base64url-encode, prefix. Centralizing that avoids three slightly
//! different encodings drifting apart.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// `SHA256(bytes)`, truncated to `len` bytes, base64url-encoded (no padding).
#[must_use]
pub fn sha256_b64url(bytes: &[u8], len: usize) -> String {
    let digest = Sha256::digest(bytes);
    URL_SAFE_NO_PAD.encode(&digest[..len.min(digest.len())])
}

/// `HMAC-SHA256(key, bytes)`, truncated to `len` bytes, base64url-encoded.
///
/// Falls back to a plain `SHA256` digest when `key` is empty, matching
/// spec.md §4.6 step 2/3 for transport id derivation ("If `planKey` is
/// non-empty: HMAC… Else: SHA256…").
#[must_use]
pub fn keyed_digest_b64url(key: &[u8], bytes: &[u8], len: usize) -> String {
    if key.is_empty() {
        return sha256_b64url(bytes, len);
    }
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(bytes);
    let digest = mac.finalize().into_bytes();
    URL_SAFE_NO_PAD.encode(&digest[..len.min(digest.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_output() {
        let a = keyed_digest_b64url(b"key", b"data", 16);
        let b = keyed_digest_b64url(b"key", b"data", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn different_key_different_output() {
        let a = keyed_digest_b64url(b"key1", b"data", 16);
        let b = keyed_digest_b64url(b"key2", b"data", 16);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_key_falls_back_to_plain_sha256() {
        let hmac_empty = keyed_digest_b64url(b"", b"data", 16);
        let plain = sha256_b64url(b"data", 16);
        assert_eq!(hmac_empty, plain);
    }
}
