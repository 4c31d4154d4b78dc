//! HMAC signature helpers shared by the provider adapters.
//!
//! Each provider wraps HMAC-SHA256 differently (hex digest, base64 digest,
//! or Stripe's timestamped `v1=` elements); the primitives live here so every
//! adapter compares signatures the same constant-time way.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `payload` under `secret`, lowercase hex.
pub fn hmac_sha256_hex(payload: &[u8], secret: &str) -> String {
    hex::encode(hmac_sha256(payload, secret))
}

/// HMAC-SHA256 of `payload` under `secret`, standard base64.
pub fn hmac_sha256_base64(payload: &[u8], secret: &str) -> String {
    BASE64.encode(hmac_sha256(payload, secret))
}

fn hmac_sha256(payload: &[u8], secret: &str) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time string comparison.
///
/// Avoids leaking the expected signature through timing analysis. Length
/// differences short-circuit, which is fine because digest lengths are
/// public.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.as_bytes().iter().zip(b.as_bytes()) {
        result |= a_byte ^ b_byte;
    }

    result == 0
}
