//! HMAC-SHA256 primitives shared by the provider verifiers.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::verifier::VerifyError;

type HmacSha256 = Hmac<Sha256>;

/// Generates an HMAC-SHA256 signature as a lowercase hex string.
///
/// # Errors
///
/// Returns `VerifyError::InvalidSecret` if the secret key is rejected by
/// the MAC implementation.
pub fn generate_hmac_hex(payload: &[u8], secret: &str) -> Result<String, VerifyError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| VerifyError::InvalidSecret)?;

    mac.update(payload);
    let result = mac.finalize();
    Ok(hex::encode(result.into_bytes()))
}

/// Timing-safe string comparison to prevent timing attacks.
///
/// Constant-time over the shared length so no information about the
/// expected signature leaks through timing analysis.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        result |= a_byte ^ b_byte;
    }

    result == 0
}
