//! Webhook signature verification.
//!
//! GitHub signs each delivery with HMAC-SHA256 over the raw body and
//! sends the hex digest in `X-Hub-Signature-256` as `sha256=<hex>`.
//! Comparison is constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature header is malformed")]
    Malformed,
    #[error("signature does not match the payload")]
    Mismatch,
}

pub fn verify(secret: &str, payload: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let claimed = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::Malformed)?;
    let claimed = hex::decode(claimed).map_err(|_| SignatureError::Malformed)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed)?;
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(claimed.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
