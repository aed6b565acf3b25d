//! Signature assembly from raw engine output and local verification.

use ed25519_dalek::Verifier;
use k256::ecdsa::signature::hazmat::PrehashVerifier;

use crate::error::{CoordinatorError, Result};
use crate::types::{KeyFamily, KeysignResponse};

/// Builds a keysign response from the raw signature bytes returned by the engine.
///
/// ECDSA output is `r || s || recovery_id` (65 bytes), EdDSA output is `R || S`
/// (64 bytes).
pub fn build_response(family: KeyFamily, message_hex: &str, raw: &[u8]) -> Result<KeysignResponse> {
    match family {
        KeyFamily::Ecdsa => {
            if raw.len() != 65 {
                return Err(CoordinatorError::Engine(format!(
                    "ECDSA signature must be 65 bytes, got {}",
                    raw.len()
                )));
            }
            let sig = k256::ecdsa::Signature::from_slice(&raw[..64])
                .map_err(|e| CoordinatorError::Engine(format!("Invalid ECDSA signature: {e}")))?;
            Ok(KeysignResponse {
                msg: message_hex.to_string(),
                r: hex::encode(&raw[..32]),
                s: hex::encode(&raw[32..64]),
                der_signature: hex::encode(sig.to_der().as_bytes()),
                recovery_id: hex::encode(&raw[64..]),
            })
        }
        KeyFamily::Eddsa => {
            if raw.len() != 64 {
                return Err(CoordinatorError::Engine(format!(
                    "EdDSA signature must be 64 bytes, got {}",
                    raw.len()
                )));
            }
            Ok(KeysignResponse {
                msg: message_hex.to_string(),
                r: hex::encode(&raw[..32]),
                s: hex::encode(&raw[32..]),
                der_signature: hex::encode(raw),
                recovery_id: String::new(),
            })
        }
    }
}

/// Verify an ECDSA (secp256k1) signature over a prehashed message.
pub fn verify_ecdsa(pubkey_hex: &str, digest: &[u8], r_hex: &str, s_hex: &str) -> Result<()> {
    let pubkey = hex::decode(pubkey_hex)?;
    let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&pubkey)
        .map_err(|e| CoordinatorError::Crypto(format!("Invalid public key: {e}")))?;

    let mut rs = hex::decode(r_hex)?;
    rs.extend(hex::decode(s_hex)?);
    let sig = k256::ecdsa::Signature::from_slice(&rs)
        .map_err(|e| CoordinatorError::Crypto(format!("Invalid signature format: {e}")))?;

    key.verify_prehash(digest, &sig)
        .map_err(|e| CoordinatorError::Crypto(format!("Signature verification failed: {e}")))
}

/// Verify an Ed25519 signature over the raw message.
pub fn verify_eddsa(pubkey_hex: &str, message: &[u8], r_hex: &str, s_hex: &str) -> Result<()> {
    let pubkey: [u8; 32] = hex::decode(pubkey_hex)?
        .try_into()
        .map_err(|_| CoordinatorError::Crypto("EdDSA public key must be 32 bytes".into()))?;
    let key = ed25519_dalek::VerifyingKey::from_bytes(&pubkey)
        .map_err(|e| CoordinatorError::Crypto(format!("Invalid public key: {e}")))?;

    let mut sig_bytes = hex::decode(r_hex)?;
    sig_bytes.extend(hex::decode(s_hex)?);
    let signature = ed25519_dalek::Signature::from_slice(&sig_bytes)
        .map_err(|e| CoordinatorError::Crypto(format!("Invalid signature format: {e}")))?;

    key.verify(message, &signature)
        .map_err(|e| CoordinatorError::Crypto(format!("Signature verification failed: {e}")))
}
