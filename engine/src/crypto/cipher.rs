use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CoordinatorError, Result};

const NONCE_LEN: usize = 12;

/// Encrypts with AES-256-GCM. Output layout: nonce || ciphertext.
pub fn encrypt_gcm(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CoordinatorError::Crypto(format!("Encryption failed: {e:?}")))?;

    let mut sealed = nonce_bytes.to_vec();
    sealed.extend(ciphertext);
    Ok(sealed)
}

/// Reverses [`encrypt_gcm`].
pub fn decrypt_gcm(sealed: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(CoordinatorError::Crypto("Invalid sealed data".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    cipher(key)?
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CoordinatorError::Crypto(format!("Decryption failed: {e:?}")))
}

/// Encrypts a protocol message with the session key and encodes it for the relay.
pub fn encrypt_encode(plaintext: &[u8], hex_key: &str) -> Result<String> {
    let key = session_key(hex_key)?;
    Ok(STANDARD.encode(encrypt_gcm(plaintext, &key)?))
}

/// Decodes and decrypts a relay payload with the session key.
pub fn decode_decrypt(encoded: &str, hex_key: &str) -> Result<Vec<u8>> {
    let key = session_key(hex_key)?;
    let sealed = STANDARD.decode(encoded.trim())?;
    decrypt_gcm(&sealed, &key)
}

/// Encrypts with a key derived from a password (SHA-256 of the password).
pub fn encrypt_with_password(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    encrypt_gcm(plaintext, password_key(password).as_ref())
}

pub fn decrypt_with_password(sealed: &[u8], password: &str) -> Result<Vec<u8>> {
    decrypt_gcm(sealed, password_key(password).as_ref())
}

fn session_key(hex_key: &str) -> Result<Zeroizing<Vec<u8>>> {
    let key = Zeroizing::new(
        hex::decode(hex_key.trim())
            .map_err(|e| CoordinatorError::Crypto(format!("Invalid session key: {e}")))?,
    );
    if key.len() != 32 {
        return Err(CoordinatorError::Crypto(format!(
            "Session key must be 32 bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

fn password_key(password: &str) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(Sha256::digest(password.as_bytes()).into())
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != 32 {
        return Err(CoordinatorError::Crypto("AES-256 key must be 32 bytes".into()));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}
