//! Shared data types: vault records, key shares, keygen and keysign requests.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};

/// Curve family a round or message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFamily {
    Ecdsa,
    Eddsa,
}

impl KeyFamily {
    pub fn label(&self) -> &'static str {
        match self {
            KeyFamily::Ecdsa => "ecdsa",
            KeyFamily::Eddsa => "eddsa",
        }
    }
}

/// Threshold library that produced the key shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibType {
    Gg20,
    Dkls,
}

/// One party's share of a key, keyed by the group public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    /// Hex-encoded group public key.
    pub public_key: String,
    /// Base64-encoded opaque key-share blob.
    pub keyshare: String,
}

/// A wallet produced by keygen. Read-only once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub name: String,
    pub public_key_ecdsa: String,
    pub public_key_eddsa: String,
    pub hex_chain_code: String,
    pub signers: Vec<String>,
    pub local_party_id: String,
    pub key_shares: Vec<KeyShare>,
    pub lib_type: LibType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reshare_prefix: Option<String>,
}

impl Vault {
    pub fn public_key(&self, family: KeyFamily) -> &str {
        match family {
            KeyFamily::Ecdsa => &self.public_key_ecdsa,
            KeyFamily::Eddsa => &self.public_key_eddsa,
        }
    }
}

/// Request to create a new vault through distributed key generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeygenRequest {
    pub name: String,
    pub session_id: String,
    /// Hex-encoded 32-byte AES key shared by the committee for this session.
    pub hex_encryption_key: String,
    pub local_party_id: String,
    /// Password the persisted vault is encrypted with.
    pub encryption_password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub plugin_id: String,
}

impl KeygenRequest {
    pub fn validate(&self) -> Result<()> {
        require("name", &self.name)?;
        require("session_id", &self.session_id)?;
        require("hex_encryption_key", &self.hex_encryption_key)?;
        require("local_party_id", &self.local_party_id)?;
        require("encryption_password", &self.encryption_password)?;
        Ok(())
    }
}

/// A single message to be signed in a keysign session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignMessage {
    /// Hex-encoded bytes to sign: a 32-byte digest for ECDSA, the raw message for EdDSA.
    pub message: String,
    /// Caller-side identifier of the message, used as the result key.
    pub hash: String,
    pub family: KeyFamily,
}

impl KeysignMessage {
    pub fn message_bytes(&self) -> Result<Vec<u8>> {
        Ok(hex::decode(&self.message)?)
    }

    /// Relay scope isolating this message's round from concurrent rounds in the same session.
    pub fn scope(&self) -> Result<String> {
        Ok(blake3::hash(&self.message_bytes()?).to_hex().to_string())
    }
}

/// Request to sign one or more messages with an existing vault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysignRequest {
    /// ECDSA public key identifying the vault.
    pub public_key: String,
    pub messages: Vec<KeysignMessage>,
    pub session_id: String,
    pub hex_encryption_key: String,
    /// BIP32-style derivation path for ECDSA child keys, e.g. `m/44'/60'/0'/0/0`.
    #[serde(default)]
    pub derive_path: String,
    #[serde(default)]
    pub plugin_id: String,
}

impl KeysignRequest {
    pub fn validate(&self) -> Result<()> {
        require("public_key", &self.public_key)?;
        require("session_id", &self.session_id)?;
        require("hex_encryption_key", &self.hex_encryption_key)?;
        if self.messages.is_empty() {
            return Err(CoordinatorError::Validation("no messages to sign".into()));
        }

        let mut hashes = HashSet::new();
        // rounds are scoped by message bytes, so one body may only be signed once
        let mut bodies = HashSet::new();
        for msg in &self.messages {
            require("message", &msg.message)?;
            require("hash", &msg.hash)?;
            if !hashes.insert(msg.hash.as_str()) {
                return Err(CoordinatorError::Validation(format!(
                    "duplicate message hash {}",
                    msg.hash
                )));
            }
            let body = msg.message_bytes().map_err(|_| {
                CoordinatorError::Validation(format!("message {} is not hex", msg.hash))
            })?;
            if !bodies.insert(body) {
                return Err(CoordinatorError::Validation(format!(
                    "message {} repeats an earlier message body",
                    msg.hash
                )));
            }
        }
        Ok(())
    }
}

/// Signature produced for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub msg: String,
    pub r: String,
    pub s: String,
    pub der_signature: String,
    /// Empty for EdDSA.
    pub recovery_id: String,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoordinatorError::Validation(format!("{field} is required")));
    }
    Ok(())
}
