//! Vault persistence contract and the versioned, encrypted vault container.

pub mod backend;
pub mod local_state;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::crypto::cipher::{decrypt_with_password, encrypt_with_password};
use crate::error::{CoordinatorError, Result};
use crate::types::Vault;

pub use local_state::{LocalStateAccessor, MemoryLocalState, VaultLocalState};

pub const VAULT_CONTAINER_VERSION: u32 = 1;

/// Narrow storage contract. The blob is opaque to the backend.
#[async_trait]
pub trait VaultStorage: Send + Sync {
    async fn get_vault(&self, name: &str) -> Result<Vec<u8>>;
    async fn save_vault(&self, name: &str, content: &str) -> Result<()>;
}

/// Outer envelope written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultContainer {
    pub version: u32,
    /// Base64 of the (possibly encrypted) serialized vault.
    pub vault: String,
    pub is_encrypted: bool,
}

impl VaultContainer {
    pub fn seal(vault: &Vault, password: &str) -> Result<Self> {
        let plaintext = serde_json::to_vec(vault)?;
        let sealed = encrypt_with_password(&plaintext, password)?;
        Ok(VaultContainer {
            version: VAULT_CONTAINER_VERSION,
            vault: STANDARD.encode(sealed),
            is_encrypted: true,
        })
    }

    pub fn open(&self, password: &str) -> Result<Vault> {
        if self.version != VAULT_CONTAINER_VERSION {
            return Err(CoordinatorError::Serde(format!(
                "unsupported vault container version {}",
                self.version
            )));
        }
        let data = STANDARD.decode(&self.vault)?;
        let plaintext = if self.is_encrypted {
            decrypt_with_password(&data, password)?
        } else {
            data
        };
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Base64 of the JSON container, as handed to [`VaultStorage::save_vault`].
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(content: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(content)
            .map_err(|e| CoordinatorError::Serde(format!("vault content is not utf-8: {e}")))?;
        let raw = STANDARD.decode(text.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Loads and decrypts a stored vault.
pub async fn load_vault(storage: &dyn VaultStorage, name: &str, password: &str) -> Result<Vault> {
    let content = storage.get_vault(name).await?;
    VaultContainer::decode(&content)?.open(password)
}
