use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CoordinatorError, Result};
use crate::vault::VaultStorage;

/// Vault blob sealed at rest with AES-GCM.
struct SealedBlob {
    ciphertext: Vec<u8>,
    nonce: [u8; 12],
}

/// In-process vault storage that seals every blob under an ephemeral key.
///
/// Contents do not survive the process; used for local runs and tests.
#[derive(Clone)]
pub struct SealedMemoryStorage {
    store: Arc<RwLock<HashMap<String, SealedBlob>>>,
    cipher: Aes256Gcm,
}

impl Default for SealedMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SealedMemoryStorage {
    pub fn new() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));

        SealedMemoryStorage {
            store: Arc::new(RwLock::new(HashMap::new())),
            cipher,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store
            .read()
            .map(|store| store.contains_key(name))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.store
            .read()
            .map(|store| store.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VaultStorage for SealedMemoryStorage {
    async fn get_vault(&self, name: &str) -> Result<Vec<u8>> {
        let store = self
            .store
            .read()
            .map_err(|_| CoordinatorError::Storage("Vault lock poisoned".into()))?;
        let blob = store
            .get(name)
            .ok_or_else(|| CoordinatorError::Storage(format!("vault {name} not found")))?;

        self.cipher
            .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_ref())
            .map_err(|e| CoordinatorError::Storage(format!("Unsealing failed: {e:?}")))
    }

    async fn save_vault(&self, name: &str, content: &str) -> Result<()> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), content.as_bytes())
            .map_err(|e| CoordinatorError::Storage(format!("Sealing failed: {e:?}")))?;

        let mut store = self
            .store
            .write()
            .map_err(|_| CoordinatorError::Storage("Vault lock poisoned".into()))?;
        store.insert(name.to_string(), SealedBlob { ciphertext, nonce });
        Ok(())
    }
}
