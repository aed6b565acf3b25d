use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{CoordinatorError, Result};
use crate::types::Vault;

/// Lookup and storage of the local party's key-share blobs, keyed by public key.
pub trait LocalStateAccessor: Send + Sync {
    fn get_local_state(&self, public_key: &str) -> Result<String>;
    fn save_local_state(&self, public_key: &str, keyshare: &str) -> Result<()>;
}

/// Holds shares produced during keygen, before the vault exists.
#[derive(Default)]
pub struct MemoryLocalState {
    shares: RwLock<HashMap<String, String>>,
}

impl MemoryLocalState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStateAccessor for MemoryLocalState {
    fn get_local_state(&self, public_key: &str) -> Result<String> {
        let shares = self
            .shares
            .read()
            .map_err(|_| CoordinatorError::Storage("Local state lock poisoned".into()))?;
        shares
            .get(public_key)
            .cloned()
            .ok_or_else(|| CoordinatorError::Storage(format!("no key share for {public_key}")))
    }

    fn save_local_state(&self, public_key: &str, keyshare: &str) -> Result<()> {
        let mut shares = self
            .shares
            .write()
            .map_err(|_| CoordinatorError::Storage("Local state lock poisoned".into()))?;
        shares.insert(public_key.to_string(), keyshare.to_string());
        Ok(())
    }
}

/// Read-only view over the key shares of a loaded vault.
pub struct VaultLocalState<'a> {
    vault: &'a Vault,
}

impl<'a> VaultLocalState<'a> {
    pub fn new(vault: &'a Vault) -> Self {
        VaultLocalState { vault }
    }
}

impl LocalStateAccessor for VaultLocalState<'_> {
    fn get_local_state(&self, public_key: &str) -> Result<String> {
        self.vault
            .key_shares
            .iter()
            .find(|share| share.public_key == public_key)
            .map(|share| share.keyshare.clone())
            .ok_or_else(|| {
                CoordinatorError::Storage(format!(
                    "vault {} has no key share for {public_key}",
                    self.vault.name
                ))
            })
    }

    fn save_local_state(&self, _public_key: &str, _keyshare: &str) -> Result<()> {
        Err(CoordinatorError::Storage("loaded vaults are read-only".into()))
    }
}
