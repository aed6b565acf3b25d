//! Fire-and-forget task queue collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const TYPE_EMAIL_VAULT_BACKUP: &str = "vault:email_backup";

/// Emails the encrypted vault container to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailBackupTask {
    pub name: String,
    pub email: String,
    pub file_name: String,
    /// Base64 encrypted vault container, exactly as persisted.
    pub file_content: String,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task_type: &str, payload: Vec<u8>) -> Result<()>;
}

impl EmailBackupTask {
    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
