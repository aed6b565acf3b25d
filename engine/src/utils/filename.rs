use crate::error::{CoordinatorError, Result};

const BACKUP_EXTENSION: &str = ".vult";

/// Metadata extracted from a validated vault backup filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFileMetadata {
    pub plugin_id: String,
    pub public_key_ecdsa: String,
}

/// Storage name of a vault: `<plugin_id>-<ecdsa public key>.vult`.
pub fn backup_filename(public_key_ecdsa: &str, plugin_id: &str) -> String {
    format!("{plugin_id}-{public_key_ecdsa}{BACKUP_EXTENSION}")
}

/// Validates the filename structure and extracts its parts.
///
/// Enforces:
/// - Format: `<plugin_id>-<hex public key>.vult`
/// - the public key part is non-empty hex
pub fn parse_backup_filename(filename: &str) -> Result<BackupFileMetadata> {
    let stem = filename.strip_suffix(BACKUP_EXTENSION).ok_or_else(|| {
        CoordinatorError::Validation(format!("backup file must end with '{BACKUP_EXTENSION}'"))
    })?;

    // plugin ids may contain '-', public keys never do
    let (plugin_id, public_key) = stem
        .rsplit_once('-')
        .ok_or_else(|| CoordinatorError::Validation("backup file must be '<plugin>-<key>'".into()))?;

    if public_key.is_empty() || hex::decode(public_key).is_err() {
        return Err(CoordinatorError::Validation(
            "backup file must end with a hex public key".into(),
        ));
    }

    Ok(BackupFileMetadata {
        plugin_id: plugin_id.to_string(),
        public_key_ecdsa: public_key.to_string(),
    })
}
