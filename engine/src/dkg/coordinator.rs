use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::protocol::{EngineSession, Engines, RoundContext, check_committee, run_round};
use crate::relay::{Relay, RelayClient};
use crate::task::{EmailBackupTask, TYPE_EMAIL_VAULT_BACKUP, TaskQueue};
use crate::types::{KeyFamily, KeyShare, KeygenRequest, LibType, Vault};
use crate::utils::filename::backup_filename;
use crate::vault::{LocalStateAccessor, MemoryLocalState, VaultContainer, VaultStorage};

/// Scope of the EdDSA round, keeping its setup and messages apart from the ECDSA round.
const EDDSA_SCOPE: &str = "eddsa";

/// Result of one finished keygen round.
#[derive(Debug, Clone)]
struct KeygenRound {
    public_key: String,
    chain_code: Option<String>,
}

/// Drives vault creation for the local party.
pub struct KeygenCoordinator {
    config: EngineConfig,
    relay: Arc<dyn Relay>,
    engines: Engines,
    storage: Arc<dyn VaultStorage>,
    task_queue: Option<Arc<dyn TaskQueue>>,
    audit: Arc<AuditTracker>,
}

impl KeygenCoordinator {
    pub fn new(
        config: EngineConfig,
        relay: Arc<dyn Relay>,
        engines: Engines,
        storage: Arc<dyn VaultStorage>,
    ) -> Self {
        KeygenCoordinator {
            config,
            relay,
            engines,
            storage,
            task_queue: None,
            audit: Arc::new(AuditTracker::default()),
        }
    }

    pub fn with_task_queue(mut self, task_queue: Arc<dyn TaskQueue>) -> Self {
        self.task_queue = Some(task_queue);
        self
    }

    /// Coordinator talking to the HTTP relay named in `config`.
    pub fn from_config(
        config: EngineConfig,
        engines: Engines,
        storage: Arc<dyn VaultStorage>,
    ) -> Self {
        let relay = Arc::new(RelayClient::from_config(&config));
        Self::new(config, relay, engines, storage)
    }

    pub fn with_audit(mut self, audit: Arc<AuditTracker>) -> Self {
        self.audit = audit;
        self
    }

    /// Runs the ECDSA and EdDSA keygen rounds, then persists the encrypted
    /// vault. Returns `(ecdsa_public_key, eddsa_public_key)`.
    ///
    /// Nothing is persisted unless both rounds succeed.
    pub async fn create_vault(&self, req: &KeygenRequest) -> Result<(String, String)> {
        req.validate()?;
        let timeouts = &self.config.timeouts;

        self.relay
            .register_session(&req.session_id, &req.local_party_id)
            .await?;
        let committee = self
            .relay
            .wait_for_session_start(&req.session_id, timeouts.keygen_session_start)
            .await?;
        check_committee(&committee, &req.local_party_id, None)?;
        info!(session_id = %req.session_id, party = %req.local_party_id, ?committee, "keygen session started");

        let local_state = MemoryLocalState::new();
        let ecdsa = self
            .keygen_with_retry(req, &committee, KeyFamily::Ecdsa, &local_state)
            .await?;
        sleep(timeouts.settle_delay).await;
        let eddsa = self
            .keygen_with_retry(req, &committee, KeyFamily::Eddsa, &local_state)
            .await?;

        self.finish_session(&req.session_id, &req.local_party_id, &committee)
            .await;

        let vault = Vault {
            name: req.name.clone(),
            public_key_ecdsa: ecdsa.public_key.clone(),
            public_key_eddsa: eddsa.public_key.clone(),
            hex_chain_code: ecdsa.chain_code.clone().unwrap_or_default(),
            signers: committee.clone(),
            local_party_id: req.local_party_id.clone(),
            key_shares: vec![
                KeyShare {
                    public_key: ecdsa.public_key.clone(),
                    keyshare: local_state.get_local_state(&ecdsa.public_key)?,
                },
                KeyShare {
                    public_key: eddsa.public_key.clone(),
                    keyshare: local_state.get_local_state(&eddsa.public_key)?,
                },
            ],
            lib_type: LibType::Dkls,
            created_at: Utc::now(),
            reshare_prefix: None,
        };

        let content = VaultContainer::seal(&vault, &req.encryption_password)?.encode()?;
        let file_name = backup_filename(&vault.public_key_ecdsa, &req.plugin_id);
        self.storage.save_vault(&file_name, &content).await?;
        info!(session_id = %req.session_id, file_name, "vault persisted");

        self.enqueue_email_backup(req, &file_name, &content);

        Ok((ecdsa.public_key, eddsa.public_key))
    }

    async fn keygen_with_retry(
        &self,
        req: &KeygenRequest,
        committee: &[String],
        family: KeyFamily,
        local_state: &dyn LocalStateAccessor,
    ) -> Result<KeygenRound> {
        let label = format!("keygen {}", family.label());
        let outcome = self
            .config
            .timeouts
            .keygen_retry()
            .run(&label, move |attempt| {
                self.keygen(req, committee, family, local_state, attempt)
            })
            .await;

        match &outcome {
            Ok(round) => self.audit.log(AuditRecord::new(
                AuditEventType::Keygen,
                &req.session_id,
                &req.local_party_id,
                format!("{} key {} generated", family.label(), round.public_key),
            )),
            Err(e) => self.audit.log(AuditRecord::new(
                AuditEventType::for_error(e),
                &req.session_id,
                &req.local_party_id,
                format!("{label} failed: {e}"),
            )),
        }
        outcome
    }

    async fn keygen(
        &self,
        req: &KeygenRequest,
        committee: &[String],
        family: KeyFamily,
        local_state: &dyn LocalStateAccessor,
        attempt: u32,
    ) -> Result<KeygenRound> {
        let timeouts = &self.config.timeouts;
        let scope = match family {
            KeyFamily::Ecdsa => None,
            KeyFamily::Eddsa => Some(EDDSA_SCOPE.to_string()),
        };
        let ctx = RoundContext::new(
            self.relay.clone(),
            &req.session_id,
            &req.hex_encryption_key,
            &req.local_party_id,
            committee,
            timeouts.keygen_round,
            timeouts,
        )
        .with_scope(scope);

        debug!(session_id = %req.session_id, family = family.label(), attempt, "starting keygen round");
        let setup = ctx.fetch_setup_message().await?;

        let engine = self.engines.get(family);
        let raw_share = {
            let session = EngineSession::keygen(engine, &setup, &req.local_party_id)?;
            run_round(&ctx, &session).await?
        };

        let public_key = hex::encode(engine.public_key(&raw_share)?);
        let chain_code = match family {
            KeyFamily::Ecdsa => Some(hex::encode(engine.chain_code(&raw_share)?)),
            KeyFamily::Eddsa => None,
        };
        local_state.save_local_state(&public_key, &STANDARD.encode(&raw_share))?;

        info!(session_id = %req.session_id, family = family.label(), attempt, public_key, "keygen round finished");
        Ok(KeygenRound {
            public_key,
            chain_code,
        })
    }

    async fn finish_session(&self, session_id: &str, party_id: &str, committee: &[String]) {
        if let Err(e) = self.relay.complete_session(session_id, party_id).await {
            error!(session_id, party = party_id, error = %e, "failed to complete session");
        }
        match self.relay.check_completed_parties(session_id, committee).await {
            Ok(true) => debug!(session_id, "all parties completed"),
            Ok(false) => warn!(session_id, "not all parties reported completion"),
            Err(e) => warn!(session_id, error = %e, "failed to check completed parties"),
        }
    }

    fn enqueue_email_backup(&self, req: &KeygenRequest, file_name: &str, content: &str) {
        let Some(email) = req.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            return;
        };
        if !self.config.email_backup_enabled {
            debug!(session_id = %req.session_id, "email backup disabled");
            return;
        }
        let Some(queue) = self.task_queue.clone() else {
            warn!(session_id = %req.session_id, "email backup requested but no task queue configured");
            return;
        };

        let task = EmailBackupTask {
            name: req.name.clone(),
            email: email.to_string(),
            file_name: file_name.to_string(),
            file_content: content.to_string(),
        };
        let payload = match task.payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(session_id = %req.session_id, error = %e, "failed to encode email backup task");
                return;
            }
        };

        let session_id = req.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.enqueue(TYPE_EMAIL_VAULT_BACKUP, payload).await {
                error!(session_id, error = %e, "failed to enqueue email backup");
            }
        });
    }
}
