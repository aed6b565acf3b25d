use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::config::EngineConfig;
use crate::crypto::signing::{build_response, verify_ecdsa, verify_eddsa};
use crate::error::{CoordinatorError, Result};
use crate::protocol::{EngineSession, Engines, RoundContext, check_committee, run_round};
use crate::relay::{Relay, RelayClient};
use crate::types::{KeyFamily, KeysignMessage, KeysignRequest, KeysignResponse, Vault};
use crate::utils::filename::{backup_filename, parse_backup_filename};
use crate::vault::{LocalStateAccessor, VaultLocalState, VaultStorage, load_vault};

/// Per-invocation state shared by every message round.
struct KeysignSession<'a> {
    req: &'a KeysignRequest,
    vault: &'a Vault,
    committee: &'a [String],
    local_state: &'a dyn LocalStateAccessor,
}

/// Drives keysign rounds for the local party of a stored vault.
pub struct KeysignCoordinator {
    config: EngineConfig,
    relay: Arc<dyn Relay>,
    engines: Engines,
    storage: Arc<dyn VaultStorage>,
    audit: Arc<AuditTracker>,
}

impl KeysignCoordinator {
    pub fn new(
        config: EngineConfig,
        relay: Arc<dyn Relay>,
        engines: Engines,
        storage: Arc<dyn VaultStorage>,
    ) -> Self {
        KeysignCoordinator {
            config,
            relay,
            engines,
            storage,
            audit: Arc::new(AuditTracker::default()),
        }
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

    /// Signs every requested message, one round at a time, and returns the
    /// signatures keyed by message hash.
    ///
    /// Any message that still fails after retries aborts the whole call.
    pub async fn sign_messages(
        &self,
        req: &KeysignRequest,
    ) -> Result<HashMap<String, KeysignResponse>> {
        req.validate()?;

        let file_name = backup_filename(&req.public_key, &req.plugin_id);
        parse_backup_filename(&file_name)?;
        let vault = load_vault(self.storage.as_ref(), &file_name, &self.config.encryption_secret)
            .await?;
        if vault.public_key_ecdsa != req.public_key {
            return Err(CoordinatorError::Validation(format!(
                "vault {file_name} does not belong to public key {}",
                req.public_key
            )));
        }
        let party = vault.local_party_id.clone();

        self.relay.register_session(&req.session_id, &party).await?;
        let committee = self
            .relay
            .wait_for_session_start(&req.session_id, self.config.timeouts.keysign_session_start)
            .await?;
        check_committee(&committee, &party, Some(vault.signers.as_slice()))?;
        info!(session_id = %req.session_id, party = %party, ?committee, messages = req.messages.len(), "keysign session started");

        let local_state = VaultLocalState::new(&vault);
        let session = KeysignSession {
            req,
            vault: &vault,
            committee: &committee,
            local_state: &local_state,
        };

        let mut results = HashMap::with_capacity(req.messages.len());
        for msg in &req.messages {
            let response = self.sign_with_retry(&session, msg).await?;
            self.verify(&session, msg, &response);
            results.insert(msg.hash.clone(), response);
        }

        if let Err(e) = self.relay.complete_session(&req.session_id, &party).await {
            error!(session_id = %req.session_id, party = %party, error = %e, "failed to complete session");
        }
        Ok(results)
    }

    async fn sign_with_retry(
        &self,
        session: &KeysignSession<'_>,
        msg: &KeysignMessage,
    ) -> Result<KeysignResponse> {
        let label = format!("keysign {} {}", msg.family.label(), msg.hash);
        let outcome = self
            .config
            .timeouts
            .keysign_retry()
            .run(&label, move |attempt| self.sign(session, msg, attempt))
            .await;

        let party = &session.vault.local_party_id;
        match &outcome {
            Ok(_) => self.audit.log(AuditRecord::new(
                AuditEventType::Keysign,
                &session.req.session_id,
                party,
                format!("signed message {}", msg.hash),
            )),
            Err(e) => self.audit.log(AuditRecord::new(
                AuditEventType::for_error(e),
                &session.req.session_id,
                party,
                format!("{label} failed: {e}"),
            )),
        }
        outcome
    }

    async fn sign(
        &self,
        session: &KeysignSession<'_>,
        msg: &KeysignMessage,
        attempt: u32,
    ) -> Result<KeysignResponse> {
        let req = session.req;
        let party = &session.vault.local_party_id;
        let scope = msg.scope()?;

        let ctx = RoundContext::new(
            self.relay.clone(),
            &req.session_id,
            &req.hex_encryption_key,
            party,
            session.committee,
            self.config.timeouts.keysign_round,
            &self.config.timeouts,
        )
        .with_scope(Some(scope.clone()));

        let key_share = STANDARD.decode(
            session
                .local_state
                .get_local_state(session.vault.public_key(msg.family))?,
        )?;

        debug!(session_id = %req.session_id, party = %party, scope = %scope, attempt, "starting keysign round");
        let setup = ctx.fetch_setup_message().await?;

        let engine = self.engines.get(msg.family);
        let raw = {
            let round = EngineSession::sign(engine, &setup, party, &key_share)?;
            run_round(&ctx, &round).await?
        };

        info!(session_id = %req.session_id, party = %party, scope = %scope, attempt, "keysign round finished");
        build_response(msg.family, &msg.message, &raw)
    }

    /// Checks the signature against the vault's key. Failures are recorded, never returned.
    fn verify(&self, session: &KeysignSession<'_>, msg: &KeysignMessage, resp: &KeysignResponse) {
        if let Err(e) = self.try_verify(session, msg, resp) {
            warn!(session_id = %session.req.session_id, hash = %msg.hash, error = %e, "signature verification failed");
            self.audit.log(AuditRecord::new(
                AuditEventType::Verification,
                &session.req.session_id,
                &session.vault.local_party_id,
                format!("signature for {} did not verify: {e}", msg.hash),
            ));
        }
    }

    fn try_verify(
        &self,
        session: &KeysignSession<'_>,
        msg: &KeysignMessage,
        resp: &KeysignResponse,
    ) -> Result<()> {
        let message = msg.message_bytes()?;
        match msg.family {
            KeyFamily::Ecdsa => {
                let public_key = self.signing_public_key(session)?;
                verify_ecdsa(&public_key, &message, &resp.r, &resp.s)
            }
            KeyFamily::Eddsa => {
                verify_eddsa(&session.vault.public_key_eddsa, &message, &resp.r, &resp.s)
            }
        }
    }

    fn signing_public_key(&self, session: &KeysignSession<'_>) -> Result<String> {
        let vault = session.vault;
        let derive_path = session.req.derive_path.trim();
        if derive_path.is_empty() {
            return Ok(vault.public_key_ecdsa.clone());
        }
        let share = STANDARD.decode(session.local_state.get_local_state(&vault.public_key_ecdsa)?)?;
        let child = self
            .engines
            .get(KeyFamily::Ecdsa)
            .derive_child_public_key(&share, derive_path)?;
        Ok(hex::encode(child))
    }
}

/// Re-sequences keyed results into the order the messages were requested in.
pub fn original_order(
    req: &KeysignRequest,
    results: &HashMap<String, KeysignResponse>,
) -> Result<Vec<KeysignResponse>> {
    if results.len() != req.messages.len() {
        return Err(CoordinatorError::Validation(format!(
            "expected {} signatures, got {}",
            req.messages.len(),
            results.len()
        )));
    }

    req.messages
        .iter()
        .map(|msg| {
            results.get(&msg.hash).cloned().ok_or_else(|| {
                CoordinatorError::Validation(format!("missing signature for message {}", msg.hash))
            })
        })
        .collect()
}
