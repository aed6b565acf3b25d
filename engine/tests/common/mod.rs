//! Shared harness: an in-memory relay and a deterministic simulated engine.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};

use vault_engine::crypto::cipher::encrypt_encode;
use vault_engine::error::{CoordinatorError, Result};
use vault_engine::protocol::{Engines, MpcEngine, SessionHandle};
use vault_engine::relay::{Relay, RelayMessage};
use vault_engine::task::TaskQueue;
use vault_engine::types::{KeyFamily, KeyShare, LibType, Vault};
use vault_engine::utils::filename::backup_filename;
use vault_engine::vault::{VaultContainer, VaultStorage};
use vault_engine::{EngineConfig, Timeouts};

pub const ECDSA_SEED: [u8; 32] = [1u8; 32];
pub const EDDSA_SEED: [u8; 32] = [2u8; 32];
pub const SECRET: &str = "correct horse battery staple";

pub fn session_key() -> String {
    hex::encode([42u8; 32])
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn parties(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|p| p.to_string()).collect()
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::new("memory://relay", SECRET);
    config.timeouts = Timeouts {
        poll_interval: Duration::from_millis(10),
        outbound_grace: Duration::from_millis(20),
        settle_delay: Duration::from_millis(10),
        ..Timeouts::default()
    };
    config
}

type QueueKey = (String, String, Option<String>);

#[derive(Default)]
struct RelayState {
    registered: HashMap<String, Vec<String>>,
    completed: HashMap<String, Vec<String>>,
    setup: HashMap<(String, Option<String>), String>,
    queues: HashMap<QueueKey, Vec<RelayMessage>>,
}

/// Relay kept in process memory. A session starts once `expected` parties registered.
pub struct MemoryRelay {
    expected: usize,
    ignore_deletes: bool,
    fail_deletes: bool,
    fail_uploads: AtomicU32,
    state: Mutex<RelayState>,
    pub uploads: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl MemoryRelay {
    pub fn new(expected: usize) -> Self {
        MemoryRelay {
            expected,
            ignore_deletes: false,
            fail_deletes: false,
            fail_uploads: AtomicU32::new(0),
            state: Mutex::new(RelayState::default()),
            uploads: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Keeps every message queued after delete, so it is downloaded again on each poll.
    pub fn ignoring_deletes(mut self) -> Self {
        self.ignore_deletes = true;
        self
    }

    /// Every delete fails with a relay error and leaves the message queued.
    pub fn failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    /// The next `n` uploads fail with a relay error and are dropped.
    pub fn failing_first_uploads(self, n: u32) -> Self {
        self.fail_uploads.store(n, Ordering::SeqCst);
        self
    }

    pub fn put_setup(&self, session_id: &str, scope: Option<&str>, body: String) {
        let mut state = self.state.lock().unwrap();
        state
            .setup
            .insert((session_id.to_string(), scope.map(str::to_string)), body);
    }

    pub fn completed(&self, session_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.completed.get(session_id).cloned().unwrap_or_default()
    }

    pub fn pending(&self, session_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .queues
            .iter()
            .filter(|((s, _, _), _)| s == session_id)
            .map(|(_, q)| q.len())
            .sum()
    }

    fn queue_key(session_id: &str, party_id: &str, scope: Option<&str>) -> QueueKey {
        (
            session_id.to_string(),
            party_id.to_string(),
            scope.map(str::to_string),
        )
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn register_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let joined = state.registered.entry(session_id.to_string()).or_default();
        if !joined.iter().any(|p| p == party_id) {
            joined.push(party_id.to_string());
        }
        Ok(())
    }

    async fn wait_for_session_start(
        &self,
        session_id: &str,
        wait: Duration,
    ) -> Result<Vec<String>> {
        let poll = async {
            loop {
                {
                    let state = self.state.lock().unwrap();
                    if let Some(joined) = state.registered.get(session_id) {
                        if joined.len() >= self.expected {
                            return joined.clone();
                        }
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(wait, poll)
            .await
            .map_err(|_| CoordinatorError::Timeout(format!("session {session_id} never started")))
    }

    async fn wait_for_setup_message(
        &self,
        session_id: &str,
        scope: Option<&str>,
        wait: Duration,
    ) -> Result<String> {
        let key = (session_id.to_string(), scope.map(str::to_string));
        let poll = async {
            loop {
                let body = self.state.lock().unwrap().setup.get(&key).cloned();
                if let Some(body) = body {
                    return body;
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(wait, poll)
            .await
            .map_err(|_| CoordinatorError::Timeout(format!("no setup message for {session_id}")))
    }

    async fn upload_message(&self, message: &RelayMessage, scope: Option<&str>) -> Result<()> {
        let pending = self.fail_uploads.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_uploads.store(pending - 1, Ordering::SeqCst);
            return Err(CoordinatorError::Relay("upload rejected".into()));
        }
        let mut state = self.state.lock().unwrap();
        for to in &message.to {
            state
                .queues
                .entry(Self::queue_key(&message.session_id, to, scope))
                .or_default()
                .push(message.clone());
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download_messages(
        &self,
        session_id: &str,
        party_id: &str,
        scope: Option<&str>,
    ) -> Result<Vec<RelayMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .queues
            .get(&Self::queue_key(session_id, party_id, scope))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_message(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        scope: Option<&str>,
    ) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes {
            return Err(CoordinatorError::Relay("delete rejected".into()));
        }
        if self.ignore_deletes {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state
            .queues
            .get_mut(&Self::queue_key(session_id, party_id, scope))
        {
            queue.retain(|m| m.hash != hash);
        }
        Ok(())
    }

    async fn complete_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .completed
            .entry(session_id.to_string())
            .or_default()
            .push(party_id.to_string());
        Ok(())
    }

    async fn check_completed_parties(&self, session_id: &str, parties: &[String]) -> Result<bool> {
        let poll = async {
            loop {
                let done = self.completed(session_id);
                if parties.iter().all(|p| done.contains(p)) {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        Ok(timeout(Duration::from_secs(60), poll).await.is_ok())
    }
}

/// Setup message understood by [`SimEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSetup {
    pub committee: Vec<String>,
    /// Hex key seed shared by the committee (keygen).
    #[serde(default)]
    pub seed: Option<String>,
    /// Hex message to sign (keysign).
    #[serde(default)]
    pub message: Option<String>,
}

impl SimSetup {
    pub fn keygen(committee: &[String], seed: [u8; 32]) -> Self {
        SimSetup {
            committee: committee.to_vec(),
            seed: Some(hex::encode(seed)),
            message: None,
        }
    }

    pub fn keysign(committee: &[String], message_hex: &str) -> Self {
        SimSetup {
            committee: committee.to_vec(),
            seed: None,
            message: Some(message_hex.to_string()),
        }
    }

    /// Encrypted and encoded as the initiator would upload it.
    pub fn sealed(&self) -> String {
        let raw = serde_json::to_vec(self).unwrap();
        encrypt_encode(&raw, &session_key()).unwrap()
    }
}

#[derive(Serialize, Deserialize)]
struct SimShare {
    seed: String,
    party: String,
}

#[derive(Serialize, Deserialize)]
struct SimWire {
    from: String,
    to: String,
}

struct SimSession {
    local: String,
    committee: Vec<String>,
    outbound: Vec<Vec<u8>>,
    received: HashSet<String>,
    seed: [u8; 32],
    message: Option<Vec<u8>>,
}

/// Stand-in for a threshold engine: one addressed message to every peer,
/// finished once every peer's message arrived. The "shares" carry the whole
/// seed, which is only acceptable in tests.
pub struct SimEngine {
    family: KeyFamily,
    next: AtomicU64,
    sessions: Mutex<HashMap<u64, SimSession>>,
    fail_creations: AtomicU32,
    corrupt_signatures: bool,
    pub created: AtomicUsize,
    pub freed: AtomicUsize,
    pub finished: AtomicUsize,
    pub applied: AtomicUsize,
}

impl SimEngine {
    pub fn new(family: KeyFamily) -> Self {
        SimEngine {
            family,
            next: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            fail_creations: AtomicU32::new(0),
            corrupt_signatures: false,
            created: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
        }
    }

    /// The next `n` session creations fail with an engine error.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_creations.store(n, Ordering::SeqCst);
        self
    }

    /// Signatures come out with a flipped bit in `s`.
    pub fn corrupting_signatures(mut self) -> Self {
        self.corrupt_signatures = true;
        self
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn share_for(party: &str, seed: [u8; 32]) -> Vec<u8> {
        serde_json::to_vec(&SimShare {
            seed: hex::encode(seed),
            party: party.to_string(),
        })
        .unwrap()
    }

    pub fn public_key_for(family: KeyFamily, seed: [u8; 32]) -> Vec<u8> {
        match family {
            KeyFamily::Ecdsa => {
                let key = k256::ecdsa::SigningKey::from_slice(&seed).unwrap();
                key.verifying_key().to_encoded_point(true).as_bytes().to_vec()
            }
            KeyFamily::Eddsa => ed25519_dalek::SigningKey::from_bytes(&seed)
                .verifying_key()
                .to_bytes()
                .to_vec(),
        }
    }

    fn open(&self, setup: &[u8], local: &str, seed: [u8; 32], message: Option<Vec<u8>>) -> Result<SessionHandle> {
        let pending = self.fail_creations.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_creations.store(pending - 1, Ordering::SeqCst);
            return Err(CoordinatorError::Engine("simulated session failure".into()));
        }

        let setup: SimSetup = serde_json::from_slice(setup).map_err(engine_err)?;
        if !setup.committee.iter().any(|p| p == local) {
            return Err(CoordinatorError::Engine(format!("{local} not in setup committee")));
        }
        let outbound = setup
            .committee
            .iter()
            .filter(|p| *p != local)
            .map(|to| {
                serde_json::to_vec(&SimWire {
                    from: local.to_string(),
                    to: to.clone(),
                })
                .unwrap()
            })
            .collect();

        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().insert(
            id,
            SimSession {
                local: local.to_string(),
                committee: setup.committee,
                outbound,
                received: HashSet::new(),
                seed,
                message,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionHandle(id))
    }
}

impl MpcEngine for SimEngine {
    fn keygen_session_from_setup(&self, setup: &[u8], local_party: &str) -> Result<SessionHandle> {
        let parsed: SimSetup = serde_json::from_slice(setup).map_err(engine_err)?;
        let seed = decode_seed(parsed.seed.as_deref().unwrap_or_default())?;
        self.open(setup, local_party, seed, None)
    }

    fn sign_session_from_setup(
        &self,
        setup: &[u8],
        local_party: &str,
        key_share: &[u8],
    ) -> Result<SessionHandle> {
        let parsed: SimSetup = serde_json::from_slice(setup).map_err(engine_err)?;
        let share: SimShare = serde_json::from_slice(key_share).map_err(engine_err)?;
        let message = hex::decode(parsed.message.unwrap_or_default()).map_err(engine_err)?;
        self.open(setup, local_party, decode_seed(&share.seed)?, Some(message))
    }

    fn output_message(&self, handle: SessionHandle) -> Result<Option<Vec<u8>>> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&handle.0).ok_or_else(|| unknown(handle))?;
        Ok(session.outbound.pop())
    }

    fn message_receiver(
        &self,
        handle: SessionHandle,
        message: &[u8],
        index: usize,
    ) -> Result<Option<String>> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&handle.0).ok_or_else(|| unknown(handle))?;
        let wire: SimWire = serde_json::from_slice(message).map_err(engine_err)?;
        Ok(session
            .committee
            .get(index)
            .filter(|member| **member == wire.to)
            .cloned())
    }

    fn input_message(&self, handle: SessionHandle, message: &[u8]) -> Result<bool> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&handle.0).ok_or_else(|| unknown(handle))?;
        let wire: SimWire = serde_json::from_slice(message).map_err(engine_err)?;
        if wire.to != session.local || !session.committee.contains(&wire.from) {
            return Err(CoordinatorError::Engine("misaddressed message".into()));
        }
        if !session.received.insert(wire.from.clone()) {
            return Err(CoordinatorError::Engine(format!(
                "message from {} applied twice",
                wire.from
            )));
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(session.received.len() + 1 == session.committee.len())
    }

    fn finish(&self, handle: SessionHandle) -> Result<Vec<u8>> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&handle.0).ok_or_else(|| unknown(handle))?;
        if session.received.len() + 1 != session.committee.len() {
            return Err(CoordinatorError::Engine("round not finished".into()));
        }
        self.finished.fetch_add(1, Ordering::SeqCst);

        let Some(message) = &session.message else {
            return Ok(Self::share_for(&session.local, session.seed));
        };
        let mut raw = self.signature(&session.seed, message)?;
        if self.corrupt_signatures {
            // last byte of `s` for both layouts
            raw[63] ^= 1;
        }
        Ok(raw)
    }

    fn free(&self, handle: SessionHandle) {
        if self.sessions.lock().unwrap().remove(&handle.0).is_some() {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn public_key(&self, key_share: &[u8]) -> Result<Vec<u8>> {
        let share: SimShare = serde_json::from_slice(key_share).map_err(engine_err)?;
        Ok(Self::public_key_for(self.family, decode_seed(&share.seed)?))
    }

    fn chain_code(&self, key_share: &[u8]) -> Result<Vec<u8>> {
        let share: SimShare = serde_json::from_slice(key_share).map_err(engine_err)?;
        Ok(blake3::hash(share.seed.as_bytes()).as_bytes().to_vec())
    }

    // no child derivation in the simulation
    fn derive_child_public_key(&self, key_share: &[u8], _derive_path: &str) -> Result<Vec<u8>> {
        self.public_key(key_share)
    }
}

impl SimEngine {
    fn signature(&self, seed: &[u8; 32], message: &[u8]) -> Result<Vec<u8>> {
        match self.family {
            KeyFamily::Ecdsa => {
                let key = k256::ecdsa::SigningKey::from_slice(seed).map_err(engine_err)?;
                let (sig, recid) = key.sign_prehash_recoverable(message).map_err(engine_err)?;
                let mut raw = sig.to_bytes().to_vec();
                raw.push(recid.to_byte());
                Ok(raw)
            }
            KeyFamily::Eddsa => {
                let key = ed25519_dalek::SigningKey::from_bytes(seed);
                Ok(key.sign(message).to_bytes().to_vec())
            }
        }
    }
}

fn decode_seed(seed_hex: &str) -> Result<[u8; 32]> {
    hex::decode(seed_hex)
        .map_err(engine_err)?
        .try_into()
        .map_err(|_| CoordinatorError::Engine("seed must be 32 bytes".into()))
}

fn engine_err(e: impl std::fmt::Display) -> CoordinatorError {
    CoordinatorError::Engine(e.to_string())
}

fn unknown(handle: SessionHandle) -> CoordinatorError {
    CoordinatorError::Engine(format!("unknown handle {}", handle.0))
}

/// A party's engines, kept concrete so tests can read the counters.
pub struct SimParty {
    pub ecdsa: Arc<SimEngine>,
    pub eddsa: Arc<SimEngine>,
}

impl SimParty {
    pub fn new() -> Self {
        SimParty {
            ecdsa: Arc::new(SimEngine::new(KeyFamily::Ecdsa)),
            eddsa: Arc::new(SimEngine::new(KeyFamily::Eddsa)),
        }
    }

    pub fn from_engines(ecdsa: SimEngine, eddsa: SimEngine) -> Self {
        SimParty {
            ecdsa: Arc::new(ecdsa),
            eddsa: Arc::new(eddsa),
        }
    }

    pub fn with_ecdsa(ecdsa: SimEngine) -> Self {
        SimParty {
            ecdsa: Arc::new(ecdsa),
            eddsa: Arc::new(SimEngine::new(KeyFamily::Eddsa)),
        }
    }

    pub fn engines(&self) -> Engines {
        Engines::new(self.ecdsa.clone(), self.eddsa.clone())
    }
}

/// Vault as keygen would have produced it for `local` with the harness seeds.
pub fn sim_vault(signers: &[String], local: &str) -> Vault {
    let ecdsa = hex::encode(SimEngine::public_key_for(KeyFamily::Ecdsa, ECDSA_SEED));
    let eddsa = hex::encode(SimEngine::public_key_for(KeyFamily::Eddsa, EDDSA_SEED));
    Vault {
        name: "treasury".into(),
        public_key_ecdsa: ecdsa.clone(),
        public_key_eddsa: eddsa.clone(),
        hex_chain_code: hex::encode([0u8; 32]),
        signers: signers.to_vec(),
        local_party_id: local.to_string(),
        key_shares: vec![
            KeyShare {
                public_key: ecdsa,
                keyshare: STANDARD.encode(SimEngine::share_for(local, ECDSA_SEED)),
            },
            KeyShare {
                public_key: eddsa,
                keyshare: STANDARD.encode(SimEngine::share_for(local, EDDSA_SEED)),
            },
        ],
        lib_type: LibType::Dkls,
        created_at: chrono::Utc::now(),
        reshare_prefix: None,
    }
}

pub async fn store_vault(storage: &dyn VaultStorage, vault: &Vault, plugin_id: &str) {
    let content = VaultContainer::seal(vault, SECRET).unwrap().encode().unwrap();
    storage
        .save_vault(&backup_filename(&vault.public_key_ecdsa, plugin_id), &content)
        .await
        .unwrap();
}

/// Task queue that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingQueue {
    pub tasks: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task_type: &str, payload: Vec<u8>) -> Result<()> {
        self.tasks
            .lock()
            .unwrap()
            .push((task_type.to_string(), payload));
        Ok(())
    }
}
