//! One protocol round: an outbound pump and an inbound pump sharing an engine
//! session, joined before the round result is returned.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Timeouts;
use crate::crypto::cipher::{decode_decrypt, encrypt_encode};
use crate::error::{CoordinatorError, Result};
use crate::protocol::engine::EngineSession;
use crate::relay::{Messenger, Relay};

/// Everything one round needs, passed explicitly into both pumps.
#[derive(Clone)]
pub struct RoundContext {
    pub relay: Arc<dyn Relay>,
    pub session_id: String,
    pub hex_encryption_key: String,
    pub local_party_id: String,
    pub committee: Vec<String>,
    /// Relay scope; set for keysign rounds and the EdDSA keygen round.
    pub scope: Option<String>,
    /// Inbound completion deadline.
    pub deadline: Duration,
    pub setup_timeout: Duration,
    pub poll_interval: Duration,
    pub outbound_grace: Duration,
}

impl RoundContext {
    pub fn new(
        relay: Arc<dyn Relay>,
        session_id: &str,
        hex_encryption_key: &str,
        local_party_id: &str,
        committee: &[String],
        deadline: Duration,
        timeouts: &Timeouts,
    ) -> Self {
        RoundContext {
            relay,
            session_id: session_id.to_string(),
            hex_encryption_key: hex_encryption_key.to_string(),
            local_party_id: local_party_id.to_string(),
            committee: committee.to_vec(),
            scope: None,
            deadline,
            setup_timeout: timeouts.setup_message,
            poll_interval: timeouts.poll_interval,
            outbound_grace: timeouts.outbound_grace,
        }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Waits for the initiator's setup message for this round's scope and decrypts it.
    pub async fn fetch_setup_message(&self) -> Result<Vec<u8>> {
        let encoded = self
            .relay
            .wait_for_setup_message(&self.session_id, self.scope(), self.setup_timeout)
            .await?;
        decode_decrypt(&encoded, &self.hex_encryption_key)
    }
}

/// Checks the joined committee against the local party and, for keysign, the
/// vault's recorded signers.
pub fn check_committee(
    committee: &[String],
    local_party_id: &str,
    signers: Option<&[String]>,
) -> Result<()> {
    if !committee.iter().any(|p| p == local_party_id) {
        return Err(CoordinatorError::Validation(format!(
            "local party {local_party_id} is not part of committee {committee:?}"
        )));
    }
    if let Some(signers) = signers {
        if let Some(stranger) = committee.iter().find(|p| !signers.contains(p)) {
            return Err(CoordinatorError::Validation(format!(
                "party {stranger} is not a signer of this vault"
            )));
        }
    }
    Ok(())
}

/// Lifecycle of a round as observed by both pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoundState {
    Created = 0,
    AwaitingMessages = 1,
    Finished = 2,
    TimedOut = 3,
    Failed = 4,
}

impl RoundState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RoundState::Created,
            1 => RoundState::AwaitingMessages,
            2 => RoundState::Finished,
            3 => RoundState::TimedOut,
            _ => RoundState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoundState::Finished | RoundState::TimedOut | RoundState::Failed
        )
    }
}

/// Completion signal shared by the two pumps. Terminal states are sticky.
#[derive(Debug)]
pub struct RoundSignal(AtomicU8);

impl Default for RoundSignal {
    fn default() -> Self {
        RoundSignal(AtomicU8::new(RoundState::Created as u8))
    }
}

impl RoundSignal {
    pub fn state(&self) -> RoundState {
        RoundState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves to `next` unless a terminal state was already reached.
    pub fn set(&self, next: RoundState) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (!RoundState::from_u8(current).is_terminal()).then_some(next as u8)
            });
    }
}

/// Messages already applied to the engine in this round.
#[derive(Debug, Default)]
pub struct DedupCache(Mutex<HashSet<String>>);

impl DedupCache {
    pub fn key(session_id: &str, party_id: &str, scope: Option<&str>, hash: &str) -> String {
        match scope {
            Some(scope) => format!("{session_id}-{party_id}-{scope}-{hash}"),
            None => format!("{session_id}-{party_id}-{hash}"),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains(key)
    }

    /// Returns `false` if the key was already present.
    pub fn insert(&self, key: String) -> bool {
        self.entries().insert(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs both pumps concurrently over `session` and returns the raw finish output.
///
/// Both pumps have returned by the time this resolves, so the caller may free
/// the engine session right after.
pub async fn run_round(ctx: &RoundContext, session: &EngineSession<'_>) -> Result<Vec<u8>> {
    let signal = RoundSignal::default();
    let cache = DedupCache::default();
    let messenger = Messenger::new(ctx.relay.clone(), &ctx.session_id, ctx.scope.clone());

    let (outbound, inbound) = tokio::join!(
        outbound_pump(ctx, session, &messenger, &signal),
        inbound_pump(ctx, session, &cache, &signal),
    );

    match (outbound, inbound) {
        (Ok(()), Ok(raw)) => {
            info!(session_id = %ctx.session_id, party = %ctx.local_party_id, handle = session.handle().0, scope = ?ctx.scope, applied = cache.len(), "round finished");
            Ok(raw)
        }
        (Err(e), _) | (Ok(()), Err(e)) => Err(e),
    }
}

/// Drains outbound messages from the engine and delivers each to its receivers.
pub async fn outbound_pump(
    ctx: &RoundContext,
    session: &EngineSession<'_>,
    messenger: &Messenger,
    signal: &RoundSignal,
) -> Result<()> {
    let result = outbound_loop(ctx, session, messenger, signal).await;
    if let Err(e) = &result {
        error!(session_id = %ctx.session_id, party = %ctx.local_party_id, handle = session.handle().0, error = %e, "outbound pump failed");
        signal.set(RoundState::Failed);
    }
    result
}

async fn outbound_loop(
    ctx: &RoundContext,
    session: &EngineSession<'_>,
    messenger: &Messenger,
    signal: &RoundSignal,
) -> Result<()> {
    loop {
        let Some(message) = session.output_message()? else {
            match signal.state() {
                RoundState::Finished => {
                    // let the last deliveries land before leaving
                    sleep(ctx.outbound_grace).await;
                    return Ok(());
                }
                RoundState::TimedOut | RoundState::Failed => return Ok(()),
                _ => {
                    sleep(ctx.poll_interval).await;
                    continue;
                }
            }
        };

        let body = encrypt_encode(&message, &ctx.hex_encryption_key)?;
        for index in 0..ctx.committee.len() {
            let Some(receiver) = session.message_receiver(&message, index)? else {
                continue;
            };
            if receiver.is_empty() {
                continue;
            }
            if let Err(e) = messenger.send(&ctx.local_party_id, &receiver, &body).await {
                warn!(session_id = %ctx.session_id, party = %ctx.local_party_id, receiver = %receiver, error = %e, "failed to deliver message");
            } else {
                debug!(session_id = %ctx.session_id, party = %ctx.local_party_id, receiver = %receiver, "message delivered");
            }
        }
    }
}

/// Applies inbound messages until the engine reports the round finished or the
/// round deadline elapses. Always leaves `signal` in a terminal state.
pub async fn inbound_pump(
    ctx: &RoundContext,
    session: &EngineSession<'_>,
    cache: &DedupCache,
    signal: &RoundSignal,
) -> Result<Vec<u8>> {
    signal.set(RoundState::AwaitingMessages);

    match timeout(ctx.deadline, inbound_loop(ctx, session, cache, signal)).await {
        Ok(Ok(raw)) => {
            signal.set(RoundState::Finished);
            Ok(raw)
        }
        Ok(Err(e)) => {
            error!(session_id = %ctx.session_id, party = %ctx.local_party_id, handle = session.handle().0, error = %e, "inbound pump failed");
            signal.set(RoundState::Failed);
            Err(e)
        }
        Err(_) => {
            warn!(session_id = %ctx.session_id, party = %ctx.local_party_id, handle = session.handle().0, scope = ?ctx.scope, deadline = ?ctx.deadline, "round timed out");
            signal.set(RoundState::TimedOut);
            Err(CoordinatorError::Timeout(format!(
                "round in session {} did not finish within {:?}",
                ctx.session_id, ctx.deadline
            )))
        }
    }
}

async fn inbound_loop(
    ctx: &RoundContext,
    session: &EngineSession<'_>,
    cache: &DedupCache,
    signal: &RoundSignal,
) -> Result<Vec<u8>> {
    loop {
        if signal.state() == RoundState::Failed {
            return Err(CoordinatorError::Engine("outbound pump aborted the round".into()));
        }

        let messages = ctx
            .relay
            .download_messages(&ctx.session_id, &ctx.local_party_id, ctx.scope())
            .await?;

        for message in messages {
            if message.from == ctx.local_party_id {
                continue;
            }
            let key = DedupCache::key(&ctx.session_id, &ctx.local_party_id, ctx.scope(), &message.hash);
            if cache.contains(&key) {
                continue;
            }

            let raw = decode_decrypt(&message.body, &ctx.hex_encryption_key)?;
            let finished = session.input_message(&raw)?;
            cache.insert(key);

            if let Err(e) = ctx
                .relay
                .delete_message(&ctx.session_id, &ctx.local_party_id, &message.hash, ctx.scope())
                .await
            {
                warn!(session_id = %ctx.session_id, party = %ctx.local_party_id, hash = %message.hash, error = %e, "failed to delete message from relay");
            }

            if finished {
                return session.finish();
            }
        }

        sleep(ctx.poll_interval).await;
    }
}
