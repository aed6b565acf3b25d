use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::{CoordinatorError, Result};
use crate::types::KeyFamily;

/// Opaque per-round session handle issued by an [`MpcEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Threshold cryptography engine for one curve family.
///
/// The engine owns the protocol math and the wire format of its messages.
/// Implementations must tolerate concurrent calls on the same handle: the
/// outbound pump reads messages and receivers while the inbound pump feeds
/// messages in. Failures are reported as [`CoordinatorError::Engine`].
pub trait MpcEngine: Send + Sync {
    fn keygen_session_from_setup(&self, setup: &[u8], local_party: &str) -> Result<SessionHandle>;

    fn sign_session_from_setup(
        &self,
        setup: &[u8],
        local_party: &str,
        key_share: &[u8],
    ) -> Result<SessionHandle>;

    /// Next pending outbound message, if any.
    fn output_message(&self, handle: SessionHandle) -> Result<Option<Vec<u8>>>;

    /// Receiver of `message` at committee position `index`, if it goes to that member.
    fn message_receiver(
        &self,
        handle: SessionHandle,
        message: &[u8],
        index: usize,
    ) -> Result<Option<String>>;

    /// Applies an inbound message. Returns `true` once the round is finished.
    fn input_message(&self, handle: SessionHandle, message: &[u8]) -> Result<bool>;

    /// Raw key-share (keygen) or raw signature (keysign) bytes.
    fn finish(&self, handle: SessionHandle) -> Result<Vec<u8>>;

    fn free(&self, handle: SessionHandle);

    fn public_key(&self, key_share: &[u8]) -> Result<Vec<u8>>;

    fn chain_code(&self, key_share: &[u8]) -> Result<Vec<u8>>;

    fn derive_child_public_key(&self, key_share: &[u8], derive_path: &str) -> Result<Vec<u8>>;
}

/// One engine per curve family.
#[derive(Clone)]
pub struct Engines {
    pub ecdsa: Arc<dyn MpcEngine>,
    pub eddsa: Arc<dyn MpcEngine>,
}

impl Engines {
    pub fn new(ecdsa: Arc<dyn MpcEngine>, eddsa: Arc<dyn MpcEngine>) -> Self {
        Engines { ecdsa, eddsa }
    }

    pub fn get(&self, family: KeyFamily) -> &dyn MpcEngine {
        match family {
            KeyFamily::Ecdsa => self.ecdsa.as_ref(),
            KeyFamily::Eddsa => self.eddsa.as_ref(),
        }
    }
}

/// Owns an engine handle for the lifetime of one round and frees it on drop.
pub struct EngineSession<'a> {
    engine: &'a dyn MpcEngine,
    handle: SessionHandle,
    finished: AtomicBool,
}

impl<'a> EngineSession<'a> {
    pub fn keygen(engine: &'a dyn MpcEngine, setup: &[u8], local_party: &str) -> Result<Self> {
        let handle = engine.keygen_session_from_setup(setup, local_party)?;
        Ok(Self::wrap(engine, handle))
    }

    pub fn sign(
        engine: &'a dyn MpcEngine,
        setup: &[u8],
        local_party: &str,
        key_share: &[u8],
    ) -> Result<Self> {
        let handle = engine.sign_session_from_setup(setup, local_party, key_share)?;
        Ok(Self::wrap(engine, handle))
    }

    fn wrap(engine: &'a dyn MpcEngine, handle: SessionHandle) -> Self {
        debug!(handle = handle.0, "engine session opened");
        EngineSession {
            engine,
            handle,
            finished: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn output_message(&self) -> Result<Option<Vec<u8>>> {
        self.engine.output_message(self.handle)
    }

    pub fn message_receiver(&self, message: &[u8], index: usize) -> Result<Option<String>> {
        self.engine.message_receiver(self.handle, message, index)
    }

    pub fn input_message(&self, message: &[u8]) -> Result<bool> {
        self.engine.input_message(self.handle, message)
    }

    /// Finishes the round. A second call is an error and never reaches the engine.
    pub fn finish(&self) -> Result<Vec<u8>> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(CoordinatorError::Engine(format!(
                "session {} already finished",
                self.handle.0
            )));
        }
        self.engine.finish(self.handle)
    }
}

impl Drop for EngineSession<'_> {
    fn drop(&mut self) {
        self.engine.free(self.handle);
        debug!(handle = self.handle.0, "engine session freed");
    }
}
