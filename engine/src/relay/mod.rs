//! Untrusted store-and-forward relay used for session rendezvous and message transport.

pub mod client;
pub mod messenger;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use client::RelayClient;
pub use messenger::Messenger;

/// Header carrying the relay scope of a round.
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// Envelope stored on the relay. `body` is base64 AES-GCM ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub session_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub body: String,
    pub hash: String,
    #[serde(default)]
    pub sequence_no: u64,
}

/// Operations the coordinators need from the relay.
///
/// `scope` keeps rounds that share a session apart: one scope per keysign
/// message, and `"eddsa"` for the second keygen round.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn register_session(&self, session_id: &str, party_id: &str) -> Result<()>;

    /// Blocks until the committee has started the session or `timeout` elapses.
    async fn wait_for_session_start(&self, session_id: &str, timeout: Duration)
    -> Result<Vec<String>>;

    /// Blocks until the initiator has uploaded the setup message for `scope`.
    async fn wait_for_setup_message(
        &self,
        session_id: &str,
        scope: Option<&str>,
        timeout: Duration,
    ) -> Result<String>;

    async fn upload_message(&self, message: &RelayMessage, scope: Option<&str>) -> Result<()>;

    async fn download_messages(
        &self,
        session_id: &str,
        party_id: &str,
        scope: Option<&str>,
    ) -> Result<Vec<RelayMessage>>;

    async fn delete_message(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        scope: Option<&str>,
    ) -> Result<()>;

    async fn complete_session(&self, session_id: &str, party_id: &str) -> Result<()>;

    /// Returns whether every party in `parties` has reported completion.
    async fn check_completed_parties(&self, session_id: &str, parties: &[String]) -> Result<bool>;
}
