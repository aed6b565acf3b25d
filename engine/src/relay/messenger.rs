use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::relay::{Relay, RelayMessage};

/// Addresses already-encrypted protocol messages and uploads them to the relay.
pub struct Messenger {
    relay: Arc<dyn Relay>,
    session_id: String,
    scope: Option<String>,
    counter: AtomicU64,
}

impl Messenger {
    pub fn new(relay: Arc<dyn Relay>, session_id: &str, scope: Option<String>) -> Self {
        Messenger {
            relay,
            session_id: session_id.to_string(),
            scope,
            counter: AtomicU64::new(0),
        }
    }

    /// Delivers `body` (base64 ciphertext) from `from` to a single recipient.
    pub async fn send(&self, from: &str, to: &str, body: &str) -> Result<()> {
        let message = RelayMessage {
            session_id: self.session_id.clone(),
            from: from.to_string(),
            to: vec![to.to_string()],
            body: body.to_string(),
            hash: content_hash(body),
            sequence_no: self.counter.fetch_add(1, Ordering::Relaxed),
        };
        self.relay
            .upload_message(&message, self.scope.as_deref())
            .await
    }
}

/// Hex BLAKE3 digest identifying a message body on the relay.
pub fn content_hash(body: &str) -> String {
    blake3::hash(body.as_bytes()).to_hex().to_string()
}
