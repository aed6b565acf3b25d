//! Engine configuration: relay endpoint, vault secret and protocol timing.

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoordinatorError, Result};
use crate::protocol::retry::RetryPolicy;

/// Timing budget for sessions and rounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Outer budget for the keygen committee to assemble.
    #[serde(with = "secs")]
    pub keygen_session_start: Duration,
    /// Outer budget for the keysign committee to assemble.
    #[serde(with = "secs")]
    pub keysign_session_start: Duration,
    /// Inbound deadline of a single keygen round.
    #[serde(with = "secs")]
    pub keygen_round: Duration,
    /// Inbound deadline of a single keysign round.
    #[serde(with = "secs")]
    pub keysign_round: Duration,
    #[serde(with = "secs")]
    pub setup_message: Duration,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// How long the outbound pump lingers after the round finished.
    #[serde(with = "millis")]
    pub outbound_grace: Duration,
    /// Pause between the ECDSA and EdDSA keygen rounds.
    #[serde(with = "millis")]
    pub settle_delay: Duration,
    pub retry_attempts: u32,
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            keygen_session_start: Duration::from_secs(5 * 60),
            keysign_session_start: Duration::from_secs(3 * 60 + 3),
            keygen_round: Duration::from_secs(2 * 60),
            keysign_round: Duration::from_secs(60),
            setup_message: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            outbound_grace: Duration::from_secs(1),
            settle_delay: Duration::from_millis(500),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl Timeouts {
    pub fn keygen_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_backoff)
            .with_overall_deadline(self.round_budget(self.keygen_round))
    }

    pub fn keysign_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_backoff)
            .with_overall_deadline(self.round_budget(self.keysign_round))
    }

    // every attempt may also wait for its setup message
    fn round_budget(&self, round: Duration) -> Duration {
        (round + self.setup_message) * self.retry_attempts.max(1) + Duration::from_secs(5)
    }
}

/// Configuration of a vault engine node.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the relay, e.g. `https://relay.example.com`.
    pub relay_server: String,
    /// Secret used to decrypt stored vaults for keysign.
    pub encryption_secret: String,
    #[serde(default)]
    pub email_backup_enabled: bool,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl EngineConfig {
    pub fn new(relay_server: &str, encryption_secret: &str) -> Self {
        EngineConfig {
            relay_server: relay_server.trim_end_matches('/').to_string(),
            encryption_secret: encryption_secret.to_string(),
            email_backup_enabled: false,
            timeouts: Timeouts::default(),
        }
    }

    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let relay_server = env::var("RELAY_SERVER")
            .map_err(|_| CoordinatorError::Validation("RELAY_SERVER is not set".into()))?;
        let encryption_secret = env::var("VAULT_ENCRYPTION_SECRET").map_err(|_| {
            CoordinatorError::Validation("VAULT_ENCRYPTION_SECRET is not set".into())
        })?;

        let mut config = EngineConfig::new(&relay_server, &encryption_secret);
        config.email_backup_enabled = env::var("EMAIL_BACKUP_ENABLED")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        Ok(config)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
