//! Vault Engine Core Library
//!
//! Session coordination for threshold keygen and keysign over an untrusted
//! relay. The threshold math is supplied by an [`protocol::MpcEngine`]
//! implementation; this crate handles rendezvous, encrypted message pumping,
//! round completion, retries and vault persistence.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod dkg;
pub mod error;
pub mod logging;
pub mod mpc;
pub mod protocol;
pub mod relay;
pub mod task;
pub mod types;
pub mod utils;
pub mod vault;

pub use config::{EngineConfig, Timeouts};
pub use dkg::KeygenCoordinator;
pub use error::{CoordinatorError, Result};
pub use mpc::{KeysignCoordinator, original_order};
pub use protocol::{Engines, MpcEngine, SessionHandle};
pub use relay::{Relay, RelayClient};
pub use types::{KeyFamily, KeygenRequest, KeysignMessage, KeysignRequest, KeysignResponse, Vault};
