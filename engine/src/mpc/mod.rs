//! Distributed signing against an existing vault.

pub mod coordinator;

pub use coordinator::{KeysignCoordinator, original_order};
