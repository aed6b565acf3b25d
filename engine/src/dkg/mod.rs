//! Distributed key generation: one ECDSA round and one EdDSA round per vault.

pub mod coordinator;

pub use coordinator::KeygenCoordinator;
