//! Session message encryption, vault sealing and signature verification.

pub mod cipher;
pub mod signing;
