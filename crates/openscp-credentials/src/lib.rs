//! # OpenSCP – Credentials
//!
//! Platform keychain abstraction used by front-ends to fetch and persist
//! site passwords and key passphrases before a session is built.

pub mod credentials;

pub use credentials::*;
