//! # OpenSCP – SFTP
//!
//! SSH/SFTP sessions with host-key trust on first use, hash-verified
//! resumable transfers and a concurrent, rate-limited transfer scheduler.

pub mod sftp;
