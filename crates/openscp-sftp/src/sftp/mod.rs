// ── openscp-sftp / sftp module ──────────────────────────────────────────────
//
//   • Session lifecycle: TCP keepalive, modern algorithm preferences,
//     host-key policy with TOFU, password / kbd-interactive / key / agent auth
//   • Known-hosts store with hashed names and atomic persistence
//   • Streaming SHA-256 hasher for local and remote ranges
//   • Chunked upload / download through `.part` files with resume
//   • Token-bucket rate limiting (global and per task)
//   • Transfer scheduler with pause / cancel / retry and coalesced snapshots
//   • Read-only directory model and bounded recursive enumeration

pub mod audit;
pub mod auth;
pub mod callbacks;
pub mod dir_model;
pub mod file_ops;
pub mod hasher;
pub mod host_key;
pub mod known_hosts;
pub mod queue;
pub mod rate_limit;
pub mod remote;
pub mod session;
pub mod transfer;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use callbacks::{HostKeyPrompt, KbdIntPrompt, KbdIntResponse, RejectUnknownHosts, SessionCallbacks};
pub use known_hosts::{HostKeyCheck, KnownHostEntry, KnownHosts};
pub use queue::{SchedulerConfig, TaskSnapshot, TransferScheduler};
pub use remote::{RemoteFs, RemoteWrite, SessionFactory, WriteStart};
pub use session::Session;
pub use transfer::{TransferControl, TransferOptions, TransferOutcome};
pub use types::*;

/// Size of one transfer / hashing chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;
