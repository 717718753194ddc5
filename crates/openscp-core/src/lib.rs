//! Shared foundation for the OpenSCP crates: error taxonomy, configuration,
//! environment switches, logging, atomic persistence, cancellation and path
//! helpers.

pub mod atomic;
pub mod cancel;
pub mod config;
pub mod env;
pub mod error;
pub mod logging;
pub mod paths;

pub use atomic::{write_atomic, AtomicStage, AtomicWriteError};
pub use cancel::CancelToken;
pub use config::{CoreConfig, IntegrityPolicy};
pub use env::RuntimeEnv;
pub use error::{AuthFailure, CredentialFailure, ErrorKind, OpenScpError, OpenScpResult};
