//! # OpenSCP
//!
//! Front-end entry point for the OpenSCP transfer core. Wires site profiles,
//! the credential store, the primary SFTP session and the transfer scheduler
//! so GUI, CLI and test front-ends share one surface.

mod client;
mod site;

pub use client::OpenScp;
pub use site::SiteProfile;

pub use openscp_core as core;
pub use openscp_credentials as credentials;
pub use openscp_sftp::sftp;
