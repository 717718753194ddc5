// ── OpenScp front ───────────────────────────────────────────────────────────
//
// Owns the primary session and the transfer scheduler. Credential lookups
// happen here, on the caller's thread, before any session or worker sees the
// options.

use crate::site::SiteProfile;
use openscp_core::{CoreConfig, OpenScpError, OpenScpResult};
use openscp_credentials::{CredentialStore, PersistResult, SecretKind};
use openscp_sftp::sftp::{
    Session, SessionCallbacks, SessionFactory, SessionInfo, SessionOptions, TransferScheduler,
};
use std::sync::Arc;
use tracing::{info, warn};

pub struct OpenScp {
    config: CoreConfig,
    credentials: CredentialStore,
    scheduler: TransferScheduler,
    primary: Option<Session>,
}

impl OpenScp {
    pub fn new(config: CoreConfig, credentials: CredentialStore) -> OpenScpResult<Self> {
        let scheduler = TransferScheduler::from_core_config(&config)?;
        Ok(OpenScp {
            config,
            credentials,
            scheduler,
            primary: None,
        })
    }

    /// Configuration file plus environment, platform credential store.
    pub fn from_default_config() -> OpenScpResult<Self> {
        let config = CoreConfig::load_with_env(&CoreConfig::default_path())?;
        let credentials = CredentialStore::from_config(&config);
        Self::new(config, credentials)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn scheduler(&self) -> &TransferScheduler {
        &self.scheduler
    }

    pub fn session(&self) -> Option<&Session> {
        self.primary.as_ref()
    }

    /// Options for `site` with stored secrets filled in. Legacy name-keyed
    /// secrets are migrated on the way. A failing store is logged and the
    /// secret left empty; agent and interactive auth may still succeed.
    pub fn session_options_for(
        &self,
        site: &SiteProfile,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> SessionOptions {
        let mut opts = site.session_options(&self.config).with_callbacks(callbacks);
        opts.password = self.lookup(site, SecretKind::Password);
        if site.private_key_path.is_some() {
            opts.private_key_passphrase = self.lookup(site, SecretKind::KeyPassphrase);
        }
        opts
    }

    fn lookup(&self, site: &SiteProfile, kind: SecretKind) -> Option<String> {
        match self.credentials.get_site_secret(&site.id, Some(&site.name), kind) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(site = %site.id, ?kind, error = %e, "credential lookup failed");
                None
            }
        }
    }

    /// Connect the primary session for `site` and hand its factory to the
    /// scheduler. Any previous session is closed first.
    pub fn connect(
        &mut self,
        site: &SiteProfile,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> OpenScpResult<&SessionInfo> {
        self.disconnect();
        let opts = self.session_options_for(site, callbacks);
        let session = Session::connect(opts)?;
        self.scheduler.set_client(session.factory()?);
        info!(site = %site.name, "site connected");
        let session = self.primary.insert(session);
        session.info().ok_or(OpenScpError::NotConnected)
    }

    /// Attach a ready-made session source without a primary session.
    pub fn attach_factory(&mut self, factory: Arc<dyn SessionFactory>) {
        self.disconnect();
        self.scheduler.set_client(factory);
    }

    /// Detach the scheduler and close the primary session. Queued and
    /// interrupted transfers stay queued for the next connection.
    pub fn disconnect(&mut self) {
        self.scheduler.clear_client();
        if let Some(mut session) = self.primary.take() {
            session.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.primary.as_ref().map_or(false, Session::is_connected) || self.scheduler.has_client()
    }

    // ── Secrets ──────────────────────────────────────────────────

    pub fn save_site_password(&self, site: &SiteProfile, password: &str) -> PersistResult {
        self.credentials
            .set_site_secret(&site.id, SecretKind::Password, password)
    }

    pub fn save_site_passphrase(&self, site: &SiteProfile, passphrase: &str) -> PersistResult {
        self.credentials
            .set_site_secret(&site.id, SecretKind::KeyPassphrase, passphrase)
    }

    pub fn forget_site(&self, site: &SiteProfile) -> PersistResult {
        self.credentials.remove_site_secrets(&site.id)
    }
}

impl Drop for OpenScp {
    fn drop(&mut self) {
        self.disconnect();
    }
}
