//! macOS Keychain (generic passwords).

use super::backend::{BackendFailure, SecretBackend};
use security_framework::base::Error as SecError;
use security_framework::passwords::{
    delete_generic_password, get_generic_password, set_generic_password,
};

const ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;
const ERR_SEC_AUTH_FAILED: i32 = -25293;
const ERR_SEC_INTERACTION_NOT_ALLOWED: i32 = -25308;
const ERR_SEC_NOT_AVAILABLE: i32 = -25291;
const ERR_SEC_NO_SUCH_KEYCHAIN: i32 = -25294;

pub(super) struct KeychainBackend {
    service: &'static str,
}

impl KeychainBackend {
    pub(super) fn new(service: &'static str) -> Self {
        Self { service }
    }
}

fn classify(e: SecError) -> BackendFailure {
    let detail = format!("keychain error {}: {}", e.code(), e);
    match e.code() {
        ERR_SEC_AUTH_FAILED | ERR_SEC_INTERACTION_NOT_ALLOWED => BackendFailure::denied(detail),
        ERR_SEC_NOT_AVAILABLE | ERR_SEC_NO_SUCH_KEYCHAIN => BackendFailure::unavailable(detail),
        _ => BackendFailure::backend(detail),
    }
}

impl SecretBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "macos-keychain"
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendFailure> {
        set_generic_password(self.service, key, value.as_bytes()).map_err(classify)
    }

    fn get(&self, key: &str) -> Result<Option<String>, BackendFailure> {
        match get_generic_password(self.service, key) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| BackendFailure::backend("keychain item is not UTF-8")),
            Err(e) if e.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    fn remove(&self, key: &str) -> Result<bool, BackendFailure> {
        match delete_generic_password(self.service, key) {
            Ok(()) => Ok(true),
            Err(e) if e.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }
}
