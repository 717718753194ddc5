//! Windows Credential Manager (generic credentials).

use super::backend::{BackendFailure, SecretBackend};
use std::ptr;
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_ACCESS_DENIED, ERROR_NOT_FOUND, ERROR_NO_SUCH_LOGON_SESSION,
};
use windows_sys::Win32::Security::Credentials::{
    CredDeleteW, CredFree, CredReadW, CredWriteW, CREDENTIALW, CRED_PERSIST_LOCAL_MACHINE,
    CRED_TYPE_GENERIC,
};

pub(super) struct CredManagerBackend {
    service: &'static str,
}

impl CredManagerBackend {
    pub(super) fn new(service: &'static str) -> Self {
        Self { service }
    }

    /// `OpenSCP/<key>` as a NUL-terminated UTF-16 string.
    fn target(&self, key: &str) -> Vec<u16> {
        format!("{}/{}", self.service, key)
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect()
    }
}

fn last_error(op: &str) -> BackendFailure {
    let code = unsafe { GetLastError() };
    let detail = format!("{} failed (win32 error {})", op, code);
    match code {
        ERROR_ACCESS_DENIED => BackendFailure::denied(detail),
        ERROR_NO_SUCH_LOGON_SESSION => BackendFailure::unavailable(detail),
        _ => BackendFailure::backend(detail),
    }
}

impl SecretBackend for CredManagerBackend {
    fn name(&self) -> &'static str {
        "windows-credential-manager"
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendFailure> {
        let mut target = self.target(key);
        let mut user: Vec<u16> = "openscp".encode_utf16().chain(std::iter::once(0)).collect();
        let mut blob = value.as_bytes().to_vec();

        let mut cred: CREDENTIALW = unsafe { std::mem::zeroed() };
        cred.Type = CRED_TYPE_GENERIC;
        cred.TargetName = target.as_mut_ptr();
        cred.UserName = user.as_mut_ptr();
        cred.CredentialBlobSize = blob.len() as u32;
        cred.CredentialBlob = blob.as_mut_ptr();
        cred.Persist = CRED_PERSIST_LOCAL_MACHINE;

        let ok = unsafe { CredWriteW(&cred, 0) };
        if ok == 0 {
            return Err(last_error("CredWriteW"));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, BackendFailure> {
        let target = self.target(key);
        let mut pcred: *mut CREDENTIALW = ptr::null_mut();
        let ok = unsafe { CredReadW(target.as_ptr(), CRED_TYPE_GENERIC, 0, &mut pcred) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_NOT_FOUND {
                return Ok(None);
            }
            return Err(last_error("CredReadW"));
        }

        // SAFETY: CredReadW succeeded, so pcred points at a valid CREDENTIALW
        // until CredFree.
        let bytes = unsafe {
            let cred = &*pcred;
            let slice = if cred.CredentialBlob.is_null() || cred.CredentialBlobSize == 0 {
                &[][..]
            } else {
                std::slice::from_raw_parts(cred.CredentialBlob, cred.CredentialBlobSize as usize)
            };
            let owned = slice.to_vec();
            CredFree(pcred as *const _);
            owned
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| BackendFailure::backend("credential blob is not UTF-8"))
    }

    fn remove(&self, key: &str) -> Result<bool, BackendFailure> {
        let target = self.target(key);
        let ok = unsafe { CredDeleteW(target.as_ptr(), CRED_TYPE_GENERIC, 0) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_NOT_FOUND {
                return Ok(false);
            }
            return Err(last_error("CredDeleteW"));
        }
        Ok(true)
    }
}
