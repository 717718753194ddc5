//! Freedesktop Secret Service (GNOME Keyring, KWallet) over D-Bus.
//!
//! Uses the `plain` session algorithm; the session bus is local to the user.
//! Items that need an interactive unlock prompt are reported as unavailable.

use super::backend::{BackendFailure, SecretBackend};
use std::collections::HashMap;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

const BUS_NAME: &str = "org.freedesktop.secrets";
const SERVICE_PATH: &str = "/org/freedesktop/secrets";
const DEFAULT_COLLECTION: &str = "/org/freedesktop/secrets/aliases/default";
const SERVICE_IFACE: &str = "org.freedesktop.Secret.Service";
const COLLECTION_IFACE: &str = "org.freedesktop.Secret.Collection";
const ITEM_IFACE: &str = "org.freedesktop.Secret.Item";

/// `(oayays)`: session, parameters, value, content type.
type Secret = (OwnedObjectPath, Vec<u8>, Vec<u8>, String);

pub(super) struct SecretServiceBackend {
    service: &'static str,
}

fn classify(e: zbus::Error) -> BackendFailure {
    match e {
        zbus::Error::MethodError(ref name, ref detail, _) => {
            let detail = format!("{}: {}", name.as_str(), detail.clone().unwrap_or_default());
            match name.as_str() {
                "org.freedesktop.DBus.Error.ServiceUnknown"
                | "org.freedesktop.DBus.Error.NameHasNoOwner"
                | "org.freedesktop.Secret.Error.NoSuchObject" => BackendFailure::unavailable(detail),
                "org.freedesktop.DBus.Error.AccessDenied"
                | "org.freedesktop.Secret.Error.IsLocked" => BackendFailure::denied(detail),
                _ => BackendFailure::backend(detail),
            }
        }
        zbus::Error::InputOutput(_) | zbus::Error::Address(_) | zbus::Error::Handshake(_) => {
            BackendFailure::unavailable(e.to_string())
        }
        other => BackendFailure::backend(other.to_string()),
    }
}

/// Open connection plus a `plain` transfer session.
struct Ctx {
    conn: Connection,
    session: OwnedObjectPath,
}

impl SecretServiceBackend {
    pub(super) fn new(service: &'static str) -> Self {
        Self { service }
    }

    fn attributes<'a>(&self, key: &'a str) -> HashMap<&'static str, &'a str> {
        let mut attrs = HashMap::new();
        attrs.insert("service", self.service);
        attrs.insert("account", key);
        attrs
    }

    fn open(&self) -> Result<Ctx, BackendFailure> {
        let conn = Connection::session()
            .map_err(|e| BackendFailure::unavailable(format!("no session bus: {}", e)))?;
        let service = Proxy::new(&conn, BUS_NAME, SERVICE_PATH, SERVICE_IFACE).map_err(classify)?;
        let (_output, session): (OwnedValue, OwnedObjectPath) = service
            .call("OpenSession", &("plain", Value::from("")))
            .map_err(classify)?;
        Ok(Ctx { conn, session })
    }

    /// Item paths matching `key`, unlocking without a prompt where possible.
    fn find(&self, ctx: &Ctx, key: &str) -> Result<Vec<OwnedObjectPath>, BackendFailure> {
        let service =
            Proxy::new(&ctx.conn, BUS_NAME, SERVICE_PATH, SERVICE_IFACE).map_err(classify)?;
        let (mut unlocked, locked): (Vec<OwnedObjectPath>, Vec<OwnedObjectPath>) = service
            .call("SearchItems", &(self.attributes(key),))
            .map_err(classify)?;
        if !locked.is_empty() {
            let (now_unlocked, prompt): (Vec<OwnedObjectPath>, OwnedObjectPath) =
                service.call("Unlock", &(locked,)).map_err(classify)?;
            if prompt.as_str() != "/" {
                return Err(BackendFailure::unavailable(
                    "secret collection is locked and needs an interactive unlock",
                ));
            }
            unlocked.extend(now_unlocked);
        }
        Ok(unlocked)
    }

    fn item<'c>(&self, ctx: &'c Ctx, path: &'c OwnedObjectPath) -> Result<Proxy<'c>, BackendFailure> {
        Proxy::new(&ctx.conn, BUS_NAME, path.as_str(), ITEM_IFACE).map_err(classify)
    }
}

impl SecretBackend for SecretServiceBackend {
    fn name(&self) -> &'static str {
        "secret-service"
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendFailure> {
        let ctx = self.open()?;
        let collection =
            Proxy::new(&ctx.conn, BUS_NAME, DEFAULT_COLLECTION, COLLECTION_IFACE).map_err(classify)?;

        let label = format!("{} {}", self.service, key);
        let mut props: HashMap<&str, Value> = HashMap::new();
        props.insert("org.freedesktop.Secret.Item.Label", Value::from(label));
        props.insert(
            "org.freedesktop.Secret.Item.Attributes",
            Value::from(self.attributes(key)),
        );
        let secret: Secret = (
            ctx.session.clone(),
            Vec::new(),
            value.as_bytes().to_vec(),
            "text/plain; charset=utf8".to_string(),
        );

        let (_item, prompt): (OwnedObjectPath, OwnedObjectPath) = collection
            .call("CreateItem", &(props, secret, true))
            .map_err(classify)?;
        if prompt.as_str() != "/" {
            return Err(BackendFailure::unavailable(
                "default collection requires an interactive prompt",
            ));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, BackendFailure> {
        let ctx = self.open()?;
        let items = self.find(&ctx, key)?;
        let Some(path) = items.first() else {
            return Ok(None);
        };
        let secret: Secret = self
            .item(&ctx, path)?
            .call("GetSecret", &(&ctx.session,))
            .map_err(classify)?;
        String::from_utf8(secret.2)
            .map(Some)
            .map_err(|_| BackendFailure::backend("secret is not UTF-8"))
    }

    fn remove(&self, key: &str) -> Result<bool, BackendFailure> {
        let ctx = self.open()?;
        let items = self.find(&ctx, key)?;
        for path in &items {
            let prompt: OwnedObjectPath = self.item(&ctx, path)?.call("Delete", &()).map_err(classify)?;
            if prompt.as_str() != "/" {
                return Err(BackendFailure::unavailable("delete requires an interactive prompt"));
            }
        }
        Ok(!items.is_empty())
    }
}
