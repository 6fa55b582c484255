use crate::credentials::CredentialStore;
use crate::error::{AppdownError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An authenticated store account, as persisted in the credential store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Directory services id, sent as `X-Dsid`
    pub dsid: String,
    pub country_code: String,
    pub storefront: String,
    /// Long-lived auth token, sent as `X-Token`
    pub password_token: String,
    pub session_token: String,
    /// `name=value` pairs captured from the cookie jar after login
    pub cookies: Vec<String>,
}

impl Identity {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }

    pub fn has_token(&self) -> bool {
        !self.password_token.is_empty() && !self.dsid.is_empty()
    }

    /// Numeric storefront code without the language suffix (`143441-1,29` -> `143441`).
    pub fn storefront_id(&self) -> Option<u64> {
        self.storefront
            .split(|c| c == '-' || c == ',')
            .next()
            .and_then(|s| s.trim().parse().ok())
    }
}

/// A live login. Clones share one validity flag, so invalidating any clone
/// invalidates them all.
#[derive(Debug, Clone)]
pub struct Session {
    identity: Identity,
    valid: Arc<AtomicBool>,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            tracing::info!(account = %self.identity.email, "session invalidated");
        }
    }

    /// The identity, if the backend still accepts this session and it holds a token.
    pub fn ensure_valid(&self) -> Result<&Identity> {
        if !self.is_valid() || !self.identity.has_token() {
            return Err(AppdownError::SessionInvalid);
        }
        Ok(&self.identity)
    }

    /// Replace the cookie snapshot after the jar picked up new values.
    pub fn refresh_cookies(&mut self, cookies: Vec<String>) {
        self.identity.cookies = cookies;
    }
}

/// Holder for the single active account.
///
/// Replacing the account invalidates the session it displaced; every write
/// goes through the credential store.
pub struct AccountManager {
    store: Arc<dyn CredentialStore>,
    active: RwLock<Option<Session>>,
}

impl AccountManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            active: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.active.read().clone()
    }

    /// Persist and activate `session`.
    pub fn activate(&self, session: Session) -> Result<()> {
        self.store.save(session.identity())?;
        self.replace(session);
        Ok(())
    }

    /// Load the stored account, if any, and make it active.
    pub fn restore(&self) -> Result<Option<Session>> {
        let Some(identity) = self.store.load()? else {
            return Ok(None);
        };
        let session = Session::new(identity);
        self.replace(session.clone());
        Ok(Some(session))
    }

    fn replace(&self, session: Session) {
        let previous = self.active.write().replace(session.clone());
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.valid, &session.valid) {
                previous.invalidate();
            }
        }
    }

    /// Drop the active account. Returns whether a stored record existed.
    pub fn logout(&self) -> Result<bool> {
        if let Some(previous) = self.active.write().take() {
            previous.invalidate();
        }
        self.store.delete()
    }
}
