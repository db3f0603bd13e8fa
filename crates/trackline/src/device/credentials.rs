//! In-process holder for the device's bearer credential.

use std::sync::RwLock;

use tracing::{info, warn};

/// Thread-safe slot for the bearer credential.
///
/// One instance per device process, shared through `Arc` by the submitter and
/// the delivery agent. The credential can appear or disappear at runtime
/// (activation, revocation); readers always see the latest value.
#[derive(Debug, Default)]
pub struct CredentialStore {
    token: RwLock<Option<String>>,
}

impl CredentialStore {
    /// Create a store, optionally pre-loaded with a credential.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.trim().is_empty())),
        }
    }

    /// Install or replace the credential.
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        info!(credential = %mask(&token), "Credential installed");
        match self.token.write() {
            Ok(mut slot) => *slot = Some(token),
            Err(poisoned) => *poisoned.into_inner() = Some(token),
        }
    }

    /// Forget the credential.
    pub fn clear(&self) {
        match self.token.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        warn!("Credential cleared; records will be queued until a new one is installed");
    }

    /// Current credential, if any.
    #[must_use]
    pub fn bearer(&self) -> Option<String> {
        match self.token.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether a credential is present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.bearer().is_some()
    }

    /// Masked form of the current credential for display.
    #[must_use]
    pub fn masked(&self) -> Option<String> {
        self.bearer().as_deref().map(mask)
    }
}

/// First six characters followed by `***`.
pub(crate) fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}***")
}
