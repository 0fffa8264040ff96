//! Per-subject visitor identity and persisted client metadata.

use pulse_core::{ClientMeta, IdentityToken, normalize_subject};

use crate::{JsonStore, StoreResult};

/// Prefix of the per-subject identity key.
pub const VISITOR_KEY_PREFIX: &str = "sb_visitor_id_v1:";

/// Key of the persisted client metadata.
pub const CLIENT_META_KEY: &str = "sb_client_meta_v1";

/// Stored identities shorter than this read back as absent.
const MIN_STORED_LEN: usize = 10;

/// Reads and writes the visitor identity for each subject.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    store: JsonStore,
}

impl IdentityStore {
    /// Wrap a JSON store.
    #[must_use]
    pub const fn new(store: JsonStore) -> Self {
        Self { store }
    }

    fn key(subject: &str) -> String {
        format!("{VISITOR_KEY_PREFIX}{}", normalize_subject(subject))
    }

    /// Raw stored identity, trimmed; empty when absent or too short.
    #[must_use]
    pub fn visitor_id(&self, subject: &str) -> String {
        self.store
            .get::<String>(&Self::key(subject))
            .map(|raw| raw.trim().to_string())
            .filter(|raw| raw.len() >= MIN_STORED_LEN)
            .unwrap_or_default()
    }

    /// Stored identity if it looks signed.
    #[must_use]
    pub fn signed(&self, subject: &str) -> Option<IdentityToken> {
        IdentityToken::parse(&self.visitor_id(subject))
    }

    /// True when a signed identity is stored for `subject`.
    #[must_use]
    pub fn has_signed(&self, subject: &str) -> bool {
        self.signed(subject).is_some()
    }

    /// Store an identity. Empty values are ignored.
    ///
    /// # Errors
    /// Returns an error if persisting fails.
    pub fn set(&self, subject: &str, raw: &str) -> StoreResult<()> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        if self.visitor_id(subject) == trimmed {
            return Ok(());
        }
        tracing::debug!(subject = %normalize_subject(subject), "visitor identity updated");
        self.store.set(&Self::key(subject), &trimmed)
    }

    /// Adopt `raw` only if it looks signed. Returns whether it was adopted.
    pub fn adopt_if_signed(&self, subject: &str, raw: Option<&str>) -> bool {
        let Some(token) = raw.and_then(IdentityToken::parse) else {
            return false;
        };
        if let Err(e) = self.set(subject, token.expose()) {
            tracing::warn!(error = %e, "failed to persist renewed identity");
        }
        true
    }

    /// Forget the identity for `subject`.
    ///
    /// # Errors
    /// Returns an error if the storage delete fails.
    pub fn clear(&self, subject: &str) -> StoreResult<()> {
        self.store.remove(&Self::key(subject))
    }

    /// Persisted client metadata, probing and persisting it on first use.
    #[must_use]
    pub fn client_meta(&self) -> ClientMeta {
        if let Some(meta) = self
            .store
            .get::<ClientMeta>(CLIENT_META_KEY)
            .filter(ClientMeta::is_populated)
        {
            return meta;
        }
        let meta = ClientMeta::detect();
        if let Err(e) = self.store.set(CLIENT_META_KEY, &meta) {
            tracing::warn!(error = %e, "failed to persist client metadata");
        }
        meta
    }
}
