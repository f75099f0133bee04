//! Secrets and secret references.
//!
//! A `SecretValue` can be moved around and handed to an adapter's
//! `put_secret`, but it cannot be formatted, serialized or compared by
//! accident. Everything else in a plan refers to secrets by name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque secret material. `Debug` prints `<redacted>`; there is no `Display`
/// and no `Serialize`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap raw secret material
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw value, for the single place that writes it to a provider secret store.
    #[inline]
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True when the value is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 of the value, hex encoded. Stored next to the secret as a tag
    /// so a rewrite can be skipped when the value has not changed.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// A named secret registered with the plan.
#[derive(Debug, Clone)]
pub struct Secret {
    /// Logical name, referenced from env bindings
    pub name: String,
    /// Secret material
    pub value: SecretValue,
}

impl Secret {
    /// Create a new secret
    #[must_use]
    pub fn new(name: impl Into<String>, value: SecretValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Reference to a registered secret, as it appears in env bindings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name of the registered secret
    pub name: String,
}

impl SecretRef {
    /// Reference a secret by name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Provider-side handle to a stored secret (ARN, Key Vault/Container App
/// secret name, Secret Manager resource name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretHandle {
    /// Logical name of the secret
    pub name: String,
    /// Provider reference used in `valueFrom`/`secretRef`/`secretKeyRef`
    pub reference: String,
}

/// Secrets registered with a plan, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    secrets: BTreeMap<String, Secret>,
}

impl SecretStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a secret
    pub fn insert(&mut self, secret: Secret) {
        self.secrets.insert(secret.name.clone(), secret);
    }

    /// Look up a secret by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Secret> {
        self.secrets.get(name)
    }

    /// Whether a secret of this name exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    /// Iterate secrets in name order
    pub fn iter(&self) -> impl Iterator<Item = &Secret> {
        self.secrets.values()
    }

    /// Number of registered secrets
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// True when no secrets are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// True if `text` contains any registered secret value.
    #[must_use]
    pub fn leaks_into(&self, text: &str) -> bool {
        self.secrets
            .values()
            .any(|s| !s.value.is_empty() && text.contains(s.value.expose()))
    }

    /// Replace every occurrence of a registered secret value with `<redacted>`.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in self.secrets.values() {
            if !secret.value.is_empty() {
                out = out.replace(secret.value.expose(), "<redacted>");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_value() {
        let secret = Secret::new("pat", SecretValue::new("ghp_supersecret"));
        let printed = format!("{secret:?}");
        assert!(!printed.contains("ghp_supersecret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn redact_scrubs_values() {
        let mut store = SecretStore::new();
        store.insert(Secret::new("pat", SecretValue::new("ghp_abc")));
        assert!(store.leaks_into("token=ghp_abc"));
        assert_eq!(store.redact("token=ghp_abc"), "token=<redacted>");
        assert!(!store.leaks_into("token=<redacted>"));
    }

    #[test]
    fn fingerprint_follows_the_value() {
        let value = SecretValue::new("ghp_abc");
        assert_eq!(value.fingerprint(), SecretValue::new("ghp_abc").fingerprint());
        assert_ne!(value.fingerprint(), SecretValue::new("ghp_abd").fingerprint());
        assert!(!value.fingerprint().contains("ghp_abc"));
        assert_eq!(value.fingerprint().len(), 64);
    }

    #[test]
    fn empty_secret_never_matches() {
        let mut store = SecretStore::new();
        store.insert(Secret::new("empty", SecretValue::new("")));
        assert!(!store.leaks_into("anything"));
    }
}
