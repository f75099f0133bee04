//! Provider resource names
//!
//! Names are `{prefix}-{node}` lowered to `[a-z0-9-]`. When that exceeds the
//! provider's limit, the name is cut and suffixed with the first 8 hex
//! digits of its sha256 so two long names never truncate to the same value.

use fleet_plan::Provider;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

const HASH_LEN: usize = 8;

fn invalid_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap_or_else(|_| unreachable!("static pattern")))
}

/// Derives provider-safe names from a fleet prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNamer {
    prefix: String,
    max_len: usize,
}

impl ResourceNamer {
    /// Namer with an explicit length limit (at least 16)
    #[must_use]
    pub fn new(prefix: &str, max_len: usize) -> Self {
        Self {
            prefix: sanitize(prefix),
            max_len: max_len.max(2 * HASH_LEN),
        }
    }

    /// Namer using the tightest job/app name limit of a provider
    #[must_use]
    pub fn for_provider(provider: Provider, prefix: &str) -> Self {
        let max_len = match provider {
            // IAM role names
            Provider::Aws => 64,
            // Container Apps and jobs
            Provider::Azure => 32,
            // Cloud Run jobs and services
            Provider::Gcp => 49,
        };
        Self::new(prefix, max_len)
    }

    /// Fleet prefix after sanitizing
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Maximum name length
    #[must_use]
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// `{prefix}-{part}-{part}...`, shortened if needed
    #[must_use]
    pub fn name(&self, parts: &[&str]) -> String {
        let mut full = self.prefix.clone();
        for part in parts {
            let part = sanitize(part);
            if part.is_empty() {
                continue;
            }
            if !full.is_empty() {
                full.push('-');
            }
            full.push_str(&part);
        }
        shorten(&full, self.max_len)
    }
}

/// Lowercase, collapse anything outside `[a-z0-9]` to a single `-`, trim dashes.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase();
    invalid_chars()
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

fn shorten(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = max_len - HASH_LEN - 1;
    let head = name[..keep].trim_end_matches('-');
    format!("{head}-{}", &digest[..HASH_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_names_pass_through() {
        let namer = ResourceNamer::new("gha-runner", 64);
        assert_eq!(namer.name(&["identity-runner"]), "gha-runner-identity-runner");
        assert_eq!(namer.name(&["Runner_Job", ""]), "gha-runner-runner-job");
    }

    #[test]
    fn long_names_get_hash_suffix() {
        let namer = ResourceNamer::for_provider(Provider::Azure, "gha-runner");
        let a = namer.name(&["controller-trigger-job-runner"]);
        let b = namer.name(&["controller-trigger-job-runner2"]);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.starts_with("gha-runner-controller"));
    }

    proptest! {
        #[test]
        fn prop_names_are_bounded_and_safe(
            prefix in "[a-zA-Z0-9_ -]{0,20}",
            parts in proptest::collection::vec("[a-zA-Z0-9_./-]{0,30}", 0..4),
            max_len in 16usize..80,
        ) {
            let namer = ResourceNamer::new(&prefix, max_len);
            let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
            let name = namer.name(&parts);
            prop_assert!(name.len() <= max_len);
            prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            prop_assert!(!name.starts_with('-'));
            prop_assert!(!name.ends_with('-'));
            prop_assert_eq!(&name, &namer.name(&parts));
        }
    }
}
