//! Durable cache of captured certificate material
//!
//! All operations are idempotent: storing overwrites, deleting a missing entry succeeds, and
//! purging is only ever applied to entries that have been soft-deleted before.
//!
//! Entries live either in Azure Key Vault ([`KeyVaultCertStore`]), which outlives the cluster, or
//! as Secrets in a dedicated namespace ([`KubernetesCertStore`]).

pub mod azure_key_vault;
pub mod kubernetes;

use std::fmt::Display;

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::kube;
use time::OffsetDateTime;

use tracing::warn;

use crate::certificate::{self, CertificateMaterial};

pub use azure_key_vault::KeyVaultCertStore;
pub use kubernetes::KubernetesCertStore;

/// Address of a cache entry, `<secretName>--<namespace>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(secret_name: &str, namespace: &str) -> Self {
        Self(format!("{secret_name}--{namespace}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuilds a key from the name of an existing store entry.
    pub(crate) fn from_entry_name(name: String) -> Self {
        Self(name)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live (not soft-deleted) cache entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedEntry {
    pub material: CertificateMaterial,
}

impl CachedEntry {
    /// Parsed from the stored certificate on every call.
    pub fn not_after(&self) -> Result<OffsetDateTime, certificate::Error> {
        self.material.not_after()
    }
}

/// Parses a stored bundle.
///
/// A bundle that is missing or lacks the certificate or the private key counts as no entry at
/// all, so that it is evicted and captured again like an expired one.
pub(crate) fn entry_from_bundle(key: &CacheKey, bundle: Option<&[u8]>) -> Option<CachedEntry> {
    match bundle.and_then(CertificateMaterial::from_bundle) {
        Some(material) => Some(CachedEntry { material }),
        None => {
            warn!(
                cache.key = %key,
                "cache entry does not hold a certificate and private key, treating it as missing"
            );
            None
        }
    }
}

/// Failure of the system holding the entries.
#[derive(Debug, Snafu)]
pub enum BackendError {
    #[snafu(display("Kubernetes API request failed"), context(false))]
    Kubernetes { source: kube::Error },

    #[snafu(display("Key Vault request failed"), context(false))]
    KeyVault { source: azure_key_vault::RequestError },
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read cache entry {key}"))]
    ReadEntry { source: BackendError, key: CacheKey },

    #[snafu(display("failed to write cache entry {key}"))]
    WriteEntry { source: BackendError, key: CacheKey },

    #[snafu(display("failed to soft-delete cache entry {key}"))]
    DeleteEntry { source: BackendError, key: CacheKey },

    #[snafu(display("failed to purge cache entry {key}"))]
    PurgeEntry { source: BackendError, key: CacheKey },

    #[snafu(display("failed to list soft-deleted cache entries"))]
    ListDeleted { source: BackendError },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait CertStore: Send + Sync {
    /// Writes `material` under `key`, overwriting (and reviving) any previous entry.
    async fn store(&self, key: &CacheKey, material: &CertificateMaterial) -> Result<()>;

    /// Soft-deleted and malformed entries are reported as missing.
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedEntry>>;

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Soft-deletes the entry, if there is one.
    async fn delete(&self, key: &CacheKey) -> Result<()>;

    async fn list_pending_purge(&self) -> Result<Vec<CacheKey>>;

    /// Permanently removes a soft-deleted entry.
    async fn purge(&self, key: &CacheKey) -> Result<()>;
}
