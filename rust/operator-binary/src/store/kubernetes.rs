//! Keeps cache entries as [`Secret`]s in a dedicated namespace
//!
//! Each entry is an `Opaque` Secret named after its [`CacheKey`], holding the certificate bundle
//! under a single data key. Soft-deleted entries keep their data but are labelled as deleted
//! until they are purged.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use snafu::ResultExt as _;
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{
        self,
        api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams},
    },
};
use tracing::{debug, info};

use super::{
    entry_from_bundle, BackendError, CacheKey, CachedEntry, CertStore, DeleteEntrySnafu,
    ListDeletedSnafu, PurgeEntrySnafu, ReadEntrySnafu, Result, WriteEntrySnafu,
};
use crate::{
    certificate::CertificateMaterial,
    utils::{api_error_code, HTTP_NOT_FOUND},
};

pub const LABEL_CACHE_STATE: &str = "admissions.drmax.gl/cache-state";
const CACHE_STATE_ACTIVE: &str = "active";
const CACHE_STATE_DELETED: &str = "deleted";

/// Data key holding the PEM bundle (certificate followed by private key).
pub const DATA_KEY_BUNDLE: &str = "bundle";

const FIELD_MANAGER: &str = "admissions.drmax.gl/cert-store";

pub struct KubernetesCertStore {
    secrets: Api<Secret>,
    namespace: String,
}

impl KubernetesCertStore {
    pub fn new(client: &stackable_operator::client::Client, namespace: &str) -> Self {
        Self {
            secrets: client.get_api::<Secret>(namespace),
            namespace: namespace.to_string(),
        }
    }
}

fn state_label(secret: &Secret) -> Option<&str> {
    secret
        .metadata
        .labels
        .as_ref()?
        .get(LABEL_CACHE_STATE)
        .map(String::as_str)
}

fn is_soft_deleted(secret: &Secret) -> bool {
    state_label(secret) == Some(CACHE_STATE_DELETED)
}

fn entry_secret(key: &CacheKey, namespace: &str, material: &CertificateMaterial) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(key.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_CACHE_STATE.to_string(),
                CACHE_STATE_ACTIVE.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            DATA_KEY_BUNDLE.to_string(),
            ByteString(material.to_bundle()),
        )])),
        ..Secret::default()
    }
}

fn entry_from_secret(key: &CacheKey, secret: &Secret) -> Option<CachedEntry> {
    if is_soft_deleted(secret) {
        return None;
    }
    let bundle = secret
        .data
        .as_ref()
        .and_then(|data| data.get(DATA_KEY_BUNDLE));
    entry_from_bundle(key, bundle.map(|bundle| bundle.0.as_slice()))
}

/// Treats "not found" as success, for operations that are idempotent by contract.
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if api_error_code(&err) == Some(HTTP_NOT_FOUND) => Ok(None),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl CertStore for KubernetesCertStore {
    async fn store(&self, key: &CacheKey, material: &CertificateMaterial) -> Result<()> {
        let secret = entry_secret(key, &self.namespace, material);
        self.secrets
            .patch(
                key.as_str(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(BackendError::from)
            .context(WriteEntrySnafu { key: key.clone() })?;
        info!(cache.key = %key, "stored certificate in cache");
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedEntry>> {
        let secret = self
            .secrets
            .get_opt(key.as_str())
            .await
            .map_err(BackendError::from)
            .context(ReadEntrySnafu { key: key.clone() })?;
        Ok(secret.and_then(|secret| entry_from_secret(key, &secret)))
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        let patch = json!({
            "metadata": {
                "labels": {
                    LABEL_CACHE_STATE: CACHE_STATE_DELETED
                }
            }
        });
        let deleted = ignore_not_found(
            self.secrets
                .patch(
                    key.as_str(),
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await,
        )
        .map_err(BackendError::from)
        .context(DeleteEntrySnafu { key: key.clone() })?;
        match deleted {
            Some(_) => info!(cache.key = %key, "soft-deleted cache entry"),
            None => debug!(cache.key = %key, "cache entry already gone, nothing to delete"),
        }
        Ok(())
    }

    async fn list_pending_purge(&self) -> Result<Vec<CacheKey>> {
        let selector = format!("{LABEL_CACHE_STATE}={CACHE_STATE_DELETED}");
        Ok(self
            .secrets
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(BackendError::from)
            .context(ListDeletedSnafu)?
            .items
            .into_iter()
            .filter_map(|secret| secret.metadata.name)
            .map(CacheKey::from_entry_name)
            .collect())
    }

    async fn purge(&self, key: &CacheKey) -> Result<()> {
        ignore_not_found(
            self.secrets
                .delete(key.as_str(), &DeleteParams::default())
                .await,
        )
        .map_err(BackendError::from)
        .context(PurgeEntrySnafu { key: key.clone() })?;
        info!(cache.key = %key, "purged cache entry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::testing::self_signed;

    #[test]
    fn entry_secret_round_trips_material() {
        let key = CacheKey::new("shop-tls", "prod");
        let material = valid_material();
        let secret = entry_secret(&key, "cert-cache", &material);
        assert_eq!(secret.metadata.name.as_deref(), Some("shop-tls--prod"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("cert-cache"));
        assert_eq!(
            entry_from_secret(&key, &secret),
            Some(CachedEntry { material })
        );
    }

    #[test]
    fn soft_deleted_entries_are_hidden() {
        let key = CacheKey::new("shop-tls", "prod");
        let mut secret = entry_secret(&key, "cert-cache", &valid_material());
        secret
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_CACHE_STATE.to_string(), CACHE_STATE_DELETED.to_string());
        assert_eq!(entry_from_secret(&key, &secret), None);
    }

    fn valid_material() -> CertificateMaterial {
        self_signed(
            "shop.example.com",
            OffsetDateTime::now_utc() + Duration::days(60),
        )
    }

    #[test]
    fn entry_without_bundle_is_missing() {
        let key = CacheKey::new("shop-tls", "prod");
        let secret: Secret = serde_yaml::from_str(
            r#"
            apiVersion: v1
            kind: Secret
            metadata:
              name: shop-tls--prod
              namespace: cert-cache
            data:
              tls.crt: Zm9v
            "#,
        )
        .unwrap();
        assert_eq!(entry_from_secret(&key, &secret), None);
    }

    #[test]
    fn entry_with_truncated_bundle_is_missing() {
        let key = CacheKey::new("shop-tls", "prod");
        let mut secret = entry_secret(&key, "cert-cache", &valid_material());
        secret.data = Some(BTreeMap::from([(
            DATA_KEY_BUNDLE.to_string(),
            ByteString(valid_material().cert_pem),
        )]));
        assert_eq!(entry_from_secret(&key, &secret), None);
    }
}
