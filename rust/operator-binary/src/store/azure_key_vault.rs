//! Keeps cache entries as Azure Key Vault secrets
//!
//! Deleting a secret only soft-deletes it, and it stays recoverable until it is purged, which is
//! the lifecycle of a cache entry. Requests go to the Key Vault REST API, authenticated with a
//! token from the Azure identity chain (workload identity, managed identity or a CLI login).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use azure_core::credentials::TokenCredential;
use azure_identity::DefaultAzureCredential;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info};

use super::{
    entry_from_bundle, BackendError, CacheKey, CachedEntry, CertStore, DeleteEntrySnafu,
    ListDeletedSnafu, PurgeEntrySnafu, ReadEntrySnafu, Result, WriteEntrySnafu,
};
use crate::{
    certificate::CertificateMaterial,
    retry::{retry_on_conflict, ConflictError, RetryConfig},
};

const API_VERSION: &str = "7.4";
const SCOPE: &str = "https://vault.azure.net/.default";
const CONTENT_TYPE_BUNDLE: &str = "application/x-pem-file";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to set up the Azure credential chain"))]
    Credential { source: azure_core::Error },

    #[snafu(display("failed to build the Key Vault HTTP client"))]
    BuildHttpClient { source: reqwest::Error },
}

#[derive(Debug, Snafu)]
pub enum RequestError {
    #[snafu(display("failed to obtain an access token for Key Vault"))]
    AccessToken { source: azure_core::Error },

    #[snafu(display("failed to send request to Key Vault"))]
    Send { source: reqwest::Error },

    #[snafu(display("Key Vault responded with {status}: {message}"))]
    Status { status: StatusCode, message: String },

    #[snafu(display("failed to decode Key Vault response"))]
    DecodeResponse { source: reqwest::Error },

    #[snafu(display("certificate bundle is not valid UTF-8"))]
    NonUtf8Bundle { source: std::string::FromUtf8Error },
}

impl RequestError {
    fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl ConflictError for RequestError {
    fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT)
    }
}

/// Hands out bearer tokens for Key Vault requests.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, RequestError>;
}

struct AzureIdentity(Arc<dyn TokenCredential>);

#[async_trait]
impl AccessTokenSource for AzureIdentity {
    async fn access_token(&self) -> Result<String, RequestError> {
        let token = self.0.get_token(&[SCOPE]).await.context(AccessTokenSnafu)?;
        Ok(token.token.secret().to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetSecretParameters<'a> {
    value: &'a str,
    content_type: &'a str,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedSecretList {
    #[serde(default)]
    value: Vec<DeletedSecretItem>,
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct DeletedSecretItem {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Deserialize)]
struct ErrorDetails {
    code: Option<String>,
    message: Option<String>,
}

/// Name of the secret a Key Vault secret id (`https://<vault>/secrets/<name>[/<version>]`) points
/// at.
fn secret_name_of_id(id: &str) -> Option<&str> {
    let path = id.split_once("://").map_or(id, |(_, rest)| rest);
    let mut segments = path.split('/').skip(1).filter(|segment| !segment.is_empty());
    let _collection = segments.next()?;
    segments.next()
}

/// Treats "not found" as success, for operations that are idempotent by contract.
fn ignore_not_found<T>(result: Result<T, RequestError>) -> Result<Option<T>, RequestError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => Ok(None),
        Err(err) => Err(err),
    }
}

pub struct KeyVaultCertStore {
    http: reqwest::Client,
    vault_url: String,
    tokens: Arc<dyn AccessTokenSource>,
    /// Overwriting a soft-deleted entry waits for Key Vault to finish recovering it.
    recovery_retry: RetryConfig,
}

impl KeyVaultCertStore {
    /// Authenticates through [`DefaultAzureCredential`].
    pub fn new(vault_url: &str) -> Result<Self, Error> {
        let credential: Arc<dyn TokenCredential> =
            DefaultAzureCredential::new().context(CredentialSnafu)?;
        Self::with_token_source(vault_url, Arc::new(AzureIdentity(credential)))
    }

    pub fn with_token_source(
        vault_url: &str,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(BuildHttpClientSnafu)?;
        Ok(Self {
            http,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            tokens,
            recovery_retry: RetryConfig {
                max_attempts: 8,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
                backoff_multiplier: 2.0,
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}?api-version={API_VERSION}", self.vault_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RequestError> {
        let token = self.tokens.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .context(SendSnafu)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(ErrorBody {
                error: ErrorDetails { code, message },
            }) => format!(
                "{}: {}",
                code.as_deref().unwrap_or("Unknown"),
                message.as_deref().unwrap_or_default()
            ),
            Err(_) => status.canonical_reason().unwrap_or_default().to_string(),
        };
        StatusSnafu { status, message }.fail()
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RequestError> {
        self.send(self.http.get(url))
            .await?
            .json()
            .await
            .context(DecodeResponseSnafu)
    }

    async fn set_secret(&self, key: &CacheKey, value: &str) -> Result<(), RequestError> {
        let parameters = SetSecretParameters {
            value,
            content_type: CONTENT_TYPE_BUNDLE,
        };
        let url = self.url(&format!("secrets/{key}"));
        self.send(self.http.put(url).json(&parameters)).await?;
        Ok(())
    }

    async fn write(
        &self,
        key: &CacheKey,
        material: &CertificateMaterial,
    ) -> Result<(), RequestError> {
        let value = String::from_utf8(material.to_bundle()).context(NonUtf8BundleSnafu)?;
        match self.set_secret(key, &value).await {
            // The name is still taken by a soft-deleted entry
            Err(err) if err.is_conflict() => {
                info!(cache.key = %key, "recovering soft-deleted cache entry to overwrite it");
                let url = self.url(&format!("deletedsecrets/{key}/recover"));
                match self.send(self.http.post(url)).await {
                    // Already being recovered
                    Err(err) if err.is_conflict() => {}
                    result => {
                        result?;
                    }
                }
                retry_on_conflict(&self.recovery_retry, "overwrite recovered cache entry", || {
                    self.set_secret(key, &value)
                })
                .await
            }
            result => result,
        }
    }

    async fn read(&self, key: &CacheKey) -> Result<Option<CachedEntry>, RequestError> {
        let url = self.url(&format!("secrets/{key}"));
        let Some(secret) = ignore_not_found(self.get_json::<SecretBundle>(&url).await)? else {
            return Ok(None);
        };
        Ok(entry_from_bundle(key, secret.value.as_deref().map(str::as_bytes)))
    }

    async fn soft_delete(&self, key: &CacheKey) -> Result<(), RequestError> {
        let url = self.url(&format!("secrets/{key}"));
        match ignore_not_found(self.send(self.http.delete(url)).await)? {
            Some(_) => info!(cache.key = %key, "soft-deleted cache entry"),
            None => debug!(cache.key = %key, "cache entry already gone, nothing to delete"),
        }
        Ok(())
    }

    async fn list_deleted(&self) -> Result<Vec<CacheKey>, RequestError> {
        let mut keys = Vec::new();
        let mut next = Some(self.url("deletedsecrets"));
        while let Some(url) = next {
            let page: DeletedSecretList = self.get_json(&url).await?;
            keys.extend(
                page.value
                    .iter()
                    .filter_map(|item| secret_name_of_id(item.id.as_deref()?))
                    .map(|name| CacheKey::from_entry_name(name.to_string())),
            );
            next = page.next_link.filter(|link| !link.is_empty());
        }
        Ok(keys)
    }

    async fn purge_deleted(&self, key: &CacheKey) -> Result<(), RequestError> {
        let url = self.url(&format!("deletedsecrets/{key}"));
        ignore_not_found(self.send(self.http.delete(url)).await)?;
        info!(cache.key = %key, "purged cache entry");
        Ok(())
    }
}

#[async_trait]
impl CertStore for KeyVaultCertStore {
    async fn store(&self, key: &CacheKey, material: &CertificateMaterial) -> Result<()> {
        self.write(key, material)
            .await
            .map_err(BackendError::from)
            .context(WriteEntrySnafu { key: key.clone() })?;
        info!(cache.key = %key, "stored certificate in cache");
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedEntry>> {
        self.read(key)
            .await
            .map_err(BackendError::from)
            .context(ReadEntrySnafu { key: key.clone() })
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.soft_delete(key)
            .await
            .map_err(BackendError::from)
            .context(DeleteEntrySnafu { key: key.clone() })
    }

    async fn list_pending_purge(&self) -> Result<Vec<CacheKey>> {
        self.list_deleted()
            .await
            .map_err(BackendError::from)
            .context(ListDeletedSnafu)
    }

    async fn purge(&self, key: &CacheKey) -> Result<()> {
        self.purge_deleted(key)
            .await
            .map_err(BackendError::from)
            .context(PurgeEntrySnafu { key: key.clone() })
    }
}
