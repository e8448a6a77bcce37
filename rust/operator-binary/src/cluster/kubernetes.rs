//! [`Cluster`](super::Cluster) backed by the Kubernetes API

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::{OptionExt as _, ResultExt as _};
use stackable_operator::{
    k8s_openapi::{
        api::{core::v1::Secret, networking::v1::Ingress},
        ByteString,
    },
    kube::{
        api::{
            entry::{self, Entry},
            Api, ListParams, Patch, PatchParams, PostParams,
        },
        runtime::reflector::ObjectRef,
        Resource,
    },
};
use tracing::debug;

use super::{
    ApplySecretSnafu, CertificateStatusPort, CreateCertificateRequestSnafu, GetCertificateSnafu,
    GetIngressSnafu, GetSecretSnafu, IngressAnnotationPort, ListIngressesSnafu, NoNameSnafu,
    Result, TlsSecretPort, UpdateCertificateSnafu, UpdateIngressSnafu, WriteOutcome,
};
use crate::{
    annotations::AnnotationDelta,
    certificate::CertificateMaterial,
    external_crd::cert_manager::{Certificate, CertificateRequest},
    retry::{retry_on_conflict, RetryConfig},
    utils::{api_error_code, Unloggable, HTTP_CONFLICT},
    FIELD_MANAGER,
};

pub const SECRET_KEY_TLS_CERT: &str = "tls.crt";
pub const SECRET_KEY_TLS_KEY: &str = "tls.key";

pub struct KubeCluster {
    // Not secret per se, but Client isn't Debug
    client: Unloggable<stackable_operator::client::Client>,
    retry: RetryConfig,
}

impl KubeCluster {
    pub fn new(client: stackable_operator::client::Client) -> Self {
        Self {
            client: Unloggable(client),
            retry: RetryConfig::default(),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PostParams::default()
        }
    }
}

/// Applies `delta` onto the current annotations of `entry`, committing only if anything changes.
async fn commit_annotations<K>(
    entry: Entry<'_, K>,
    delta: &AnnotationDelta,
) -> Result<WriteOutcome, entry::CommitError>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let Entry::Occupied(mut object) = entry else {
        return Ok(WriteOutcome::Missing);
    };
    let current = object.get().meta().annotations.as_ref();
    if delta.is_satisfied_by(current) {
        return Ok(WriteOutcome::AlreadySatisfied);
    }
    let annotations = delta.applied_to(current);
    object.get_mut().meta_mut().annotations = Some(annotations);
    object.commit(&KubeCluster::post_params()).await?;
    Ok(WriteOutcome::Written)
}

impl KubeCluster {
    async fn try_update_ingress(
        &self,
        api: &Api<Ingress>,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> Result<WriteOutcome> {
        let ingress = || ObjectRef::<Ingress>::new(name).within(namespace);
        let entry = api
            .entry(name)
            .await
            .with_context(|_| GetIngressSnafu { ingress: ingress() })?;
        commit_annotations(entry, delta)
            .await
            .with_context(|_| UpdateIngressSnafu { ingress: ingress() })
    }

    async fn try_update_certificate(
        &self,
        api: &Api<Certificate>,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> Result<WriteOutcome> {
        let certificate = || ObjectRef::<Certificate>::new(name).within(namespace);
        let entry = api.entry(name).await.with_context(|_| GetCertificateSnafu {
            certificate: certificate(),
        })?;
        commit_annotations(entry, delta)
            .await
            .with_context(|_| UpdateCertificateSnafu {
                certificate: certificate(),
            })
    }
}

#[async_trait]
impl IngressAnnotationPort for KubeCluster {
    async fn list_ingresses(&self) -> Result<Vec<Ingress>> {
        Ok(Api::<Ingress>::all(self.client.as_kube_client())
            .list(&ListParams::default())
            .await
            .context(ListIngressesSnafu)?
            .items)
    }

    async fn get_ingress(&self, name: &str, namespace: &str) -> Result<Option<Ingress>> {
        self.client
            .get_api::<Ingress>(namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetIngressSnafu {
                ingress: ObjectRef::new(name).within(namespace),
            })
    }

    async fn update_ingress_annotations(
        &self,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> Result<WriteOutcome> {
        let api = self.client.get_api::<Ingress>(namespace);
        retry_on_conflict(&self.retry, "update Ingress annotations", || {
            self.try_update_ingress(&api, name, namespace, delta)
        })
        .await
    }
}

#[async_trait]
impl CertificateStatusPort for KubeCluster {
    async fn get_certificate(&self, name: &str, namespace: &str) -> Result<Option<Certificate>> {
        self.client
            .get_api::<Certificate>(namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetCertificateSnafu {
                certificate: ObjectRef::new(name).within(namespace),
            })
    }

    async fn update_certificate_annotations(
        &self,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> Result<WriteOutcome> {
        let api = self.client.get_api::<Certificate>(namespace);
        retry_on_conflict(&self.retry, "update Certificate annotations", || {
            self.try_update_certificate(&api, name, namespace, delta)
        })
        .await
    }

    async fn create_certificate_request(&self, request: &CertificateRequest) -> Result<()> {
        let name = request.metadata.name.as_deref().context(NoNameSnafu)?;
        let namespace = request.metadata.namespace.as_deref().context(NoNameSnafu)?;
        match self
            .client
            .get_api::<CertificateRequest>(namespace)
            .create(&Self::post_params(), request)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if api_error_code(&err) == Some(HTTP_CONFLICT) => {
                let existing = ObjectRef::<CertificateRequest>::new(name).within(namespace);
                debug!(certificate_request = %existing, "CertificateRequest already exists");
                Ok(())
            }
            Err(err) => Err(err).context(CreateCertificateRequestSnafu {
                request: ObjectRef::new(name).within(namespace),
            }),
        }
    }
}

/// Extracts the TLS material from a `kubernetes.io/tls` Secret.
pub fn tls_material(secret: &Secret) -> Option<CertificateMaterial> {
    let data = secret.data.as_ref()?;
    let cert_pem = data.get(SECRET_KEY_TLS_CERT)?.0.clone();
    let key_pem = data.get(SECRET_KEY_TLS_KEY)?.0.clone();
    (!cert_pem.is_empty() && !key_pem.is_empty())
        .then_some(CertificateMaterial { cert_pem, key_pem })
}

/// Data of a `kubernetes.io/tls` Secret holding `material`.
pub fn tls_data(material: &CertificateMaterial) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (
            SECRET_KEY_TLS_CERT.to_string(),
            ByteString(material.cert_pem.clone()),
        ),
        (
            SECRET_KEY_TLS_KEY.to_string(),
            ByteString(material.key_pem.clone()),
        ),
    ])
}

#[async_trait]
impl TlsSecretPort for KubeCluster {
    async fn read_tls_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<CertificateMaterial>> {
        Ok(self
            .client
            .get_api::<Secret>(namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetSecretSnafu {
                secret: ObjectRef::new(name).within(namespace),
            })?
            .as_ref()
            .and_then(tls_material))
    }

    async fn apply_tls_secret(&self, secret: &Secret) -> Result<()> {
        let name = secret.metadata.name.as_deref().context(NoNameSnafu)?;
        let namespace = secret.metadata.namespace.as_deref().context(NoNameSnafu)?;
        self.client
            .get_api::<Secret>(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(secret),
            )
            .await
            .with_context(|_| ApplySecretSnafu {
                secret: ObjectRef::new(name).within(namespace),
            })?;
        Ok(())
    }
}
