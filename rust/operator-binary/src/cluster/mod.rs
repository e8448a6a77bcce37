//! Narrow views of the cluster API used by the cache engine
//!
//! Every annotation write is a read-modify-write against a fresh copy of the object, retried on
//! conflict, so a losing writer never clobbers the winner's annotations.

pub mod kubernetes;

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::api::{core::v1::Secret, networking::v1::Ingress},
    kube::{self, api::entry, runtime::reflector::ObjectRef},
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    annotations::AnnotationDelta,
    certificate::CertificateMaterial,
    external_crd::cert_manager::{Certificate, CertificateRequest},
    retry::ConflictError,
    utils::{api_error_code, HTTP_CONFLICT},
};

pub use kubernetes::KubeCluster;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to list Ingresses"))]
    ListIngresses { source: kube::Error },

    #[snafu(display("failed to get {ingress}"))]
    GetIngress {
        source: kube::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to update annotations of {ingress}"))]
    UpdateIngress {
        source: entry::CommitError,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to get {certificate}"))]
    GetCertificate {
        source: kube::Error,
        certificate: ObjectRef<Certificate>,
    },

    #[snafu(display("failed to update annotations of {certificate}"))]
    UpdateCertificate {
        source: entry::CommitError,
        certificate: ObjectRef<Certificate>,
    },

    #[snafu(display("failed to create {request}"))]
    CreateCertificateRequest {
        source: kube::Error,
        request: ObjectRef<CertificateRequest>,
    },

    #[snafu(display("failed to get {secret}"))]
    GetSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to apply {secret}"))]
    ApplySecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("object has no name"))]
    NoName,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

impl ConflictError for Error {
    fn is_conflict(&self) -> bool {
        match self {
            Error::UpdateIngress { source, .. } | Error::UpdateCertificate { source, .. } => {
                matches!(
                    source,
                    entry::CommitError::Save(err) if api_error_code(err) == Some(HTTP_CONFLICT)
                )
            }
            _ => false,
        }
    }
}

/// Result of an annotation write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The object already carried the requested values, nothing was sent.
    AlreadySatisfied,
    /// The object does not exist (anymore).
    Missing,
}

/// Issuer-side readiness of a Certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    Missing,
}

impl Readiness {
    pub fn of(certificate: Option<&Certificate>) -> Self {
        match certificate {
            Some(certificate) if certificate.is_ready() => Self::Ready,
            Some(_) => Self::NotReady,
            None => Self::Missing,
        }
    }
}

/// Name of the TLS Secret the Ingress terminates with, which is also the name cert-manager gives
/// the Certificate it creates for it.
pub fn ingress_tls_secret_name(ingress: &Ingress) -> Option<&str> {
    ingress
        .spec
        .as_ref()?
        .tls
        .as_ref()?
        .first()?
        .secret_name
        .as_deref()
}

#[async_trait]
pub trait IngressAnnotationPort: Send + Sync {
    async fn list_ingresses(&self) -> Result<Vec<Ingress>>;

    async fn get_ingress(&self, name: &str, namespace: &str) -> Result<Option<Ingress>>;

    async fn update_ingress_annotations(
        &self,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> Result<WriteOutcome>;
}

#[async_trait]
pub trait CertificateStatusPort: Send + Sync {
    async fn get_certificate(&self, name: &str, namespace: &str) -> Result<Option<Certificate>>;

    async fn certificate_readiness(&self, name: &str, namespace: &str) -> Result<Readiness> {
        Ok(Readiness::of(self.get_certificate(name, namespace).await?.as_ref()))
    }

    async fn update_certificate_annotations(
        &self,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> Result<WriteOutcome>;

    /// Creating a request that already exists succeeds without touching it.
    async fn create_certificate_request(&self, request: &CertificateRequest) -> Result<()>;
}

#[async_trait]
pub trait TlsSecretPort: Send + Sync {
    /// [`None`] if the Secret is missing or does not (yet) hold both `tls.crt` and `tls.key`.
    async fn read_tls_secret(&self, name: &str, namespace: &str)
        -> Result<Option<CertificateMaterial>>;

    async fn apply_tls_secret(&self, secret: &Secret) -> Result<()>;
}

/// Everything the engine needs from the cluster.
pub trait Cluster: IngressAnnotationPort + CertificateStatusPort + TlsSecretPort {}

impl<T: IngressAnnotationPort + CertificateStatusPort + TlsSecretPort> Cluster for T {}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::{api::entry::CommitError, runtime::reflector::ObjectRef};

    use super::*;
    use crate::testing::api_error;

    #[test]
    fn only_rejected_commits_are_conflicts() {
        let ingress = || ObjectRef::<Ingress>::new("shop").within("prod");
        assert!(Error::UpdateIngress {
            source: CommitError::Save(api_error(409)),
            ingress: ingress(),
        }
        .is_conflict());
        assert!(!Error::UpdateIngress {
            source: CommitError::Save(api_error(500)),
            ingress: ingress(),
        }
        .is_conflict());
        assert!(!Error::GetIngress {
            source: api_error(409),
            ingress: ingress(),
        }
        .is_conflict());
    }

    #[test]
    fn readiness_distinguishes_missing_certificates() {
        let certificate: Certificate = serde_yaml::from_str(
            r#"
            apiVersion: cert-manager.io/v1
            kind: Certificate
            metadata:
              name: shop-tls
              namespace: prod
            spec:
              secretName: shop-tls
              issuerRef:
                name: zerossl
            "#,
        )
        .unwrap();
        assert_eq!(Readiness::of(None), Readiness::Missing);
        assert_eq!(Readiness::of(Some(&certificate)), Readiness::NotReady);
    }
}
