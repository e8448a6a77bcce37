//! Mutations applied while objects are admitted
//!
//! The webhook server hands every admitted object to [`AdmissionHandler::mutate`], which either
//! returns the object to patch in or [`MutationOutcome::Unchanged`]. Failures never block
//! admission, with the single exception of [`Error::CreateSyntheticRequest`].

mod certificate;
mod challenge;
mod ingress;

use std::{sync::Arc, time::Duration};

use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::api::networking::v1::Ingress, kube::runtime::reflector::ObjectRef,
};
use strum::{EnumDiscriminants, EnumString, IntoStaticStr};
use time::OffsetDateTime;
use tracing::warn;

use crate::{
    cluster,
    external_crd::{acme::Challenge, cert_manager::Certificate},
    utils::error_full_message,
    Ctx,
};

/// Kubernetes webhooks give up after 10 seconds unless configured otherwise.
pub const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, IntoStaticStr)]
pub enum ResourceKind {
    Ingress,
    Certificate,
    Challenge,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AdmittedObject {
    Ingress(Box<Ingress>),
    Certificate(Box<Certificate>),
    Challenge(Box<Challenge>),
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum DecodeError {
    #[snafu(display("objects of kind {kind:?} are not handled"))]
    UnknownKind { kind: String },

    #[snafu(display("failed to deserialize admitted {kind:?}"))]
    Deserialize {
        source: serde_json::Error,
        kind: ResourceKind,
    },
}

impl AdmittedObject {
    /// Decodes an admitted object of the given `kind` (as in `AdmissionRequest.kind.kind`).
    pub fn decode(kind: &str, object: serde_json::Value) -> Result<Self, DecodeError> {
        use decode_error::*;
        let resource_kind: ResourceKind = kind
            .parse()
            .map_err(|_| UnknownKindSnafu { kind }.build())?;
        let context = DeserializeSnafu {
            kind: resource_kind,
        };
        Ok(match resource_kind {
            ResourceKind::Ingress => {
                Self::Ingress(Box::new(serde_json::from_value(object).context(context)?))
            }
            ResourceKind::Certificate => {
                Self::Certificate(Box::new(serde_json::from_value(object).context(context)?))
            }
            ResourceKind::Challenge => {
                Self::Challenge(Box::new(serde_json::from_value(object).context(context)?))
            }
        })
    }

    /// The object as it goes back into the admission response.
    pub fn into_value(self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Ingress(object) => serde_json::to_value(object),
            Self::Certificate(object) => serde_json::to_value(object),
            Self::Challenge(object) => serde_json::to_value(object),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Ingress(_) => ResourceKind::Ingress,
            Self::Certificate(_) => ResourceKind::Certificate,
            Self::Challenge(_) => ResourceKind::Challenge,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationOutcome {
    Unchanged,
    Mutated(AdmittedObject),
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to create synthetic CertificateRequest for {certificate}"))]
    CreateSyntheticRequest {
        source: cluster::Error,
        certificate: ObjectRef<Certificate>,
    },
}

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    /// Message to reject the admission request with, including every source error.
    pub fn rejection_message(&self) -> String {
        error_full_message(self)
    }
}

pub struct AdmissionHandler {
    ctx: Arc<Ctx>,
    timeout: Duration,
}

impl AdmissionHandler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self {
            ctx,
            timeout: ADMISSION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn mutate(&self, object: AdmittedObject) -> Result<MutationOutcome, Error> {
        let kind = object.kind();
        let now = OffsetDateTime::now_utc();
        let mutation = async {
            match object {
                AdmittedObject::Ingress(object) => {
                    Ok(ingress::mutate(&self.ctx, *object, now).await)
                }
                AdmittedObject::Certificate(object) => {
                    certificate::mutate(&self.ctx, *object, now).await
                }
                AdmittedObject::Challenge(object) => Ok(challenge::mutate(*object)),
            }
        };
        match tokio::time::timeout(self.timeout, mutation).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    kind = <&str>::from(kind),
                    timeout = ?self.timeout,
                    "admission mutation timed out, admitting the object unchanged"
                );
                Ok(MutationOutcome::Unchanged)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rejection_message_names_the_root_cause() {
        let err = Error::CreateSyntheticRequest {
            source: cluster::Error::NoName,
            certificate: ObjectRef::new("shop-tls").within("prod"),
        };
        let message = err.rejection_message();
        assert!(message.starts_with("failed to create synthetic CertificateRequest for"));
        assert!(message.ends_with(": object has no name"));
        assert_eq!(err.category(), "CreateSyntheticRequest");
    }

    #[test]
    fn decode_resolves_kind_once() {
        let object = AdmittedObject::decode(
            "Challenge",
            json!({
                "apiVersion": "acme.cert-manager.io/v1",
                "kind": "Challenge",
                "metadata": {"name": "shop-tls-1-2", "namespace": "prod"},
                "spec": {"type": "HTTP-01", "dnsName": "shop.example.com"},
            }),
        )
        .unwrap();
        assert_eq!(object.kind(), ResourceKind::Challenge);
        let value = object.into_value().unwrap();
        assert_eq!(value["kind"], "Challenge");
        assert_eq!(value["metadata"]["name"], "shop-tls-1-2");
    }

    #[test]
    fn decode_rejects_unknown_kinds() {
        assert!(matches!(
            AdmittedObject::decode("Deployment", json!({})),
            Err(DecodeError::UnknownKind { .. })
        ));
    }

    #[test]
    fn decode_reports_malformed_objects() {
        assert!(matches!(
            AdmittedObject::decode("Certificate", json!({"spec": "nope"})),
            Err(DecodeError::Deserialize {
                kind: ResourceKind::Certificate,
                ..
            })
        ));
    }
}
