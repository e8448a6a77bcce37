//! Serves admitted Certificates from the cache
//!
//! A cached Certificate is made to look issued: its TLS Secret is written from the cache entry,
//! a synthetic CertificateRequest is created and its status is marked as ready, so that
//! cert-manager never goes back to the certificate authority for it.

use std::collections::BTreeMap;

use snafu::ResultExt as _;
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Secret,
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time},
        ByteString,
    },
    kube::{runtime::reflector::ObjectRef, Resource as _},
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info};

use super::{AdmittedObject, CreateSyntheticRequestSnafu, Error, MutationOutcome};
use crate::{
    annotations::{self, AnnotationDelta, CertificateCacheState},
    certificate::{CertificateMaterial, CertificateSubject},
    cluster::{
        kubernetes::tls_data, CertificateStatusPort as _, IngressAnnotationPort as _,
        TlsSecretPort as _,
    },
    external_crd::cert_manager::{
        set_condition, Certificate, CertificateRequest, CertificateRequestSpec,
        CertificateRequestStatus, CertificateStatus, Condition,
    },
    store::{CacheKey, CertStore as _},
    utils::to_kube_time,
    Ctx,
};

/// cert-manager renews certificates this long before they expire.
pub const RENEWAL_OFFSET: Duration = Duration::days(14);

pub const CONDITION_REASON_CACHED: &str = "Cached";
const CONDITION_MESSAGE_CACHED: &str = "Certificate is cached";
const SYNTHETIC_REQUEST_SUFFIX: &str = "-cached";
const PLACEHOLDER_CSR: &[u8] = b"cached-certificate-placeholder-csr";

const ANNOTATION_ALT_NAMES: &str = "cert-manager.io/alt-names";
const ANNOTATION_COMMON_NAME: &str = "cert-manager.io/common-name";
const ANNOTATION_CERTIFICATE_NAME: &str = "cert-manager.io/certificate-name";
const ANNOTATION_IP_SANS: &str = "cert-manager.io/ip-sans";
const ANNOTATION_URI_SANS: &str = "cert-manager.io/uri-sans";
const ANNOTATION_ISSUER_NAME: &str = "cert-manager.io/issuer-name";
const ANNOTATION_ISSUER_KIND: &str = "cert-manager.io/issuer-kind";
const ANNOTATION_ISSUER_GROUP: &str = "cert-manager.io/issuer-group";
const LABEL_FAO: &str = "controller.cert-manager.io/fao";

/// Whether the Certificate, or the Ingress it was created for, opted into caching.
async fn is_opted_in(
    ctx: &Ctx,
    certificate: &Certificate,
    namespace: &str,
) -> Result<bool, crate::cluster::Error> {
    if annotations::opted_in(certificate.metadata.annotations.as_ref()) {
        return Ok(true);
    }
    for owner in ingress_owners(certificate) {
        if let Some(ingress) = ctx.cluster.get_ingress(&owner.name, namespace).await? {
            if annotations::opted_in(ingress.metadata.annotations.as_ref()) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn ingress_owners(certificate: &Certificate) -> impl Iterator<Item = &OwnerReference> {
    certificate
        .metadata
        .owner_references
        .iter()
        .flatten()
        .filter(|owner| {
            owner.kind == "Ingress" && owner.api_version.starts_with("networking.k8s.io/")
        })
}

fn tls_secret(
    certificate: &Certificate,
    namespace: &str,
    material: &CertificateMaterial,
    subject: &CertificateSubject,
    provenance: &AnnotationDelta,
) -> Secret {
    let issuer = &certificate.spec.issuer_ref;
    let mut secret_annotations: BTreeMap<String, String> = [
        (ANNOTATION_ALT_NAMES, subject.dns_names.join(",")),
        (
            ANNOTATION_COMMON_NAME,
            subject.common_name.clone().unwrap_or_default(),
        ),
        (
            ANNOTATION_CERTIFICATE_NAME,
            certificate.metadata.name.clone().unwrap_or_default(),
        ),
        (ANNOTATION_IP_SANS, String::new()),
        (ANNOTATION_URI_SANS, String::new()),
        (ANNOTATION_ISSUER_NAME, issuer.name.clone()),
        (
            ANNOTATION_ISSUER_KIND,
            issuer.kind.clone().unwrap_or_else(|| "Issuer".to_string()),
        ),
        (
            ANNOTATION_ISSUER_GROUP,
            issuer
                .group
                .clone()
                .unwrap_or_else(|| "cert-manager.io".to_string()),
        ),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect();
    secret_annotations = provenance.applied_to(Some(&secret_annotations));
    Secret {
        metadata: ObjectMeta {
            name: Some(certificate.spec.secret_name.clone()),
            namespace: Some(namespace.to_string()),
            annotations: Some(secret_annotations),
            labels: Some(BTreeMap::from([(LABEL_FAO.to_string(), "true".to_string())])),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(tls_data(material)),
        ..Secret::default()
    }
}

fn synthetic_request(certificate: &Certificate, namespace: &str, now: Time) -> CertificateRequest {
    let name = certificate.metadata.name.as_deref().unwrap_or_default();
    let mut request = CertificateRequest::new(
        &format!("{name}{SYNTHETIC_REQUEST_SUFFIX}"),
        CertificateRequestSpec {
            request: ByteString(PLACEHOLDER_CSR.to_vec()),
            issuer_ref: certificate.spec.issuer_ref.clone(),
            duration: certificate.spec.duration.clone(),
        },
    );
    request.metadata.namespace = Some(namespace.to_string());
    request.metadata.owner_references = certificate
        .controller_owner_ref(&())
        .map(|owner| vec![owner]);
    request.status = Some(CertificateRequestStatus {
        conditions: vec![Condition::ready(
            CONDITION_REASON_CACHED,
            "Served from the certificate cache instead of being issued",
            Some(now),
        )],
    });
    request
}

pub(super) async fn mutate(
    ctx: &Ctx,
    mut certificate: Certificate,
    now: OffsetDateTime,
) -> Result<MutationOutcome, Error> {
    let (Some(name), Some(namespace)) = (
        certificate.metadata.name.clone(),
        certificate.metadata.namespace.clone(),
    ) else {
        debug!("admitted Certificate has no name or namespace yet, skipping");
        return Ok(MutationOutcome::Unchanged);
    };
    let certificate_ref = ObjectRef::<Certificate>::new(&name).within(&namespace);
    if CertificateCacheState::from_annotations(certificate.metadata.annotations.as_ref()).cached {
        debug!(certificate = %certificate_ref, "Certificate is already served from the cache");
        return Ok(MutationOutcome::Unchanged);
    }
    match is_opted_in(ctx, &certificate, &namespace).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(certificate = %certificate_ref, "Certificate did not opt into caching");
            return Ok(MutationOutcome::Unchanged);
        }
        Err(err) => {
            error!(
                certificate = %certificate_ref,
                error = &err as &dyn std::error::Error,
                "failed to look up owning Ingress, admitting Certificate unchanged"
            );
            return Ok(MutationOutcome::Unchanged);
        }
    }

    let key = CacheKey::new(&name, &namespace);
    let entry = match ctx.store.get(&key).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            debug!(
                certificate = %certificate_ref,
                cache.key = %key,
                "no cache entry, issuance proceeds normally"
            );
            return Ok(MutationOutcome::Unchanged);
        }
        Err(err) => {
            error!(
                certificate = %certificate_ref,
                cache.key = %key,
                error = &err as &dyn std::error::Error,
                "failed to read cache entry, admitting Certificate unchanged"
            );
            return Ok(MutationOutcome::Unchanged);
        }
    };
    let inspected = entry
        .not_after()
        .and_then(|not_after| Ok((not_after, entry.material.subject()?)));
    let (not_after, subject) = match inspected {
        Ok(inspected) => inspected,
        Err(err) => {
            error!(
                certificate = %certificate_ref,
                cache.key = %key,
                error = &err as &dyn std::error::Error,
                "cache entry holds an unreadable certificate, admitting Certificate unchanged"
            );
            return Ok(MutationOutcome::Unchanged);
        }
    };
    let times = to_kube_time(now)
        .and_then(|now| Ok((now, to_kube_time(not_after - RENEWAL_OFFSET)?)));
    let (sync_time, renewal_time) = match times {
        Ok(times) => times,
        Err(err) => {
            error!(
                certificate = %certificate_ref,
                error = &err as &dyn std::error::Error,
                "cached certificate has unrepresentable validity, admitting Certificate unchanged"
            );
            return Ok(MutationOutcome::Unchanged);
        }
    };
    let provenance = AnnotationDelta::certificate_served(
        key.as_str(),
        &namespace,
        &sync_time.0.to_rfc3339(),
    );

    let secret = tls_secret(&certificate, &namespace, &entry.material, &subject, &provenance);
    if let Err(err) = ctx.cluster.apply_tls_secret(&secret).await {
        error!(
            certificate = %certificate_ref,
            error = &err as &dyn std::error::Error,
            error.category = err.category(),
            "failed to restore TLS Secret from cache, admitting Certificate unchanged"
        );
        return Ok(MutationOutcome::Unchanged);
    }
    ctx.cluster
        .create_certificate_request(&synthetic_request(&certificate, &namespace, sync_time.clone()))
        .await
        .with_context(|_| CreateSyntheticRequestSnafu {
            certificate: certificate_ref.clone(),
        })?;

    let status = certificate.status.get_or_insert_with(CertificateStatus::default);
    set_condition(
        &mut status.conditions,
        Condition::ready(CONDITION_REASON_CACHED, CONDITION_MESSAGE_CACHED, Some(sync_time)),
    );
    status.renewal_time = Some(renewal_time);
    certificate.metadata.annotations =
        Some(provenance.applied_to(certificate.metadata.annotations.as_ref()));
    info!(
        certificate = %certificate_ref,
        cache.key = %key,
        %not_after,
        "served Certificate from cache"
    );
    Ok(MutationOutcome::Mutated(AdmittedObject::Certificate(Box::new(certificate))))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stackable_operator::k8s_openapi::api::networking::v1::Ingress;

    use super::*;
    use crate::{
        annotations::{CACHE_CERTS, CERT_CACHED, CERT_CACHE_NAME},
        cluster::kubernetes::tls_material,
        testing::{
            certificate, ingress, opted_in_ingress, self_signed, FakeCluster, MemoryCertStore,
        },
    };

    struct Setup {
        cluster: Arc<FakeCluster>,
        ctx: Ctx,
        material: CertificateMaterial,
        certificate: Certificate,
    }

    fn setup(owner: Ingress, cached: bool) -> Setup {
        let material = self_signed(
            "shop.example.com",
            OffsetDateTime::now_utc() + Duration::days(60),
        );
        let mut store = MemoryCertStore::default();
        if cached {
            store = store.with_entry(CacheKey::new("shop-tls", "prod"), material.clone());
        }
        let certificate = certificate("shop-tls", "prod", Some(&owner), false);
        let cluster = Arc::new(FakeCluster::default().with_ingress(owner));
        Setup {
            ctx: Ctx {
                cluster: cluster.clone(),
                store: Arc::new(store),
            },
            cluster,
            material,
            certificate,
        }
    }

    #[tokio::test]
    async fn cached_certificate_is_served() {
        let Setup {
            cluster,
            ctx,
            material,
            certificate,
        } = setup(opted_in_ingress("shop", "prod", "shop-tls"), true);
        let now = OffsetDateTime::now_utc();
        let MutationOutcome::Mutated(AdmittedObject::Certificate(served)) =
            mutate(&ctx, certificate, now).await.unwrap()
        else {
            panic!("cached Certificate should be mutated");
        };

        assert!(served.is_ready());
        let status = served.status.as_ref().unwrap();
        let ready = status
            .conditions
            .iter()
            .find(|condition| condition.type_ == "Ready")
            .unwrap();
        assert_eq!(ready.reason.as_deref(), Some(CONDITION_REASON_CACHED));
        let expected_renewal = material.not_after().unwrap() - RENEWAL_OFFSET;
        assert_eq!(
            status.renewal_time.as_ref().unwrap().0.timestamp(),
            expected_renewal.unix_timestamp()
        );
        let annotations = served.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[CERT_CACHED], "true");
        assert_eq!(annotations[CERT_CACHE_NAME], "shop-tls--prod");

        let secret = cluster.tls_secret("shop-tls", "prod").unwrap();
        assert_eq!(tls_material(&secret), Some(material));
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        let secret_annotations = secret.metadata.annotations.as_ref().unwrap();
        assert_eq!(secret_annotations[ANNOTATION_ALT_NAMES], "shop.example.com");
        assert_eq!(secret_annotations[ANNOTATION_ISSUER_KIND], "ClusterIssuer");

        let state = cluster.state();
        let request =
            &state.certificate_requests[&("prod".to_string(), "shop-tls-cached".to_string())];
        assert_eq!(
            request.metadata.owner_references.as_ref().unwrap()[0].kind,
            "Certificate"
        );
        assert_eq!(request.spec.issuer_ref.name, "zerossl");
    }

    #[tokio::test]
    async fn certificate_without_opted_in_owner_is_never_mutated() {
        let Setup {
            cluster,
            ctx,
            certificate,
            ..
        } = setup(ingress("shop", "prod", "shop-tls", &[]), true);
        assert_eq!(
            mutate(&ctx, certificate, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            MutationOutcome::Unchanged
        );
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn own_annotation_opts_in() {
        let Setup {
            ctx,
            mut certificate,
            ..
        } = setup(ingress("shop", "prod", "shop-tls", &[]), true);
        certificate.metadata.owner_references = None;
        certificate.metadata.annotations =
            Some(BTreeMap::from([(CACHE_CERTS.to_string(), "true".to_string())]));
        assert!(matches!(
            mutate(&ctx, certificate, OffsetDateTime::now_utc()).await.unwrap(),
            MutationOutcome::Mutated(_)
        ));
    }

    #[tokio::test]
    async fn cache_miss_leaves_certificate_alone() {
        let Setup {
            cluster,
            ctx,
            certificate,
            ..
        } = setup(opted_in_ingress("shop", "prod", "shop-tls"), false);
        assert_eq!(
            mutate(&ctx, certificate, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            MutationOutcome::Unchanged
        );
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn secret_write_failure_admits_unchanged() {
        let Setup {
            cluster,
            ctx,
            certificate,
            ..
        } = setup(opted_in_ingress("shop", "prod", "shop-tls"), true);
        cluster.state().fail_secret_writes = true;
        assert_eq!(
            mutate(&ctx, certificate, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            MutationOutcome::Unchanged
        );
        assert!(cluster.state().certificate_requests.is_empty());
    }

    #[tokio::test]
    async fn synthetic_request_failure_is_surfaced() {
        let Setup {
            cluster,
            ctx,
            certificate,
            ..
        } = setup(opted_in_ingress("shop", "prod", "shop-tls"), true);
        cluster.state().fail_certificate_requests = true;
        assert!(matches!(
            mutate(&ctx, certificate, OffsetDateTime::now_utc()).await,
            Err(Error::CreateSyntheticRequest { .. })
        ));
    }

    #[tokio::test]
    async fn repeated_admission_has_no_further_side_effects() {
        let Setup {
            cluster,
            ctx,
            certificate,
            ..
        } = setup(opted_in_ingress("shop", "prod", "shop-tls"), true);
        let now = OffsetDateTime::now_utc();
        let MutationOutcome::Mutated(AdmittedObject::Certificate(served)) =
            mutate(&ctx, certificate, now).await.unwrap()
        else {
            panic!("cached Certificate should be mutated");
        };
        let writes = cluster.writes();
        assert_eq!(
            mutate(&ctx, (*served).clone(), now).await.unwrap(),
            MutationOutcome::Unchanged
        );
        assert_eq!(cluster.writes(), writes);
    }
}
