//! In-memory fakes of the cluster and the cache store, plus fixture builders

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::PKey,
    x509::{extension::SubjectAlternativeName, X509Builder, X509NameBuilder},
};
use stackable_operator::{
    k8s_openapi::api::{core::v1::Secret, networking::v1::Ingress},
    kube::{self, api::entry::CommitError, runtime::reflector::ObjectRef, Resource as _},
};
use time::{Duration, OffsetDateTime};

use crate::{
    annotations::{AnnotationDelta, CACHE_CERTS},
    certificate::CertificateMaterial,
    cluster::{
        self, kubernetes::tls_material, CertificateStatusPort, IngressAnnotationPort,
        TlsSecretPort, WriteOutcome,
    },
    external_crd::cert_manager::{Certificate, CertificateRequest},
    store::{self, entry_from_bundle, CacheKey, CachedEntry, CertStore},
};

pub fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected failure with code {code}"),
        reason: "Injected".to_string(),
        code,
    })
}

/// A self-signed certificate for `common_name` (also its only DNS SAN), expiring at `not_after`.
pub fn self_signed(common_name: &str, not_after: OffsetDateTime) -> CertificateMaterial {
    let key = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
        .and_then(|group| EcKey::generate(&group))
        .and_then(PKey::from_ec_key)
        .unwrap();
    let subject_name = X509NameBuilder::new()
        .and_then(|mut name| {
            name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
            Ok(name)
        })
        .unwrap()
        .build();
    let not_before = not_after.min(OffsetDateTime::now_utc()) - Duration::days(1);
    let cert = X509Builder::new()
        .and_then(|mut x509| {
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(&subject_name)?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&key)?;
            let mut serial = BigNum::new()?;
            serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
            x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            let san = SubjectAlternativeName::new()
                .dns(common_name)
                .build(&x509.x509v3_context(None, None))?;
            x509.append_extension(san)?;
            x509.sign(&key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .unwrap()
        .build();
    CertificateMaterial {
        cert_pem: cert.to_pem().unwrap(),
        key_pem: key.private_key_to_pem_pkcs8().unwrap(),
    }
}

pub fn ingress(
    name: &str,
    namespace: &str,
    secret_name: &str,
    annotations: &[(&str, &str)],
) -> Ingress {
    let mut ingress: Ingress = serde_yaml::from_str(&format!(
        r#"
        apiVersion: networking.k8s.io/v1
        kind: Ingress
        metadata:
          name: {name}
          namespace: {namespace}
          uid: {name}-uid
        spec:
          tls:
            - secretName: {secret_name}
              hosts:
                - {name}.example.com
        "#
    ))
    .unwrap();
    ingress.metadata.annotations = Some(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    ingress
}

pub fn opted_in_ingress(name: &str, namespace: &str, secret_name: &str) -> Ingress {
    ingress(name, namespace, secret_name, &[(CACHE_CERTS, "true")])
}

/// A Certificate created for `owner` the way cert-manager's ingress-shim does it.
pub fn certificate(
    name: &str,
    namespace: &str,
    owner: Option<&Ingress>,
    ready: bool,
) -> Certificate {
    let mut certificate: Certificate = serde_yaml::from_str(&format!(
        r#"
        apiVersion: cert-manager.io/v1
        kind: Certificate
        metadata:
          name: {name}
          namespace: {namespace}
          uid: {name}-certificate-uid
        spec:
          secretName: {name}
          dnsNames:
            - {name}.example.com
          issuerRef:
            name: zerossl
            kind: ClusterIssuer
            group: cert-manager.io
        status:
          conditions:
            - type: Ready
              status: "{ready}"
              reason: {reason}
        "#,
        ready = if ready { "True" } else { "False" },
        reason = if ready { "Ready" } else { "Issuing" },
    ))
    .unwrap();
    if let Some(owner) = owner {
        certificate.metadata.owner_references = owner
            .controller_owner_ref(&())
            .map(|owner_ref| vec![owner_ref]);
    }
    certificate
}

type Key = (String, String);

fn key_of(name: &str, namespace: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
pub struct FakeClusterState {
    pub ingresses: BTreeMap<Key, Ingress>,
    pub certificates: BTreeMap<Key, Certificate>,
    pub secrets: BTreeMap<Key, Secret>,
    pub certificate_requests: BTreeMap<Key, CertificateRequest>,
    /// Every successful write, as `<kind>/<namespace>/<name>`.
    pub writes: Vec<String>,
    /// Names of objects whose reads and writes fail.
    pub failing: BTreeSet<String>,
    pub fail_certificate_requests: bool,
    pub fail_secret_writes: bool,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeClusterState>,
}

impl FakeCluster {
    pub fn state(&self) -> MutexGuard<'_, FakeClusterState> {
        self.state.lock().unwrap()
    }

    pub fn with_ingress(self, ingress: Ingress) -> Self {
        let key = key_of(
            ingress.metadata.name.as_deref().unwrap(),
            ingress.metadata.namespace.as_deref().unwrap(),
        );
        self.state().ingresses.insert(key, ingress);
        self
    }

    pub fn with_certificate(self, certificate: Certificate) -> Self {
        let key = key_of(
            certificate.metadata.name.as_deref().unwrap(),
            certificate.metadata.namespace.as_deref().unwrap(),
        );
        self.state().certificates.insert(key, certificate);
        self
    }

    pub fn with_tls_secret(
        self,
        name: &str,
        namespace: &str,
        material: &CertificateMaterial,
    ) -> Self {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(cluster::kubernetes::tls_data(material)),
            ..Secret::default()
        };
        self.state().secrets.insert(key_of(name, namespace), secret);
        self
    }

    pub fn failing(self, name: &str) -> Self {
        self.state().failing.insert(name.to_string());
        self
    }

    pub fn ingress(&self, name: &str, namespace: &str) -> Ingress {
        self.state().ingresses[&key_of(name, namespace)].clone()
    }

    pub fn certificate(&self, name: &str, namespace: &str) -> Certificate {
        self.state().certificates[&key_of(name, namespace)].clone()
    }

    pub fn tls_secret(&self, name: &str, namespace: &str) -> Option<Secret> {
        self.state().secrets.get(&key_of(name, namespace)).cloned()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }
}

#[async_trait]
impl IngressAnnotationPort for FakeCluster {
    async fn list_ingresses(&self) -> cluster::Result<Vec<Ingress>> {
        Ok(self.state().ingresses.values().cloned().collect())
    }

    async fn get_ingress(&self, name: &str, namespace: &str) -> cluster::Result<Option<Ingress>> {
        let state = self.state();
        if state.failing.contains(name) {
            return Err(cluster::Error::GetIngress {
                source: api_error(503),
                ingress: ObjectRef::new(name).within(namespace),
            });
        }
        Ok(state.ingresses.get(&key_of(name, namespace)).cloned())
    }

    async fn update_ingress_annotations(
        &self,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> cluster::Result<WriteOutcome> {
        let mut state = self.state();
        if state.failing.contains(name) {
            return Err(cluster::Error::UpdateIngress {
                source: CommitError::Save(api_error(503)),
                ingress: ObjectRef::new(name).within(namespace),
            });
        }
        let Some(ingress) = state.ingresses.get_mut(&key_of(name, namespace)) else {
            return Ok(WriteOutcome::Missing);
        };
        if delta.is_satisfied_by(ingress.metadata.annotations.as_ref()) {
            return Ok(WriteOutcome::AlreadySatisfied);
        }
        ingress.metadata.annotations =
            Some(delta.applied_to(ingress.metadata.annotations.as_ref()));
        state.writes.push(format!("ingress/{namespace}/{name}"));
        Ok(WriteOutcome::Written)
    }
}

#[async_trait]
impl CertificateStatusPort for FakeCluster {
    async fn get_certificate(
        &self,
        name: &str,
        namespace: &str,
    ) -> cluster::Result<Option<Certificate>> {
        let state = self.state();
        if state.failing.contains(name) {
            return Err(cluster::Error::GetCertificate {
                source: api_error(503),
                certificate: ObjectRef::new(name).within(namespace),
            });
        }
        Ok(state.certificates.get(&key_of(name, namespace)).cloned())
    }

    async fn update_certificate_annotations(
        &self,
        name: &str,
        namespace: &str,
        delta: &AnnotationDelta,
    ) -> cluster::Result<WriteOutcome> {
        let mut state = self.state();
        if state.failing.contains(name) {
            return Err(cluster::Error::UpdateCertificate {
                source: CommitError::Save(api_error(503)),
                certificate: ObjectRef::new(name).within(namespace),
            });
        }
        let Some(certificate) = state.certificates.get_mut(&key_of(name, namespace)) else {
            return Ok(WriteOutcome::Missing);
        };
        if delta.is_satisfied_by(certificate.metadata.annotations.as_ref()) {
            return Ok(WriteOutcome::AlreadySatisfied);
        }
        certificate.metadata.annotations =
            Some(delta.applied_to(certificate.metadata.annotations.as_ref()));
        state.writes.push(format!("certificate/{namespace}/{name}"));
        Ok(WriteOutcome::Written)
    }

    async fn create_certificate_request(
        &self,
        request: &CertificateRequest,
    ) -> cluster::Result<()> {
        let name = request.metadata.name.clone().unwrap_or_default();
        let namespace = request.metadata.namespace.clone().unwrap_or_default();
        let mut state = self.state();
        if state.fail_certificate_requests {
            return Err(cluster::Error::CreateCertificateRequest {
                source: api_error(403),
                request: ObjectRef::new(&name).within(&namespace),
            });
        }
        let key = key_of(&name, &namespace);
        if !state.certificate_requests.contains_key(&key) {
            state.certificate_requests.insert(key, request.clone());
            state
                .writes
                .push(format!("certificaterequest/{namespace}/{name}"));
        }
        Ok(())
    }
}

#[async_trait]
impl TlsSecretPort for FakeCluster {
    async fn read_tls_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> cluster::Result<Option<CertificateMaterial>> {
        let state = self.state();
        if state.failing.contains(name) {
            return Err(cluster::Error::GetSecret {
                source: api_error(503),
                secret: ObjectRef::new(name).within(namespace),
            });
        }
        Ok(state
            .secrets
            .get(&key_of(name, namespace))
            .and_then(tls_material))
    }

    async fn apply_tls_secret(&self, secret: &Secret) -> cluster::Result<()> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let mut state = self.state();
        if state.fail_secret_writes {
            return Err(cluster::Error::ApplySecret {
                source: api_error(500),
                secret: ObjectRef::new(&name).within(&namespace),
            });
        }
        let key = key_of(&name, &namespace);
        if state.secrets.get(&key) != Some(secret) {
            state.secrets.insert(key, secret.clone());
            state.writes.push(format!("secret/{namespace}/{name}"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryEntry {
    pub material: CertificateMaterial,
    pub deleted: bool,
}

#[derive(Default)]
pub struct MemoryCertStoreState {
    pub entries: BTreeMap<CacheKey, MemoryEntry>,
    /// Keys whose operations fail.
    pub failing: BTreeSet<CacheKey>,
    pub stores: usize,
}

#[derive(Default)]
pub struct MemoryCertStore {
    state: Mutex<MemoryCertStoreState>,
}

impl MemoryCertStore {
    pub fn state(&self) -> MutexGuard<'_, MemoryCertStoreState> {
        self.state.lock().unwrap()
    }

    pub fn with_entry(self, key: CacheKey, material: CertificateMaterial) -> Self {
        self.state().entries.insert(
            key,
            MemoryEntry {
                material,
                deleted: false,
            },
        );
        self
    }

    pub fn with_deleted_entry(self, key: CacheKey, material: CertificateMaterial) -> Self {
        self.state().entries.insert(
            key,
            MemoryEntry {
                material,
                deleted: true,
            },
        );
        self
    }

    /// An entry whose bundle lost its private key.
    pub fn with_malformed_entry(self, key: CacheKey, material: CertificateMaterial) -> Self {
        self.with_entry(
            key,
            CertificateMaterial {
                key_pem: Vec::new(),
                ..material
            },
        )
    }

    pub fn failing(self, key: CacheKey) -> Self {
        self.state().failing.insert(key);
        self
    }

    pub fn entry(&self, key: &CacheKey) -> Option<MemoryEntry> {
        self.state().entries.get(key).cloned()
    }

    fn check(&self, key: &CacheKey) -> Result<(), kube::Error> {
        if self.state().failing.contains(key) {
            Err(api_error(503))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CertStore for MemoryCertStore {
    async fn store(&self, key: &CacheKey, material: &CertificateMaterial) -> store::Result<()> {
        self.check(key).map_err(|source| store::Error::WriteEntry {
            source: source.into(),
            key: key.clone(),
        })?;
        let mut state = self.state();
        state.entries.insert(
            key.clone(),
            MemoryEntry {
                material: material.clone(),
                deleted: false,
            },
        );
        state.stores += 1;
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> store::Result<Option<CachedEntry>> {
        self.check(key).map_err(|source| store::Error::ReadEntry {
            source: source.into(),
            key: key.clone(),
        })?;
        let state = self.state();
        let Some(entry) = state.entries.get(key).filter(|entry| !entry.deleted) else {
            return Ok(None);
        };
        Ok(entry_from_bundle(key, Some(&entry.material.to_bundle()[..])))
    }

    async fn delete(&self, key: &CacheKey) -> store::Result<()> {
        self.check(key).map_err(|source| store::Error::DeleteEntry {
            source: source.into(),
            key: key.clone(),
        })?;
        if let Some(entry) = self.state().entries.get_mut(key) {
            entry.deleted = true;
        }
        Ok(())
    }

    async fn list_pending_purge(&self) -> store::Result<Vec<CacheKey>> {
        Ok(self
            .state()
            .entries
            .iter()
            .filter(|(_, entry)| entry.deleted)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn purge(&self, key: &CacheKey) -> store::Result<()> {
        self.check(key).map_err(|source| store::Error::PurgeEntry {
            source: source.into(),
            key: key.clone(),
        })?;
        self.state().entries.remove(key);
        Ok(())
    }
}
