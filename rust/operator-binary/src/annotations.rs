//! Annotations that encode the cache state of Ingress and Certificate objects
//!
//! The engine never writes [`CACHE_CERTS`], it is owned by whoever owns the Ingress.

use std::collections::BTreeMap;

use stackable_operator::k8s_openapi::api::networking::v1::Ingress;

/// Opt-in switch, set by the owner of the Ingress.
pub const CACHE_CERTS: &str = "admissions.drmax.gl/cache-certs";
pub const CERT_SCHEDULED_FOR_SAVE: &str = "admissions.drmax.gl/cert-scheduled-for-save";
pub const CERT_CACHED: &str = "admissions.drmax.gl/cert-cached";
pub const CERT_CACHE_NAME: &str = "admissions.drmax.gl/cert-cache-name";
pub const CERT_CACHE_NAMESPACE: &str = "admissions.drmax.gl/cert-cache-namespace";
pub const TIME_OF_SYNC: &str = "admissions.drmax.gl/time-of-sync";

const TRUE: &str = "true";
const FALSE: &str = "false";

fn flag(annotations: Option<&BTreeMap<String, String>>, key: &str) -> bool {
    annotations
        .and_then(|annotations| annotations.get(key))
        .is_some_and(|value| value == TRUE)
}

/// Whether the object opted into certificate caching.
pub fn opted_in(annotations: Option<&BTreeMap<String, String>>) -> bool {
    flag(annotations, CACHE_CERTS)
}

/// Cache state of an Ingress, as far as the engine is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngressCacheState {
    /// `cache-certs` is absent or not `"true"`, the engine must leave the Ingress alone.
    OptedOut,
    Uncached,
    ScheduledForSave,
    Cached,
}

impl IngressCacheState {
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Self {
        if !opted_in(annotations) {
            Self::OptedOut
        } else if flag(annotations, CERT_CACHED) {
            // `cert-cached` wins if both flags were set by hand, the next transition rewrites both
            Self::Cached
        } else if flag(annotations, CERT_SCHEDULED_FOR_SAVE) {
            Self::ScheduledForSave
        } else {
            Self::Uncached
        }
    }

    pub fn of(ingress: &Ingress) -> Self {
        Self::from_annotations(ingress.metadata.annotations.as_ref())
    }
}

/// Cache provenance recorded on a Certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateCacheState {
    pub cached: bool,
    pub cache_name: Option<String>,
    pub cache_namespace: Option<String>,
    pub time_of_sync: Option<String>,
}

impl CertificateCacheState {
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Self {
        let get = |key: &str| annotations.and_then(|annotations| annotations.get(key)).cloned();
        Self {
            cached: flag(annotations, CERT_CACHED),
            cache_name: get(CERT_CACHE_NAME),
            cache_namespace: get(CERT_CACHE_NAMESPACE),
            time_of_sync: get(TIME_OF_SYNC),
        }
    }
}

/// A set of annotation values to write onto an object.
///
/// Deltas are applied to a fresh snapshot of the object on every write attempt, they never
/// carry state from an earlier attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotationDelta(BTreeMap<&'static str, String>);

impl AnnotationDelta {
    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    fn flag(self, key: &'static str, value: bool) -> Self {
        self.set(key, if value { TRUE } else { FALSE })
    }

    /// Ingress waits for the next capture run.
    pub fn scheduled_for_save() -> Self {
        Self::default()
            .flag(CERT_SCHEDULED_FOR_SAVE, true)
            .flag(CERT_CACHED, false)
    }

    /// Ingress (or Certificate) is backed by a cache entry.
    pub fn cached() -> Self {
        Self::default()
            .flag(CERT_CACHED, true)
            .flag(CERT_SCHEDULED_FOR_SAVE, false)
    }

    /// Certificate must go through a fresh issuance.
    pub fn certificate_evicted() -> Self {
        Self::default().flag(CERT_CACHED, false)
    }

    /// Certificate has been served from the cache entry `cache_name`.
    pub fn certificate_served(cache_name: &str, cache_namespace: &str, time_of_sync: &str) -> Self {
        Self::default()
            .flag(CERT_CACHED, true)
            .set(CERT_CACHE_NAME, cache_name)
            .set(CERT_CACHE_NAMESPACE, cache_namespace)
            .set(TIME_OF_SYNC, time_of_sync)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(key, value)| (*key, value.as_str()))
    }

    /// Returns `current` with this delta applied, leaving unrelated annotations untouched.
    pub fn applied_to(
        &self,
        current: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        let mut annotations = current.cloned().unwrap_or_default();
        annotations.extend(self.iter().map(|(key, value)| (key.to_string(), value.to_string())));
        annotations
    }

    /// Whether writing this delta onto `current` would be a no-op.
    pub fn is_satisfied_by(&self, current: Option<&BTreeMap<String, String>>) -> bool {
        self.iter().all(|(key, value)| {
            current
                .and_then(|annotations| annotations.get(key))
                .is_some_and(|current| current == value)
        })
    }
}
