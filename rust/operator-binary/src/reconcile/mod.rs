//! Periodic reconciliation of the cache
//!
//! Each [`Job`] scans every Ingress (or every soft-deleted cache entry), runs the state machine
//! for it and carries out the returned action. A failing item is logged and skipped, the rest of
//! the batch is still processed.

pub mod schedule;

use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::api::networking::v1::Ingress, kube::runtime::reflector::ObjectRef,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::{
    annotations::{AnnotationDelta, IngressCacheState},
    certificate,
    cluster::{
        self, ingress_tls_secret_name, CertificateStatusPort as _, IngressAnnotationPort as _,
        Readiness, TlsSecretPort as _, WriteOutcome,
    },
    external_crd::cert_manager::Certificate,
    state_machine::{decide, Action, Trigger},
    store::{self, CacheKey, CertStore as _},
    Ctx,
};

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to list Ingresses"))]
    ListIngresses { source: cluster::Error },

    #[snafu(display("failed to list cache entries pending purge"))]
    ListPendingPurge { source: store::Error },

    #[snafu(display("failed to check readiness of the Certificate for {ingress}"))]
    CheckReadiness {
        source: cluster::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to read the TLS Secret of {ingress}"))]
    ReadTlsSecret {
        source: cluster::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("the TLS Secret of {ingress} holds an unreadable certificate"))]
    ParseLiveCertificate {
        source: certificate::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to look up cache entry for {ingress}"))]
    LookUpEntry {
        source: store::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to capture the certificate of {ingress}"))]
    CaptureEntry {
        source: store::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to evict the cache entry of {ingress}"))]
    EvictEntry {
        source: store::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to update annotations of {ingress}"))]
    AnnotateIngress {
        source: cluster::Error,
        ingress: ObjectRef<Ingress>,
    },

    #[snafu(display("failed to clear the cache marker of {certificate}"))]
    ClearCertificateMarker {
        source: cluster::Error,
        certificate: ObjectRef<Certificate>,
    },

    #[snafu(display("failed to purge cache entry"))]
    PurgeEntry { source: store::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Job {
    /// Schedules opted-in Ingresses whose Certificate became ready.
    CheckAndMark,
    /// Captures the live certificate of scheduled Ingresses.
    CheckAndCache,
    /// Evicts cache entries that expire within a month.
    CleanupExpiring,
    /// Purges soft-deleted cache entries.
    PurgeDeleted,
}

impl Job {
    pub async fn run(self, ctx: &Ctx, now: OffsetDateTime) -> Result<JobReport> {
        let report = match self {
            Job::CheckAndMark => check_and_mark(ctx, now).await,
            Job::CheckAndCache => check_and_cache(ctx, now).await,
            Job::CleanupExpiring => cleanup_expiring(ctx, now).await,
            Job::PurgeDeleted => purge_deleted(ctx).await,
        }?;
        info!(
            job = <&str>::from(self),
            examined = report.examined,
            changed = report.changed,
            failed = report.failed,
            "reconciliation job finished"
        );
        Ok(report)
    }
}

/// Counts of one job run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobReport {
    pub examined: usize,
    pub changed: usize,
    pub failed: usize,
}

impl JobReport {
    fn record(&mut self, job: Job, outcome: Result<bool>) {
        self.examined += 1;
        match outcome {
            Ok(true) => self.changed += 1,
            Ok(false) => {}
            Err(err) => {
                self.failed += 1;
                error!(
                    job = <&str>::from(job),
                    error = &err as &dyn std::error::Error,
                    error.category = err.category(),
                    "skipping item until the next run"
                );
            }
        }
    }
}

/// An opted-in Ingress in the state a job acts on.
struct Target {
    ingress: ObjectRef<Ingress>,
    name: String,
    namespace: String,
    secret_name: String,
    state: IngressCacheState,
}

impl Target {
    fn of(ingress: &Ingress) -> Option<Self> {
        Some(Self {
            ingress: ObjectRef::from_obj(ingress),
            name: ingress.metadata.name.clone()?,
            namespace: ingress.metadata.namespace.clone()?,
            secret_name: ingress_tls_secret_name(ingress)?.to_string(),
            state: IngressCacheState::of(ingress),
        })
    }

    fn key(&self) -> CacheKey {
        CacheKey::new(&self.secret_name, &self.namespace)
    }

    /// Whether anything was written.
    async fn annotate(&self, ctx: &Ctx, delta: &AnnotationDelta) -> Result<bool> {
        let outcome = ctx
            .cluster
            .update_ingress_annotations(&self.name, &self.namespace, delta)
            .await
            .with_context(|_| AnnotateIngressSnafu {
                ingress: self.ingress.clone(),
            })?;
        if outcome == WriteOutcome::Missing {
            debug!(ingress = %self.ingress, "Ingress disappeared before it could be updated");
        }
        Ok(outcome == WriteOutcome::Written)
    }

    async fn readiness(&self, ctx: &Ctx) -> Result<Readiness> {
        ctx.cluster
            .certificate_readiness(&self.secret_name, &self.namespace)
            .await
            .with_context(|_| CheckReadinessSnafu {
                ingress: self.ingress.clone(),
            })
    }

    fn skipped(&self, action: Action) -> Result<bool> {
        match action {
            Action::Skip(reason) => debug!(
                ingress = %self.ingress,
                reason = <&str>::from(reason),
                "leaving Ingress unchanged"
            ),
            action => debug!(
                ingress = %self.ingress,
                ?action,
                "action is not carried out by this job"
            ),
        }
        Ok(false)
    }
}

/// Opted-in Ingresses currently in `state`.
async fn targets(ctx: &Ctx, state: IngressCacheState) -> Result<Vec<Target>> {
    let ingresses = ctx.cluster.list_ingresses().await.context(ListIngressesSnafu)?;
    Ok(ingresses
        .iter()
        .filter(|ingress| IngressCacheState::of(ingress) == state)
        .filter_map(|ingress| {
            let target = Target::of(ingress);
            if target.is_none() {
                debug!(
                    ingress = %ObjectRef::from_obj(ingress),
                    "opted-in Ingress has no TLS secret, ignoring it"
                );
            }
            target
        })
        .collect())
}

pub async fn check_and_mark(ctx: &Ctx, now: OffsetDateTime) -> Result<JobReport> {
    let mut report = JobReport::default();
    for target in targets(ctx, IngressCacheState::Uncached).await? {
        let outcome = async {
            let readiness = target.readiness(ctx).await?;
            match decide(target.state, Trigger::MarkScan { readiness }, now) {
                Action::ScheduleForSave => {
                    info!(
                        ingress = %target.ingress,
                        "certificate is ready, scheduling it for caching"
                    );
                    target.annotate(ctx, &AnnotationDelta::scheduled_for_save()).await
                }
                action => target.skipped(action),
            }
        };
        report.record(Job::CheckAndMark, outcome.await);
    }
    Ok(report)
}

async fn capture(ctx: &Ctx, target: &Target, now: OffsetDateTime) -> Result<bool> {
    let key = target.key();
    let cache_hit = ctx
        .store
        .exists(&key)
        .await
        .with_context(|_| LookUpEntrySnafu {
            ingress: target.ingress.clone(),
        })?;
    let (readiness, live) = if cache_hit {
        (None, None)
    } else {
        let readiness = target.readiness(ctx).await?;
        let live = if readiness == Readiness::Ready {
            ctx.cluster
                .read_tls_secret(&target.secret_name, &target.namespace)
                .await
                .with_context(|_| ReadTlsSecretSnafu {
                    ingress: target.ingress.clone(),
                })?
        } else {
            None
        };
        (Some(readiness), live)
    };
    let live_not_after = live
        .as_ref()
        .map(|material| material.not_after())
        .transpose()
        .with_context(|_| ParseLiveCertificateSnafu {
            ingress: target.ingress.clone(),
        })?;

    let trigger = Trigger::CaptureScan {
        cache_hit,
        readiness,
        live_not_after,
    };
    match (decide(target.state, trigger, now), live) {
        (Action::MarkCached, _) => {
            info!(
                ingress = %target.ingress,
                cache.key = %key,
                "certificate already cached, marking Ingress as cached"
            );
            target.annotate(ctx, &AnnotationDelta::cached()).await
        }
        (Action::Capture, Some(material)) => {
            ctx.store
                .store(&key, &material)
                .await
                .with_context(|_| CaptureEntrySnafu {
                    ingress: target.ingress.clone(),
                })?;
            info!(
                ingress = %target.ingress,
                cache.key = %key,
                not_after = ?live_not_after,
                "captured certificate into the cache"
            );
            target.annotate(ctx, &AnnotationDelta::cached()).await?;
            Ok(true)
        }
        (action, _) => target.skipped(action),
    }
}

pub async fn check_and_cache(ctx: &Ctx, now: OffsetDateTime) -> Result<JobReport> {
    let mut report = JobReport::default();
    for target in targets(ctx, IngressCacheState::ScheduledForSave).await? {
        report.record(Job::CheckAndCache, capture(ctx, &target, now).await);
    }
    Ok(report)
}

async fn evict_if_expiring(ctx: &Ctx, target: &Target, now: OffsetDateTime) -> Result<bool> {
    let key = target.key();
    let entry = ctx
        .store
        .get(&key)
        .await
        .with_context(|_| LookUpEntrySnafu {
            ingress: target.ingress.clone(),
        })?;
    let cache_not_after = match entry.as_ref().map(|entry| entry.not_after()) {
        None => {
            warn!(
                ingress = %target.ingress,
                cache.key = %key,
                "Ingress is marked as cached, but the cache holds no entry"
            );
            None
        }
        Some(Ok(not_after)) => Some(not_after),
        Some(Err(err)) => {
            warn!(
                ingress = %target.ingress,
                cache.key = %key,
                error = &err as &dyn std::error::Error,
                "cache entry holds an unreadable certificate, treating it as expired"
            );
            None
        }
    };

    match decide(target.state, Trigger::CleanupScan { cache_not_after }, now) {
        Action::EvictAndRearm => {
            ctx.store
                .delete(&key)
                .await
                .with_context(|_| EvictEntrySnafu {
                    ingress: target.ingress.clone(),
                })?;
            // cert-manager names the Certificate of an Ingress after its TLS secret.
            // The Ingress stays cached until the marker is gone, so a failure here is retried.
            ctx.cluster
                .update_certificate_annotations(
                    &target.secret_name,
                    &target.namespace,
                    &AnnotationDelta::certificate_evicted(),
                )
                .await
                .with_context(|_| ClearCertificateMarkerSnafu {
                    certificate: ObjectRef::new(&target.secret_name).within(&target.namespace),
                })?;
            target
                .annotate(ctx, &AnnotationDelta::scheduled_for_save())
                .await?;
            info!(
                ingress = %target.ingress,
                cache.key = %key,
                not_after = ?cache_not_after,
                "evicted expiring certificate, Ingress will be captured again once reissued"
            );
            Ok(true)
        }
        action => target.skipped(action),
    }
}

pub async fn cleanup_expiring(ctx: &Ctx, now: OffsetDateTime) -> Result<JobReport> {
    let mut report = JobReport::default();
    for target in targets(ctx, IngressCacheState::Cached).await? {
        report.record(
            Job::CleanupExpiring,
            evict_if_expiring(ctx, &target, now).await,
        );
    }
    Ok(report)
}

pub async fn purge_deleted(ctx: &Ctx) -> Result<JobReport> {
    let mut report = JobReport::default();
    for key in ctx
        .store
        .list_pending_purge()
        .await
        .context(ListPendingPurgeSnafu)?
    {
        let outcome = ctx.store.purge(&key).await.context(PurgeEntrySnafu).map(|()| {
            info!(cache.key = %key, "purged soft-deleted cache entry");
            true
        });
        report.record(Job::PurgeDeleted, outcome);
    }
    Ok(report)
}
