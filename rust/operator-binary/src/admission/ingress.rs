//! Discovers opted-in Ingresses as they are admitted

use stackable_operator::{
    k8s_openapi::api::networking::v1::Ingress, kube::runtime::reflector::ObjectRef,
};
use time::OffsetDateTime;
use tracing::{debug, error, info};

use super::{AdmittedObject, MutationOutcome};
use crate::{
    annotations::{AnnotationDelta, IngressCacheState},
    cluster::{ingress_tls_secret_name, CertificateStatusPort as _},
    state_machine::{decide, Action, Trigger},
    store::{CacheKey, CertStore as _},
    Ctx,
};

pub(super) async fn mutate(
    ctx: &Ctx,
    mut ingress: Ingress,
    now: OffsetDateTime,
) -> MutationOutcome {
    let state = IngressCacheState::of(&ingress);
    if !matches!(state, IngressCacheState::Uncached) {
        return MutationOutcome::Unchanged;
    }
    let (Some(name), Some(namespace)) = (
        ingress.metadata.name.clone(),
        ingress.metadata.namespace.clone(),
    ) else {
        debug!("admitted Ingress has no name or namespace yet, skipping");
        return MutationOutcome::Unchanged;
    };
    let ingress_ref = ObjectRef::<Ingress>::new(&name).within(&namespace);
    let Some(secret_name) = ingress_tls_secret_name(&ingress).map(str::to_string) else {
        debug!(ingress = %ingress_ref, "Ingress has no TLS secret, nothing to cache");
        return MutationOutcome::Unchanged;
    };

    let key = CacheKey::new(&secret_name, &namespace);
    let cache_hit = match ctx.store.exists(&key).await {
        Ok(cache_hit) => cache_hit,
        Err(err) => {
            error!(
                ingress = %ingress_ref,
                cache.key = %key,
                error = &err as &dyn std::error::Error,
                "failed to look up cache entry, admitting Ingress unchanged"
            );
            return MutationOutcome::Unchanged;
        }
    };
    let readiness = if cache_hit {
        None
    } else {
        match ctx
            .cluster
            .certificate_readiness(&secret_name, &namespace)
            .await
        {
            Ok(readiness) => Some(readiness),
            Err(err) => {
                error!(
                    ingress = %ingress_ref,
                    error = &err as &dyn std::error::Error,
                    error.category = err.category(),
                    "failed to check Certificate readiness, admitting Ingress unchanged"
                );
                return MutationOutcome::Unchanged;
            }
        }
    };

    let delta = match decide(state, Trigger::Admission { cache_hit, readiness }, now) {
        Action::MarkCached => {
            info!(
                ingress = %ingress_ref,
                cache.key = %key,
                "certificate already cached, marking Ingress as cached"
            );
            AnnotationDelta::cached()
        }
        Action::ScheduleForSave => {
            info!(ingress = %ingress_ref, "certificate is ready, scheduling it for caching");
            AnnotationDelta::scheduled_for_save()
        }
        Action::Skip(reason) => {
            debug!(
                ingress = %ingress_ref,
                reason = <&str>::from(reason),
                "leaving Ingress unchanged"
            );
            return MutationOutcome::Unchanged;
        }
        action @ (Action::Capture | Action::EvictAndRearm) => {
            debug!(ingress = %ingress_ref, ?action, "action is not carried out during admission");
            return MutationOutcome::Unchanged;
        }
    };
    ingress.metadata.annotations = Some(delta.applied_to(ingress.metadata.annotations.as_ref()));
    MutationOutcome::Mutated(AdmittedObject::Ingress(Box::new(ingress)))
}
