//! Decides the next cache transition of an Ingress
//!
//! [`decide`] is pure: the drivers gather the observations, call it, and carry out the returned
//! [`Action`]. Observations are gathered lazily, so a field that was not needed for an earlier
//! branch is left as [`None`].

use time::OffsetDateTime;

use crate::{annotations::IngressCacheState, cluster::Readiness, utils::add_one_month};

/// What was observed about an Ingress, and by which driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The Ingress is being admitted.
    Admission {
        cache_hit: bool,
        /// Only looked up on a cache miss.
        readiness: Option<Readiness>,
    },
    /// Periodic scan for Ingresses whose Certificate became ready.
    MarkScan { readiness: Readiness },
    /// Periodic scan for Ingresses waiting to be captured.
    CaptureScan {
        cache_hit: bool,
        /// Only looked up on a cache miss.
        readiness: Option<Readiness>,
        /// Expiry of the certificate in the live TLS Secret, only looked up once ready.
        live_not_after: Option<OffsetDateTime>,
    },
    /// Periodic scan for cached entries that are about to expire.
    CleanupScan {
        /// [`None`] if the entry is missing from the store or cannot be parsed.
        cache_not_after: Option<OffsetDateTime>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Skip(SkipReason),
    /// Set `cert-scheduled-for-save`.
    ScheduleForSave,
    /// Set `cert-cached` without capturing, the store already holds the entry.
    MarkCached,
    /// Copy the live TLS Secret into the store, then set `cert-cached`.
    Capture,
    /// Soft-delete the entry, re-arm the Ingress and clear the Certificate's `cert-cached`.
    EvictAndRearm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum SkipReason {
    OptedOut,
    /// The Ingress is not in the state this trigger acts on.
    OtherState,
    NotReady,
    CertificateMissing,
    SecretNotIssued,
    /// The live certificate has less than a month left, capturing it would be wasted.
    ExpiresTooSoon,
    NotExpiring,
}

fn readiness_skip(readiness: Option<Readiness>) -> Action {
    match readiness {
        Some(Readiness::Missing) => Action::Skip(SkipReason::CertificateMissing),
        _ => Action::Skip(SkipReason::NotReady),
    }
}

pub fn decide(state: IngressCacheState, trigger: Trigger, now: OffsetDateTime) -> Action {
    use IngressCacheState as S;

    if state == S::OptedOut {
        return Action::Skip(SkipReason::OptedOut);
    }
    match (state, trigger) {
        (S::Uncached, Trigger::Admission { cache_hit: true, .. }) => Action::MarkCached,
        (
            S::Uncached,
            Trigger::Admission {
                readiness: Some(Readiness::Ready),
                ..
            },
        ) => Action::ScheduleForSave,
        (S::Uncached, Trigger::Admission { readiness, .. }) => readiness_skip(readiness),

        (
            S::Uncached,
            Trigger::MarkScan {
                readiness: Readiness::Ready,
            },
        ) => Action::ScheduleForSave,
        (S::Uncached, Trigger::MarkScan { readiness }) => readiness_skip(Some(readiness)),

        // Serving from the existing entry wins over a redundant capture
        (S::ScheduledForSave, Trigger::CaptureScan { cache_hit: true, .. }) => Action::MarkCached,
        (
            S::ScheduledForSave,
            Trigger::CaptureScan {
                readiness: Some(Readiness::Ready),
                live_not_after,
                ..
            },
        ) => match live_not_after {
            None => Action::Skip(SkipReason::SecretNotIssued),
            Some(not_after) if not_after >= add_one_month(now) => Action::Capture,
            Some(_) => Action::Skip(SkipReason::ExpiresTooSoon),
        },
        (S::ScheduledForSave, Trigger::CaptureScan { readiness, .. }) => readiness_skip(readiness),

        (S::Cached, Trigger::CleanupScan { cache_not_after }) => match cache_not_after {
            Some(not_after) if not_after >= add_one_month(now) => {
                Action::Skip(SkipReason::NotExpiring)
            }
            // Expiring within a month, or the marker outlived its entry
            _ => Action::EvictAndRearm,
        },

        _ => Action::Skip(SkipReason::OtherState),
    }
}
