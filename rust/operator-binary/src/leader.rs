//! Leader gate on a `coordination.k8s.io/v1` Lease
//!
//! Only the holder of the Lease runs the reconciliation jobs. Every write to the Lease is a
//! compare-and-swap on its `resourceVersion`, so two replicas can never both believe they took
//! it over. Leadership is published through a [`watch`] channel that turns `false` once the
//! Lease could not be renewed within [`RENEW_DEADLINE`].

use std::{sync::Arc, time::Duration};

use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::coordination::v1::{Lease, LeaseSpec},
        apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
        chrono::{self, DateTime, Utc},
    },
    kube::{
        self,
        api::{Api, PostParams},
        runtime::reflector::ObjectRef,
    },
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::utils::{api_error_code, HTTP_CONFLICT};

pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {lease}"))]
    GetLease {
        source: kube::Error,
        lease: ObjectRef<Lease>,
    },

    #[snafu(display("failed to create {lease}"))]
    CreateLease {
        source: kube::Error,
        lease: ObjectRef<Lease>,
    },

    #[snafu(display("failed to update {lease}"))]
    UpdateLease {
        source: kube::Error,
        lease: ObjectRef<Lease>,
    },

    #[snafu(display("failed to release {lease}"))]
    ReleaseLease {
        source: kube::Error,
        lease: ObjectRef<Lease>,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Who may hold the Lease right now, from the point of view of `identity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseClaim {
    /// `identity` holds it, and may renew it.
    Held,
    /// Nobody holds it (any longer), and it may be taken over.
    Available,
    /// Somebody else holds an unexpired Lease.
    Taken,
}

impl LeaseClaim {
    pub fn of(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> Self {
        let holder = spec.and_then(|spec| spec.holder_identity.as_deref());
        if holder == Some(identity) {
            return Self::Held;
        }
        let expires = spec.and_then(|spec| {
            let renewed = spec.renew_time.as_ref()?;
            let duration = spec.lease_duration_seconds?;
            Some(renewed.0 + chrono::Duration::seconds(i64::from(duration)))
        });
        match (holder, expires) {
            (Some(_), Some(expires)) if now <= expires => Self::Taken,
            _ => Self::Available,
        }
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    lease: ObjectRef<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(
        client: &stackable_operator::client::Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
    ) -> Self {
        Self {
            api: Api::namespaced(client.as_kube_client(), namespace),
            lease_name: lease_name.to_string(),
            lease: ObjectRef::new(lease_name).within(namespace),
            identity: identity.to_string(),
        }
    }

    fn spec(
        &self,
        now: DateTime<Utc>,
        acquire_time: Option<MicroTime>,
        transitions: i32,
    ) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time,
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }

    /// Waits until the Lease is acquired.
    ///
    /// API failures are logged and retried, they never end the wait.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, lease = %self.lease, "leadership acquired");
                    return self.guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        lease = %self.lease,
                        "Lease is held by another replica"
                    );
                }
                Err(err) => {
                    warn!(
                        identity = %self.identity,
                        error = &err as &dyn std::error::Error,
                        "failed to acquire Lease, retrying"
                    );
                }
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (leading_tx, leadership) = watch::channel(true);
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move { elector.renewal_loop(leading_tx).await });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            leadership,
        }
    }

    /// Whether this replica holds the Lease after the call.
    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let existing = self
            .api
            .get_opt(&self.lease_name)
            .await
            .with_context(|_| GetLeaseSnafu {
                lease: self.lease.clone(),
            })?;
        let Some(existing) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    namespace: self.lease.namespace.clone(),
                    ..ObjectMeta::default()
                },
                spec: Some(self.spec(now, Some(MicroTime(now)), 0)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Somebody else created it first
                Err(err) if api_error_code(&err) == Some(HTTP_CONFLICT) => Ok(false),
                Err(err) => Err(err).with_context(|_| CreateLeaseSnafu {
                    lease: self.lease.clone(),
                }),
            };
        };

        let spec = existing.spec.as_ref();
        let transitions = spec.and_then(|spec| spec.lease_transitions).unwrap_or(0);
        let updated_spec = match LeaseClaim::of(spec, &self.identity, now) {
            LeaseClaim::Taken => return Ok(false),
            LeaseClaim::Held => self.spec(
                now,
                spec.and_then(|spec| spec.acquire_time.clone()),
                transitions,
            ),
            LeaseClaim::Available => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "taking over expired Lease"
                );
                self.spec(now, Some(MicroTime(now)), transitions + 1)
            }
        };
        // Keeps the resourceVersion, so that the replace fails if anybody else wrote in between
        let mut updated = existing;
        updated.spec = Some(updated_spec);
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if api_error_code(&err) == Some(HTTP_CONFLICT) => Ok(false),
            Err(err) => Err(err).with_context(|_| UpdateLeaseSnafu {
                lease: self.lease.clone(),
            }),
        }
    }

    async fn renewal_loop(&self, leading: watch::Sender<bool>) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::time::sleep(RETRY_PERIOD).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    warn!(
                        identity = %self.identity,
                        lease = %self.lease,
                        "Lease was taken over, leadership lost"
                    );
                    break;
                }
                Err(err) if last_renewal.elapsed() >= RENEW_DEADLINE => {
                    warn!(
                        identity = %self.identity,
                        error = &err as &dyn std::error::Error,
                        "could not renew Lease within the deadline, leadership lost"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        identity = %self.identity,
                        error = &err as &dyn std::error::Error,
                        "failed to renew Lease, retrying"
                    );
                }
            }
        }
        let _ = leading.send(false);
    }

    /// Hands the Lease over right away, instead of letting it expire.
    ///
    /// The write carries the `resourceVersion` that was checked, so a Lease that was taken over in
    /// between is left alone.
    async fn release(&self) -> Result<()> {
        let lease = self
            .api
            .get_opt(&self.lease_name)
            .await
            .with_context(|_| GetLeaseSnafu {
                lease: self.lease.clone(),
            })?;
        let now = Utc::now();
        let Some(unheld) = lease.and_then(|lease| released(lease, &self.identity, now)) else {
            debug!(identity = %self.identity, "not holding the Lease, nothing to release");
            return Ok(());
        };
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &unheld)
            .await
        {
            Ok(_) => {
                info!(identity = %self.identity, lease = %self.lease, "released Lease");
                Ok(())
            }
            Err(err) if api_error_code(&err) == Some(HTTP_CONFLICT) => {
                debug!(identity = %self.identity, "Lease changed hands before it was released");
                Ok(())
            }
            Err(err) => Err(err).with_context(|_| ReleaseLeaseSnafu {
                lease: self.lease.clone(),
            }),
        }
    }
}

/// `lease` without a holder and already expired, if `identity` holds it.
fn released(mut lease: Lease, identity: &str, now: DateTime<Utc>) -> Option<Lease> {
    let spec = lease.spec.as_mut()?;
    if spec.holder_identity.as_deref() != Some(identity) {
        return None;
    }
    spec.holder_identity = None;
    spec.renew_time = Some(MicroTime(
        now - chrono::Duration::seconds(LEASE_DURATION.as_secs() as i64),
    ));
    Some(lease)
}

/// Held while this replica leads, the Lease is renewed in the background.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    leadership: watch::Receiver<bool>,
}

impl LeaderGuard {
    /// Turns `false` once leadership is lost, never turns back.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership.clone()
    }

    /// Stops renewing and releases the Lease for a fast failover.
    pub async fn release(self) -> Result<()> {
        self.renewal_task.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
