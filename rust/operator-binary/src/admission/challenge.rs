//! Keeps ACME Challenges alive through CA rate limiting
//!
//! cert-manager gives up on a Challenge once the ACME server rejects it, a `429 Too Many
//! Requests` included. Resetting such a Challenge to `pending` makes cert-manager try again later.

use stackable_operator::kube::runtime::reflector::ObjectRef;
use tracing::{debug, info};

use super::{AdmittedObject, MutationOutcome};
use crate::external_crd::acme::{Challenge, STATE_ERRORED, STATE_PENDING};

const RATE_LIMITED_MARKER: &str = "429";
const RATE_LIMITED_REASON: &str =
    "Rejected by the ACME server due to rate limiting, reset to pending so that it is retried";

pub(super) fn mutate(mut challenge: Challenge) -> MutationOutcome {
    let challenge_ref = ObjectRef::from_obj(&challenge);
    let Some(status) = challenge.status.as_mut() else {
        debug!(challenge = %challenge_ref, "Challenge has no status yet");
        return MutationOutcome::Unchanged;
    };
    let rate_limited = status.state.as_deref() == Some(STATE_ERRORED)
        && status
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains(RATE_LIMITED_MARKER));
    if !rate_limited {
        debug!(
            challenge = %challenge_ref,
            state = status.state.as_deref(),
            "Challenge was not rate limited, leaving it alone"
        );
        return MutationOutcome::Unchanged;
    }
    info!(
        challenge = %challenge_ref,
        reason = status.reason.as_deref(),
        "Challenge was rate limited, resetting it to pending"
    );
    status.state = Some(STATE_PENDING.to_string());
    status.reason = Some(RATE_LIMITED_REASON.to_string());
    MutationOutcome::Mutated(AdmittedObject::Challenge(Box::new(challenge)))
}
