//! Caches TLS certificates issued by cert-manager, so that they can be restored without going
//! back to a rate-limited certificate authority.
//!
//! The binary runs the reconciliation jobs on the replica holding the leader Lease. Admission
//! is served by every replica, through the webhook server the handler is embedded into.
//!
//! # Embedding the admission path
//!
//! Build one [`admission::AdmissionHandler`] from a [`Ctx`] wired like the one in `main.rs`, and
//! call it for every `AdmissionReview` of an Ingress, Certificate or Challenge. The returned
//! object is patched in, an error rejects the request with its full message, and anything else
//! admits the object unchanged:
//!
//! ```no_run
//! use cert_cache_operator::admission::{AdmissionHandler, AdmittedObject, MutationOutcome};
//!
//! /// `Ok(Some(_))` is the object to patch in, `Ok(None)` admits it unchanged.
//! async fn review(
//!     handler: &AdmissionHandler,
//!     kind: &str,
//!     object: serde_json::Value,
//! ) -> Result<Option<serde_json::Value>, String> {
//!     let Ok(object) = AdmittedObject::decode(kind, object) else {
//!         return Ok(None);
//!     };
//!     match handler.mutate(object).await {
//!         Ok(MutationOutcome::Mutated(mutated)) => Ok(mutated.into_value().ok()),
//!         Ok(MutationOutcome::Unchanged) => Ok(None),
//!         Err(err) => Err(err.rejection_message()),
//!     }
//! }
//! ```

use std::sync::Arc;

pub mod admission;
pub mod annotations;
pub mod certificate;
pub mod cluster;
pub mod external_crd;
pub mod leader;
pub mod reconcile;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

pub const FIELD_MANAGER: &str = "admissions.drmax.gl";

/// Shared by the admission path and the reconciliation jobs.
pub struct Ctx {
    pub cluster: Arc<dyn cluster::Cluster>,
    pub store: Arc<dyn store::CertStore>,
}
