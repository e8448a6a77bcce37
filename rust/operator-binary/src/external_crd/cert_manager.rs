//! CRDs owned by [cert-manager](https://cert-manager.io/), see [their API docs](https://cert-manager.io/docs/reference/api-docs/).
//!
//! Only the fields the cache engine reads or writes are modelled, everything else is kept in
//! `extra` so that a mutated object serializes back without losing fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, ByteString},
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_TRUE: &str = "True";

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.Certificate>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    namespaced,
    derive = "PartialEq",
    status = "CertificateStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    pub issuer_ref: ObjectReference,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateStatus>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<Time>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Shared shape of `CertificateCondition` and `CertificateRequestCondition`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn ready(reason: &str, message: &str, last_transition_time: Option<Time>) -> Self {
        Self {
            type_: CONDITION_READY.to_string(),
            status: CONDITION_TRUE.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_transition_time,
            observed_generation: None,
        }
    }

    fn is_ready(&self) -> bool {
        self.type_ == CONDITION_READY && self.status == CONDITION_TRUE
    }
}

/// Replaces the condition of the same type, or appends it if there is none yet.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

impl Certificate {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.conditions.iter().any(Condition::is_ready))
    }
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequest>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    namespaced,
    derive = "PartialEq",
    status = "CertificateRequestStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    pub request: ByteString,
    pub issuer_ref: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.ObjectReference>.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERTIFICATE: &str = r#"
    apiVersion: cert-manager.io/v1
    kind: Certificate
    metadata:
      name: shop-tls
      namespace: prod
    spec:
      secretName: shop-tls
      dnsNames:
        - shop.example.com
      issuerRef:
        name: zerossl
        kind: ClusterIssuer
        group: cert-manager.io
      privateKey:
        rotationPolicy: Always
      usages:
        - digital signature
    status:
      conditions:
        - type: Issuing
          status: "False"
        - type: Ready
          status: "True"
          reason: Ready
      revision: 3
    "#;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let cert: Certificate = serde_yaml::from_str(CERTIFICATE).unwrap();
        let original: serde_json::Value = serde_yaml::from_str(CERTIFICATE).unwrap();
        assert_eq!(serde_json::to_value(&cert).unwrap(), original);
    }

    #[test]
    fn readiness_comes_from_the_ready_condition() {
        let mut cert: Certificate = serde_yaml::from_str(CERTIFICATE).unwrap();
        assert!(cert.is_ready());
        let status = cert.status.as_mut().unwrap();
        set_condition(
            &mut status.conditions,
            Condition {
                status: "False".to_string(),
                ..Condition::ready("Renewing", "renewal in progress", None)
            },
        );
        assert_eq!(status.conditions.len(), 2);
        assert!(!cert.is_ready());
    }
}
