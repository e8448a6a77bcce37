//! Inspection of PEM-encoded TLS material
//!
//! Only the leaf certificate is inspected, any chain certificates are carried along untouched.

use std::fmt::Debug;

use cert_cache_operator_utils::pem;
use openssl::{nid::Nid, x509::X509};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use time::OffsetDateTime;

use crate::utils::{asn1time_to_offsetdatetime, Asn1TimeParseError};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("material contains no PEM certificate"))]
    NoCertificate,

    #[snafu(display("failed to parse leaf certificate"))]
    ParseCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to read expiry of leaf certificate"))]
    ParseNotAfter { source: Asn1TimeParseError },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// A certificate (chain) together with its private key, both PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("cert_pem", &String::from_utf8_lossy(&self.cert_pem))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Identity fields of a leaf certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateSubject {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
}

impl CertificateMaterial {
    pub fn from_bundle(bundle: &[u8]) -> Option<Self> {
        pem::split_bundle(bundle).map(|(cert_pem, key_pem)| Self { cert_pem, key_pem })
    }

    pub fn to_bundle(&self) -> Vec<u8> {
        pem::encode_bundle(&self.cert_pem, &self.key_pem)
    }

    fn leaf(&self) -> Result<X509> {
        let leaf = pem::split_pem_certificates(&self.cert_pem)
            .into_iter()
            .next()
            .context(NoCertificateSnafu)?;
        X509::from_pem(leaf).context(ParseCertificateSnafu)
    }

    /// End of the leaf certificate's validity, always parsed from the PEM itself.
    pub fn not_after(&self) -> Result<OffsetDateTime> {
        asn1time_to_offsetdatetime(self.leaf()?.not_after()).context(ParseNotAfterSnafu)
    }

    pub fn subject(&self) -> Result<CertificateSubject> {
        let leaf = self.leaf()?;
        let common_name = leaf
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|cn| cn.to_string());
        let dns_names = leaf
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(CertificateSubject {
            common_name,
            dns_names,
        })
    }
}
