//! Helpers shared between the cert-cache-operator components.

pub mod pem;
