//! CRDs owned by other projects, which the cache engine reads and mutates but never installs

pub mod acme;
pub mod cert_manager;
