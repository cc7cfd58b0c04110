//! Certificate authority for the osmosis interception proxy.
//!
//! The proxy terminates TLS for hosts it never owned, so it carries its own
//! root certificate and mints leaf certificates on demand: either from
//! scratch for a host name, or by cloning the metadata of a certificate
//! observed on the real upstream.

mod ca;

pub use ca::{load_or_generate, CertificateAuthority, IssuedLeaf};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate authority material not found: {0}")]
    NotFound(PathBuf),
    #[error("malformed certificate authority material: {0}")]
    Malformed(String),
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
