//! Request fingerprinting.
//!
//! A [`DigestGenerator`] turns a request into a stable [`Fingerprint`], or into
//! `None` when the request carries nothing usable to fingerprint. Strategies form
//! a closed set selected by name at configuration time ([`DigestStrategy`]).
//!
//! Every strategy renders the raw digest as the concatenated *signed decimal*
//! value of each byte (`0xCB` → `-53`), not hex. Fingerprints produced by older
//! deployments use this form, and replicated entries are keyed by it.

use std::{str::FromStr, sync::Arc};

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::key::Fingerprint;

pub const MD5_DIGEST_ALGORITHM: &str = "MD5";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("can not locate the algorithm provided for the digest generation: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unknown digest generator '{0}'")]
    UnknownGenerator(String),
}

/// The parts of a request a digest strategy may look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestView<'a> {
    /// Target address (endpoint URL) of the request.
    pub to: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl FromStr for DigestAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA-1" | "SHA1" => Ok(Self::Sha1),
            "SHA-256" | "SHA256" => Ok(Self::Sha256),
            _ => Err(DigestError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl DigestAlgorithm {
    /// Hashes the concatenation of `parts`.
    pub fn hash(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Md5 => hash_with::<Md5>(parts),
            Self::Sha1 => hash_with::<Sha1>(parts),
            Self::Sha256 => hash_with::<Sha256>(parts),
        }
    }
}

fn hash_with<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

pub trait DigestGenerator: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means "cannot cache this request".
    fn digest(&self, request: &RequestView<'_>) -> Result<Option<Fingerprint>, DigestError>;
}

/// Hashes the UTF-16BE encoded target address. The reference strategy.
#[derive(Debug, Clone)]
pub struct UrlDigest {
    algorithm: DigestAlgorithm,
}

impl UrlDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl Default for UrlDigest {
    fn default() -> Self {
        Self::new(DigestAlgorithm::Md5)
    }
}

impl DigestGenerator for UrlDigest {
    fn name(&self) -> &'static str {
        "url"
    }

    fn digest(&self, request: &RequestView<'_>) -> Result<Option<Fingerprint>, DigestError> {
        let Some(to) = request.to.filter(|to| !to.is_empty()) else {
            return Ok(None);
        };
        let digest = self.algorithm.hash(&[&utf16_be(to)]);
        Ok(Some(Fingerprint::new(signed_decimal(&digest))))
    }
}

/// Hashes the target address followed by the request body, so requests to the
/// same endpoint with different bodies get different fingerprints.
#[derive(Debug, Clone)]
pub struct PayloadDigest {
    algorithm: DigestAlgorithm,
}

impl PayloadDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl DigestGenerator for PayloadDigest {
    fn name(&self) -> &'static str {
        "payload"
    }

    fn digest(&self, request: &RequestView<'_>) -> Result<Option<Fingerprint>, DigestError> {
        let Some(to) = request.to.filter(|to| !to.is_empty()) else {
            return Ok(None);
        };
        let digest = self.algorithm.hash(&[&utf16_be(to), request.body]);
        Ok(Some(Fingerprint::new(signed_decimal(&digest))))
    }
}

/// Closed set of fingerprinting strategies, resolvable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestStrategy {
    Url,
    Payload,
}

impl FromStr for DigestStrategy {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "url" | "ReqUrlHashGenerator" | "org.riyafa.ReqUrlHashGenerator" => Ok(Self::Url),
            "payload" => Ok(Self::Payload),
            other => Err(DigestError::UnknownGenerator(other.to_string())),
        }
    }
}

impl DigestStrategy {
    pub fn build(self, algorithm: DigestAlgorithm) -> Arc<dyn DigestGenerator> {
        match self {
            Self::Url => Arc::new(UrlDigest::new(algorithm)),
            Self::Payload => Arc::new(PayloadDigest::new(algorithm)),
        }
    }
}

/// Resolves a generator name and algorithm name into a ready generator.
pub fn resolve_generator(
    name: &str,
    algorithm: &str,
) -> Result<Arc<dyn DigestGenerator>, DigestError> {
    let strategy: DigestStrategy = name.parse()?;
    let algorithm: DigestAlgorithm = algorithm.parse()?;
    Ok(strategy.build(algorithm))
}

/// UTF-16 big endian, no byte order mark.
fn utf16_be(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

/// Each byte as its signed decimal value, concatenated.
pub fn signed_decimal(bytes: &[u8]) -> String {
    bytes.iter().map(|b| (*b as i8).to_string()).collect()
}
