//! Peppered 3PID digest computation.
//!
//! Every published hash is `digest("<value> <label> <pepper>")` where the
//! label is `email` or `msisdn` (the protocol label for phone numbers).
//! Digests are encoded as unpadded URL-safe base64, the Matrix lookup
//! convention, so peers implementing the Matrix identity service API can
//! consume pushes directly.
//!
//! [`HashEngine`] is the seam between the jobs and the digest implementation:
//! the built-in engine is sha2-backed and always ready, but the trait keeps
//! an asynchronous readiness signal for engines that warm up out of process.

use crate::store::FieldKind;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use thiserror::Error;

/// Hashing errors.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("hash engine not ready: {0}")]
    NotReady(String),
}

/// Digest algorithms this service can speak on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Wire name as advertised in `hash_details`.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic digest provider.
#[async_trait]
pub trait HashEngine: Send + Sync {
    /// Algorithms this engine can compute, in preference order.
    fn supported_algorithms(&self) -> &[HashAlgorithm];

    /// Compute the digest of `input` under `algorithm`.
    fn digest(&self, algorithm: HashAlgorithm, input: &str) -> Result<String, HashError>;

    /// Resolves once the engine can serve digests.
    async fn ready(&self) -> Result<(), HashError>;
}

/// sha2-backed engine. Ready from construction.
#[derive(Debug, Clone)]
pub struct BuiltinHashEngine {
    algorithms: Vec<HashAlgorithm>,
}

impl BuiltinHashEngine {
    pub fn new() -> Self {
        Self::with_algorithms(vec![HashAlgorithm::Sha256, HashAlgorithm::Sha512])
    }

    /// Restrict (or reorder) the advertised algorithm set.
    pub fn with_algorithms(algorithms: Vec<HashAlgorithm>) -> Self {
        Self { algorithms }
    }
}

impl Default for BuiltinHashEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HashEngine for BuiltinHashEngine {
    fn supported_algorithms(&self) -> &[HashAlgorithm] {
        &self.algorithms
    }

    fn digest(&self, algorithm: HashAlgorithm, input: &str) -> Result<String, HashError> {
        let encoded = match algorithm {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(input.as_bytes());
                URL_SAFE_NO_PAD.encode(hasher.finalize())
            }
            HashAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                hasher.update(input.as_bytes());
                URL_SAFE_NO_PAD.encode(hasher.finalize())
            }
        };
        Ok(encoded)
    }

    async fn ready(&self) -> Result<(), HashError> {
        Ok(())
    }
}

/// Protocol label for a field in hash inputs.
///
/// Phone numbers hash under `msisdn`, never under the storage name `phone`.
pub fn hash_field_label(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Email => "email",
        FieldKind::Phone => "msisdn",
    }
}

/// Normalize a phone number for hashing: strip ASCII whitespace and one
/// leading `+`.
pub fn normalize_msisdn(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    stripped.strip_prefix('+').unwrap_or(&stripped).to_string()
}

/// The exact string fed into the digest function.
pub fn peppered_input(value: &str, label: &str, pepper: &str) -> String {
    format!("{value} {label} {pepper}")
}

/// Digest one 3PID field value under the given pepper, applying the
/// field-specific normalization and label.
pub fn field_digest<H: HashEngine + ?Sized>(
    engine: &H,
    algorithm: HashAlgorithm,
    kind: FieldKind,
    raw_value: &str,
    pepper: &str,
) -> Result<String, HashError> {
    let value = match kind {
        FieldKind::Email => raw_value.to_string(),
        FieldKind::Phone => normalize_msisdn(raw_value),
    };
    engine.digest(
        algorithm,
        &peppered_input(&value, hash_field_label(kind), pepper),
    )
}
