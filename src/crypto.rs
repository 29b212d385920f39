//! # Cryptographic Infrastructure
//!
//! Cryptographic primitives for logmesh:
//!
//! - **Content Hashing**: BLAKE3 over a message's canonical encoding,
//!   used as the digest entry exchanged during query reconciliation
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//!
//! ## Security Properties
//!
//! - Domain separation prevents cross-protocol signature replay: a stored
//!   message signature can never double as a heartbeat signature and vice
//!   versa
//! - Only Ed25519 signatures are accepted; `verify_strict` rejects
//!   malleable encodings

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Identity, Keypair};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
/// Used across all logmesh signature verification (stored messages,
/// propagated payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: Domain separation prevents cross-protocol signature replay.
// Each signed data type in logmesh uses a unique prefix.

/// Domain separation prefix for stored stream message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"logmesh-message-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing.
/// Returns a 64-byte Ed25519 signature as a `Vec<u8>`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature
/// against the claimed signer's identity (public key).
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// 32-byte BLAKE3 content hash, the unit compared in query digests.
pub type ContentHash = [u8; 32];

/// Hash arbitrary content with BLAKE3.
#[inline]
pub fn content_hash(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}
