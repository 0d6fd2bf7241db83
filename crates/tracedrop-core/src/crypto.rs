//! Signing material and the credential triple carried with every signed upload.
//!
//! # Nonce binding
//!
//! ```text
//! nonce = base64url_nopad(SHA256(signature_der)[..8])
//! ```
//!
//! The nonce is the object key of the upload, so two uploads can only share
//! an address if they share a signature.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Number of entropy bytes in an upload nonce.
pub const NONCE_BYTES: usize = 8;

/// Public key, signature and content-derived nonce for one signed payload.
///
/// Immutable once created; it may be embedded in and extracted from package
/// trailers any number of times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoData {
    /// SPKI PEM of the signing key.
    pub public_key: String,
    /// DER ECDSA signature, base64url without padding.
    pub signature: String,
    /// First 8 bytes of SHA-256(signature), base64url without padding.
    pub nonce: String,
}

impl CryptoData {
    /// Build the triple from a public key and raw DER signature bytes.
    pub fn from_signature(public_key_pem: impl Into<String>, signature_der: &[u8]) -> Self {
        Self {
            public_key: public_key_pem.into(),
            signature: URL_SAFE_NO_PAD.encode(signature_der),
            nonce: derive_nonce(signature_der),
        }
    }

    /// Public key with PEM header/footer lines and whitespace removed.
    pub fn stripped_public_key(&self) -> String {
        strip_pem_wrapper(&self.public_key)
    }

    /// Decode the signature back to DER bytes.
    pub fn signature_der(&self) -> Result<Vec<u8>, KeyError> {
        URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|e| KeyError::Malformed(format!("signature is not base64url: {e}")))
    }
}

/// Derive the upload nonce from DER signature bytes.
pub fn derive_nonce(signature_der: &[u8]) -> String {
    let digest = Sha256::digest(signature_der);
    URL_SAFE_NO_PAD.encode(&digest[..NONCE_BYTES])
}

/// Fresh random nonce for unsigned uploads. Not bound to any content.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Drop `-----BEGIN/END-----` lines and join the remaining lines trimmed.
pub fn strip_pem_wrapper(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("----"))
        .map(str::trim)
        .collect()
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed signing key: {0}")]
    Malformed(String),

    #[error("failed to encode key: {0}")]
    Encode(String),

    #[error("signing failed: {0}")]
    Sign(String),
}

/// Operator's P-256 private key.
///
/// The scalar is zeroized on drop. Signing consumes the key so a single
/// signer invocation owns it exclusively.
pub struct OperatorKey {
    secret: SecretKey,
}

impl fmt::Debug for OperatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorKey").finish_non_exhaustive()
    }
}

impl OperatorKey {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Parse base64 SEC1 DER, the form stored in the third field of the
    /// operator's secret key.
    pub fn from_sec1_base64(encoded: &str) -> Result<Self, KeyError> {
        let der = STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyError::Malformed(format!("not base64: {e}")))?;
        let secret = SecretKey::from_sec1_der(&der)
            .map_err(|e| KeyError::Malformed(format!("not a SEC1 P-256 key: {e}")))?;
        Ok(Self { secret })
    }

    /// Parse an `EC PRIVATE KEY` (SEC1) or `PRIVATE KEY` (PKCS#8) PEM document.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        if let Ok(secret) = SecretKey::from_sec1_pem(pem) {
            return Ok(Self { secret });
        }
        SecretKey::from_pkcs8_pem(pem)
            .map(|secret| Self { secret })
            .map_err(|e| KeyError::Malformed(format!("not an EC private key PEM: {e}")))
    }

    pub fn to_sec1_base64(&self) -> Result<String, KeyError> {
        let der = self
            .secret
            .to_sec1_der()
            .map_err(|e| KeyError::Encode(e.to_string()))?;
        Ok(STANDARD.encode(der.as_slice()))
    }

    /// Public key as SPKI PEM.
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        self.secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encode(e.to_string()))
    }

    /// Sign a SHA-256 digest, returning DER signature bytes.
    ///
    /// RFC 6979 nonces make this deterministic for a given key and digest.
    pub fn sign_digest(self, digest: &[u8]) -> Result<Vec<u8>, KeyError> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;

        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key
            .sign_prehash(digest)
            .map_err(|e| KeyError::Sign(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}
