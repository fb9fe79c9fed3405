//! KAS private key holder with automatic zeroization.
//!
//! The static P-256 key is the only long-lived secret the KAS owns. It is
//! kept behind `secrecy` and only materialized as a `SecretKey` for the
//! duration of a single ECDH.

use elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use secrecy::{ExposeSecret, Secret};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key size: expected {expected}, got {got}")]
    InvalidKeySize { expected: usize, got: usize },

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),
}

/// Secure wrapper for the KAS EC private key (P-256).
pub struct SecureEcPrivateKey {
    inner: Secret<[u8; 32]>,
    public_key: PublicKey,
}

impl SecureEcPrivateKey {
    /// Fresh random key, for development servers and tests.
    pub fn generate() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        Self::from_secret_key(&secret_key)
    }

    /// Create from raw 32-byte scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::InvalidKeySize {
                expected: 32,
                got: bytes.len(),
            });
        }
        let secret_key =
            SecretKey::from_slice(bytes).map_err(|e| KeyError::CryptoError(e.to_string()))?;
        Ok(Self::from_secret_key(&secret_key))
    }

    /// Create from PEM, either SEC1 (`EC PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`).
    pub fn from_pem(pem_content: &str) -> Result<Self, KeyError> {
        use p256::pkcs8::DecodePrivateKey;

        let parsed = pem::parse(pem_content.as_bytes())
            .map_err(|e| KeyError::InvalidFormat(e.to_string()))?;

        let secret_key = match parsed.tag() {
            "EC PRIVATE KEY" => SecretKey::from_sec1_der(parsed.contents())
                .map_err(|e| KeyError::InvalidFormat(e.to_string()))?,
            "PRIVATE KEY" => SecretKey::from_pkcs8_der(parsed.contents())
                .map_err(|e| KeyError::InvalidFormat(e.to_string()))?,
            other => {
                return Err(KeyError::InvalidFormat(format!(
                    "Expected EC PRIVATE KEY or PRIVATE KEY, got {}",
                    other
                )))
            }
        };

        Ok(Self::from_secret_key(&secret_key))
    }

    fn from_secret_key(secret_key: &SecretKey) -> Self {
        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(secret_key.to_bytes().as_slice());
        Self {
            inner: Secret::new(key_array),
            public_key: secret_key.public_key(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Compressed SEC1 public key (33 bytes).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.to_encoded_point(true).as_bytes().to_vec()
    }

    /// ECDH against a peer key; returns the x-coordinate of the shared point.
    pub fn perform_ecdh(&self, peer_public: &PublicKey) -> Result<[u8; 32], KeyError> {
        let secret_key = SecretKey::from_bytes(self.inner.expose_secret().into())
            .map_err(|e| KeyError::CryptoError(e.to_string()))?;
        Ok(crate::modules::crypto::custom_ecdh(&secret_key, peer_public))
    }
}

impl fmt::Debug for SecureEcPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureEcPrivateKey([REDACTED])")
    }
}

impl Clone for SecureEcPrivateKey {
    fn clone(&self) -> Self {
        let mut new_bytes = [0u8; 32];
        new_bytes.copy_from_slice(self.inner.expose_secret());
        Self {
            inner: Secret::new(new_bytes),
            public_key: self.public_key,
        }
    }
}
