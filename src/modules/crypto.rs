//! Key agreement for collections.
//!
//! Publisher: ephemeral key × KAS static key → HKDF → collection key, and a
//! GMAC over the policy bound with that key. KAS: static key × header
//! ephemeral key → the same collection key. Rewrap: a fresh KAS ephemeral
//! key × subscriber key → wrapping key, and the collection key sealed under
//! it. Subscriber: its ephemeral key × KAS ephemeral key → wrapping key →
//! the collection key, bit-identical to the publisher's.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Key, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use elliptic_curve::sec1::ToEncodedPoint;
use hkdf::Hkdf;
use log::debug;
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

use crate::header::{CipherSuite, EccCurve, Header, Policy, ResourceLocator, SymmetricCipher};
use crate::header::{MAGIC_NUMBER, VERSION};
use crate::modules::secure_keys::SecureEcPrivateKey;

pub const COLLECTION_KEY_SIZE: usize = 32;
pub const WRAP_NONCE_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;
/// nonce || sealed collection key || tag
pub const WRAPPED_KEY_SIZE: usize = WRAP_NONCE_SIZE + COLLECTION_KEY_SIZE + GCM_TAG_SIZE;

/// HKDF info for the rewrap wrapping key. Collection keys use empty info.
const REWRAP_INFO: &[u8] = b"rewrappedKey";

/// Nonce reserved for the policy binding; collection items start at counter 1.
const POLICY_BINDING_NONCE: [u8; 12] = [0u8; 12];

#[derive(Debug, Error)]
pub enum KeyAgreementError {
    #[error("Unsupported cipher suite: ecc mode {ecc_mode:#04x}, payload config {payload_config:#04x}")]
    UnsupportedCipherSuite { ecc_mode: u8, payload_config: u8 },

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Policy binding does not match the derived key")]
    PolicyBindingMismatch,

    #[error("Wrapped key is malformed: {0}")]
    MalformedWrappedKey(String),

    #[error("Unwrap failed: wrapped key did not authenticate")]
    UnwrapFailed,

    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),

    #[error("Header could not be built: {0}")]
    Header(#[from] crate::header::ParsingError),
}

/// The 256-bit symmetric key shared by the publisher and authorized
/// subscribers of one collection. Zeroized on drop.
pub struct CollectionKey {
    inner: Secret<[u8; COLLECTION_KEY_SIZE]>,
}

impl CollectionKey {
    pub fn from_bytes(bytes: [u8; COLLECTION_KEY_SIZE]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyAgreementError> {
        if bytes.len() != COLLECTION_KEY_SIZE {
            return Err(KeyAgreementError::MalformedWrappedKey(format!(
                "collection key is {} bytes, expected {}",
                bytes.len(),
                COLLECTION_KEY_SIZE
            )));
        }
        let mut key = [0u8; COLLECTION_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self::from_bytes(key))
    }

    pub fn as_bytes(&self) -> &[u8; COLLECTION_KEY_SIZE] {
        self.inner.expose_secret()
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        let key = Key::<Aes256Gcm>::from(*self.inner.expose_secret());
        Aes256Gcm::new(&key)
    }
}

impl Clone for CollectionKey {
    fn clone(&self) -> Self {
        Self::from_bytes(*self.inner.expose_secret())
    }
}

impl fmt::Debug for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CollectionKey([REDACTED])")
    }
}

/// HKDF salt: SHA256(MAGIC_NUMBER || VERSION).
pub fn compute_salt(version: u8) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(MAGIC_NUMBER);
    hasher.update([version]);
    hasher.finalize().into()
}

/// Performs ECDH and returns the x-coordinate of the shared point.
pub fn custom_ecdh(private_key: &SecretKey, public_key: &PublicKey) -> [u8; 32] {
    use elliptic_curve::point::AffineCoordinates;
    let scalar = private_key.to_nonzero_scalar();
    let public_key_point = public_key.to_projective();
    let shared_point = (public_key_point * *scalar).to_affine();
    let mut x_coordinate = [0u8; 32];
    x_coordinate.copy_from_slice(shared_point.x().as_slice());
    x_coordinate
}

pub fn compressed_public_key(public_key: &PublicKey) -> Vec<u8> {
    public_key.to_encoded_point(true).as_bytes().to_vec()
}

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, KeyAgreementError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|e| KeyAgreementError::InvalidPublicKey(e.to_string()))
}

fn hkdf_expand(
    shared_secret: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<[u8; COLLECTION_KEY_SIZE], KeyAgreementError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut derived_key = [0u8; COLLECTION_KEY_SIZE];
    hkdf.expand(info, &mut derived_key)
        .map_err(|e| KeyAgreementError::DerivationFailed(format!("HKDF expansion failed: {}", e)))?;
    Ok(derived_key)
}

/// Collection key from an ECDH shared secret.
pub fn derive_collection_key(
    shared_secret: &[u8],
    salt: &[u8],
) -> Result<CollectionKey, KeyAgreementError> {
    Ok(CollectionKey::from_bytes(hkdf_expand(shared_secret, salt, b"")?))
}

/// Only P-256 with GMAC binding and 128-bit tags can be derived and framed.
pub fn ensure_supported(suite: &CipherSuite) -> Result<(), KeyAgreementError> {
    if suite.curve != EccCurve::Secp256r1
        || suite.use_ecdsa_binding
        || suite.symmetric_cipher != SymmetricCipher::Gcm128
    {
        return Err(KeyAgreementError::UnsupportedCipherSuite {
            ecc_mode: suite.ecc_mode_byte(),
            payload_config: suite.payload_config_byte(),
        });
    }
    Ok(())
}

/// GMAC over the policy: AES-GCM of an empty message with the policy as
/// associated data, under the reserved zero nonce.
pub fn compute_policy_binding(
    key: &CollectionKey,
    policy: &Policy,
) -> Result<Vec<u8>, KeyAgreementError> {
    let aad = policy.binding_input();
    key.cipher()
        .encrypt(
            GenericArray::from_slice(&POLICY_BINDING_NONCE),
            Payload { msg: &[], aad: &aad },
        )
        .map_err(|e| KeyAgreementError::DerivationFailed(format!("GMAC failed: {}", e)))
}

/// Verifies the header's binding under `key`. The tag comparison is the
/// AEAD's own constant-time check.
pub fn verify_policy_binding(header: &Header, key: &CollectionKey) -> Result<(), KeyAgreementError> {
    let aad = header.get_policy().binding_input();
    key.cipher()
        .decrypt(
            GenericArray::from_slice(&POLICY_BINDING_NONCE),
            Payload {
                msg: header.get_policy_binding(),
                aad: &aad,
            },
        )
        .map(|_| ())
        .map_err(|_| KeyAgreementError::PolicyBindingMismatch)
}

/// Publisher path: a fresh header for `policy` plus its collection key.
pub fn create_collection_key(
    kas_public_key: &PublicKey,
    kas: ResourceLocator,
    policy: Policy,
) -> Result<(Header, CollectionKey), KeyAgreementError> {
    let suite = CipherSuite::P256_AES256_GCM;
    let ephemeral = SecretKey::random(&mut OsRng);
    let shared_secret = custom_ecdh(&ephemeral, kas_public_key);
    let key = derive_collection_key(&shared_secret, &compute_salt(VERSION))?;
    let binding = compute_policy_binding(&key, &policy)?;

    let header = Header::new(
        suite,
        kas,
        policy,
        binding,
        compressed_public_key(&ephemeral.public_key()),
    )?;
    debug!("Derived collection key for KAS {}", header.get_kas());
    Ok((header, key))
}

/// Seals the collection key under HKDF(salt, session_shared_secret, "rewrappedKey").
///
/// Returns nonce || ciphertext || tag.
pub fn wrap_collection_key(
    key: &CollectionKey,
    session_shared_secret: &[u8],
    salt: &[u8],
) -> Result<Vec<u8>, KeyAgreementError> {
    let wrapping_key = CollectionKey::from_bytes(hkdf_expand(session_shared_secret, salt, REWRAP_INFO)?);

    let mut nonce = [0u8; WRAP_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let sealed = wrapping_key
        .cipher()
        .encrypt(GenericArray::from_slice(&nonce), key.as_bytes().as_slice())
        .map_err(|e| KeyAgreementError::DerivationFailed(format!("AES-GCM encryption failed: {}", e)))?;

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_SIZE);
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

pub fn unwrap_collection_key(
    wrapped: &[u8],
    session_shared_secret: &[u8],
    salt: &[u8],
) -> Result<CollectionKey, KeyAgreementError> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(KeyAgreementError::MalformedWrappedKey(format!(
            "{} bytes, expected {}",
            wrapped.len(),
            WRAPPED_KEY_SIZE
        )));
    }
    let wrapping_key = CollectionKey::from_bytes(hkdf_expand(session_shared_secret, salt, REWRAP_INFO)?);
    let (nonce, sealed) = wrapped.split_at(WRAP_NONCE_SIZE);
    let plaintext = wrapping_key
        .cipher()
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| KeyAgreementError::UnwrapFailed)?;
    CollectionKey::from_slice(&plaintext)
}

/// A rewrapped key ready to send back to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub kas_ephemeral_public_key: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

/// Operations that need the KAS private key.
///
/// Implementations must verify the header's policy binding before returning
/// a derived key. The software backend is [`EcdhAesGcmBackend`]; a hardware
/// backend only has to provide these two calls.
pub trait KeyWrapBackend: Send + Sync {
    fn public_key(&self) -> &PublicKey;

    /// Recompute the collection key the publisher derived for `header`.
    fn derive_collection_key(&self, header: &Header) -> Result<CollectionKey, KeyAgreementError>;

    /// Rewrap `key` for `recipient` under a fresh KAS ephemeral key.
    fn wrap_for_recipient(
        &self,
        key: &CollectionKey,
        recipient: &PublicKey,
    ) -> Result<WrappedKey, KeyAgreementError>;
}

/// Software ECDH + AES-256-GCM backend.
#[derive(Debug, Clone)]
pub struct EcdhAesGcmBackend {
    private_key: SecureEcPrivateKey,
}

impl EcdhAesGcmBackend {
    pub fn new(private_key: SecureEcPrivateKey) -> Self {
        Self { private_key }
    }
}

impl KeyWrapBackend for EcdhAesGcmBackend {
    fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }

    fn derive_collection_key(&self, header: &Header) -> Result<CollectionKey, KeyAgreementError> {
        ensure_supported(header.get_cipher_suite())?;
        let ephemeral = parse_public_key(header.get_ephemeral_key())?;
        let shared_secret = self
            .private_key
            .perform_ecdh(&ephemeral)
            .map_err(|e| KeyAgreementError::DerivationFailed(e.to_string()))?;
        let key = derive_collection_key(&shared_secret, &compute_salt(VERSION))?;
        verify_policy_binding(header, &key)?;
        Ok(key)
    }

    fn wrap_for_recipient(
        &self,
        key: &CollectionKey,
        recipient: &PublicKey,
    ) -> Result<WrappedKey, KeyAgreementError> {
        let session_private_key = SecretKey::random(&mut OsRng);
        let session_shared_secret = custom_ecdh(&session_private_key, recipient);
        let wrapped_key = wrap_collection_key(key, &session_shared_secret, &compute_salt(VERSION))?;
        Ok(WrappedKey {
            kas_ephemeral_public_key: compressed_public_key(&session_private_key.public_key()),
            wrapped_key,
        })
    }
}

/// Subscriber side of a rewrap: owns the ephemeral keypair the KAS wraps for.
pub struct SubscriberKeyAgreement {
    secret: SecretKey,
}

impl SubscriberKeyAgreement {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        compressed_public_key(&self.secret.public_key())
    }

    /// One ECDH with the KAS ephemeral key, unwrap, then check the header's
    /// binding with the recovered key before handing it out.
    pub fn unwrap(
        &self,
        header: &Header,
        wrapped: &WrappedKey,
    ) -> Result<CollectionKey, KeyAgreementError> {
        ensure_supported(header.get_cipher_suite())?;
        let kas_ephemeral = parse_public_key(&wrapped.kas_ephemeral_public_key)?;
        let session_shared_secret = custom_ecdh(&self.secret, &kas_ephemeral);
        let key = unwrap_collection_key(
            &wrapped.wrapped_key,
            &session_shared_secret,
            &compute_salt(VERSION),
        )?;
        verify_policy_binding(header, &key)?;
        Ok(key)
    }
}

impl fmt::Debug for SubscriberKeyAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriberKeyAgreement([REDACTED])")
    }
}
