//! Collection encryption for live streams.
//!
//! One collection key encrypts every frame of a stream. Each frame becomes an
//! independently decryptable item whose 24-bit counter is also its nonce:
//!
//! ```text
//! [counter (3B BE)][length (3B BE)][ciphertext][tag (16B)]
//! ```
//!
//! The nonce is 9 zero bytes followed by the counter. Counter 0 belongs to
//! the policy binding, so items start at 1.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::Aes256Gcm;
use log::{debug, warn};
use p256::PublicKey;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

use crate::header::{Header, ParsingError, Policy, ResourceLocator};
use crate::modules::crypto::{self, CollectionKey, KeyAgreementError, KeyWrapBackend};

pub const IV_SIZE: usize = 3;
pub const LENGTH_SIZE: usize = 3;
pub const TAG_SIZE: usize = 16;
pub const ITEM_OVERHEAD: usize = IV_SIZE + LENGTH_SIZE + TAG_SIZE;
pub const MAX_IV: u32 = 0x00FF_FFFF;
pub const MAX_PAYLOAD_LENGTH: usize = 0x00FF_FFFF;
/// Early rotation warning at half the IV space.
pub const DEFAULT_ROTATION_THRESHOLD: u32 = 0x0080_0000;

const LEDGER_WORDS: usize = (MAX_IV as usize + 1) / 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncryptError {
    #[error("Counter {0} was already used in this collection")]
    DuplicateCounter(u32),
    #[error("Counter 0 is reserved for the policy binding")]
    ReservedCounter,
    #[error("Counter {0} does not fit in 24 bits")]
    CounterOutOfRange(u32),
    #[error("Payload of {0} bytes does not fit the 24-bit length field")]
    PayloadTooLarge(usize),
    #[error("IV counter exhausted - create new collection")]
    IvExhausted,
    #[error("AES-GCM encryption failed")]
    EncryptionFailed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptError {
    /// Wrong key and corrupted data are deliberately indistinguishable.
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("Malformed framing: {0}")]
    MalformedFraming(String),
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("KAS URL not set")]
    MissingKas,
    #[error("Policy not set")]
    MissingPolicy,
    #[error("Header error: {0}")]
    Header(#[from] ParsingError),
    #[error("Key agreement failed: {0}")]
    KeyAgreement(#[from] KeyAgreementError),
}

/// One encrypted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionItem {
    pub iv_counter: u32,
    pub payload_length: u32,
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_SIZE],
}

impl CollectionItem {
    pub fn encoded_len(&self) -> usize {
        ITEM_OVERHEAD + self.ciphertext.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.iv_counter.to_be_bytes()[1..]);
        out.extend_from_slice(&self.payload_length.to_be_bytes()[1..]);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.auth_tag);
        out
    }

    /// Splits a serialized item. The declared length is kept as sent; it is
    /// checked against the real ciphertext size at decrypt time.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecryptError> {
        if bytes.len() < ITEM_OVERHEAD {
            return Err(DecryptError::MalformedFraming(format!(
                "{} bytes is shorter than the {} byte item overhead",
                bytes.len(),
                ITEM_OVERHEAD
            )));
        }
        let iv_counter = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let payload_length = u32::from_be_bytes([0, bytes[3], bytes[4], bytes[5]]);
        let tag_start = bytes.len() - TAG_SIZE;
        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(&bytes[tag_start..]);

        Ok(CollectionItem {
            iv_counter,
            payload_length,
            ciphertext: bytes[IV_SIZE + LENGTH_SIZE..tag_start].to_vec(),
            auth_tag,
        })
    }
}

fn item_nonce(counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// One bit per possible counter; 2 MiB per collection.
struct CounterLedger {
    words: Box<[AtomicU64]>,
}

impl CounterLedger {
    fn new() -> Self {
        let words = (0..LEDGER_WORDS)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        CounterLedger { words }
    }

    /// True if `counter` had not been claimed before.
    fn claim(&self, counter: u32) -> bool {
        let index = counter as usize / 64;
        let bit = 1u64 << (counter % 64);
        self.words[index].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }
}

/// Item cipher bound to one collection key. Remembers every counter it has
/// encrypted under, so a counter can never be reused while it lives.
///
/// Only a [`Collection`] creates one, and every collection derives a fresh
/// key, so there is exactly one ledger per key.
pub struct CollectionCipher {
    aead: Aes256Gcm,
    ledger: CounterLedger,
}

impl CollectionCipher {
    pub(crate) fn new(key: &CollectionKey) -> Self {
        CollectionCipher {
            aead: key.cipher(),
            ledger: CounterLedger::new(),
        }
    }

    pub fn encrypt_item(&self, counter: u32, plaintext: &[u8]) -> Result<CollectionItem, EncryptError> {
        if counter == 0 {
            return Err(EncryptError::ReservedCounter);
        }
        if counter > MAX_IV {
            return Err(EncryptError::CounterOutOfRange(counter));
        }
        if plaintext.len() > MAX_PAYLOAD_LENGTH {
            return Err(EncryptError::PayloadTooLarge(plaintext.len()));
        }
        if !self.ledger.claim(counter) {
            return Err(EncryptError::DuplicateCounter(counter));
        }

        let mut sealed = self
            .aead
            .encrypt(GenericArray::from_slice(&item_nonce(counter)), plaintext)
            .map_err(|_| EncryptError::EncryptionFailed)?;
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);
        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(&tag);

        Ok(CollectionItem {
            iv_counter: counter,
            payload_length: sealed.len() as u32,
            ciphertext: sealed,
            auth_tag,
        })
    }

    pub fn decrypt_item(&self, item: &CollectionItem) -> Result<Vec<u8>, DecryptError> {
        open_item(&self.aead, item)
    }
}

/// Decrypt with a bare key, for callers that never encrypt.
pub fn decrypt_item(key: &CollectionKey, item: &CollectionItem) -> Result<Vec<u8>, DecryptError> {
    open_item(&key.cipher(), item)
}

fn open_item(aead: &Aes256Gcm, item: &CollectionItem) -> Result<Vec<u8>, DecryptError> {
    if item.payload_length as usize != item.ciphertext.len() {
        return Err(DecryptError::MalformedFraming(format!(
            "declared length {} but {} ciphertext bytes",
            item.payload_length,
            item.ciphertext.len()
        )));
    }
    if item.iv_counter == 0 || item.iv_counter > MAX_IV {
        return Err(DecryptError::MalformedFraming(format!(
            "counter {} outside item range",
            item.iv_counter
        )));
    }
    let mut sealed = Vec::with_capacity(item.ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(&item.ciphertext);
    sealed.extend_from_slice(&item.auth_tag);
    aead.decrypt(GenericArray::from_slice(&item_nonce(item.iv_counter)), sealed.as_slice())
        .map_err(|_| DecryptError::AuthenticationFailed)
}

/// Publisher-side collection: header, key and the counter allocator.
pub struct Collection {
    header: Header,
    header_bytes: Vec<u8>,
    key: CollectionKey,
    cipher: CollectionCipher,
    next_iv: AtomicU32,
    rotation_threshold: u32,
    rotation_warned: AtomicBool,
}

pub struct CollectionBuilder {
    kas_url: Option<String>,
    policy: Option<Policy>,
    rotation_threshold: u32,
}

impl Default for CollectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionBuilder {
    pub fn new() -> Self {
        CollectionBuilder {
            kas_url: None,
            policy: None,
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
        }
    }

    pub fn kas_url(mut self, kas_url: &str) -> Self {
        self.kas_url = Some(kas_url.to_string());
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn policy_plaintext(self, body: Vec<u8>) -> Self {
        self.policy(Policy::Embedded(body))
    }

    pub fn rotation_threshold(mut self, threshold: u32) -> Self {
        self.rotation_threshold = threshold;
        self
    }

    /// Performs ECDH + HKDF once; every item reuses the derived key.
    pub fn build(self, kas_public_key: &PublicKey) -> Result<Collection, CollectionError> {
        let kas_url = self.kas_url.ok_or(CollectionError::MissingKas)?;
        let policy = self.policy.ok_or(CollectionError::MissingPolicy)?;
        let kas = ResourceLocator::parse(&kas_url)?;

        let (header, key) = crypto::create_collection_key(kas_public_key, kas, policy)?;
        let header_bytes = header.encode();
        let cipher = CollectionCipher::new(&key);

        Ok(Collection {
            header,
            header_bytes,
            key,
            cipher,
            next_iv: AtomicU32::new(1),
            rotation_threshold: self.rotation_threshold,
            rotation_warned: AtomicBool::new(false),
        })
    }
}

impl Collection {
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Serialized header, for manifests and in-band injection.
    pub fn header_bytes(&self) -> &[u8] {
        &self.header_bytes
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &CollectionKey {
        &self.key
    }

    /// Decryptor sharing this collection's key, for local monitoring.
    pub fn decryptor(&self) -> CollectionDecryptor {
        CollectionDecryptor {
            header: self.header.clone(),
            key: self.key.clone(),
        }
    }

    /// Encrypt with the next free counter. Safe to call from many threads.
    pub fn encrypt_next(&self, plaintext: &[u8]) -> Result<CollectionItem, EncryptError> {
        let counter = self
            .next_iv
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current <= MAX_IV).then_some(current + 1)
            })
            .map_err(|_| EncryptError::IvExhausted)?;

        if counter >= self.rotation_threshold && !self.rotation_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Collection for {} passed rotation threshold ({} items); rotate the key soon",
                self.header.get_kas(),
                self.rotation_threshold
            );
        }

        self.cipher.encrypt_item(counter, plaintext)
    }

    pub fn decrypt_item(&self, item: &CollectionItem) -> Result<Vec<u8>, DecryptError> {
        self.cipher.decrypt_item(item)
    }

    pub fn rotation_threshold_reached(&self) -> bool {
        self.next_iv.load(Ordering::Acquire) >= self.rotation_threshold
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_iv.load(Ordering::Acquire) > MAX_IV
    }

    pub fn remaining_capacity(&self) -> u32 {
        (MAX_IV + 1).saturating_sub(self.next_iv.load(Ordering::Acquire))
    }
}

/// Subscriber-side decryptor. The header's policy binding is verified
/// against the key before the decryptor exists.
pub struct CollectionDecryptor {
    header: Header,
    key: CollectionKey,
}

impl CollectionDecryptor {
    /// With a key recovered from a rewrap.
    pub fn from_header_with_key(header_bytes: &[u8], key: CollectionKey) -> Result<Self, CollectionError> {
        let header = Header::decode(header_bytes)?;
        crypto::ensure_supported(header.get_cipher_suite())?;
        crypto::verify_policy_binding(&header, &key)?;
        Ok(CollectionDecryptor { header, key })
    }

    /// KAS-side, deriving the key directly from the KAS private key.
    pub fn from_header_with_backend(
        header_bytes: &[u8],
        backend: &dyn KeyWrapBackend,
    ) -> Result<Self, CollectionError> {
        let header = Header::decode(header_bytes)?;
        let key = backend.derive_collection_key(&header)?;
        debug!("KAS-side decryptor ready for {}", header.get_kas());
        Ok(CollectionDecryptor { header, key })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn decrypt_item(&self, item: &CollectionItem) -> Result<Vec<u8>, DecryptError> {
        decrypt_item(&self.key, item)
    }

    pub fn decrypt_bytes(&self, encrypted: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let item = CollectionItem::from_bytes(encrypted)?;
        self.decrypt_item(&item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::crypto::EcdhAesGcmBackend;
    use crate::modules::secure_keys::SecureEcPrivateKey;
    use std::sync::Arc;

    fn test_backend() -> EcdhAesGcmBackend {
        EcdhAesGcmBackend::new(SecureEcPrivateKey::generate())
    }

    fn test_collection(backend: &EcdhAesGcmBackend) -> Collection {
        CollectionBuilder::new()
            .kas_url("https://kas.example.com/kas")
            .policy_plaintext(b"{}".to_vec())
            .build(backend.public_key())
            .expect("Collection creation should succeed")
    }

    #[test]
    fn test_collection_encrypt_decrypt_roundtrip() {
        let backend = test_backend();
        let collection = test_collection(&backend);
        let plaintext = b"Hello NTDF-RTMP! This is a test video frame payload.";

        let encrypted = collection.encrypt_next(plaintext).unwrap().to_bytes();
        assert_eq!(encrypted.len(), ITEM_OVERHEAD + plaintext.len());

        let decryptor =
            CollectionDecryptor::from_header_with_backend(collection.header_bytes(), &backend)
                .expect("Decryptor creation");
        let decrypted = decryptor.decrypt_bytes(&encrypted).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_wire_layout() {
        let key = CollectionKey::from_bytes([7u8; 32]);
        let cipher = CollectionCipher::new(&key);
        let item = cipher.encrypt_item(0x01_02_03, b"abcd").unwrap();
        let bytes = item.to_bytes();
        assert_eq!(&bytes[..3], &[0x01, 0x02, 0x03]);
        assert_eq!(&bytes[3..6], &[0x00, 0x00, 0x04]);
        assert_eq!(&bytes[6..10], item.ciphertext.as_slice());
        assert_eq!(&bytes[10..], &item.auth_tag);
        assert_eq!(CollectionItem::from_bytes(&bytes).unwrap(), item);
    }

    #[test]
    fn test_decrypt_payload_too_short() {
        let key = CollectionKey::from_bytes([1u8; 32]);
        let short_payload = [0u8; ITEM_OVERHEAD - 1];
        assert!(matches!(
            CollectionItem::from_bytes(&short_payload),
            Err(DecryptError::MalformedFraming(_))
        ));
        let item = CollectionItem {
            iv_counter: 1,
            payload_length: 5,
            ciphertext: vec![0; 4],
            auth_tag: [0; TAG_SIZE],
        };
        assert!(matches!(
            decrypt_item(&key, &item),
            Err(DecryptError::MalformedFraming(_))
        ));
    }

    #[test]
    fn test_unique_ivs() {
        let backend = test_backend();
        let collection = test_collection(&backend);
        let plaintext = b"Same plaintext";

        let encrypted1 = collection.encrypt_next(plaintext).unwrap().to_bytes();
        let encrypted2 = collection.encrypt_next(plaintext).unwrap().to_bytes();

        assert_ne!(&encrypted1[..IV_SIZE], &encrypted2[..IV_SIZE]);
        assert_ne!(encrypted1, encrypted2);

        let iv1 = u32::from_be_bytes([0, encrypted1[0], encrypted1[1], encrypted1[2]]);
        let iv2 = u32::from_be_bytes([0, encrypted2[0], encrypted2[1], encrypted2[2]]);
        assert_eq!(iv1, 1);
        assert_eq!(iv2, 2);
    }

    #[test]
    fn test_duplicate_counter_rejected() {
        let key = CollectionKey::from_bytes([9u8; 32]);
        let cipher = CollectionCipher::new(&key);
        cipher.encrypt_item(42, b"first").unwrap();
        assert_eq!(
            cipher.encrypt_item(42, b"second"),
            Err(EncryptError::DuplicateCounter(42))
        );
        // rejected calls must not burn a counter
        assert_eq!(cipher.encrypt_item(0, b"x"), Err(EncryptError::ReservedCounter));
        assert_eq!(
            cipher.encrypt_item(MAX_IV + 1, b"x"),
            Err(EncryptError::CounterOutOfRange(MAX_IV + 1))
        );
        assert!(cipher.encrypt_item(43, b"third").is_ok());
    }

    #[test]
    fn test_concurrent_encryption_never_reuses_counters() {
        let backend = test_backend();
        let collection = Arc::new(test_collection(&backend));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let collection = collection.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| collection.encrypt_next(b"frame").unwrap().iv_counter)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counters: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        counters.sort_unstable();
        counters.dedup();
        assert_eq!(counters.len(), 1000);
        assert_eq!(counters[0], 1);
        assert_eq!(counters[999], 1000);
    }

    #[test]
    fn test_tamper_detection() {
        let key = CollectionKey::from_bytes([3u8; 32]);
        let cipher = CollectionCipher::new(&key);
        let original = cipher.encrypt_item(7, b"keyframe payload").unwrap().to_bytes();

        for byte in IV_SIZE + LENGTH_SIZE..original.len() {
            for bit in 0..8 {
                let mut tampered = original.clone();
                tampered[byte] ^= 1 << bit;
                let item = CollectionItem::from_bytes(&tampered).unwrap();
                assert_eq!(
                    decrypt_item(&key, &item),
                    Err(DecryptError::AuthenticationFailed),
                    "byte {} bit {}",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_wrong_key_is_authentication_failure() {
        let cipher = CollectionCipher::new(&CollectionKey::from_bytes([1u8; 32]));
        let item = cipher.encrypt_item(1, b"secret").unwrap();
        let wrong = CollectionKey::from_bytes([2u8; 32]);
        assert_eq!(decrypt_item(&wrong, &item), Err(DecryptError::AuthenticationFailed));
    }

    #[test]
    fn test_rotation_threshold() {
        let backend = test_backend();
        let collection = CollectionBuilder::new()
            .kas_url("https://kas.example.com/kas")
            .policy_plaintext(b"test-policy".to_vec())
            .rotation_threshold(5)
            .build(backend.public_key())
            .unwrap();

        assert!(!collection.rotation_threshold_reached());
        for _ in 0..3 {
            collection.encrypt_next(b"test").unwrap();
        }
        assert!(!collection.rotation_threshold_reached());
        collection.encrypt_next(b"test").unwrap();
        assert!(collection.rotation_threshold_reached());
    }

    #[test]
    fn test_remaining_capacity() {
        let backend = test_backend();
        let collection = test_collection(&backend);

        let initial = collection.remaining_capacity();
        assert_eq!(initial, MAX_IV);
        collection.encrypt_next(b"test").unwrap();
        assert_eq!(collection.remaining_capacity(), initial - 1);
        assert!(!collection.is_exhausted());
    }

    #[test]
    fn test_exhaustion() {
        let backend = test_backend();
        let collection = test_collection(&backend);
        collection.next_iv.store(MAX_IV, Ordering::Release);

        assert!(collection.encrypt_next(b"last").is_ok());
        assert!(collection.is_exhausted());
        assert_eq!(collection.remaining_capacity(), 0);
        assert_eq!(collection.encrypt_next(b"more"), Err(EncryptError::IvExhausted));
    }

    #[test]
    fn test_empty_plaintext() {
        let backend = test_backend();
        let collection = test_collection(&backend);

        let encrypted = collection.encrypt_next(b"").unwrap().to_bytes();
        assert_eq!(encrypted.len(), ITEM_OVERHEAD);

        let decryptor = CollectionDecryptor::from_header_with_key(
            collection.header_bytes(),
            collection.key().clone(),
        )
        .unwrap();
        assert!(decryptor.decrypt_bytes(&encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_decryptor_rejects_mismatched_key() {
        let backend = test_backend();
        let collection = test_collection(&backend);
        let result = CollectionDecryptor::from_header_with_key(
            collection.header_bytes(),
            CollectionKey::from_bytes([0u8; 32]),
        );
        assert!(matches!(
            result,
            Err(CollectionError::KeyAgreement(KeyAgreementError::PolicyBindingMismatch))
        ));
    }

    #[test]
    fn test_collections_on_one_kas_never_share_a_key() {
        let backend = test_backend();
        let first = test_collection(&backend);
        let second = test_collection(&backend);
        assert_ne!(first.key().as_bytes(), second.key().as_bytes());

        // counter 1 in both collections, but keystreams differ
        let a = first.encrypt_next(b"AAAAAAAA").unwrap();
        let b = second.encrypt_next(b"BBBBBBBB").unwrap();
        assert_eq!(a.iv_counter, b.iv_counter);
        let xor: Vec<u8> = a.ciphertext.iter().zip(&b.ciphertext).map(|(x, y)| x ^ y).collect();
        assert_ne!(xor, vec![b'A' ^ b'B'; 8]);
    }

    #[test]
    fn test_decryptor_from_collection() {
        let backend = test_backend();
        let collection = test_collection(&backend);
        let item = collection.encrypt_next(b"monitor").unwrap().to_bytes();
        assert_eq!(collection.decryptor().decrypt_bytes(&item).unwrap(), b"monitor");
    }

    #[test]
    fn test_builder_requires_kas_and_policy() {
        let backend = test_backend();
        assert!(matches!(
            CollectionBuilder::new().policy_plaintext(vec![]).build(backend.public_key()),
            Err(CollectionError::MissingKas)
        ));
        assert!(matches!(
            CollectionBuilder::new()
                .kas_url("https://kas.example.com")
                .build(backend.public_key()),
            Err(CollectionError::MissingPolicy)
        ));
    }
}
