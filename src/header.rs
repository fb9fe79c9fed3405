//! Collection header codec.
//!
//! One header prefixes every collection. It tells a subscriber which KAS to
//! ask, carries the policy and its binding, and holds the publisher's
//! ephemeral public key. All multi-byte integers are big-endian.
//!
//! ```text
//! +-----------------------------+---------------------------+
//! | magic "L1" (2) | version (1)                            |
//! | KAS locator: protocol (1) | length (1) | body           |
//! | ECC & binding mode (1) | symmetric & payload config (1) |
//! | policy: type (1) | embedded: len (2) + body             |
//! |                  | remote:   locator                    |
//! | policy binding (16 GMAC / 64..132 ECDSA)                |
//! | ephemeral public key (33..67, compressed)               |
//! +---------------------------------------------------------+
//! ```

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const MAGIC_NUMBER: [u8; 2] = *b"L1";
pub const VERSION: u8 = 0x4C;

const MAGIC_NUMBER_SIZE: usize = 2;
const VERSION_SIZE: usize = 1;
const GMAC_BINDING_SIZE: usize = 16;
const MAX_LOCATOR_BODY_SIZE: usize = u8::MAX as usize;
const MAX_EMBEDDED_POLICY_SIZE: usize = u16::MAX as usize;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEnum {
    Http = 0x00,
    Https = 0x01,
    Ws = 0x02,
    Wss = 0x03,
    SharedResource = 0xFF,
}

impl ProtocolEnum {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(ProtocolEnum::Http),
            0x01 => Some(ProtocolEnum::Https),
            0x02 => Some(ProtocolEnum::Ws),
            0x03 => Some(ProtocolEnum::Wss),
            0xFF => Some(ProtocolEnum::SharedResource),
            _ => None,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            ProtocolEnum::Http => "http",
            ProtocolEnum::Https => "https",
            ProtocolEnum::Ws => "ws",
            ProtocolEnum::Wss => "wss",
            ProtocolEnum::SharedResource => "shared",
        }
    }
}

/// Scheme plus scheme-less body, e.g. `Https` + `kas.example.com/kas`.
/// Built only through [`ResourceLocator::new`], [`ResourceLocator::parse`] or
/// the header parser, so the body always fits its one-byte length prefix.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceLocator {
    protocol_enum: ProtocolEnum,
    body: String,
}

impl ResourceLocator {
    pub fn new(protocol_enum: ProtocolEnum, body: impl Into<String>) -> Result<Self, ParsingError> {
        let body = body.into();
        if body.is_empty() || body.len() > MAX_LOCATOR_BODY_SIZE {
            return Err(ParsingError::InvalidKas);
        }
        Ok(ResourceLocator {
            protocol_enum,
            body,
        })
    }

    /// Parse a URL such as `https://kas.example.com/kas`.
    pub fn parse(url: &str) -> Result<Self, ParsingError> {
        let (scheme, body) = url.split_once("://").ok_or(ParsingError::InvalidKas)?;
        let protocol_enum = match scheme.to_ascii_lowercase().as_str() {
            "http" => ProtocolEnum::Http,
            "https" => ProtocolEnum::Https,
            "ws" => ProtocolEnum::Ws,
            "wss" => ProtocolEnum::Wss,
            "shared" => ProtocolEnum::SharedResource,
            _ => return Err(ParsingError::InvalidKas),
        };
        Self::new(protocol_enum, body)
    }

    pub fn protocol_enum(&self) -> ProtocolEnum {
        self.protocol_enum
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn to_url(&self) -> String {
        format!("{}://{}", self.protocol_enum.scheme(), self.body)
    }

    fn is_encodable(&self) -> bool {
        !self.body.is_empty() && self.body.len() <= MAX_LOCATOR_BODY_SIZE
    }

    fn encoded_len(&self) -> usize {
        2 + self.body.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.protocol_enum as u8);
        out.push(self.body.len() as u8);
        out.extend_from_slice(self.body.as_bytes());
    }
}

impl TryFrom<String> for ResourceLocator {
    type Error = ParsingError;

    fn try_from(url: String) -> Result<Self, Self::Error> {
        Self::parse(&url)
    }
}

impl From<ResourceLocator> for String {
    fn from(locator: ResourceLocator) -> Self {
        locator.to_url()
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccCurve {
    Secp256r1 = 0x00,
    Secp384r1 = 0x01,
    Secp521r1 = 0x02,
    Secp256k1 = 0x03,
}

impl EccCurve {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(EccCurve::Secp256r1),
            0x01 => Some(EccCurve::Secp384r1),
            0x02 => Some(EccCurve::Secp521r1),
            0x03 => Some(EccCurve::Secp256k1),
            _ => None,
        }
    }

    /// Size of a SEC1 compressed public key on this curve.
    pub fn compressed_key_size(self) -> usize {
        match self {
            EccCurve::Secp256r1 | EccCurve::Secp256k1 => 33,
            EccCurve::Secp384r1 => 49,
            EccCurve::Secp521r1 => 67,
        }
    }

    /// Size of an `r || s` ECDSA signature on this curve.
    pub fn ecdsa_binding_size(self) -> usize {
        match self {
            EccCurve::Secp256r1 | EccCurve::Secp256k1 => 64,
            EccCurve::Secp384r1 => 96,
            EccCurve::Secp521r1 => 132,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetricCipher {
    Gcm64 = 0x00,
    Gcm96 = 0x01,
    Gcm104 = 0x02,
    Gcm112 = 0x03,
    Gcm120 = 0x04,
    Gcm128 = 0x05,
}

impl SymmetricCipher {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(SymmetricCipher::Gcm64),
            0x01 => Some(SymmetricCipher::Gcm96),
            0x02 => Some(SymmetricCipher::Gcm104),
            0x03 => Some(SymmetricCipher::Gcm112),
            0x04 => Some(SymmetricCipher::Gcm120),
            0x05 => Some(SymmetricCipher::Gcm128),
            _ => None,
        }
    }

    pub fn tag_size(self) -> usize {
        match self {
            SymmetricCipher::Gcm64 => 8,
            SymmetricCipher::Gcm96 => 12,
            SymmetricCipher::Gcm104 => 13,
            SymmetricCipher::Gcm112 => 14,
            SymmetricCipher::Gcm120 => 15,
            SymmetricCipher::Gcm128 => 16,
        }
    }
}

/// The two mode bytes of the header. Together they version the key agreement
/// and the collection item framing; changing either byte layout needs a new
/// suite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub use_ecdsa_binding: bool,
    pub curve: EccCurve,
    pub has_signature: bool,
    pub signature_curve: EccCurve,
    pub symmetric_cipher: SymmetricCipher,
}

impl CipherSuite {
    /// P-256 ECDH, GMAC policy binding, AES-256-GCM with 128-bit tags.
    pub const P256_AES256_GCM: CipherSuite = CipherSuite {
        use_ecdsa_binding: false,
        curve: EccCurve::Secp256r1,
        has_signature: false,
        signature_curve: EccCurve::Secp256r1,
        symmetric_cipher: SymmetricCipher::Gcm128,
    };

    pub fn ecc_mode_byte(&self) -> u8 {
        let binding = if self.use_ecdsa_binding { 0x80 } else { 0x00 };
        binding | self.curve as u8
    }

    pub fn payload_config_byte(&self) -> u8 {
        let signature = if self.has_signature { 0x80 } else { 0x00 };
        signature | ((self.signature_curve as u8) << 4) | self.symmetric_cipher as u8
    }

    pub fn from_bytes(ecc_mode: u8, payload_config: u8) -> Result<Self, ParsingError> {
        let use_ecdsa_binding = ecc_mode & 0x80 != 0;
        let curve = EccCurve::from_u8(ecc_mode & 0x07).ok_or(ParsingError::InvalidEccMode)?;

        let has_signature = payload_config & 0x80 != 0;
        let signature_curve = EccCurve::from_u8((payload_config & 0x70) >> 4)
            .ok_or(ParsingError::InvalidPayloadSigMode)?;
        let symmetric_cipher = SymmetricCipher::from_u8(payload_config & 0x0F)
            .ok_or(ParsingError::InvalidPayloadSigMode)?;

        Ok(CipherSuite {
            use_ecdsa_binding,
            curve,
            has_signature,
            signature_curve,
            symmetric_cipher,
        })
    }

    pub fn binding_size(&self) -> usize {
        if self.use_ecdsa_binding {
            self.curve.ecdsa_binding_size()
        } else {
            GMAC_BINDING_SIZE
        }
    }
}

/// Policy as carried in the header: either the document itself or where to
/// fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    Remote(ResourceLocator),
    Embedded(Vec<u8>),
}

impl Policy {
    const REMOTE: u8 = 0x00;
    const EMBEDDED: u8 = 0x01;

    /// Bytes covered by the policy binding.
    pub fn binding_input(&self) -> Vec<u8> {
        match self {
            Policy::Remote(locator) => locator.to_url().into_bytes(),
            Policy::Embedded(body) => body.clone(),
        }
    }

    pub fn embedded_body(&self) -> Option<&[u8]> {
        match self {
            Policy::Embedded(body) => Some(body),
            Policy::Remote(_) => None,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Policy::Remote(locator) => 1 + locator.encoded_len(),
            Policy::Embedded(body) => 3 + body.len(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Policy::Remote(locator) => {
                out.push(Self::REMOTE);
                locator.write(out);
            }
            Policy::Embedded(body) => {
                out.push(Self::EMBEDDED);
                out.extend_from_slice(&(body.len() as u16).to_be_bytes());
                out.extend_from_slice(body);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    cipher_suite: CipherSuite,
    kas: ResourceLocator,
    policy: Policy,
    policy_binding: Vec<u8>,
    ephemeral_key: Vec<u8>,
}

impl Header {
    /// Build a header, checking every field fits its wire slot.
    pub fn new(
        cipher_suite: CipherSuite,
        kas: ResourceLocator,
        policy: Policy,
        policy_binding: Vec<u8>,
        ephemeral_key: Vec<u8>,
    ) -> Result<Self, ParsingError> {
        if !kas.is_encodable() {
            return Err(ParsingError::InvalidKas);
        }
        match &policy {
            Policy::Embedded(body) if body.len() > MAX_EMBEDDED_POLICY_SIZE => {
                return Err(ParsingError::InvalidPolicy);
            }
            Policy::Remote(locator) if !locator.is_encodable() => {
                return Err(ParsingError::InvalidPolicy);
            }
            _ => {}
        }
        if policy_binding.len() != cipher_suite.binding_size() {
            return Err(ParsingError::InvalidPolicyBinding);
        }
        if ephemeral_key.len() != cipher_suite.curve.compressed_key_size() {
            return Err(ParsingError::InvalidEphemeralKey);
        }
        Ok(Header {
            cipher_suite,
            kas,
            policy,
            policy_binding,
            ephemeral_key,
        })
    }

    pub fn get_cipher_suite(&self) -> &CipherSuite {
        &self.cipher_suite
    }
    pub fn get_kas(&self) -> &ResourceLocator {
        &self.kas
    }
    pub fn get_policy(&self) -> &Policy {
        &self.policy
    }
    pub fn get_policy_binding(&self) -> &[u8] {
        &self.policy_binding
    }
    pub fn get_ephemeral_key(&self) -> &[u8] {
        &self.ephemeral_key
    }

    pub fn encoded_len(&self) -> usize {
        MAGIC_NUMBER_SIZE
            + VERSION_SIZE
            + self.kas.encoded_len()
            + 2
            + self.policy.encoded_len()
            + self.policy_binding.len()
            + self.ephemeral_key.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&MAGIC_NUMBER);
        out.push(VERSION);
        self.kas.write(&mut out);
        out.push(self.cipher_suite.ecc_mode_byte());
        out.push(self.cipher_suite.payload_config_byte());
        self.policy.write(&mut out);
        out.extend_from_slice(&self.policy_binding);
        out.extend_from_slice(&self.ephemeral_key);
        out
    }

    /// Decode exactly one header. Short input is `Truncated`; bytes left over
    /// after a complete header are `TrailingBytes`, since the header itself
    /// parsed and the mismatch is in the framing around it.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParsingError> {
        let mut parser = BinaryParser::new(bytes);
        let header = parser.parse_header()?;
        match parser.remaining() {
            0 => Ok(header),
            n => Err(ParsingError::TrailingBytes(n)),
        }
    }
}

/// Cursor over a borrowed buffer. Every read is bounds-checked against what
/// is actually left, so a spoofed length can only produce `Truncated`.
pub struct BinaryParser<'a> {
    data: &'a [u8],
    pub position: usize,
}

impl<'a> BinaryParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BinaryParser { data, position: 0 }
    }

    pub fn parse_header(&mut self) -> Result<Header, ParsingError> {
        if self.read(MAGIC_NUMBER_SIZE)? != MAGIC_NUMBER {
            return Err(ParsingError::InvalidMagicNumber);
        }
        if self.read_u8()? != VERSION {
            return Err(ParsingError::InvalidVersion);
        }
        let kas = self.read_kas_field()?;
        let cipher_suite = self.read_cipher_suite()?;
        let policy = self.read_policy_field()?;
        let policy_binding = self.read(cipher_suite.binding_size())?.to_vec();
        let ephemeral_key = self
            .read(cipher_suite.curve.compressed_key_size())?
            .to_vec();

        Ok(Header {
            cipher_suite,
            kas,
            policy,
            policy_binding,
            ephemeral_key,
        })
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn read(&mut self, length: usize) -> Result<&'a [u8], ParsingError> {
        if length > self.remaining() {
            return Err(ParsingError::Truncated);
        }
        let result = &self.data[self.position..self.position + length];
        self.position += length;
        Ok(result)
    }

    pub fn read_u8(&mut self) -> Result<u8, ParsingError> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ParsingError> {
        let bytes = self.read(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, ParsingError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.read(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_kas_field(&mut self) -> Result<ResourceLocator, ParsingError> {
        let protocol_enum =
            ProtocolEnum::from_u8(self.read_u8()?).ok_or(ParsingError::InvalidKas)?;
        let body_length = self.read_u8()? as usize;
        let body = std::str::from_utf8(self.read(body_length)?)
            .map_err(|_| ParsingError::InvalidKas)?
            .to_string();
        Ok(ResourceLocator {
            protocol_enum,
            body,
        })
    }

    fn read_cipher_suite(&mut self) -> Result<CipherSuite, ParsingError> {
        let ecc_mode = self.read_u8()?;
        let payload_config = self.read_u8()?;
        CipherSuite::from_bytes(ecc_mode, payload_config)
    }

    fn read_policy_field(&mut self) -> Result<Policy, ParsingError> {
        match self.read_u8()? {
            Policy::REMOTE => Ok(Policy::Remote(self.read_kas_field()?)),
            Policy::EMBEDDED => {
                let length = self.read_u16()? as usize;
                Ok(Policy::Embedded(self.read(length)?.to_vec()))
            }
            _ => Err(ParsingError::InvalidPolicy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsingError {
    Truncated,
    TrailingBytes(usize),
    InvalidMagicNumber,
    InvalidVersion,
    InvalidKas,
    InvalidEccMode,
    InvalidPayloadSigMode,
    InvalidPolicy,
    InvalidPolicyBinding,
    InvalidEphemeralKey,
    InvalidMessageType(u8),
    InvalidSessionState(u8),
    InvalidToken,
    FieldTooLong(usize),
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParsingError::Truncated => f.write_str("Truncated"),
            ParsingError::TrailingBytes(n) => write!(f, "TrailingBytes({})", n),
            ParsingError::InvalidMagicNumber => f.write_str("InvalidMagicNumber"),
            ParsingError::InvalidVersion => f.write_str("InvalidVersion"),
            ParsingError::InvalidKas => f.write_str("InvalidKas"),
            ParsingError::InvalidEccMode => f.write_str("InvalidEccMode"),
            ParsingError::InvalidPayloadSigMode => f.write_str("InvalidPayloadSigMode"),
            ParsingError::InvalidPolicy => f.write_str("InvalidPolicy"),
            ParsingError::InvalidPolicyBinding => f.write_str("InvalidPolicyBinding"),
            ParsingError::InvalidEphemeralKey => f.write_str("InvalidEphemeralKey"),
            ParsingError::InvalidMessageType(t) => write!(f, "InvalidMessageType({:#04x})", t),
            ParsingError::InvalidSessionState(s) => write!(f, "InvalidSessionState({:#04x})", s),
            ParsingError::InvalidToken => f.write_str("InvalidToken"),
            ParsingError::FieldTooLong(n) => write!(f, "FieldTooLong({})", n),
        }
    }
}

impl Error for ParsingError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(policy: Policy) -> Header {
        Header::new(
            CipherSuite::P256_AES256_GCM,
            ResourceLocator::parse("https://kas.example.com/kas").unwrap(),
            policy,
            vec![0xAB; 16],
            {
                let mut key = vec![0x02];
                key.extend_from_slice(&[0x11; 32]);
                key
            },
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip_embedded_policy() {
        let header = sample_header(Policy::Embedded(br#"{"expiry":null}"#.to_vec()));
        let bytes = header.encode();
        assert_eq!(bytes.len(), header.encoded_len());
        assert_eq!(&bytes[..3], b"L1L");
        assert_eq!(Header::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_round_trip_remote_policy_with_ecdsa_binding() {
        let suite = CipherSuite {
            use_ecdsa_binding: true,
            curve: EccCurve::Secp384r1,
            has_signature: true,
            signature_curve: EccCurve::Secp521r1,
            symmetric_cipher: SymmetricCipher::Gcm96,
        };
        let header = Header::new(
            suite,
            ResourceLocator::parse("wss://kas.example.com").unwrap(),
            Policy::Remote(ResourceLocator::parse("https://policy.example.com/p/1").unwrap()),
            vec![0x01; 96],
            vec![0x03; 49],
        )
        .unwrap();
        assert_eq!(Header::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_every_truncation_is_reported() {
        let bytes = sample_header(Policy::Embedded(vec![7; 40])).encode();
        for len in 0..bytes.len() {
            assert_eq!(
                Header::decode(&bytes[..len]),
                Err(ParsingError::Truncated),
                "prefix of {} bytes",
                len
            );
        }
    }

    #[test]
    fn test_spoofed_policy_length_is_truncated() {
        let mut bytes = sample_header(Policy::Embedded(vec![7; 4])).encode();
        // policy length sits right after magic, version, locator and mode bytes
        let offset = 3 + 2 + "kas.example.com/kas".len() + 2 + 1;
        bytes[offset] = 0xFF;
        bytes[offset + 1] = 0xFF;
        assert_eq!(Header::decode(&bytes), Err(ParsingError::Truncated));
    }

    #[test]
    fn test_trailing_bytes_rejected_but_streaming_parser_tolerates() {
        let header = sample_header(Policy::Embedded(vec![1, 2, 3]));
        let mut bytes = header.encode();
        bytes.extend_from_slice(&[0xEE, 0xEE]);
        assert_eq!(Header::decode(&bytes), Err(ParsingError::TrailingBytes(2)));

        let mut parser = BinaryParser::new(&bytes);
        assert_eq!(parser.parse_header().unwrap(), header);
        assert_eq!(parser.remaining(), 2);
    }

    #[test]
    fn test_truncated_reference_sample() {
        // Reference header fragment: ECDSA binding over a remote policy, cut
        // short inside the binding.
        let hex_string = "\
            4c 31 4c 01 0e 6b 61 73 2e 76 69 72 74 72 75 2e 63 6f 6d 80\
            80 00 01 15 6b 61 73 2e 76 69 72 74 72 75 2e 63 6f 6d 2f 70\
            6f 6c 69 63 79 b5 e4 13 a6 02 11 e5 f1 7b 22 34 a0 cd 3f 36\
            ff 7b ba 6d 8f e8 df 23 f6 2c 9d 09 35 6f 85 82 f8 a9 cf 15\
            12 6c 8a 9d a4 6c 5e 4e 0c bc c8 26 97 19 ac 05 1b 80 62 5c\
            c7 54 03 03 6f fb 82 87 1f 02 f7 7f ba e5 26 09 da";
        let bytes = hex::decode(hex_string.replace(' ', "")).unwrap();

        let mut parser = BinaryParser::new(&bytes);
        assert_eq!(parser.read(3).unwrap(), b"L1L");
        let kas = parser.read_kas_field().unwrap();
        assert_eq!(kas.to_url(), "https://kas.virtru.com");

        assert_eq!(Header::decode(&bytes), Err(ParsingError::Truncated));
    }

    #[test]
    fn test_invalid_enums() {
        let mut bytes = sample_header(Policy::Embedded(vec![])).encode();
        bytes[0] = b'X';
        assert_eq!(Header::decode(&bytes), Err(ParsingError::InvalidMagicNumber));

        let mut bytes = sample_header(Policy::Embedded(vec![])).encode();
        bytes[2] = 0x4D;
        assert_eq!(Header::decode(&bytes), Err(ParsingError::InvalidVersion));

        let mut bytes = sample_header(Policy::Embedded(vec![])).encode();
        bytes[3] = 0x09;
        assert_eq!(Header::decode(&bytes), Err(ParsingError::InvalidKas));
    }

    #[test]
    fn test_binding_sizes() {
        let mut suite = CipherSuite::P256_AES256_GCM;
        assert_eq!(suite.binding_size(), 16);
        suite.use_ecdsa_binding = true;
        assert_eq!(suite.binding_size(), 64);
        suite.curve = EccCurve::Secp384r1;
        assert_eq!(suite.binding_size(), 96);
        suite.curve = EccCurve::Secp521r1;
        assert_eq!(suite.binding_size(), 132);
    }

    #[test]
    fn test_header_new_rejects_wrong_sizes() {
        let kas = ResourceLocator::parse("https://kas.example.com").unwrap();
        let err = Header::new(
            CipherSuite::P256_AES256_GCM,
            kas.clone(),
            Policy::Embedded(vec![]),
            vec![0; 15],
            vec![0; 33],
        );
        assert_eq!(err, Err(ParsingError::InvalidPolicyBinding));

        let err = Header::new(
            CipherSuite::P256_AES256_GCM,
            kas,
            Policy::Embedded(vec![]),
            vec![0; 16],
            vec![0; 65],
        );
        assert_eq!(err, Err(ParsingError::InvalidEphemeralKey));
    }

    #[test]
    fn test_remote_policy_locator_must_fit_length_prefix() {
        let too_long = format!("https://{}", "p".repeat(300));
        assert_eq!(ResourceLocator::parse(&too_long), Err(ParsingError::InvalidKas));
        assert!(serde_json::from_str::<ResourceLocator>(&format!("\"{}\"", too_long)).is_err());

        let longest = ResourceLocator::parse(&format!("https://{}", "p".repeat(255))).unwrap();
        let header = sample_header(Policy::Remote(longest));
        assert_eq!(Header::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_resource_locator_serializes_as_url() {
        let locator = ResourceLocator::parse("wss://kas.example.com/ws").unwrap();
        let json = serde_json::to_string(&locator).unwrap();
        assert_eq!(json, "\"wss://kas.example.com/ws\"");
        assert_eq!(serde_json::from_str::<ResourceLocator>(&json).unwrap(), locator);
    }

    #[test]
    fn test_resource_locator_parse() {
        let locator = ResourceLocator::parse("WSS://kas.example.com/ws").unwrap();
        assert_eq!(locator.protocol_enum(), ProtocolEnum::Wss);
        assert_eq!(locator.to_url(), "wss://kas.example.com/ws");
        assert_eq!(
            ResourceLocator::parse("ftp://x"),
            Err(ParsingError::InvalidKas)
        );
        assert_eq!(
            ResourceLocator::parse("kas.example.com"),
            Err(ParsingError::InvalidKas)
        );
    }
}
