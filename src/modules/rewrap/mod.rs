//! Rewrap protocol: binary messages exchanged between subscribers and the KAS.
//!
//! Every message starts with a one-byte [`MessageType`]. Multi-byte integers
//! are big-endian; variable fields carry a u16 length prefix.

pub mod client;
pub mod service;
pub mod token;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::header::{BinaryParser, ParsingError};
use crate::modules::policy::PolicyViolation;
use crate::session_manager::SessionState;

pub use client::{ClientError, RewrapClient, RewrapOutcome, RewrapTransport, TransportError};
pub use service::KasService;
pub use token::{PolicyClaims, TokenValidator};

pub const COMPRESSED_KEY_SIZE: usize = 33;
const SESSION_ID_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    KasPublicKey = 0x02,
    Rewrap = 0x03,
    RewrappedKey = 0x04,
    Heartbeat = 0x06,
    EndSession = 0x07,
    Ack = 0x08,
    Error = 0x0F,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            0x02 => Some(MessageType::KasPublicKey),
            0x03 => Some(MessageType::Rewrap),
            0x04 => Some(MessageType::RewrappedKey),
            0x06 => Some(MessageType::Heartbeat),
            0x07 => Some(MessageType::EndSession),
            0x08 => Some(MessageType::Ack),
            0x0F => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// Splits a raw message into its type and payload.
pub fn split_message(data: &[u8]) -> Result<(MessageType, &[u8]), ParsingError> {
    let (&first, payload) = data.split_first().ok_or(ParsingError::Truncated)?;
    let message_type = MessageType::from_u8(first).ok_or(ParsingError::InvalidMessageType(first))?;
    Ok((message_type, payload))
}

fn finish(parser: &BinaryParser) -> Result<(), ParsingError> {
    match parser.remaining() {
        0 => Ok(()),
        n => Err(ParsingError::TrailingBytes(n)),
    }
}

fn read_session_id(parser: &mut BinaryParser) -> Result<Uuid, ParsingError> {
    let mut bytes = [0u8; SESSION_ID_SIZE];
    bytes.copy_from_slice(parser.read(SESSION_ID_SIZE)?);
    Ok(Uuid::from_bytes(bytes))
}

fn read_prefixed<'a>(parser: &mut BinaryParser<'a>) -> Result<&'a [u8], ParsingError> {
    let length = parser.read_u16()? as usize;
    parser.read(length)
}

fn write_prefixed(out: &mut Vec<u8>, body: &[u8]) -> Result<(), ParsingError> {
    let length = u16::try_from(body.len()).map_err(|_| ParsingError::FieldTooLong(body.len()))?;
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(body);
    Ok(())
}

/// Subscriber → KAS: `[0x03][u16 len][header][33B client key][u16 len][token][16B session id]?`
///
/// The session id is present when a viewer asks for the key of a rotated
/// collection on a stream it is already watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrapRequest {
    pub header: Vec<u8>,
    pub client_public_key: Vec<u8>,
    pub policy_token: String,
    pub session_id: Option<Uuid>,
}

impl RewrapRequest {
    pub fn to_message(&self) -> Result<Vec<u8>, ParsingError> {
        if self.client_public_key.len() != COMPRESSED_KEY_SIZE {
            return Err(ParsingError::InvalidEphemeralKey);
        }
        let mut out = Vec::with_capacity(
            1 + 2 + self.header.len() + COMPRESSED_KEY_SIZE + 2 + self.policy_token.len() + SESSION_ID_SIZE,
        );
        out.push(MessageType::Rewrap as u8);
        write_prefixed(&mut out, &self.header)?;
        out.extend_from_slice(&self.client_public_key);
        write_prefixed(&mut out, self.policy_token.as_bytes())?;
        if let Some(session_id) = self.session_id {
            out.extend_from_slice(session_id.as_bytes());
        }
        Ok(out)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ParsingError> {
        let mut parser = BinaryParser::new(payload);
        let header = read_prefixed(&mut parser)?.to_vec();
        let client_public_key = parser.read(COMPRESSED_KEY_SIZE)?.to_vec();
        let token = read_prefixed(&mut parser)?;
        let session_id = match parser.remaining() {
            0 => None,
            _ => Some(read_session_id(&mut parser)?),
        };
        finish(&parser)?;
        let policy_token = String::from_utf8(token.to_vec()).map_err(|_| ParsingError::InvalidToken)?;
        Ok(RewrapRequest {
            header,
            client_public_key,
            policy_token,
            session_id,
        })
    }
}

/// KAS → subscriber: `[0x04][16B session id][33B KAS ephemeral key][u16 len][wrapped key]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrapResponse {
    pub session_id: Uuid,
    pub kas_ephemeral_public_key: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

impl RewrapResponse {
    pub fn to_message(&self) -> Result<Vec<u8>, ParsingError> {
        if self.kas_ephemeral_public_key.len() != COMPRESSED_KEY_SIZE {
            return Err(ParsingError::InvalidEphemeralKey);
        }
        let mut out = Vec::with_capacity(1 + SESSION_ID_SIZE + COMPRESSED_KEY_SIZE + 2 + self.wrapped_key.len());
        out.push(MessageType::RewrappedKey as u8);
        out.extend_from_slice(self.session_id.as_bytes());
        out.extend_from_slice(&self.kas_ephemeral_public_key);
        write_prefixed(&mut out, &self.wrapped_key)?;
        Ok(out)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ParsingError> {
        let mut parser = BinaryParser::new(payload);
        let session_id = read_session_id(&mut parser)?;
        let kas_ephemeral_public_key = parser.read(COMPRESSED_KEY_SIZE)?.to_vec();
        let wrapped_key = read_prefixed(&mut parser)?.to_vec();
        finish(&parser)?;
        Ok(RewrapResponse {
            session_id,
            kas_ephemeral_public_key,
            wrapped_key,
        })
    }
}

/// `[0x06][16B session id][state][has position][u64 position ms]?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub session_id: Uuid,
    pub state: SessionState,
    pub position_ms: Option<u64>,
}

impl HeartbeatRequest {
    pub fn to_message(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + SESSION_ID_SIZE + 2 + 8);
        out.push(MessageType::Heartbeat as u8);
        out.extend_from_slice(self.session_id.as_bytes());
        out.push(self.state.as_u8());
        match self.position_ms {
            Some(position) => {
                out.push(1);
                out.extend_from_slice(&position.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ParsingError> {
        let mut parser = BinaryParser::new(payload);
        let session_id = read_session_id(&mut parser)?;
        let state_byte = parser.read_u8()?;
        let state = SessionState::from_u8(state_byte).ok_or(ParsingError::InvalidSessionState(state_byte))?;
        let position_ms = match parser.read_u8()? {
            0 => None,
            _ => Some(parser.read_u64()?),
        };
        finish(&parser)?;
        Ok(HeartbeatRequest {
            session_id,
            state,
            position_ms,
        })
    }
}

/// Session id alone; used by `EndSession` and `Ack`.
pub fn session_message(message_type: MessageType, session_id: Uuid) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + SESSION_ID_SIZE);
    out.push(message_type as u8);
    out.extend_from_slice(session_id.as_bytes());
    out
}

pub fn parse_session_payload(payload: &[u8]) -> Result<Uuid, ParsingError> {
    let mut parser = BinaryParser::new(payload);
    let session_id = read_session_id(&mut parser)?;
    finish(&parser)?;
    Ok(session_id)
}

/// JSON body of an `Error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KasFailure {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<PolicyViolation>,
}

impl KasFailure {
    pub fn to_message(&self) -> Vec<u8> {
        let mut out = vec![MessageType::Error as u8];
        // a struct of strings always serializes
        if let Ok(body) = serde_json::to_vec(self) {
            out.extend_from_slice(&body);
        }
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Why the KAS refused a request, in pipeline order.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewrapError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
    #[error("Policy validation failed: {0}")]
    PolicyValidationFailed(PolicyViolation),
    #[error("Session error: {0}")]
    Session(String),
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),
}

impl RewrapError {
    pub fn code(&self) -> &'static str {
        match self {
            RewrapError::MalformedMessage(_) => "invalid_request",
            RewrapError::InvalidHeader(_) => "invalid_header",
            RewrapError::Unauthorized(_) => "unauthorized",
            RewrapError::KeyDerivationFailed(_) => "key_derivation_failed",
            RewrapError::PolicyValidationFailed(_) => "policy_validation_failed",
            RewrapError::Session(_) => "session_error",
            RewrapError::SessionNotFound(_) => "session_not_found",
        }
    }

    pub fn to_failure(&self) -> KasFailure {
        KasFailure {
            error: self.code().to_string(),
            message: self.to_string(),
            violation: match self {
                RewrapError::PolicyValidationFailed(violation) => Some(violation.clone()),
                _ => None,
            },
        }
    }
}
