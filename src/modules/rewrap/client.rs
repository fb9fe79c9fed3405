//! Subscriber side of the rewrap protocol.
//!
//! The client performs exactly one round trip per call and never retries;
//! transport failures and KAS refusals surface as different errors so the
//! caller can decide which are worth another attempt.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use p256::PublicKey;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::{
    parse_session_payload, session_message, split_message, HeartbeatRequest, KasFailure, KasService,
    MessageType, RewrapRequest, RewrapResponse, COMPRESSED_KEY_SIZE,
};
use crate::header::{Header, ParsingError};
use crate::modules::crypto::{self, CollectionKey, KeyAgreementError, SubscriberKeyAgreement, WrappedKey};
use crate::session_manager::SessionState;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Connection closed by KAS")]
    Closed,
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("KAS refused request: {} ({})", .0.message, .0.error)]
    Denied(KasFailure),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid header: {0}")]
    Header(#[from] ParsingError),
    #[error("Key agreement failed: {0}")]
    KeyAgreement(#[from] KeyAgreementError),
}

/// Carries one request message to the KAS and returns its reply.
#[async_trait]
pub trait RewrapTransport: Send + Sync {
    async fn round_trip(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

type KasSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connection to a KAS; requests are serialized over one socket.
///
/// Each exchange runs in its own task that holds the socket until the reply
/// is read, so dropping a `round_trip` future never leaves a reply behind
/// for the next request to pick up.
pub struct WebSocketTransport {
    stream: Arc<Mutex<KasSocket>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        info!("Connected to KAS at {}", url);
        Ok(WebSocketTransport {
            stream: Arc::new(Mutex::new(stream)),
        })
    }
}

#[async_trait]
impl RewrapTransport for WebSocketTransport {
    async fn round_trip(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.clone();
        tokio::spawn(async move {
            let mut stream = stream.lock().await;
            exchange(&mut stream, request).await
        })
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?
    }
}

async fn exchange(stream: &mut KasSocket, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
    stream
        .send(Message::Binary(request))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    while let Some(incoming) = stream.next().await {
        match incoming.map_err(|e| TransportError::Connection(e.to_string()))? {
            Message::Binary(data) => return Ok(data),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err(TransportError::Closed),
            other => {
                return Err(TransportError::UnexpectedFrame(format!(
                    "{} byte non-binary frame",
                    other.len()
                )))
            }
        }
    }
    Err(TransportError::Closed)
}

/// Calls a `KasService` in the same process.
pub struct InProcessTransport {
    service: Arc<KasService>,
    client_ip: Option<String>,
}

impl InProcessTransport {
    pub fn new(service: Arc<KasService>) -> Self {
        InProcessTransport {
            service,
            client_ip: None,
        }
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }
}

#[async_trait]
impl RewrapTransport for InProcessTransport {
    async fn round_trip(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        Ok(self.service.handle_message(&request, self.client_ip.as_deref()).await)
    }
}

/// A released collection key and the session it is accounted to.
#[derive(Debug)]
pub struct RewrapOutcome {
    pub session_id: Uuid,
    pub header: Header,
    pub key: CollectionKey,
}

pub struct RewrapClient<T: RewrapTransport> {
    transport: T,
}

impl<T: RewrapTransport> RewrapClient<T> {
    pub fn new(transport: T) -> Self {
        RewrapClient { transport }
    }

    async fn call(&self, request: Vec<u8>, expected: MessageType) -> Result<Vec<u8>, ClientError> {
        let reply = self.transport.round_trip(request).await?;
        let (message_type, payload) = split_message(&reply)?;
        match message_type {
            t if t == expected => Ok(payload.to_vec()),
            MessageType::Error => {
                let failure = KasFailure::from_payload(payload)
                    .map_err(|e| ClientError::Protocol(format!("unreadable error frame: {}", e)))?;
                Err(ClientError::Denied(failure))
            }
            other => Err(ClientError::Protocol(format!(
                "expected {:?}, got {:?}",
                expected, other
            ))),
        }
    }

    pub async fn kas_public_key(&self) -> Result<PublicKey, ClientError> {
        let payload = self
            .call(vec![MessageType::KasPublicKey as u8], MessageType::KasPublicKey)
            .await?;
        if payload.len() != COMPRESSED_KEY_SIZE {
            return Err(ClientError::Protocol(format!(
                "KAS public key is {} bytes",
                payload.len()
            )));
        }
        Ok(crypto::parse_public_key(&payload)?)
    }

    /// Submit `header_bytes` with a policy token and recover the collection
    /// key under a fresh ephemeral keypair. The key is only returned after
    /// the header's policy binding verifies with it.
    pub async fn rewrap(&self, header_bytes: &[u8], policy_token: &str) -> Result<RewrapOutcome, ClientError> {
        self.request_key(header_bytes, policy_token, None).await
    }

    /// Like [`rewrap`](Self::rewrap) for a viewer already holding
    /// `session_id`, e.g. when the publisher rotated to a new collection.
    /// The KAS keeps the existing session instead of opening another.
    pub async fn rewrap_in_session(
        &self,
        header_bytes: &[u8],
        policy_token: &str,
        session_id: Uuid,
    ) -> Result<RewrapOutcome, ClientError> {
        self.request_key(header_bytes, policy_token, Some(session_id)).await
    }

    async fn request_key(
        &self,
        header_bytes: &[u8],
        policy_token: &str,
        session_id: Option<Uuid>,
    ) -> Result<RewrapOutcome, ClientError> {
        let header = Header::decode(header_bytes)?;
        let agreement = SubscriberKeyAgreement::generate();

        let request = RewrapRequest {
            header: header_bytes.to_vec(),
            client_public_key: agreement.public_key_bytes(),
            policy_token: policy_token.to_string(),
            session_id,
        }
        .to_message()?;

        let payload = self.call(request, MessageType::RewrappedKey).await?;
        let response = RewrapResponse::from_payload(&payload)?;
        let key = agreement.unwrap(
            &header,
            &WrappedKey {
                kas_ephemeral_public_key: response.kas_ephemeral_public_key,
                wrapped_key: response.wrapped_key,
            },
        )?;
        debug!("Collection key released for session {}", response.session_id);

        Ok(RewrapOutcome {
            session_id: response.session_id,
            header,
            key,
        })
    }

    pub async fn heartbeat(
        &self,
        session_id: Uuid,
        state: SessionState,
        position_ms: Option<u64>,
    ) -> Result<(), ClientError> {
        let request = HeartbeatRequest {
            session_id,
            state,
            position_ms,
        }
        .to_message();
        self.expect_ack(request, session_id).await
    }

    pub async fn end_session(&self, session_id: Uuid) -> Result<(), ClientError> {
        self.expect_ack(session_message(MessageType::EndSession, session_id), session_id)
            .await
    }

    async fn expect_ack(&self, request: Vec<u8>, session_id: Uuid) -> Result<(), ClientError> {
        let payload = self.call(request, MessageType::Ack).await?;
        let acked = parse_session_payload(&payload)?;
        if acked != session_id {
            return Err(ClientError::Protocol(format!(
                "ack for {} while waiting on {}",
                acked, session_id
            )));
        }
        Ok(())
    }
}
