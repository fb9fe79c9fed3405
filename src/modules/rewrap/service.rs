//! KAS side of the rewrap protocol.

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::{
    parse_session_payload, session_message, split_message, HeartbeatRequest, KasFailure, MessageType,
    RewrapError, RewrapRequest, RewrapResponse, TokenValidator,
};
use crate::header::{Header, ResourceLocator};
use crate::modules::crypto::{self, KeyWrapBackend};
use crate::modules::policy::PolicyDocument;
use crate::session_manager::{SessionError, SessionManager, SessionRequest};

/// Stateless request handler in front of the key backend and the session
/// manager. Cheap to share across connections behind an `Arc`.
pub struct KasService {
    backend: Arc<dyn KeyWrapBackend>,
    sessions: SessionManager,
    tokens: TokenValidator,
    kas_locator: Option<ResourceLocator>,
    enable_timing_logs: bool,
}

impl KasService {
    pub fn new(backend: Arc<dyn KeyWrapBackend>, sessions: SessionManager, tokens: TokenValidator) -> Self {
        KasService {
            backend,
            sessions,
            tokens,
            kas_locator: None,
            enable_timing_logs: false,
        }
    }

    pub fn with_timing_logs(mut self, enabled: bool) -> Self {
        self.enable_timing_logs = enabled;
        self
    }

    /// Refuse headers whose KAS locator names a different service.
    pub fn with_kas_locator(mut self, locator: ResourceLocator) -> Self {
        self.kas_locator = Some(locator);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn kas_public_key_bytes(&self) -> Vec<u8> {
        crypto::compressed_public_key(self.backend.public_key())
    }

    fn log_timing(&self, message: &str, duration: std::time::Duration) {
        if self.enable_timing_logs {
            info!("{}: {:?}", message, duration);
        }
    }

    /// Dispatches one binary message and returns the reply to send back.
    /// Every request gets exactly one reply; failures become `Error` frames.
    pub async fn handle_message(&self, data: &[u8], client_ip: Option<&str>) -> Vec<u8> {
        match self.dispatch(data, client_ip).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Request rejected: {}", e);
                e.to_failure().to_message()
            }
        }
    }

    async fn dispatch(&self, data: &[u8], client_ip: Option<&str>) -> Result<Vec<u8>, RewrapError> {
        let (message_type, payload) =
            split_message(data).map_err(|e| RewrapError::MalformedMessage(e.to_string()))?;
        let malformed = |e: crate::header::ParsingError| RewrapError::MalformedMessage(e.to_string());

        match message_type {
            MessageType::KasPublicKey => {
                let mut reply = vec![MessageType::KasPublicKey as u8];
                reply.extend_from_slice(&self.kas_public_key_bytes());
                Ok(reply)
            }
            MessageType::Rewrap => {
                let request = RewrapRequest::from_payload(payload).map_err(malformed)?;
                let response = self.rewrap(&request, client_ip).await?;
                response.to_message().map_err(malformed)
            }
            MessageType::Heartbeat => {
                let heartbeat = HeartbeatRequest::from_payload(payload).map_err(malformed)?;
                self.sessions
                    .update_heartbeat(heartbeat.session_id, heartbeat.state, heartbeat.position_ms)
                    .await
                    .map_err(session_failure)?;
                Ok(session_message(MessageType::Ack, heartbeat.session_id))
            }
            MessageType::EndSession => {
                let session_id = parse_session_payload(payload).map_err(malformed)?;
                self.sessions.end_session(session_id).await.map_err(session_failure)?;
                Ok(session_message(MessageType::Ack, session_id))
            }
            MessageType::RewrappedKey | MessageType::Ack | MessageType::Error => Err(
                RewrapError::MalformedMessage(format!("{:?} is a response type", message_type)),
            ),
        }
    }

    /// Header, token, key, policy, wrap. The first failing step decides the
    /// error; a session opened by the policy step is closed again if the
    /// wrap fails. A request naming an existing session re-admits that
    /// session instead of opening another one.
    pub async fn rewrap(
        &self,
        request: &RewrapRequest,
        client_ip: Option<&str>,
    ) -> Result<RewrapResponse, RewrapError> {
        let start_time = Instant::now();

        let header = Header::decode(&request.header).map_err(|e| RewrapError::InvalidHeader(e.to_string()))?;
        if let Some(expected) = &self.kas_locator {
            if header.get_kas() != expected {
                return Err(RewrapError::InvalidHeader(format!(
                    "addressed to {}, this KAS is {}",
                    header.get_kas(),
                    expected
                )));
            }
        }
        let policy_body = header.get_policy().embedded_body().ok_or_else(|| {
            RewrapError::InvalidHeader("remote policies cannot be evaluated".to_string())
        })?;
        let policy = PolicyDocument::from_json(policy_body)
            .map_err(|e| RewrapError::InvalidHeader(format!("policy body: {}", e)))?;

        let claims = self
            .tokens
            .validate(&request.policy_token)
            .map_err(|e| RewrapError::Unauthorized(e.to_string()))?;

        let derive_time = Instant::now();
        let collection_key = self
            .backend
            .derive_collection_key(&header)
            .map_err(|e| RewrapError::KeyDerivationFailed(e.to_string()))?;
        let client_public_key = crypto::parse_public_key(&request.client_public_key)
            .map_err(|e| RewrapError::MalformedMessage(e.to_string()))?;
        self.log_timing("Time to derive collection key", derive_time.elapsed());

        let session_request = SessionRequest {
            user_id: claims.sub.clone(),
            asset_id: claims.asset_id.clone(),
            client_ip: client_ip.map(str::to_string),
            geo_region: claims.geo_region.clone(),
            policy: Arc::new(policy),
            device: claims.device.clone(),
        };
        let (session_id, opened) = match request.session_id {
            Some(existing) => {
                self.sessions
                    .resume_session(existing, session_request)
                    .await
                    .map_err(admission_failure)?;
                (existing, false)
            }
            None => {
                let opened = self
                    .sessions
                    .start_session(session_request)
                    .await
                    .map_err(admission_failure)?;
                (opened, true)
            }
        };

        let wrapped = match self.backend.wrap_for_recipient(&collection_key, &client_public_key) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                error!("Wrap failed for session {}: {}", session_id, e);
                if opened {
                    self.release(session_id).await;
                }
                return Err(RewrapError::KeyDerivationFailed(e.to_string()));
            }
        };

        info!(
            "Rewrapped key for user {} on asset {} (session {})",
            claims.sub, claims.asset_id, session_id
        );
        self.log_timing("Time to rewrap", start_time.elapsed());

        Ok(RewrapResponse {
            session_id,
            kas_ephemeral_public_key: wrapped.kas_ephemeral_public_key,
            wrapped_key: wrapped.wrapped_key,
        })
    }

    async fn release(&self, session_id: Uuid) {
        if let Err(e) = self.sessions.end_session(session_id).await {
            error!("Failed to release session {}: {}", session_id, e);
        }
    }
}

fn admission_failure(error: SessionError) -> RewrapError {
    match error {
        SessionError::PolicyViolation(violation) => RewrapError::PolicyValidationFailed(violation),
        SessionError::NotOwner(id) => RewrapError::Unauthorized(format!("session {} is not yours", id)),
        other => session_failure(other),
    }
}

fn session_failure(error: SessionError) -> RewrapError {
    match error {
        SessionError::NotFound(id) => RewrapError::SessionNotFound(id),
        other => RewrapError::Session(other.to_string()),
    }
}

/// Reply for a request the transport could not even frame.
pub fn malformed_reply(reason: &str) -> Vec<u8> {
    KasFailure {
        error: "invalid_request".to_string(),
        message: reason.to_string(),
        violation: None,
    }
    .to_message()
}
