//! Playback session tracking for key release.
//!
//! A single actor task owns every session record and the per-user stream
//! counts. Callers talk to it through a cloneable [`SessionManager`] handle;
//! each command carries a `oneshot` for its reply, so a start, heartbeat,
//! eviction or end is applied atomically with respect to every other.
//!
//! Liveness: while at least one session exists a sweep task ticks every
//! `heartbeat_interval`. A session that saw no heartbeat since the previous
//! sweep has its miss counter incremented; it is evicted when the counter
//! reaches `max_missed_heartbeats` or when `heartbeat_timeout` has elapsed
//! since its last heartbeat. The sweep task is aborted when the last session
//! goes away and restarted by the next start.

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::modules::policy::{self, DeviceInfo, PolicyDocument, PolicyViolation, SessionContext};

/// Maximum allowed concurrent streams per user when a policy sets none
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Sessions expire if no heartbeat (5 minutes)
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
/// How long a first play is remembered for rental windows (30 days)
pub const DEFAULT_FIRST_PLAY_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_missed_heartbeats: u32,
    pub default_max_concurrent_streams: u32,
    pub first_play_retention: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        SessionManagerConfig {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            default_max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            first_play_retention: DEFAULT_FIRST_PLAY_RETENTION,
        }
    }
}

/// Playback state reported by heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle = 0x00,
    Playing = 0x01,
    Paused = 0x02,
    Buffering = 0x03,
    Ended = 0x04,
}

impl SessionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(SessionState::Idle),
            0x01 => Some(SessionState::Playing),
            0x02 => Some(SessionState::Paused),
            0x03 => Some(SessionState::Buffering),
            0x04 => Some(SessionState::Ended),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Playing => "playing",
            SessionState::Paused => "paused",
            SessionState::Buffering => "buffering",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub asset_id: String,
    pub client_ip: Option<String>,
    pub geo_region: Option<String>,
    pub policy: Arc<PolicyDocument>,
    pub device: DeviceInfo,
}

/// Snapshot of one session record.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub asset_id: String,
    pub client_ip: Option<String>,
    pub geo_region: Option<String>,
    pub device: DeviceInfo,
    pub policy: Arc<PolicyDocument>,
    pub state: SessionState,
    /// Unix timestamps (seconds)
    pub created_at: i64,
    pub first_play_timestamp: Option<i64>,
    pub last_heartbeat: i64,
    pub position_ms: Option<u64>,
    pub failed_heartbeat_count: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),
    #[error("Policy violation: {0}")]
    PolicyViolation(#[from] PolicyViolation),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: SessionState, to: SessionState },
    #[error("Session {0} belongs to another user or asset")]
    NotOwner(Uuid),
    #[error("Session manager stopped")]
    ManagerStopped,
}

enum Command {
    Start {
        request: SessionRequest,
        reply: oneshot::Sender<Result<Uuid, SessionError>>,
    },
    Resume {
        session_id: Uuid,
        request: SessionRequest,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Heartbeat {
        session_id: Uuid,
        state: SessionState,
        position_ms: Option<u64>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    End {
        session_id: Uuid,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ActiveCount {
        user_id: String,
        reply: oneshot::Sender<u32>,
    },
    Get {
        session_id: Uuid,
        reply: oneshot::Sender<Option<Session>>,
    },
    UserSessions {
        user_id: String,
        reply: oneshot::Sender<Vec<Session>>,
    },
    FirstPlay {
        user_id: String,
        asset_id: String,
        reply: oneshot::Sender<Option<i64>>,
    },
    Sweep {
        /// Set by the background sweeper; sweeps from an aborted one are dropped
        generation: Option<u64>,
        reply: Option<oneshot::Sender<Vec<Uuid>>>,
    },
}

/// Handle to the session actor. Cheap to clone; the actor stops when the
/// last handle is dropped.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Spawns the actor on the current tokio runtime.
    pub fn spawn(config: SessionManagerConfig) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = SessionActor {
            config,
            sessions: HashMap::new(),
            user_counts: HashMap::new(),
            first_plays: HashMap::new(),
            sweeper: None,
            sweeper_generation: 0,
            self_tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        SessionManager { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::ManagerStopped)?;
        response.await.map_err(|_| SessionError::ManagerStopped)
    }

    /// Validates the request against its policy and the user's current
    /// stream count, then creates the session. A rejected start never
    /// creates a record.
    pub async fn start_session(&self, request: SessionRequest) -> Result<Uuid, SessionError> {
        self.request(|reply| Command::Start { request, reply }).await?
    }

    /// Re-admits an existing session for a new key (e.g. after the publisher
    /// rotated its collection). The session must belong to the same user and
    /// asset; the policy is checked again without counting the session twice,
    /// and on success it replaces the session's policy and counts as a
    /// heartbeat.
    pub async fn resume_session(&self, session_id: Uuid, request: SessionRequest) -> Result<(), SessionError> {
        self.request(|reply| Command::Resume {
            session_id,
            request,
            reply,
        })
        .await?
    }

    pub async fn update_heartbeat(
        &self,
        session_id: Uuid,
        state: SessionState,
        position_ms: Option<u64>,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::Heartbeat {
            session_id,
            state,
            position_ms,
            reply,
        })
        .await?
    }

    pub async fn end_session(&self, session_id: Uuid) -> Result<(), SessionError> {
        self.request(|reply| Command::End { session_id, reply }).await?
    }

    pub async fn get_active_stream_count(&self, user_id: &str) -> Result<u32, SessionError> {
        let user_id = user_id.to_string();
        self.request(|reply| Command::ActiveCount { user_id, reply }).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, SessionError> {
        self.request(|reply| Command::Get { session_id, reply }).await
    }

    pub async fn get_user_sessions(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        let user_id = user_id.to_string();
        self.request(|reply| Command::UserSessions { user_id, reply }).await
    }

    /// First time `user_id` started playing `asset_id`, used for rental windows
    pub async fn first_play(&self, user_id: &str, asset_id: &str) -> Result<Option<i64>, SessionError> {
        let user_id = user_id.to_string();
        let asset_id = asset_id.to_string();
        self.request(|reply| Command::FirstPlay {
            user_id,
            asset_id,
            reply,
        })
        .await
    }

    /// Runs one sweep immediately and returns the evicted session ids.
    pub async fn sweep_now(&self) -> Result<Vec<Uuid>, SessionError> {
        self.request(|reply| Command::Sweep {
            generation: None,
            reply: Some(reply),
        })
        .await
    }
}

struct SessionEntry {
    session: Session,
    last_seen: Instant,
    heartbeat_since_sweep: bool,
}

struct SessionActor {
    config: SessionManagerConfig,
    sessions: HashMap<Uuid, SessionEntry>,
    user_counts: HashMap<String, u32>,
    first_plays: HashMap<(String, String), i64>,
    sweeper: Option<JoinHandle<()>>,
    sweeper_generation: u64,
    self_tx: mpsc::WeakSender<Command>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        self.stop_sweeper();
        debug!("Session manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                let _ = reply.send(self.start(request));
            }
            Command::Resume {
                session_id,
                request,
                reply,
            } => {
                let _ = reply.send(self.resume(session_id, request));
            }
            Command::Heartbeat {
                session_id,
                state,
                position_ms,
                reply,
            } => {
                let _ = reply.send(self.heartbeat(session_id, state, position_ms));
            }
            Command::End { session_id, reply } => {
                let _ = reply.send(self.end(session_id));
            }
            Command::ActiveCount { user_id, reply } => {
                let _ = reply.send(self.active_count(&user_id));
            }
            Command::Get { session_id, reply } => {
                let _ = reply.send(self.sessions.get(&session_id).map(|e| e.session.clone()));
            }
            Command::UserSessions { user_id, reply } => {
                let sessions = self
                    .sessions
                    .values()
                    .filter(|e| e.session.user_id == user_id)
                    .map(|e| e.session.clone())
                    .collect();
                let _ = reply.send(sessions);
            }
            Command::FirstPlay {
                user_id,
                asset_id,
                reply,
            } => {
                let _ = reply.send(self.first_plays.get(&(user_id, asset_id)).copied());
            }
            Command::Sweep { generation, reply } => {
                if generation.is_some_and(|g| self.sweeper.is_none() || g != self.sweeper_generation) {
                    debug!("Dropping sweep from a stopped sweeper");
                    return;
                }
                let evicted = self.sweep();
                if let Some(reply) = reply {
                    let _ = reply.send(evicted);
                }
            }
        }
    }

    fn active_count(&self, user_id: &str) -> u32 {
        self.user_counts.get(user_id).copied().unwrap_or(0)
    }

    /// Runs the policy validator for `request` as if `current` other streams
    /// were active for the user.
    fn admit(&self, request: &SessionRequest, current: u32, now: i64) -> Result<(), SessionError> {
        let context = SessionContext {
            user_id: request.user_id.clone(),
            asset_id: request.asset_id.clone(),
            geo_region: request.geo_region.clone(),
            now,
            first_play: self
                .first_plays
                .get(&(request.user_id.clone(), request.asset_id.clone()))
                .copied(),
        };

        let defaulted;
        let effective: &PolicyDocument = if request.policy.max_concurrent_streams.is_none() {
            defaulted = PolicyDocument {
                max_concurrent_streams: Some(self.config.default_max_concurrent_streams),
                ..(*request.policy).clone()
            };
            &defaulted
        } else {
            &request.policy
        };

        if let Err(violation) = policy::validate(effective, &context, current, &request.device) {
            warn!(
                "Rejected session for user {} on asset {}: {}",
                request.user_id, request.asset_id, violation
            );
            return Err(violation.into());
        }
        Ok(())
    }

    fn start(&mut self, request: SessionRequest) -> Result<Uuid, SessionError> {
        let now = Utc::now().timestamp();
        let current = self.active_count(&request.user_id);
        self.admit(&request, current, now)?;

        let session_id = Uuid::new_v4();
        let session = Session {
            session_id,
            user_id: request.user_id,
            asset_id: request.asset_id,
            client_ip: request.client_ip,
            geo_region: request.geo_region,
            device: request.device,
            policy: request.policy,
            state: SessionState::Idle,
            created_at: now,
            first_play_timestamp: None,
            last_heartbeat: now,
            position_ms: None,
            failed_heartbeat_count: 0,
        };

        *self.user_counts.entry(session.user_id.clone()).or_insert(0) += 1;
        info!(
            "Created session {} for user {} on asset {} ({} active)",
            session_id,
            session.user_id,
            session.asset_id,
            current + 1
        );
        self.sessions.insert(
            session_id,
            SessionEntry {
                session,
                last_seen: Instant::now(),
                heartbeat_since_sweep: true,
            },
        );
        self.ensure_sweeper();
        Ok(session_id)
    }

    fn resume(&mut self, session_id: Uuid, request: SessionRequest) -> Result<(), SessionError> {
        let session = &self
            .sessions
            .get(&session_id)
            .ok_or(SessionError::NotFound(session_id))?
            .session;
        if session.user_id != request.user_id || session.asset_id != request.asset_id {
            return Err(SessionError::NotOwner(session_id));
        }
        if session.state == SessionState::Ended {
            return Err(SessionError::InvalidStateTransition {
                from: SessionState::Ended,
                to: SessionState::Playing,
            });
        }

        let now = Utc::now().timestamp();
        // this session already holds one of the user's slots
        let others = self.active_count(&request.user_id).saturating_sub(1);
        self.admit(&request, others, now)?;

        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.session.policy = request.policy;
            entry.session.device = request.device;
            entry.session.client_ip = request.client_ip;
            entry.session.geo_region = request.geo_region;
            entry.session.last_heartbeat = now;
            entry.session.failed_heartbeat_count = 0;
            entry.last_seen = Instant::now();
            entry.heartbeat_since_sweep = true;
        }
        info!("Resumed session {} for user {}", session_id, request.user_id);
        Ok(())
    }

    fn heartbeat(
        &mut self,
        session_id: Uuid,
        state: SessionState,
        position_ms: Option<u64>,
    ) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::NotFound(session_id))?;
        let session = &mut entry.session;

        if session.state == SessionState::Ended && state != SessionState::Ended {
            return Err(SessionError::InvalidStateTransition {
                from: session.state,
                to: state,
            });
        }

        let now = Utc::now().timestamp();
        if state == SessionState::Playing && session.first_play_timestamp.is_none() {
            session.first_play_timestamp = Some(now);
            self.first_plays
                .entry((session.user_id.clone(), session.asset_id.clone()))
                .or_insert(now);
            info!("First play for user {} on asset {}", session.user_id, session.asset_id);
        }

        session.state = state;
        if position_ms.is_some() {
            session.position_ms = position_ms;
        }
        session.last_heartbeat = now;
        session.failed_heartbeat_count = 0;
        entry.last_seen = Instant::now();
        entry.heartbeat_since_sweep = true;

        debug!("Heartbeat for session {}: {}", session_id, state);
        Ok(())
    }

    fn end(&mut self, session_id: Uuid) -> Result<(), SessionError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(SessionError::NotFound(session_id));
        }
        self.remove(session_id);
        info!("Ended session {}", session_id);
        Ok(())
    }

    /// Removes the record and releases its concurrency slot in one step.
    fn remove(&mut self, session_id: Uuid) {
        if let Some(entry) = self.sessions.remove(&session_id) {
            let user_id = entry.session.user_id;
            if let Some(count) = self.user_counts.get_mut(&user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.user_counts.remove(&user_id);
                }
            }
        }
        if self.sessions.is_empty() {
            self.stop_sweeper();
        }
    }

    fn sweep(&mut self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for (id, entry) in self.sessions.iter_mut() {
            if !entry.heartbeat_since_sweep {
                entry.session.failed_heartbeat_count += 1;
            }
            entry.heartbeat_since_sweep = false;

            let missed_too_many =
                entry.session.failed_heartbeat_count >= self.config.max_missed_heartbeats;
            let timed_out = now.duration_since(entry.last_seen) > self.config.heartbeat_timeout;
            if missed_too_many || timed_out {
                evicted.push(*id);
            }
        }

        for id in &evicted {
            warn!("Evicting session {} after missed heartbeats", id);
            self.remove(*id);
        }
        self.prune_first_plays();
        evicted
    }

    fn prune_first_plays(&mut self) {
        let retention = i64::try_from(self.config.first_play_retention.as_secs()).unwrap_or(i64::MAX);
        let now = Utc::now().timestamp();
        let before = self.first_plays.len();
        self.first_plays
            .retain(|_, first_play| now.saturating_sub(*first_play) < retention);
        let pruned = before - self.first_plays.len();
        if pruned > 0 {
            debug!("Forgot {} first plays older than {:?}", pruned, self.config.first_play_retention);
        }
    }

    fn ensure_sweeper(&mut self) {
        if self.sweeper.is_some() {
            return;
        }
        self.sweeper_generation += 1;
        let generation = self.sweeper_generation;
        let weak = self.self_tx.clone();
        let period = self.config.heartbeat_interval;
        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tx) = weak.upgrade() else { break };
                let sweep = Command::Sweep {
                    generation: Some(generation),
                    reply: None,
                };
                if tx.send(sweep).await.is_err() {
                    break;
                }
            }
        }));
        debug!("Heartbeat sweep started");
    }

    fn stop_sweeper(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
            debug!("Heartbeat sweep stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::policy::DeviceRequirements;
    use tokio::time::sleep;

    fn test_config() -> SessionManagerConfig {
        SessionManagerConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(300),
            max_missed_heartbeats: 3,
            default_max_concurrent_streams: 5,
            first_play_retention: DEFAULT_FIRST_PLAY_RETENTION,
        }
    }

    fn policy(max: Option<u32>) -> Arc<PolicyDocument> {
        Arc::new(PolicyDocument {
            max_concurrent_streams: max,
            device_requirements: DeviceRequirements::permissive(),
            ..Default::default()
        })
    }

    fn request(user: &str, policy: Arc<PolicyDocument>) -> SessionRequest {
        SessionRequest {
            user_id: user.to_string(),
            asset_id: "asset-1".to_string(),
            client_ip: Some("127.0.0.1".to_string()),
            geo_region: Some("US".to_string()),
            policy,
            device: DeviceInfo::default(),
        }
    }

    #[tokio::test]
    async fn test_concurrency_limit_enforced() {
        let manager = SessionManager::spawn(test_config());
        let limited = policy(Some(2));

        let first = manager.start_session(request("alice", limited.clone())).await.unwrap();
        manager.start_session(request("alice", limited.clone())).await.unwrap();

        let third = manager.start_session(request("alice", limited.clone())).await;
        assert_eq!(
            third,
            Err(SessionError::PolicyViolation(
                PolicyViolation::ConcurrencyLimitExceeded { current: 2, max: 2 }
            ))
        );
        assert_eq!(manager.get_active_stream_count("alice").await.unwrap(), 2);

        manager.end_session(first).await.unwrap();
        assert_eq!(manager.get_active_stream_count("alice").await.unwrap(), 1);
        assert!(manager.start_session(request("alice", limited)).await.is_ok());
        assert_eq!(manager.get_active_stream_count("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_default_limit_applies_when_policy_has_none() {
        let mut config = test_config();
        config.default_max_concurrent_streams = 1;
        let manager = SessionManager::spawn(config);

        manager.start_session(request("bob", policy(None))).await.unwrap();
        assert!(matches!(
            manager.start_session(request("bob", policy(None))).await,
            Err(SessionError::PolicyViolation(
                PolicyViolation::ConcurrencyLimitExceeded { current: 1, max: 1 }
            ))
        ));
        // limits are per user
        assert!(manager.start_session(request("carol", policy(None))).await.is_ok());
    }

    #[tokio::test]
    async fn test_parallel_starts_respect_limit() {
        let manager = SessionManager::spawn(test_config());
        let limited = policy(Some(3));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                let limited = limited.clone();
                tokio::spawn(async move { manager.start_session(request("dave", limited)).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(manager.get_active_stream_count("dave").await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_evict_and_release_slot() {
        let manager = SessionManager::spawn(test_config());
        let id = manager.start_session(request("erin", policy(Some(1)))).await.unwrap();

        // creation counts as a heartbeat for the first interval, so misses
        // are recorded at 20s, 30s and 40s
        sleep(Duration::from_secs(25)).await;
        let session = manager.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.failed_heartbeat_count, 1);

        sleep(Duration::from_secs(20)).await;
        assert!(manager.get_session(id).await.unwrap().is_none());
        assert_eq!(manager.get_active_stream_count("erin").await.unwrap(), 0);

        // the slot is free again and the sweep restarts with the new session
        let again = manager.start_session(request("erin", policy(Some(1)))).await.unwrap();
        sleep(Duration::from_secs(45)).await;
        assert!(manager.get_session(again).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_session_alive() {
        let manager = SessionManager::spawn(test_config());
        let id = manager.start_session(request("frank", policy(Some(1)))).await.unwrap();

        for i in 0..10u64 {
            sleep(Duration::from_secs(8)).await;
            manager
                .update_heartbeat(id, SessionState::Playing, Some(i * 8_000))
                .await
                .unwrap();
        }

        let session = manager.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Playing);
        assert_eq!(session.position_ms, Some(72_000));
        assert_eq!(session.failed_heartbeat_count, 0);
        assert_eq!(manager.get_active_stream_count("frank").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_evicts_before_miss_count() {
        let config = SessionManagerConfig {
            heartbeat_timeout: Duration::from_secs(15),
            max_missed_heartbeats: 100,
            ..test_config()
        };
        let manager = SessionManager::spawn(config);
        let id = manager.start_session(request("gina", policy(None))).await.unwrap();

        sleep(Duration::from_secs(21)).await;
        assert!(manager.get_session(id).await.unwrap().is_none());
        assert_eq!(manager.get_active_stream_count("gina").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_now_counts_misses() {
        let manager = SessionManager::spawn(test_config());
        let id = manager.start_session(request("hank", policy(None))).await.unwrap();

        // creation counts as the first heartbeat
        assert!(manager.sweep_now().await.unwrap().is_empty());
        assert!(manager.sweep_now().await.unwrap().is_empty());
        manager.update_heartbeat(id, SessionState::Buffering, None).await.unwrap();
        assert!(manager.sweep_now().await.unwrap().is_empty());
        assert!(manager.sweep_now().await.unwrap().is_empty());
        assert!(manager.sweep_now().await.unwrap().is_empty());
        assert_eq!(manager.sweep_now().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_ended_is_terminal_but_still_counted() {
        let manager = SessionManager::spawn(test_config());
        let id = manager.start_session(request("ivy", policy(None))).await.unwrap();

        manager.update_heartbeat(id, SessionState::Ended, None).await.unwrap();
        assert_eq!(manager.get_active_stream_count("ivy").await.unwrap(), 1);
        assert_eq!(
            manager.update_heartbeat(id, SessionState::Playing, None).await,
            Err(SessionError::InvalidStateTransition {
                from: SessionState::Ended,
                to: SessionState::Playing
            })
        );

        manager.end_session(id).await.unwrap();
        assert_eq!(manager.end_session(id).await, Err(SessionError::NotFound(id)));
        assert_eq!(
            manager.update_heartbeat(id, SessionState::Ended, None).await,
            Err(SessionError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn test_first_play_tracking() {
        let manager = SessionManager::spawn(test_config());
        let id = manager.start_session(request("jack", policy(None))).await.unwrap();
        assert_eq!(manager.first_play("jack", "asset-1").await.unwrap(), None);

        manager.update_heartbeat(id, SessionState::Paused, None).await.unwrap();
        assert_eq!(manager.first_play("jack", "asset-1").await.unwrap(), None);

        manager.update_heartbeat(id, SessionState::Playing, Some(0)).await.unwrap();
        let first = manager.first_play("jack", "asset-1").await.unwrap();
        assert!(first.is_some());

        let session = manager.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.first_play_timestamp, first);

        let sessions = manager.get_user_sessions("jack").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, id);
    }

    #[tokio::test]
    async fn test_rental_window_uses_first_play() {
        let manager = SessionManager::spawn(test_config());
        let rental = Arc::new(PolicyDocument {
            playback_window_seconds: Some(0),
            device_requirements: DeviceRequirements::permissive(),
            ..Default::default()
        });

        let id = manager.start_session(request("kim", rental.clone())).await.unwrap();
        manager.update_heartbeat(id, SessionState::Playing, None).await.unwrap();
        manager.end_session(id).await.unwrap();

        assert!(matches!(
            manager.start_session(request("kim", rental)).await,
            Err(SessionError::PolicyViolation(PolicyViolation::RentalWindowExpired { .. }))
        ));
    }

    #[tokio::test]
    async fn test_resume_keeps_one_slot() {
        let manager = SessionManager::spawn(test_config());
        let single = policy(Some(1));
        let id = manager.start_session(request("lena", single.clone())).await.unwrap();

        // a second start is over the limit, re-admitting the same session is not
        assert!(manager.start_session(request("lena", single.clone())).await.is_err());
        manager.resume_session(id, request("lena", single.clone())).await.unwrap();
        assert_eq!(manager.get_active_stream_count("lena").await.unwrap(), 1);

        assert_eq!(
            manager.resume_session(id, request("mallory", single.clone())).await,
            Err(SessionError::NotOwner(id))
        );
        let mut other_asset = request("lena", single.clone());
        other_asset.asset_id = "asset-2".to_string();
        assert_eq!(
            manager.resume_session(id, other_asset).await,
            Err(SessionError::NotOwner(id))
        );

        manager.end_session(id).await.unwrap();
        assert_eq!(
            manager.resume_session(id, request("lena", single)).await,
            Err(SessionError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn test_resume_counts_as_heartbeat() {
        let manager = SessionManager::spawn(test_config());
        let id = manager.start_session(request("nina", policy(None))).await.unwrap();

        manager.sweep_now().await.unwrap();
        manager.sweep_now().await.unwrap();
        assert_eq!(manager.get_session(id).await.unwrap().unwrap().failed_heartbeat_count, 1);

        manager.resume_session(id, request("nina", policy(None))).await.unwrap();
        assert_eq!(manager.get_session(id).await.unwrap().unwrap().failed_heartbeat_count, 0);
        manager.sweep_now().await.unwrap();
        assert_eq!(manager.get_session(id).await.unwrap().unwrap().failed_heartbeat_count, 0);
    }

    #[tokio::test]
    async fn test_first_plays_forgotten_after_retention() {
        let retained = SessionManager::spawn(test_config());
        let forgetful = SessionManager::spawn(SessionManagerConfig {
            first_play_retention: Duration::ZERO,
            ..test_config()
        });

        for manager in [&retained, &forgetful] {
            let id = manager.start_session(request("olga", policy(None))).await.unwrap();
            manager.update_heartbeat(id, SessionState::Playing, None).await.unwrap();
            assert!(manager.first_play("olga", "asset-1").await.unwrap().is_some());
            manager.sweep_now().await.unwrap();
        }

        assert!(retained.first_play("olga", "asset-1").await.unwrap().is_some());
        assert_eq!(forgetful.first_play("olga", "asset-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sweep_from_stopped_sweeper_is_ignored() {
        let manager = SessionManager::spawn(test_config());
        let first = manager.start_session(request("pete", policy(None))).await.unwrap();
        manager.end_session(first).await.unwrap();
        let second = manager.start_session(request("pete", policy(None))).await.unwrap();

        // a tick queued by the first sweeper before it was aborted
        manager
            .tx
            .send(Command::Sweep {
                generation: Some(1),
                reply: None,
            })
            .await
            .unwrap();

        // creation still covers the first real sweep
        manager.sweep_now().await.unwrap();
        let session = manager.get_session(second).await.unwrap().unwrap();
        assert_eq!(session.failed_heartbeat_count, 0);
    }

    #[test]
    fn test_session_state_wire_values() {
        for state in [
            SessionState::Idle,
            SessionState::Playing,
            SessionState::Paused,
            SessionState::Buffering,
            SessionState::Ended,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(SessionState::from_u8(0x05), None);
    }
}
