use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use liveproof_core::{AttemptDecision, ChallengeKind};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::rate_limiter::HandshakeLimiter;

const TOKEN_BYTES: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown session")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("session already closed")]
    Closed,
    #[error("invalid session token")]
    Unauthorized,
    #[error("session already has a live connection")]
    Busy,
    #[error("too many failed handshakes; retry in {retry_after_secs}s")]
    Locked { retry_after_secs: u64 },
}

impl SessionError {
    /// Wire code sent in `error{code}` before the socket is closed.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound => "session-not-found",
            SessionError::Expired => "session-expired",
            SessionError::Closed => "session-closed",
            SessionError::Unauthorized => "unauthorized",
            SessionError::Busy => "session-busy",
            SessionError::Locked { .. } => "session-locked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Expired,
    Closed,
}

/// Counters reported by a session's connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub attempts: u32,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub frames_evicted: u64,
    pub frames_throttled: u64,
    pub degraded_frames: u64,
    pub challenges_passed: u32,
    pub challenges_failed: u32,
    pub last_fps: Option<f32>,
    pub last_rtt_ms: Option<u32>,
}

struct SessionRecord {
    token_digest: [u8; 32],
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    closed: bool,
    connected: bool,
    attempt_id: Option<String>,
    metrics: SessionMetrics,
    last_decision: Option<AttemptDecision>,
}

impl SessionRecord {
    fn state(&self, now: DateTime<Utc>) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if now >= self.expires_at {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }
}

/// Public view of a session; never carries the token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: SessionState,
    pub connected: bool,
    pub attempt_id: Option<String>,
    pub metrics: SessionMetrics,
    pub last_decision: Option<AttemptDecision>,
}

/// Credentials handed out once, at creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub session_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub challenges: Vec<ChallengeKind>,
}

/// In-memory bootstrap session store.
///
/// Only the SHA-256 digest of each token is kept. Records live until their
/// TTL elapses and the sweeper removes them.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    limiter: Arc<Mutex<HandshakeLimiter>>,
    ttl: chrono::Duration,
    challenges: Vec<ChallengeKind>,
}

impl SessionStore {
    pub fn new(ttl: Duration, limiter: HandshakeLimiter, challenges: Vec<ChallengeKind>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            limiter: Arc::new(Mutex::new(limiter)),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(5)),
            challenges,
        }
    }

    pub async fn create(&self) -> NewSession {
        let session_id = uuid::Uuid::new_v4().to_string();
        let token = generate_token();
        let created_at = Utc::now();
        let expires_at = created_at + self.ttl;

        self.sessions.write().await.insert(
            session_id.clone(),
            SessionRecord {
                token_digest: digest(&token),
                created_at,
                expires_at,
                closed: false,
                connected: false,
                attempt_id: None,
                metrics: SessionMetrics::default(),
                last_decision: None,
            },
        );
        tracing::info!(session = %session_id, expires_at = %expires_at, "session created");

        NewSession {
            session_id,
            token,
            expires_at,
            challenges: self.challenges.clone(),
        }
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|r| SessionInfo {
            session_id: id.to_string(),
            created_at: r.created_at,
            expires_at: r.expires_at,
            state: r.state(now),
            connected: r.connected,
            attempt_id: r.attempt_id.clone(),
            metrics: r.metrics.clone(),
            last_decision: r.last_decision.clone(),
        })
    }

    /// Validate a handshake and claim the session's single connection slot.
    /// Returns when the session expires; the connection must not outlive it.
    pub async fn connect(&self, id: &str, token: &str) -> Result<DateTime<Utc>, SessionError> {
        let mut limiter = self.limiter.lock().await;
        if let Err(remaining) = limiter.check(id) {
            return Err(SessionError::Locked {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(id).ok_or(SessionError::NotFound)?;
        match record.state(Utc::now()) {
            SessionState::Expired => return Err(SessionError::Expired),
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Active => {}
        }
        if !constant_time_eq(&record.token_digest, &digest(token)) {
            limiter.record_failure(id);
            return Err(SessionError::Unauthorized);
        }
        if record.connected {
            return Err(SessionError::Busy);
        }

        limiter.record_success(id);
        record.connected = true;
        Ok(record.expires_at)
    }

    /// Release the connection slot and persist the connection's counters.
    pub async fn disconnect(&self, id: &str, metrics: SessionMetrics) {
        if let Some(record) = self.sessions.write().await.get_mut(id) {
            record.connected = false;
            record.metrics = metrics;
        }
    }

    pub async fn set_attempt(&self, id: &str, attempt_id: &str) {
        if let Some(record) = self.sessions.write().await.get_mut(id) {
            record.attempt_id = Some(attempt_id.to_string());
        }
    }

    /// Record the final attempt decision. The session cannot be reused.
    pub async fn finish(&self, id: &str, decision: AttemptDecision, metrics: SessionMetrics) {
        if let Some(record) = self.sessions.write().await.get_mut(id) {
            tracing::info!(
                session = id,
                passed = decision.passed,
                risk = decision.risk_score,
                "session finished"
            );
            record.last_decision = Some(decision);
            record.metrics = metrics;
            record.closed = true;
            record.connected = false;
        }
    }

    /// Remove every session past its expiry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, r)| now >= r.expires_at && !r.connected)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        drop(sessions);

        if !expired.is_empty() {
            let mut limiter = self.limiter.lock().await;
            for id in &expired {
                limiter.forget(id);
            }
            tracing::debug!(removed = expired.len(), "expired sessions swept");
        }
        expired.len()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                store.sweep().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(
            Duration::from_secs(60),
            HandshakeLimiter::new(3, Duration::from_secs(60)),
            ChallengeKind::ALL.to_vec(),
        )
    }

    #[tokio::test]
    async fn test_create_and_connect() {
        let s = store();
        let new = s.create().await;
        assert_eq!(new.token.len(), TOKEN_BYTES * 2);
        let expires_at = s.connect(&new.session_id, &new.token).await.unwrap();
        assert_eq!(expires_at, new.expires_at);

        let info = s.get(&new.session_id).await.unwrap();
        assert!(info.connected);
        assert_eq!(info.state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_rejects_bad_token_and_unknown_session() {
        let s = store();
        let new = s.create().await;
        assert_eq!(
            s.connect(&new.session_id, "nope").await,
            Err(SessionError::Unauthorized)
        );
        assert_eq!(s.connect("missing", &new.token).await, Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_rejects_concurrent_connection() {
        let s = store();
        let new = s.create().await;
        s.connect(&new.session_id, &new.token).await.unwrap();
        assert_eq!(
            s.connect(&new.session_id, &new.token).await,
            Err(SessionError::Busy)
        );
        s.disconnect(&new.session_id, SessionMetrics::default()).await;
        s.connect(&new.session_id, &new.token).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_expired_session() {
        let s = SessionStore::new(
            Duration::ZERO,
            HandshakeLimiter::default(),
            ChallengeKind::ALL.to_vec(),
        );
        let new = s.create().await;
        assert_eq!(
            s.connect(&new.session_id, &new.token).await,
            Err(SessionError::Expired)
        );
        assert_eq!(s.sweep().await, 1);
        assert!(s.get(&new.session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_locks_after_repeated_bad_tokens() {
        let s = store();
        let new = s.create().await;
        for _ in 0..3 {
            assert_eq!(
                s.connect(&new.session_id, "bad").await,
                Err(SessionError::Unauthorized)
            );
        }
        // Even the right token is refused while locked.
        let err = s.connect(&new.session_id, &new.token).await.unwrap_err();
        assert!(matches!(err, SessionError::Locked { .. }));
        assert_eq!(err.code(), "session-locked");
    }

    #[tokio::test]
    async fn test_finished_session_is_closed() {
        let s = store();
        let new = s.create().await;
        s.connect(&new.session_id, &new.token).await.unwrap();
        let decision = AttemptDecision {
            passed: true,
            risk_score: 7,
            reasons: Vec::new(),
        };
        s.finish(&new.session_id, decision.clone(), SessionMetrics::default()).await;

        let info = s.get(&new.session_id).await.unwrap();
        assert_eq!(info.state, SessionState::Closed);
        assert_eq!(info.last_decision, Some(decision));
        assert_eq!(
            s.connect(&new.session_id, &new.token).await,
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_sessions() {
        let s = store();
        s.create().await;
        assert_eq!(s.sweep().await, 0);
        assert_eq!(s.len().await, 1);
        assert_eq!(s.sweep_at(Utc::now() + chrono::Duration::minutes(2)).await, 1);
    }

    #[tokio::test]
    async fn test_expired_session_swept_once_released() {
        let s = store();
        let new = s.create().await;
        s.connect(&new.session_id, &new.token).await.unwrap();
        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(s.sweep_at(later).await, 0);

        s.disconnect(&new.session_id, SessionMetrics::default()).await;
        assert_eq!(s.sweep_at(later).await, 1);
        assert_eq!(s.len().await, 0);
    }
}
