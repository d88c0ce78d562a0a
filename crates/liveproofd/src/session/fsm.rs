use std::collections::HashSet;
use std::sync::Arc;

use liveproof_core::fusion::{fuse_attempt, fuse_challenge, ChallengeAnalysis, ChallengeOutcome};
use liveproof_core::pad::hash::parse_hex_hash;
use liveproof_core::pad::replay::ReplayGuard;
use liveproof_core::pad::{self, StreamPad};
use liveproof_core::{ChallengeKind, FaceSource, FrameBuffer, FrameRecord, GestureTracker, Landmarks};
use rand::seq::SliceRandom;
use tokio::time::Instant;

use super::SessionDeps;
use crate::config::Policy;
use crate::engine::EngineHandle;
use crate::protocol::{
    decode_image_data, parse_packet, timestamp_ms, ChallengeEnd, ChallengeFrameBatch,
    ChallengeStart, ClientMessage, FrameData, Hello, PromptChallenge, ProtocolError,
    ServerMessage, Telemetry,
};
use crate::rate_limiter::FrameThrottle;
use crate::store::{SessionError, SessionMetrics};

/// Chooses `n` challenge kinds for a new attempt out of the enabled ones.
pub type Planner = Box<dyn FnMut(&[ChallengeKind], usize) -> Vec<ChallengeKind> + Send>;

fn random_plan(kinds: &[ChallengeKind], n: usize) -> Vec<ChallengeKind> {
    kinds
        .choose_multiple(&mut rand::thread_rng(), n)
        .copied()
        .collect()
}

/// What the actor must do after one input.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<ServerMessage>,
    /// Close the socket once `outbound` is flushed.
    pub close: bool,
}

impl Step {
    fn none() -> Self {
        Self::default()
    }

    fn send(msg: ServerMessage) -> Self {
        Self {
            outbound: vec![msg],
            close: false,
        }
    }

    fn close_with(msg: ServerMessage) -> Self {
        Self {
            outbound: vec![msg],
            close: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingHello,
    Streaming,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChallengeState {
    /// Prompted, waiting for `challengeStart`.
    Pending,
    /// Accepting frames.
    Active,
}

struct Challenge {
    id: String,
    kind: ChallengeKind,
    state: ChallengeState,
    deadline: Instant,
    /// Present only while active.
    buffer: Option<FrameBuffer>,
    gesture: GestureTracker,
    batches: HashSet<usize>,
    replayed: u32,
}

struct Attempt {
    id: String,
    plan: Vec<ChallengeKind>,
    slot: usize,
    retries: u32,
    /// Source of challenge ids; a retry takes a fresh one.
    seq: u32,
    outcomes: Vec<ChallengeOutcome>,
    replay: ReplayGuard,
    challenge: Option<Challenge>,
}

impl Attempt {
    fn new(id: String, plan: Vec<ChallengeKind>, policy: &Policy) -> Self {
        Self {
            id,
            plan,
            slot: 0,
            retries: 0,
            seq: 0,
            outcomes: Vec::new(),
            replay: ReplayGuard::new(policy.pad.replay_window_ms, policy.pad.allow_clock_skew_ms),
            challenge: None,
        }
    }
}

/// Protocol state for one connection.
///
/// Inputs are applied strictly in arrival order. Every identity check happens
/// here: messages naming an attempt or challenge that is not current change
/// nothing.
pub struct SessionMachine {
    deps: SessionDeps,
    phase: Phase,
    /// Empty until the handshake succeeds.
    session_id: String,
    /// When the session's TTL runs out, set by the handshake.
    expires_at: Option<Instant>,
    enabled: Vec<ChallengeKind>,
    attempt: Option<Attempt>,
    throttle: FrameThrottle,
    stream_pad: StreamPad,
    metrics: SessionMetrics,
    planner: Planner,
}

impl SessionMachine {
    pub fn new(deps: SessionDeps) -> Self {
        Self::with_planner(deps, Box::new(random_plan))
    }

    pub fn with_planner(deps: SessionDeps, planner: Planner) -> Self {
        let mut seen = HashSet::new();
        let mut enabled = deps.policy.enabled_challenges.clone();
        enabled.retain(|k| seen.insert(*k));

        Self {
            throttle: FrameThrottle::new(deps.max_fps),
            stream_pad: StreamPad::new(&deps.policy.pad),
            deps,
            phase: Phase::AwaitingHello,
            session_id: String::new(),
            expires_at: None,
            enabled,
            attempt: None,
            metrics: SessionMetrics::default(),
            planner,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn attempt_id(&self) -> Option<&str> {
        self.attempt.as_ref().map(|a| a.id.as_str())
    }

    /// The current challenge's id and expiry, while one is outstanding.
    pub fn deadline(&self) -> Option<(String, Instant)> {
        if self.phase != Phase::Streaming {
            return None;
        }
        let ch = self.attempt.as_ref()?.challenge.as_ref()?;
        Some((ch.id.clone(), ch.deadline))
    }

    /// When the session expires, while the connection is live.
    pub fn expiry(&self) -> Option<Instant> {
        self.expires_at.filter(|_| self.phase == Phase::Streaming)
    }

    fn expired(&self) -> bool {
        self.expiry().is_some_and(|at| Instant::now() >= at)
    }

    /// Close the connection once the session's TTL has run out. Early
    /// firings are ignored.
    pub async fn on_expired(&mut self) -> Step {
        if !self.expired() {
            return Step::none();
        }
        tracing::info!(
            session = %self.session_id,
            attempt = ?self.attempt_id(),
            "session expired while connected, closing"
        );
        self.deps
            .store
            .disconnect(&self.session_id, self.metrics.clone())
            .await;
        self.phase = Phase::Completed;
        self.attempt = None;
        let err = SessionError::Expired;
        Step::close_with(ServerMessage::error(err.code(), &err))
    }

    pub async fn handle_text(&mut self, text: &str) -> Step {
        if self.expired() {
            return self.on_expired().await;
        }
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) if self.phase == Phase::AwaitingHello => {
                tracing::debug!(error = %e, "malformed handshake message");
                return self.protocol_violation(ProtocolError::BadHandshake);
            }
            Err(e) => {
                tracing::debug!(session = %self.session_id, error = %e, "ignoring malformed message");
                return Step::none();
            }
        };

        match self.phase {
            Phase::AwaitingHello => match msg {
                ClientMessage::Hello(hello) => self.on_hello(hello).await,
                _ => self.protocol_violation(ProtocolError::BadHandshake),
            },
            Phase::Streaming => match msg {
                ClientMessage::Hello(_) => self.protocol_violation(ProtocolError::UnexpectedHello),
                ClientMessage::ChallengeStart(m) => self.on_challenge_start(m).await,
                ClientMessage::ChallengeFrameBatch(m) => self.on_frame_batch(m).await,
                ClientMessage::ChallengeEnd(m) => self.on_challenge_end(m).await,
                ClientMessage::Telemetry(m) => self.on_telemetry(m),
            },
            Phase::Completed => Step::none(),
        }
    }

    pub async fn handle_binary(&mut self, data: &[u8]) -> Step {
        match self.phase {
            Phase::AwaitingHello => return self.protocol_violation(ProtocolError::BadHandshake),
            Phase::Completed => return Step::none(),
            Phase::Streaming if self.expired() => return self.on_expired().await,
            Phase::Streaming => {}
        }

        let packet = match parse_packet(data) {
            Ok(p) => p,
            Err(e) => {
                self.metrics.frames_rejected += 1;
                tracing::debug!(session = %self.session_id, error = %e, "invalid frame packet");
                return Step::send(ServerMessage::error("invalid-frame", e));
            }
        };
        if !self.throttle.admit(std::time::Instant::now()) {
            self.metrics.frames_throttled += 1;
            return Step::send(ServerMessage::Throttle {
                reason: "frame rate above limit".into(),
                max_fps: self.throttle.max_fps(),
            });
        }

        self.metrics.frames_received += 1;
        let ts = packet.timestamp_ms;
        let received = now_ms();
        let accepted = self.check_replay(ts, received);

        let mut record = FrameRecord::new(ts, ts, received);
        analyze_into(&self.deps.engine, &mut record, packet.payload.to_vec()).await;
        if record.face_source != FaceSource::Server {
            self.metrics.degraded_frames += 1;
        }
        tracing::trace!(
            session = %self.session_id,
            ts,
            format = ?packet.format,
            face = record.face_present,
            "binary frame"
        );

        let pad = self.stream_pad.observe(&record, !accepted);
        let face = record.face.clone();
        if accepted {
            self.push_frame(record);
        }
        Step::send(ServerMessage::FrameAck {
            ts,
            face,
            pad: Some(pad),
        })
    }

    /// Fire the deadline for `challenge_id`. Stale or early firings are ignored.
    pub async fn on_deadline(&mut self, challenge_id: &str) -> Step {
        if self.expired() {
            return self.on_expired().await;
        }
        let due = self
            .attempt
            .as_ref()
            .and_then(|a| a.challenge.as_ref())
            .is_some_and(|c| c.id == challenge_id && Instant::now() >= c.deadline);
        if self.phase != Phase::Streaming || !due {
            tracing::debug!(session = %self.session_id, challenge = challenge_id, "stale deadline ignored");
            return Step::none();
        }
        tracing::info!(session = %self.session_id, challenge = challenge_id, "challenge deadline expired");
        self.close_challenge(true).await
    }

    /// Release the session's connection slot. Completed sessions were
    /// already recorded by `finish`.
    pub async fn on_disconnect(&mut self) {
        if self.phase == Phase::Streaming {
            self.deps
                .store
                .disconnect(&self.session_id, self.metrics.clone())
                .await;
            tracing::info!(
                session = %self.session_id,
                frames = self.metrics.frames_received,
                "session disconnected"
            );
        }
        self.attempt = None;
    }

    fn protocol_violation(&self, err: ProtocolError) -> Step {
        tracing::warn!(session = %self.session_id, code = err.code(), "protocol violation, closing");
        Step::close_with(ServerMessage::error(err.code(), &err))
    }

    async fn on_hello(&mut self, hello: Hello) -> Step {
        let expires_at = match self.deps.store.connect(&hello.session_id, &hello.token).await {
            Ok(at) => at,
            Err(e) => {
                tracing::warn!(session = %hello.session_id, code = e.code(), "handshake rejected");
                return Step::close_with(ServerMessage::error(e.code(), &e));
            }
        };
        let remaining = (expires_at - chrono::Utc::now()).to_std().unwrap_or_default();
        self.expires_at = Some(Instant::now() + remaining);

        let client = hello.client.unwrap_or_default();
        tracing::info!(
            session = %hello.session_id,
            sdk = client.sdk_version.as_deref().unwrap_or("unknown"),
            platform = client.platform.as_deref().unwrap_or("unknown"),
            "session connected"
        );
        self.session_id = hello.session_id;
        self.phase = Phase::Streaming;
        self.begin_attempt(uuid::Uuid::new_v4().to_string()).await;

        let mut step = Step::send(ServerMessage::HelloAck {
            challenges: self.enabled.clone(),
        });
        step.outbound.extend(self.issue_prompt());
        step
    }

    /// Start a new attempt, dropping every buffer and counter of the previous
    /// one. A reset keeps the plan and restarts it from the first slot.
    async fn begin_attempt(&mut self, id: String) {
        let plan = match self.attempt.take() {
            Some(previous) => previous.plan,
            None => {
                let n = self.deps.policy.challenges_per_attempt.min(self.enabled.len());
                (self.planner)(&self.enabled, n)
            }
        };
        tracing::info!(session = %self.session_id, attempt = %id, plan = ?plan, "attempt started");
        self.metrics.attempts += 1;
        self.attempt = Some(Attempt::new(id.clone(), plan, &self.deps.policy));
        self.deps.store.set_attempt(&self.session_id, &id).await;
    }

    /// Create the challenge for the current plan slot and prompt for it.
    fn issue_prompt(&mut self) -> Option<ServerMessage> {
        let policy = &self.deps.policy;
        let attempt = self.attempt.as_mut()?;
        let kind = *attempt.plan.get(attempt.slot)?;
        attempt.seq += 1;
        let id = format!("c{}", attempt.seq);

        attempt.challenge = Some(Challenge {
            id: id.clone(),
            kind,
            state: ChallengeState::Pending,
            deadline: Instant::now() + policy.challenge_deadline(),
            buffer: None,
            gesture: GestureTracker::new(kind, policy.gesture.clone()),
            batches: HashSet::new(),
            replayed: 0,
        });
        tracing::debug!(
            session = %self.session_id,
            attempt = %attempt.id,
            challenge = %id,
            kind = %kind,
            slot = attempt.slot,
            "challenge prompted"
        );

        Some(ServerMessage::Prompt {
            challenge: PromptChallenge {
                id,
                kind,
                timeout_ms: policy.challenge_timeout_ms,
                attempt_id: attempt.id.clone(),
            },
        })
    }

    /// Prompt for the challenge already outstanding, without moving its deadline.
    fn current_prompt(&self) -> Option<ServerMessage> {
        let attempt = self.attempt.as_ref()?;
        let ch = attempt.challenge.as_ref()?;
        Some(ServerMessage::Prompt {
            challenge: PromptChallenge {
                id: ch.id.clone(),
                kind: ch.kind,
                timeout_ms: self.deps.policy.challenge_timeout_ms,
                attempt_id: attempt.id.clone(),
            },
        })
    }

    async fn on_challenge_start(&mut self, msg: ChallengeStart) -> Step {
        let reset = self.attempt.as_ref().map_or(true, |a| a.id != msg.attempt_id);
        if reset {
            tracing::info!(
                session = %self.session_id,
                from = ?self.attempt_id(),
                to = %msg.attempt_id,
                "attempt identity changed, resetting"
            );
            self.begin_attempt(msg.attempt_id.clone()).await;
            let _ = self.issue_prompt();
        }

        let status = self
            .attempt
            .as_ref()
            .and_then(|a| a.challenge.as_ref())
            .map(|c| (c.id == msg.challenge_id, c.state));
        match status {
            None => Step::none(),
            Some((false, _)) => {
                tracing::debug!(
                    session = %self.session_id,
                    challenge = %msg.challenge_id,
                    "challengeStart for a challenge that is not current, re-prompting"
                );
                self.current_prompt().map(Step::send).unwrap_or_default()
            }
            Some((true, ChallengeState::Active)) => {
                tracing::debug!(session = %self.session_id, challenge = %msg.challenge_id, "challenge already active");
                Step::none()
            }
            Some((true, ChallengeState::Pending)) => {
                self.open_challenge(&msg);
                Step::none()
            }
        }
    }

    fn open_challenge(&mut self, msg: &ChallengeStart) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let Some(ch) = attempt.challenge.as_mut() else {
            return;
        };

        if let Some(claimed) = msg.challenge_type.as_deref() {
            match claimed.parse::<ChallengeKind>() {
                Ok(kind) if kind == ch.kind => {}
                Ok(kind) => tracing::warn!(
                    session = %self.session_id,
                    challenge = %ch.id,
                    expected = %ch.kind,
                    claimed = %kind,
                    "client challenge type disagrees with plan"
                ),
                Err(e) => tracing::warn!(session = %self.session_id, challenge = %ch.id, error = %e, "unrecognised client challenge type"),
            }
        }

        ch.state = ChallengeState::Active;
        ch.buffer = Some(FrameBuffer::new(
            self.deps.buffer_max_frames,
            self.deps.budget.clone(),
        ));
        tracing::info!(
            session = %self.session_id,
            attempt = %attempt.id,
            challenge = %ch.id,
            kind = %ch.kind,
            client_start = ?msg.start_time,
            client_frames = ?msg.total_frames,
            client_gesture = ?msg.gesture_detected,
            "challenge started"
        );
    }

    fn active_challenge(&mut self, attempt_id: &str, challenge_id: &str) -> Option<&mut Challenge> {
        let attempt = self.attempt.as_mut().filter(|a| a.id == attempt_id)?;
        attempt
            .challenge
            .as_mut()
            .filter(|c| c.id == challenge_id && c.state == ChallengeState::Active)
    }

    async fn on_frame_batch(&mut self, batch: ChallengeFrameBatch) -> Step {
        let Some(ch) = self.active_challenge(&batch.attempt_id, &batch.challenge_id) else {
            tracing::debug!(
                session = %self.session_id,
                attempt = %batch.attempt_id,
                challenge = %batch.challenge_id,
                "dropping batch for a challenge that is not active"
            );
            return Step::none();
        };
        if !ch.batches.insert(batch.batch_index) {
            tracing::debug!(
                session = %self.session_id,
                challenge = %batch.challenge_id,
                batch = batch.batch_index,
                "dropping retransmitted batch"
            );
            return Step::none();
        }

        for frame in batch.frames {
            self.ingest_client_frame(frame).await;
        }
        Step::none()
    }

    async fn ingest_client_frame(&mut self, frame: FrameData) {
        self.metrics.frames_received += 1;
        if let Some(t) = frame.telemetry {
            self.record_telemetry(t.fps, t.rtt_ms);
        }
        let Some(ts) = timestamp_ms(frame.timestamp) else {
            self.metrics.frames_rejected += 1;
            tracing::debug!(session = %self.session_id, frame = frame.frame_id, "frame without a usable timestamp");
            return;
        };
        let received = now_ms();
        if !self.check_replay(ts, received) {
            return;
        }

        let record = client_record(&self.deps.engine, frame, ts, received).await;
        if record.face_source != FaceSource::Server {
            self.metrics.degraded_frames += 1;
        }
        self.push_frame(record);
    }

    /// Run the attempt's replay guard. Rejections count against the active
    /// challenge.
    fn check_replay(&mut self, ts: u64, received: u64) -> bool {
        let Some(attempt) = self.attempt.as_mut() else {
            return true;
        };
        match attempt.replay.check(ts, received) {
            Ok(()) => true,
            Err(rejection) => {
                if let Some(ch) = attempt
                    .challenge
                    .as_mut()
                    .filter(|c| c.state == ChallengeState::Active)
                {
                    ch.replayed += 1;
                }
                self.metrics.frames_rejected += 1;
                tracing::debug!(session = %self.session_id, %rejection, "frame rejected by replay guard");
                false
            }
        }
    }

    /// Buffer an accepted frame and, once it is held, feed it to the active
    /// challenge's gesture tracker. Without an active challenge the frame is
    /// only acknowledged.
    fn push_frame(&mut self, record: FrameRecord) {
        let Some(ch) = self
            .attempt
            .as_mut()
            .and_then(|a| a.challenge.as_mut())
            .filter(|c| c.state == ChallengeState::Active)
        else {
            return;
        };
        let Some(buffer) = ch.buffer.as_mut() else {
            return;
        };

        let before = buffer.evicted();
        if let Err(e) = buffer.append(record) {
            self.metrics.frames_rejected += 1;
            tracing::warn!(session = %self.session_id, challenge = %ch.id, error = %e, "frame dropped");
            return;
        }
        let evicted = buffer.evicted() - before;
        if evicted > 0 {
            self.metrics.frames_evicted += evicted;
            tracing::warn!(
                session = %self.session_id,
                challenge = %ch.id,
                evicted,
                frames = buffer.len(),
                "frame buffer full, evicted oldest"
            );
        }

        let Some(held) = buffer.last() else {
            return;
        };
        if ch.gesture.observe(held) {
            tracing::info!(
                session = %self.session_id,
                challenge = %ch.id,
                kind = %ch.kind,
                frame = held.frame_id,
                "gesture detected"
            );
        }
    }

    async fn on_challenge_end(&mut self, msg: ChallengeEnd) -> Step {
        if self
            .active_challenge(&msg.attempt_id, &msg.challenge_id)
            .is_none()
        {
            tracing::debug!(
                session = %self.session_id,
                attempt = %msg.attempt_id,
                challenge = %msg.challenge_id,
                "ignoring challengeEnd for a challenge that is not active"
            );
            return Step::none();
        }
        tracing::debug!(session = %self.session_id, client_end = ?msg.timestamp, "challenge ended by client");
        self.close_challenge(false).await
    }

    /// Snapshot the current challenge, decide it and move the attempt on:
    /// next slot, retry of the same slot, or the final result.
    async fn close_challenge(&mut self, timed_out: bool) -> Step {
        let policy = Arc::clone(&self.deps.policy);
        let Some(attempt) = self.attempt.as_mut() else {
            return Step::none();
        };
        let Some(ch) = attempt.challenge.take() else {
            return Step::none();
        };

        let buffer = ch.buffer.unwrap_or_else(|| {
            FrameBuffer::new(self.deps.buffer_max_frames, self.deps.budget.clone())
        });
        let snapshot = buffer.snapshot();
        let report = pad::evaluate(&snapshot, ch.replayed, &policy.pad);
        let analysis = ChallengeAnalysis::from_snapshot(
            ch.id.clone(),
            ch.kind,
            &snapshot,
            ch.gesture.detected_frame(),
            ch.replayed,
            timed_out,
            report,
        );
        let decision = fuse_challenge(&analysis, &policy.decision);
        tracing::info!(
            session = %self.session_id,
            attempt = %attempt.id,
            challenge = %ch.id,
            kind = %ch.kind,
            passed = decision.passed,
            frames = analysis.frame_count,
            severity = analysis.pad.total_severity,
            reasons = ?decision.reasons,
            "challenge decided"
        );

        let mut step = Step::send(ServerMessage::ChallengeResult {
            attempt_id: attempt.id.clone(),
            challenge_id: ch.id,
            decision: decision.clone(),
            analysis: analysis.clone(),
        });
        let outcome = ChallengeOutcome { analysis, decision };

        if outcome.decision.passed {
            self.metrics.challenges_passed += 1;
            attempt.outcomes.push(outcome);
            attempt.slot += 1;
            attempt.retries = 0;
            if attempt.slot >= attempt.plan.len() {
                return self.finish_attempt(step).await;
            }
        } else {
            self.metrics.challenges_failed += 1;
            if attempt.retries < policy.max_retries {
                attempt.retries += 1;
                tracing::info!(
                    session = %self.session_id,
                    slot = attempt.slot,
                    retry = attempt.retries,
                    "retrying challenge slot"
                );
            } else {
                attempt.outcomes.push(outcome);
                return self.finish_attempt(step).await;
            }
        }

        step.outbound.extend(self.issue_prompt());
        step
    }

    async fn finish_attempt(&mut self, mut step: Step) -> Step {
        let Some(attempt) = self.attempt.as_ref() else {
            return step;
        };
        let decision = fuse_attempt(
            &attempt.outcomes,
            attempt.plan.len(),
            &self.deps.policy.decision,
        );
        tracing::info!(
            session = %self.session_id,
            attempt = %attempt.id,
            passed = decision.passed,
            risk = decision.risk_score,
            reasons = ?decision.reasons,
            "attempt decided"
        );

        step.outbound.push(ServerMessage::Result {
            attempt_id: attempt.id.clone(),
            decision: decision.clone(),
        });
        self.phase = Phase::Completed;
        self.deps
            .store
            .finish(&self.session_id, decision, self.metrics.clone())
            .await;
        step.close = true;
        step
    }

    fn on_telemetry(&mut self, t: Telemetry) -> Step {
        tracing::debug!(
            session = %self.session_id,
            fps = ?t.fps,
            rtt_ms = ?t.rtt_ms,
            cam_width = ?t.cam_width,
            cam_height = ?t.cam_height,
            motion = ?t.motion_score,
            "telemetry"
        );
        self.record_telemetry(t.fps, t.rtt_ms);
        match t.fps {
            Some(fps) if fps.is_finite() && fps > self.deps.max_fps as f32 => {
                Step::send(ServerMessage::Throttle {
                    reason: "client fps above limit".into(),
                    max_fps: self.deps.max_fps,
                })
            }
            _ => Step::none(),
        }
    }

    fn record_telemetry(&mut self, fps: Option<f32>, rtt_ms: Option<u32>) {
        if let Some(fps) = fps.filter(|f| f.is_finite()) {
            self.metrics.last_fps = Some(fps);
        }
        if rtt_ms.is_some() {
            self.metrics.last_rtt_ms = rtt_ms;
        }
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Turn a client frame into a record. An attached image is analysed on the
/// worker pool; otherwise face presence falls back to what the client claims.
async fn client_record(engine: &EngineHandle, frame: FrameData, ts: u64, received: u64) -> FrameRecord {
    let mut record = FrameRecord::new(frame.frame_id, ts, received);
    record.motion_score = frame.motion_score.filter(|m| m.is_finite());
    record.client_hash = frame.ahash.as_deref().and_then(parse_hex_hash);
    record.telemetry = frame.telemetry;
    record.landmarks = match frame.landmarks {
        Some(pairs) => match Landmarks::try_from(pairs) {
            Ok(l) => Some(l),
            Err(e) => {
                tracing::debug!(frame = frame.frame_id, error = %e, "ignoring landmarks");
                None
            }
        },
        None => None,
    };

    if let Some(data) = frame.image_data.as_deref() {
        match decode_image_data(data) {
            Ok(bytes) => analyze_into(engine, &mut record, bytes).await,
            Err(e) => tracing::debug!(frame = frame.frame_id, error = %e, "undecodable imageData"),
        }
    }

    if record.face_source == FaceSource::None {
        let boxed = frame
            .face_box
            .is_some_and(|b| b.x.is_finite() && b.y.is_finite() && b.width > 0.0 && b.height > 0.0);
        let claimed = frame
            .face_present
            .or_else(|| (boxed || record.landmarks.is_some()).then_some(true));
        if let Some(present) = claimed {
            record.face_present = present;
            record.face_source = FaceSource::Client;
        }
    }
    record
}

/// Attach server measurements to `record`. Failures leave it degraded.
async fn analyze_into(engine: &EngineHandle, record: &mut FrameRecord, bytes: Vec<u8>) {
    match engine.analyze(bytes.clone()).await {
        Ok(a) => {
            record.server_hash = Some(a.ahash);
            record.gray = Some(a.gray);
            if a.detector_ran {
                record.face_present = a.face.is_some();
                record.face = a.face;
                record.face_source = FaceSource::Server;
            }
            record.image = Some(bytes);
        }
        Err(e) => {
            tracing::debug!(frame = record.frame_id, error = %e, "frame analysis unavailable, degraded");
        }
    }
}
