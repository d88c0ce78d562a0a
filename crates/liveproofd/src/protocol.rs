//! WebSocket wire format.
//!
//! Text messages are JSON objects tagged by `type`. Binary messages are
//! `FPF1` frame packets.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use liveproof_core::fusion::{AttemptDecision, ChallengeAnalysis, ChallengeDecision};
use liveproof_core::pad::FramePad;
use liveproof_core::{ChallengeKind, FaceDetection, FrameTelemetry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PACKET_MAGIC: &[u8; 4] = b"FPF1";
pub const PACKET_HEADER_LEN: usize = 16;
/// Smallest encoded image accepted in a packet.
pub const MIN_PACKET_PAYLOAD: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Hello(Hello),
    ChallengeStart(ChallengeStart),
    ChallengeFrameBatch(ChallengeFrameBatch),
    ChallengeEnd(ChallengeEnd),
    Telemetry(Telemetry),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub session_id: String,
    pub token: String,
    #[serde(default)]
    pub client: Option<ClientInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub sdk_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStart {
    pub attempt_id: String,
    pub challenge_id: String,
    /// Advisory; the server plan decides the kind.
    #[serde(default)]
    pub challenge_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub total_frames: Option<usize>,
    /// Advisory; never trusted.
    #[serde(default)]
    pub gesture_detected: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeFrameBatch {
    pub attempt_id: String,
    pub challenge_id: String,
    pub batch_index: usize,
    #[serde(default)]
    pub frames: Vec<FrameData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeEnd {
    pub attempt_id: String,
    pub challenge_id: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    #[serde(default)]
    pub fps: Option<f32>,
    #[serde(default)]
    pub rtt_ms: Option<u32>,
    #[serde(default)]
    pub cam_width: Option<u32>,
    #[serde(default)]
    pub cam_height: Option<u32>,
    #[serde(default)]
    pub motion_score: Option<f32>,
}

/// One captured frame inside a batch. Everything except the timestamp and
/// id is optional and advisory.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameData {
    /// Capture time in ms; clients send fractional values.
    pub timestamp: f64,
    pub frame_id: u64,
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub motion_score: Option<f32>,
    #[serde(default)]
    pub ahash: Option<String>,
    #[serde(default)]
    pub face_present: Option<bool>,
    #[serde(default)]
    pub face_box: Option<ClientFaceBox>,
    #[serde(default)]
    pub landmarks: Option<Vec<[f32; 2]>>,
    #[serde(default)]
    pub telemetry: Option<FrameTelemetry>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClientFaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    HelloAck {
        challenges: Vec<ChallengeKind>,
    },
    Prompt {
        challenge: PromptChallenge,
    },
    FrameAck {
        ts: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        face: Option<FaceDetection>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pad: Option<FramePad>,
    },
    ChallengeResult {
        #[serde(rename = "attemptId")]
        attempt_id: String,
        #[serde(rename = "challengeId")]
        challenge_id: String,
        decision: ChallengeDecision,
        analysis: ChallengeAnalysis,
    },
    Result {
        #[serde(rename = "attemptId")]
        attempt_id: String,
        decision: AttemptDecision,
    },
    Throttle {
        reason: String,
        #[serde(rename = "maxFps")]
        max_fps: u32,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptChallenge {
    pub id: String,
    pub kind: ChallengeKind,
    pub timeout_ms: u64,
    pub attempt_id: String,
}

/// Violations that end the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("first message must be a valid hello")]
    BadHandshake,
    #[error("hello received after handshake")]
    UnexpectedHello,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::BadHandshake => "bad-handshake",
            ProtocolError::UnexpectedHello => "unexpected-hello",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    Jpeg,
    Png,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FramePacket<'a> {
    pub format: PacketFormat,
    pub timestamp_ms: u64,
    pub payload: &'a [u8],
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet is {0} bytes, shorter than the header")]
    Truncated(usize),
    #[error("bad packet magic")]
    BadMagic,
    #[error("unknown packet format {0}")]
    UnknownFormat(u8),
    #[error("image payload of {0} bytes is too small")]
    PayloadTooSmall(usize),
}

/// Parse a binary frame packet:
/// magic(4) | format(1) | reserved(3) | timestamp u64 LE(8) | image.
pub fn parse_packet(data: &[u8]) -> Result<FramePacket<'_>, PacketError> {
    if data.len() < PACKET_HEADER_LEN {
        return Err(PacketError::Truncated(data.len()));
    }
    if &data[0..4] != PACKET_MAGIC {
        return Err(PacketError::BadMagic);
    }
    let format = match data[4] {
        1 => PacketFormat::Jpeg,
        2 => PacketFormat::Png,
        other => return Err(PacketError::UnknownFormat(other)),
    };
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&data[8..16]);
    let payload = &data[PACKET_HEADER_LEN..];
    if payload.len() < MIN_PACKET_PAYLOAD {
        return Err(PacketError::PayloadTooSmall(payload.len()));
    }
    Ok(FramePacket {
        format,
        timestamp_ms: u64::from_le_bytes(ts),
        payload,
    })
}

/// Decode a base64 image, with or without a `data:image/...;base64,` prefix.
pub fn decode_image_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    STANDARD.decode(encoded.trim())
}

/// Client timestamps arrive as JSON numbers; only finite, non-negative
/// values map to a frame time.
pub fn timestamp_ms(ts: f64) -> Option<u64> {
    (ts.is_finite() && ts >= 0.0 && ts < u64::MAX as f64).then(|| ts as u64)
}
