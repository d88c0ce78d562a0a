use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use liveproof_core::{ChallengeKind, DecisionConfig, DetectorConfig, GestureConfig, PadConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid policy file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Directory holding the model catalog or the flat `det_10g.onnx`.
    pub model_dir: PathBuf,
    /// Run without a detector even if a model is present.
    pub detector_enabled: bool,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Upper bound for a single WebSocket message.
    pub max_message_bytes: usize,
    /// Binary frames per second accepted per connection.
    pub max_fps: u32,
    pub inference_workers: usize,
    /// Pending requests each worker may queue before the pool reports saturation.
    pub inference_queue_depth: usize,
    pub inference_timeout_ms: u64,
    pub buffer_max_frames: usize,
    /// Aggregate byte ceiling across every live challenge buffer.
    pub buffer_max_bytes: usize,
    /// Optional TOML file overriding the verification [`Policy`].
    pub policy_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `LIVEPROOF_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("LIVEPROOF_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        Self {
            bind_addr,
            model_dir: std::env::var("LIVEPROOF_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("models")),
            detector_enabled: std::env::var("LIVEPROOF_DETECTOR_ENABLED")
                .map(|v| v != "0")
                .unwrap_or(true),
            session_ttl_secs: env_u64("LIVEPROOF_SESSION_TTL_SECS", 300),
            sweep_interval_secs: env_u64("LIVEPROOF_SWEEP_INTERVAL_SECS", 30),
            max_message_bytes: env_usize("LIVEPROOF_MAX_MESSAGE_BYTES", 4 * 1024 * 1024),
            max_fps: env_u32("LIVEPROOF_MAX_FPS", 15),
            inference_workers: env_usize("LIVEPROOF_INFERENCE_WORKERS", 2).max(1),
            inference_queue_depth: env_usize("LIVEPROOF_INFERENCE_QUEUE", 4).max(1),
            inference_timeout_ms: env_u64("LIVEPROOF_INFERENCE_TIMEOUT_MS", 1500),
            buffer_max_frames: env_usize("LIVEPROOF_BUFFER_MAX_FRAMES", 50),
            buffer_max_bytes: env_usize("LIVEPROOF_BUFFER_MAX_BYTES", 50 * 1024 * 1024),
            policy_file: std::env::var("LIVEPROOF_POLICY_FILE").ok().map(PathBuf::from),
        }
    }

    /// The configured policy file, or defaults when none is set.
    pub fn load_policy(&self) -> Result<Policy, ConfigError> {
        match &self.policy_file {
            Some(path) => Policy::load(path),
            None => Ok(Policy::default()),
        }
    }
}

/// Verification policy: everything that decides pass or fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub challenges_per_attempt: usize,
    pub challenge_timeout_ms: u64,
    /// Extra time past the client-facing timeout before the server expires
    /// a challenge.
    pub deadline_grace_ms: u64,
    /// Retries per plan slot after a failed challenge.
    pub max_retries: u32,
    pub enabled_challenges: Vec<ChallengeKind>,
    pub handshake_max_failures: u32,
    pub handshake_lockout_secs: u64,
    pub pad: PadConfig,
    pub gesture: GestureConfig,
    pub decision: DecisionConfig,
    pub detector: DetectorConfig,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            challenges_per_attempt: 3,
            challenge_timeout_ms: 5_000,
            deadline_grace_ms: 2_000,
            max_retries: 1,
            enabled_challenges: ChallengeKind::ALL.to_vec(),
            handshake_max_failures: 5,
            handshake_lockout_secs: 300,
            pad: PadConfig::default(),
            gesture: GestureConfig::default(),
            decision: DecisionConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl Policy {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|e| match e {
            PolicyParseError::Toml(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            PolicyParseError::Invalid(msg) => ConfigError::Invalid(msg),
        })
    }

    fn from_toml(text: &str) -> Result<Self, PolicyParseError> {
        let policy: Policy = toml::from_str(text).map_err(PolicyParseError::Toml)?;
        policy.validate().map_err(PolicyParseError::Invalid)?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut kinds = self.enabled_challenges.clone();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();
        if kinds.is_empty() {
            return Err("enabled_challenges must not be empty".into());
        }
        if self.challenges_per_attempt == 0 {
            return Err("challenges_per_attempt must be at least 1".into());
        }
        if self.challenges_per_attempt > kinds.len() {
            return Err(format!(
                "challenges_per_attempt ({}) exceeds the {} distinct enabled challenges",
                self.challenges_per_attempt,
                kinds.len()
            ));
        }
        if self.challenge_timeout_ms == 0 {
            return Err("challenge_timeout_ms must be positive".into());
        }
        if self.pad.reject_severity.is_nan() || self.pad.reject_severity <= 0.0 {
            return Err("pad.reject_severity must be positive".into());
        }
        let (lo, hi) = (self.pad.flicker_min, self.pad.flicker_max);
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(format!(
                "pad.flicker_min ({lo}) must not exceed pad.flicker_max ({hi})"
            ));
        }
        if self.pad.flicker_grid_size == 0 {
            return Err("pad.flicker_grid_size must be at least 1".into());
        }
        unit_interval("decision.min_face_rate", self.decision.min_face_rate)?;
        unit_interval(
            "decision.client_presence_confidence",
            self.decision.client_presence_confidence,
        )?;
        validate_detector(&self.detector)
    }

    /// Server-side deadline for one challenge, measured from its prompt.
    pub fn challenge_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.challenge_timeout_ms + self.deadline_grace_ms)
    }
}

fn unit_interval(name: &str, value: f32) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{name} must be within [0, 1], got {value}"))
    }
}

/// Settings the detector divides by or indexes with. Also applied after
/// model metadata overrides them.
pub fn validate_detector(d: &DetectorConfig) -> Result<(), String> {
    if d.input_size == 0 {
        return Err("detector.input_size must be positive".into());
    }
    if d.strides.is_empty() || d.strides.contains(&0) {
        return Err(format!("detector.strides must be non-empty and positive, got {:?}", d.strides));
    }
    if d.anchors_per_cell == 0 {
        return Err("detector.anchors_per_cell must be at least 1".into());
    }
    if d.std.iter().any(|v| !v.is_finite() || *v == 0.0) {
        return Err(format!("detector.std must be finite and non-zero, got {:?}", d.std));
    }
    if d.mean.iter().any(|v| !v.is_finite()) {
        return Err(format!("detector.mean must be finite, got {:?}", d.mean));
    }
    unit_interval("detector.score_threshold", d.score_threshold)?;
    unit_interval("detector.iou_threshold", d.iou_threshold)
}

#[derive(Debug)]
enum PolicyParseError {
    Toml(toml::de::Error),
    Invalid(String),
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
