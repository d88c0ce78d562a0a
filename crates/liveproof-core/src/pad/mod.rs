//! Presentation-attack detection over a closed challenge buffer.
//!
//! Four independent heuristics each produce a [`PadSignal`]. A report is
//! disqualifying when the summed severity of the triggered signals reaches
//! [`PadConfig::reject_severity`]. With the default weights no heuristic can
//! reject a challenge on its own.

pub mod flicker;
pub mod hash;
pub mod replay;
pub mod stability;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::buffer::FrameSnapshot;
use crate::types::{FrameRecord, GrayGrid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadKind {
    Replay,
    DuplicateHash,
    Flicker,
    StaticLandmarks,
}

impl PadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PadKind::Replay => "replay",
            PadKind::DuplicateHash => "duplicate_hash",
            PadKind::Flicker => "flicker",
            PadKind::StaticLandmarks => "static_landmarks",
        }
    }
}

impl std::fmt::Display for PadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PadConfig {
    /// Maximum drift (ms) of `receipt - timestamp` from the attempt baseline.
    pub replay_window_ms: u64,
    /// How far (ms) a timestamp may run backwards before it is rejected.
    pub allow_clock_skew_ms: u64,
    pub max_recent_hashes: usize,
    pub duplicate_hamming_threshold: u32,
    pub flicker_grid_size: u32,
    /// Mean grid difference below this looks frozen.
    pub flicker_min: f32,
    /// Mean grid difference above this looks erratic.
    pub flicker_max: f32,
    pub min_eye_displacement: f32,
    pub replay_weight: f32,
    pub duplicate_weight: f32,
    pub flicker_weight: f32,
    pub stability_weight: f32,
    pub reject_severity: f32,
}

impl Default for PadConfig {
    fn default() -> Self {
        Self {
            replay_window_ms: 5_000,
            allow_clock_skew_ms: 1_000,
            max_recent_hashes: 32,
            duplicate_hamming_threshold: 2,
            flicker_grid_size: 32,
            flicker_min: 0.002,
            flicker_max: 0.2,
            min_eye_displacement: stability::DEFAULT_MIN_EYE_DISPLACEMENT,
            replay_weight: 0.45,
            duplicate_weight: 0.35,
            flicker_weight: 0.2,
            stability_weight: 0.25,
            reject_severity: 0.5,
        }
    }
}

/// Output of one heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadSignal {
    pub kind: PadKind,
    /// Suspicion in `[0, 1]`.
    pub score: f32,
    pub weight: f32,
    pub triggered: bool,
    pub detail: String,
}

impl PadSignal {
    pub fn quiet(kind: PadKind, weight: f32, detail: impl Into<String>) -> Self {
        Self {
            kind,
            score: 0.0,
            weight,
            triggered: false,
            detail: detail.into(),
        }
    }

    pub fn severity(&self) -> f32 {
        if self.triggered {
            self.score * self.weight
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PadReport {
    pub signals: Vec<PadSignal>,
    pub total_severity: f32,
    pub disqualified: bool,
}

impl PadReport {
    pub fn from_signals(signals: Vec<PadSignal>, reject_severity: f32) -> Self {
        let total_severity: f32 = signals.iter().map(PadSignal::severity).sum();
        // NaN anywhere fails closed.
        let disqualified = !total_severity.is_finite() || total_severity >= reject_severity;
        Self {
            signals,
            total_severity,
            disqualified,
        }
    }

    pub fn triggered(&self) -> impl Iterator<Item = &PadSignal> {
        self.signals.iter().filter(|s| s.triggered)
    }
}

/// Run every heuristic over a closed challenge.
///
/// `replayed` is the number of frames the attempt's replay guard rejected
/// while the challenge was active; those frames never reached the buffer.
pub fn evaluate(snapshot: &FrameSnapshot, replayed: u32, cfg: &PadConfig) -> PadReport {
    let frames = snapshot.frames();
    let signals = vec![
        replay_signal(replayed, frames.len(), cfg),
        hash::duplicate_signal(frames, cfg),
        flicker::flicker_signal(frames, cfg),
        stability::static_landmark_signal(frames, cfg),
    ];
    PadReport::from_signals(signals, cfg.reject_severity)
}

fn replay_signal(replayed: u32, accepted: usize, cfg: &PadConfig) -> PadSignal {
    if replayed == 0 {
        return PadSignal::quiet(PadKind::Replay, cfg.replay_weight, "no replayed frames");
    }
    let total = replayed as f32 + accepted as f32;
    PadSignal {
        kind: PadKind::Replay,
        score: replayed as f32 / total,
        weight: cfg.replay_weight,
        triggered: true,
        detail: format!("{replayed} of {total} frames rejected by replay guard"),
    }
}

/// Per-frame PAD hints returned in `frameAck` on the binary path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePad {
    pub replay: bool,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion: Option<f32>,
}

/// Rolling duplicate and motion tracking across a connection's binary
/// frames. Only produces hints; challenge verdicts come from [`evaluate`].
#[derive(Debug)]
pub struct StreamPad {
    recent: VecDeque<u64>,
    previous: Option<GrayGrid>,
    max_recent: usize,
    hamming_threshold: u32,
}

impl StreamPad {
    pub fn new(cfg: &PadConfig) -> Self {
        Self {
            recent: VecDeque::with_capacity(cfg.max_recent_hashes),
            previous: None,
            max_recent: cfg.max_recent_hashes.max(1),
            hamming_threshold: cfg.duplicate_hamming_threshold,
        }
    }

    pub fn observe(&mut self, frame: &FrameRecord, replay: bool) -> FramePad {
        let duplicate = match frame.effective_hash() {
            Some(h) => {
                let dup = self
                    .recent
                    .iter()
                    .any(|&prev| hash::hamming(prev, h) <= self.hamming_threshold);
                self.recent.push_back(h);
                if self.recent.len() > self.max_recent {
                    self.recent.pop_front();
                }
                dup
            }
            None => false,
        };

        let motion = match (&self.previous, &frame.gray) {
            (Some(prev), Some(cur)) => flicker::grid_difference(prev, cur),
            _ => frame.motion_score,
        };
        if frame.gray.is_some() {
            self.previous = frame.gray.clone();
        }

        FramePad {
            replay,
            duplicate,
            motion,
        }
    }
}
