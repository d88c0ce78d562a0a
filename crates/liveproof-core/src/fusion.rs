//! Per-challenge and per-attempt verdicts.

use serde::{Deserialize, Serialize};

use crate::buffer::FrameSnapshot;
use crate::pad::PadReport;
use crate::types::{ChallengeKind, FaceSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub min_face_rate: f32,
    pub min_frames: usize,
    /// Detection confidence credited to frames whose face presence is only
    /// client-reported.
    pub client_presence_confidence: f32,
    pub risk_weight_pad: f32,
    pub risk_weight_uncertainty: f32,
    pub risk_weight_degraded: f32,
    pub risk_weight_failed: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_face_rate: 0.7,
            min_frames: 10,
            client_presence_confidence: 0.5,
            risk_weight_pad: 40.0,
            risk_weight_uncertainty: 20.0,
            risk_weight_degraded: 15.0,
            risk_weight_failed: 25.0,
        }
    }
}

/// Everything measured about one closed challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeAnalysis {
    pub challenge_id: String,
    pub kind: ChallengeKind,
    pub frame_count: usize,
    pub face_frames: usize,
    pub server_face_frames: usize,
    pub face_presence_rate: f32,
    /// Mean server detection confidence, if any frame was detected.
    pub mean_confidence: Option<f32>,
    /// Frames with no server detection result.
    pub degraded_frames: usize,
    pub evicted_frames: u64,
    pub replayed_frames: u32,
    pub gesture_detected: bool,
    pub gesture_frame: Option<u64>,
    pub timed_out: bool,
    pub pad: PadReport,
}

impl ChallengeAnalysis {
    pub fn from_snapshot(
        challenge_id: impl Into<String>,
        kind: ChallengeKind,
        snapshot: &FrameSnapshot,
        gesture_frame: Option<u64>,
        replayed_frames: u32,
        timed_out: bool,
        pad: PadReport,
    ) -> Self {
        let frames = snapshot.frames();
        let frame_count = frames.len();
        let face_frames = frames.iter().filter(|f| f.face_present).count();
        let server_face_frames = frames
            .iter()
            .filter(|f| f.face_present && f.face_source == FaceSource::Server)
            .count();
        let degraded_frames = frames
            .iter()
            .filter(|f| f.face_source != FaceSource::Server)
            .count();
        let confidences: Vec<f32> = frames
            .iter()
            .filter_map(|f| f.face.as_ref().map(|d| d.confidence))
            .collect();
        let mean_confidence = (!confidences.is_empty())
            .then(|| confidences.iter().sum::<f32>() / confidences.len() as f32);
        let face_presence_rate = if frame_count == 0 {
            0.0
        } else {
            face_frames as f32 / frame_count as f32
        };

        Self {
            challenge_id: challenge_id.into(),
            kind,
            frame_count,
            face_frames,
            server_face_frames,
            face_presence_rate,
            mean_confidence,
            degraded_frames,
            evicted_frames: snapshot.evicted(),
            replayed_frames,
            gesture_detected: gesture_frame.is_some(),
            gesture_frame,
            timed_out,
            pad,
        }
    }

    fn detection_confidence(&self, cfg: &DecisionConfig) -> f32 {
        if self.face_frames == 0 {
            return 0.0;
        }
        let trusted = self.server_face_frames as f32 / self.face_frames as f32;
        let server = self.mean_confidence.unwrap_or(cfg.client_presence_confidence);
        server * trusted + cfg.client_presence_confidence * (1.0 - trusted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeDecision {
    pub passed: bool,
    pub confidence: f32,
    pub reasons: Vec<String>,
}

pub fn fuse_challenge(a: &ChallengeAnalysis, cfg: &DecisionConfig) -> ChallengeDecision {
    let mut reasons = Vec::new();
    if a.timed_out {
        reasons.push("timeout".to_string());
    }
    if !a.gesture_detected {
        reasons.push("gesture_not_detected".to_string());
    }
    if !(a.face_presence_rate >= cfg.min_face_rate) {
        reasons.push("low_face_presence".to_string());
    }
    if a.frame_count < cfg.min_frames {
        reasons.push("insufficient_frames".to_string());
    }
    if a.pad.disqualified {
        let before = reasons.len();
        reasons.extend(a.pad.triggered().map(|s| format!("pad:{}", s.kind)));
        if reasons.len() == before {
            reasons.push("pad:invalid".to_string());
        }
    }

    let severity = a.pad.total_severity.clamp(0.0, 1.0);
    let confidence = a.face_presence_rate.clamp(0.0, 1.0) * a.detection_confidence(cfg) * (1.0 - severity);
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    ChallengeDecision {
        passed: reasons.is_empty(),
        confidence,
        reasons,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeOutcome {
    pub analysis: ChallengeAnalysis,
    pub decision: ChallengeDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptDecision {
    pub passed: bool,
    pub risk_score: u8,
    pub reasons: Vec<String>,
}

/// Combine the final outcome of every plan slot. `expected` is the plan
/// length; missing slots count as failures.
pub fn fuse_attempt(outcomes: &[ChallengeOutcome], expected: usize, cfg: &DecisionConfig) -> AttemptDecision {
    let mut reasons = Vec::new();
    if outcomes.len() < expected {
        reasons.push(format!("incomplete:{}/{}", outcomes.len(), expected));
    }
    for o in outcomes.iter().filter(|o| !o.decision.passed) {
        for r in &o.decision.reasons {
            reasons.push(format!("{}:{}", o.analysis.challenge_id, r));
        }
    }
    let passed = expected > 0
        && outcomes.len() >= expected
        && outcomes.iter().all(|o| o.decision.passed);

    AttemptDecision {
        passed,
        risk_score: risk_score(outcomes, expected, cfg),
        reasons,
    }
}

fn risk_score(outcomes: &[ChallengeOutcome], expected: usize, cfg: &DecisionConfig) -> u8 {
    let slots = expected.max(outcomes.len()).max(1) as f32;
    let n = outcomes.len().max(1) as f32;

    let pad = outcomes
        .iter()
        .map(|o| o.analysis.pad.total_severity.clamp(0.0, 1.0))
        .sum::<f32>()
        / n;
    let uncertainty = if outcomes.is_empty() {
        1.0
    } else {
        outcomes
            .iter()
            .map(|o| 1.0 - o.analysis.mean_confidence.unwrap_or(0.0).clamp(0.0, 1.0))
            .sum::<f32>()
            / n
    };
    let frames: usize = outcomes.iter().map(|o| o.analysis.frame_count).sum();
    let degraded = if frames == 0 {
        1.0
    } else {
        outcomes.iter().map(|o| o.analysis.degraded_frames).sum::<usize>() as f32 / frames as f32
    };
    let passed = outcomes.iter().filter(|o| o.decision.passed).count() as f32;
    let failed = (slots - passed) / slots;

    let weights = cfg.risk_weight_pad + cfg.risk_weight_uncertainty + cfg.risk_weight_degraded + cfg.risk_weight_failed;
    let raw = (cfg.risk_weight_pad * pad
        + cfg.risk_weight_uncertainty * uncertainty
        + cfg.risk_weight_degraded * degraded
        + cfg.risk_weight_failed * failed)
        / weights;
    if raw.is_finite() {
        (raw * 100.0).round().clamp(0.0, 100.0) as u8
    } else {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ByteBudget, FrameBuffer};
    use crate::pad::{PadKind, PadSignal};
    use crate::types::{BoundingBox, FaceDetection, FrameRecord};

    fn clean_pad() -> PadReport {
        PadReport::from_signals(Vec::new(), 0.5)
    }

    fn analysis(frames: usize, face: usize, gesture: bool) -> ChallengeAnalysis {
        let mut buf = FrameBuffer::new(64, ByteBudget::default());
        for i in 0..frames {
            let mut f = FrameRecord::new(i as u64, i as u64, i as u64);
            if i < face {
                f.face_present = true;
                f.face_source = FaceSource::Server;
                f.face = Some(FaceDetection {
                    bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
                    confidence: 0.9,
                    keypoints: None,
                    model: "scrfd".into(),
                });
            }
            buf.append(f).unwrap();
        }
        ChallengeAnalysis::from_snapshot(
            "c1",
            ChallengeKind::LookRight,
            &buf.snapshot(),
            gesture.then_some(3),
            0,
            false,
            clean_pad(),
        )
    }

    fn outcome(a: ChallengeAnalysis) -> ChallengeOutcome {
        let decision = fuse_challenge(&a, &DecisionConfig::default());
        ChallengeOutcome { analysis: a, decision }
    }

    #[test]
    fn test_challenge_passes_when_all_criteria_met() {
        let d = fuse_challenge(&analysis(12, 12, true), &DecisionConfig::default());
        assert!(d.passed, "{:?}", d.reasons);
        assert!(d.confidence > 0.8);
    }

    #[test]
    fn test_each_failed_criterion_is_reported() {
        let cfg = DecisionConfig::default();
        assert_eq!(fuse_challenge(&analysis(12, 12, false), &cfg).reasons, vec!["gesture_not_detected"]);
        assert_eq!(fuse_challenge(&analysis(12, 6, true), &cfg).reasons, vec!["low_face_presence"]);
        assert_eq!(fuse_challenge(&analysis(5, 5, true), &cfg).reasons, vec!["insufficient_frames"]);

        let mut a = analysis(12, 12, true);
        a.timed_out = true;
        assert_eq!(fuse_challenge(&a, &cfg).reasons, vec!["timeout"]);
    }

    #[test]
    fn test_disqualifying_pad_lists_kinds() {
        let mut a = analysis(12, 12, true);
        let signal = |kind| PadSignal {
            kind,
            score: 1.0,
            weight: 0.3,
            triggered: true,
            detail: String::new(),
        };
        a.pad = PadReport::from_signals(
            vec![signal(PadKind::DuplicateHash), signal(PadKind::Flicker)],
            0.5,
        );
        let d = fuse_challenge(&a, &DecisionConfig::default());
        assert!(!d.passed);
        assert_eq!(d.reasons, vec!["pad:duplicate_hash", "pad:flicker"]);
    }

    #[test]
    fn test_empty_challenge_fails_closed() {
        let d = fuse_challenge(&analysis(0, 0, false), &DecisionConfig::default());
        assert!(!d.passed);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_nan_presence_fails_closed() {
        let mut a = analysis(12, 12, true);
        a.face_presence_rate = f32::NAN;
        let d = fuse_challenge(&a, &DecisionConfig::default());
        assert!(!d.passed);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_attempt_passes_iff_all_pass() {
        let cfg = DecisionConfig::default();
        let all: Vec<_> = (0..3).map(|_| outcome(analysis(12, 12, true))).collect();
        assert!(fuse_attempt(&all, 3, &cfg).passed);

        let mut flipped = all.clone();
        flipped[1] = outcome(analysis(12, 12, false));
        let d = fuse_attempt(&flipped, 3, &cfg);
        assert!(!d.passed);
        assert!(d.reasons.iter().any(|r| r == "c1:gesture_not_detected"));
    }

    #[test]
    fn test_attempt_with_missing_slots_fails() {
        let cfg = DecisionConfig::default();
        let two: Vec<_> = (0..2).map(|_| outcome(analysis(12, 12, true))).collect();
        let d = fuse_attempt(&two, 3, &cfg);
        assert!(!d.passed);
        assert_eq!(d.reasons[0], "incomplete:2/3");
        assert!(!fuse_attempt(&[], 0, &cfg).passed);
    }

    #[test]
    fn test_risk_rises_with_suspicion() {
        let cfg = DecisionConfig::default();
        let good: Vec<_> = (0..3).map(|_| outcome(analysis(12, 12, true))).collect();
        let low = fuse_attempt(&good, 3, &cfg).risk_score;

        let mut degraded = good.clone();
        degraded[0] = outcome(analysis(12, 0, true));
        let mid = fuse_attempt(&degraded, 3, &cfg).risk_score;

        let high = fuse_attempt(&[], 3, &cfg).risk_score;
        assert!(low < mid, "{low} !< {mid}");
        assert!(mid < high, "{mid} !< {high}");
    }
}
