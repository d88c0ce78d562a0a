//! Static-image detection via landmark stability.
//!
//! A photograph held in front of the camera produces near-identical eye
//! positions frame to frame. A live face shows involuntary micro-movement
//! even when the subject tries to hold still.

use super::{PadConfig, PadKind, PadSignal};
use crate::types::{FrameRecord, Keypoints};

/// Minimum mean eye displacement (px) between consecutive frames. A steady
/// live gaze moves well over 1 px at 30 fps; a printed photo stays under
/// 0.3 px of sensor noise.
pub const DEFAULT_MIN_EYE_DISPLACEMENT: f32 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct StabilityResult {
    pub is_live: bool,
    pub mean_eye_displacement: f32,
    pub frame_pairs_analysed: usize,
}

/// Mean displacement of both eye keypoints over consecutive pairs.
///
/// Fewer than two frames cannot be judged and pass through. Non-finite
/// input fails.
pub fn check_landmark_stability(
    sequence: &[Keypoints],
    min_displacement: Option<f32>,
) -> StabilityResult {
    let threshold = min_displacement.unwrap_or(DEFAULT_MIN_EYE_DISPLACEMENT);

    if sequence.len() < 2 {
        return StabilityResult {
            is_live: true,
            mean_eye_displacement: 0.0,
            frame_pairs_analysed: 0,
        };
    }

    let total: f32 = sequence
        .windows(2)
        .map(|pair| {
            let left = pair[0][0].distance(pair[1][0]);
            let right = pair[0][1].distance(pair[1][1]);
            (left + right) / 2.0
        })
        .sum();
    let pairs = sequence.len() - 1;
    let mean = total / pairs as f32;

    StabilityResult {
        // NaN compares false, so corrupt input is never treated as live.
        is_live: mean >= threshold,
        mean_eye_displacement: mean,
        frame_pairs_analysed: pairs,
    }
}

pub(super) fn static_landmark_signal(frames: &[FrameRecord], cfg: &PadConfig) -> PadSignal {
    let weight = cfg.stability_weight;
    let sequence: Vec<Keypoints> = frames.iter().filter_map(FrameRecord::keypoints).collect();
    let result = check_landmark_stability(&sequence, Some(cfg.min_eye_displacement));

    if result.frame_pairs_analysed == 0 {
        return PadSignal::quiet(PadKind::StaticLandmarks, weight, "not enough landmark frames");
    }
    let detail = format!(
        "mean eye displacement {:.3}px over {} pairs",
        result.mean_eye_displacement, result.frame_pairs_analysed
    );
    if result.is_live {
        return PadSignal::quiet(PadKind::StaticLandmarks, weight, detail);
    }

    let score = if cfg.min_eye_displacement > 0.0 && result.mean_eye_displacement.is_finite() {
        (1.0 - result.mean_eye_displacement / cfg.min_eye_displacement).clamp(0.0, 1.0)
    } else {
        1.0
    };
    PadSignal {
        kind: PadKind::StaticLandmarks,
        score,
        weight,
        triggered: true,
        detail,
    }
}
