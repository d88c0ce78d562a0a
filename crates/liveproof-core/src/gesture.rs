//! Geometric gesture predicates over the 14-point landmark set.
//!
//! Ratios are normalised by inter-eye distance or by a per-challenge baseline,
//! so they hold at any face size. Degenerate geometry never satisfies a
//! predicate.

use serde::{Deserialize, Serialize};

use crate::types::{ChallengeKind, FrameRecord, Keypoints, Landmarks, Point};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    /// |nose - eye midpoint| along x, in inter-eye distances.
    pub yaw_threshold: f32,
    /// Chin-to-brow height relative to the first frame.
    pub pitch_compression: f32,
    /// Nose position between the eye line (0) and mouth line (1).
    pub look_down_ratio: f32,
    /// Lip gap relative to mouth width.
    pub mouth_open_ratio: f32,
    /// Mean eyelid gap in inter-eye distances.
    pub blink_ratio: f32,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            yaw_threshold: 0.3,
            pitch_compression: 0.85,
            look_down_ratio: 0.75,
            mouth_open_ratio: 0.45,
            blink_ratio: 0.06,
        }
    }
}

fn ratio(num: f32, den: f32) -> Option<f32> {
    let r = num / den;
    (den.is_finite() && den.abs() > f32::EPSILON && r.is_finite()).then_some(r)
}

fn eyes(k: &Keypoints) -> (Point, f32) {
    (k[0].midpoint(k[1]), k[0].distance(k[1]))
}

/// Horizontal nose offset from the eye midpoint; negative is left.
pub fn yaw_offset(k: &Keypoints) -> Option<f32> {
    let (mid, iod) = eyes(k);
    ratio(k[2].x - mid.x, iod)
}

/// Where the nose sits between the eye line and the mouth line.
pub fn nose_drop(k: &Keypoints) -> Option<f32> {
    let (mid, _) = eyes(k);
    let mouth = k[3].midpoint(k[4]);
    ratio(k[2].y - mid.y, mouth.y - mid.y)
}

/// Chin-to-brow height in inter-eye distances.
pub fn face_height(l: &Landmarks) -> Option<f32> {
    let brow = l.point(Landmarks::LEFT_BROW).midpoint(l.point(Landmarks::RIGHT_BROW));
    let iod = l.point(Landmarks::LEFT_EYE).distance(l.point(Landmarks::RIGHT_EYE));
    ratio(l.point(Landmarks::CHIN).y - brow.y, iod)
}

pub fn mouth_opening(l: &Landmarks) -> Option<f32> {
    let gap = l.point(Landmarks::MOUTH_TOP).distance(l.point(Landmarks::MOUTH_BOTTOM));
    let width = l.point(Landmarks::MOUTH_LEFT).distance(l.point(Landmarks::MOUTH_RIGHT));
    ratio(gap, width)
}

pub fn eyelid_gap(l: &Landmarks) -> Option<f32> {
    let left = l.point(Landmarks::LEFT_EYE_TOP).distance(l.point(Landmarks::LEFT_EYE_BOTTOM));
    let right = l.point(Landmarks::RIGHT_EYE_TOP).distance(l.point(Landmarks::RIGHT_EYE_BOTTOM));
    let iod = l.point(Landmarks::LEFT_EYE).distance(l.point(Landmarks::RIGHT_EYE));
    ratio((left + right) / 2.0, iod)
}

/// The measurement a challenge kind is judged on, if the frame carries the
/// geometry it needs. Yaw and look-down only need the five keypoints, so they
/// fall back to detector output when the client sent no landmarks.
pub fn measure(kind: ChallengeKind, frame: &FrameRecord, baseline: Option<&Landmarks>) -> Option<f32> {
    let keypoints = frame.landmarks.map(|l| l.keypoints()).or_else(|| frame.keypoints());
    match kind {
        ChallengeKind::LookLeft | ChallengeKind::LookRight => yaw_offset(&keypoints?),
        ChallengeKind::LookDown => nose_drop(&keypoints?),
        ChallengeKind::LookUp => {
            let now = face_height(frame.landmarks.as_ref()?)?;
            let base = face_height(baseline?)?;
            ratio(now, base)
        }
        ChallengeKind::OpenMouth => mouth_opening(frame.landmarks.as_ref()?),
        ChallengeKind::Blink => eyelid_gap(frame.landmarks.as_ref()?),
    }
}

pub fn satisfies(kind: ChallengeKind, value: f32, cfg: &GestureConfig) -> bool {
    if !value.is_finite() {
        return false;
    }
    match kind {
        ChallengeKind::LookLeft => value < -cfg.yaw_threshold,
        ChallengeKind::LookRight => value > cfg.yaw_threshold,
        ChallengeKind::LookUp => value < cfg.pitch_compression,
        ChallengeKind::LookDown => value > cfg.look_down_ratio,
        ChallengeKind::OpenMouth => value > cfg.mouth_open_ratio,
        ChallengeKind::Blink => value < cfg.blink_ratio,
    }
}

/// Per-challenge gesture state. The detected flag is set on the first
/// qualifying frame and never changes afterwards.
#[derive(Debug, Clone)]
pub struct GestureTracker {
    kind: ChallengeKind,
    config: GestureConfig,
    baseline: Option<Landmarks>,
    detected_frame: Option<u64>,
    measured: u32,
}

impl GestureTracker {
    pub fn new(kind: ChallengeKind, config: GestureConfig) -> Self {
        Self {
            kind,
            config,
            baseline: None,
            detected_frame: None,
            measured: 0,
        }
    }

    pub fn kind(&self) -> ChallengeKind {
        self.kind
    }

    /// Evaluate one accepted frame. Returns `true` only for the frame that
    /// first satisfies the predicate.
    pub fn observe(&mut self, frame: &FrameRecord) -> bool {
        if self.baseline.is_none() {
            self.baseline = frame.landmarks;
        }
        if self.detected_frame.is_some() {
            return false;
        }
        let Some(value) = measure(self.kind, frame, self.baseline.as_ref()) else {
            return false;
        };
        self.measured += 1;
        if satisfies(self.kind, value, &self.config) {
            self.detected_frame = Some(frame.frame_id);
            true
        } else {
            false
        }
    }

    pub fn detected(&self) -> bool {
        self.detected_frame.is_some()
    }

    pub fn detected_frame(&self) -> Option<u64> {
        self.detected_frame
    }

    /// Frames that carried usable geometry before detection.
    pub fn measured(&self) -> u32 {
        self.measured
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::LANDMARK_COUNT;

    /// A frontal, neutral face with eyes 60px apart.
    pub(crate) fn neutral() -> [Point; LANDMARK_COUNT] {
        let mut p = [Point::default(); LANDMARK_COUNT];
        p[Landmarks::LEFT_EYE] = Point::new(70.0, 100.0);
        p[Landmarks::RIGHT_EYE] = Point::new(130.0, 100.0);
        p[Landmarks::NOSE_TIP] = Point::new(100.0, 130.0);
        p[Landmarks::MOUTH_LEFT] = Point::new(80.0, 160.0);
        p[Landmarks::MOUTH_RIGHT] = Point::new(120.0, 160.0);
        p[Landmarks::MOUTH_TOP] = Point::new(100.0, 156.0);
        p[Landmarks::MOUTH_BOTTOM] = Point::new(100.0, 164.0);
        p[Landmarks::CHIN] = Point::new(100.0, 190.0);
        p[Landmarks::LEFT_BROW] = Point::new(70.0, 85.0);
        p[Landmarks::RIGHT_BROW] = Point::new(130.0, 85.0);
        p[Landmarks::LEFT_EYE_TOP] = Point::new(70.0, 96.0);
        p[Landmarks::LEFT_EYE_BOTTOM] = Point::new(70.0, 104.0);
        p[Landmarks::RIGHT_EYE_TOP] = Point::new(130.0, 96.0);
        p[Landmarks::RIGHT_EYE_BOTTOM] = Point::new(130.0, 104.0);
        p
    }

    /// Neutral face with the nose shifted horizontally by `dx` pixels.
    pub(crate) fn turned(dx: f32) -> Landmarks {
        let mut p = neutral();
        p[Landmarks::NOSE_TIP].x += dx;
        Landmarks(p)
    }

    fn frame(id: u64, l: Landmarks) -> FrameRecord {
        let mut f = FrameRecord::new(id, id * 66, id * 66);
        f.landmarks = Some(l);
        f
    }

    #[test]
    fn test_neutral_face_satisfies_nothing() {
        let cfg = GestureConfig::default();
        let f = frame(0, Landmarks(neutral()));
        let base = Landmarks(neutral());
        for kind in ChallengeKind::ALL {
            let v = measure(kind, &f, Some(&base)).unwrap();
            assert!(!satisfies(kind, v, &cfg), "{kind} fired on a neutral face ({v})");
        }
    }

    #[test]
    fn test_yaw_direction() {
        let cfg = GestureConfig::default();
        let right = measure(ChallengeKind::LookRight, &frame(0, turned(25.0)), None).unwrap();
        assert!(satisfies(ChallengeKind::LookRight, right, &cfg));
        assert!(!satisfies(ChallengeKind::LookLeft, right, &cfg));
        let left = measure(ChallengeKind::LookLeft, &frame(0, turned(-25.0)), None).unwrap();
        assert!(satisfies(ChallengeKind::LookLeft, left, &cfg));
    }

    #[test]
    fn test_open_mouth() {
        let mut p = neutral();
        p[Landmarks::MOUTH_TOP].y = 150.0;
        p[Landmarks::MOUTH_BOTTOM].y = 172.0;
        let v = measure(ChallengeKind::OpenMouth, &frame(0, Landmarks(p)), None).unwrap();
        assert!(satisfies(ChallengeKind::OpenMouth, v, &GestureConfig::default()));
    }

    #[test]
    fn test_blink() {
        let mut p = neutral();
        for i in [
            Landmarks::LEFT_EYE_TOP,
            Landmarks::LEFT_EYE_BOTTOM,
            Landmarks::RIGHT_EYE_TOP,
            Landmarks::RIGHT_EYE_BOTTOM,
        ] {
            p[i].y = 100.0;
        }
        let v = measure(ChallengeKind::Blink, &frame(0, Landmarks(p)), None).unwrap();
        assert!(satisfies(ChallengeKind::Blink, v, &GestureConfig::default()));
    }

    #[test]
    fn test_look_up_needs_baseline() {
        let mut p = neutral();
        p[Landmarks::CHIN].y = 160.0;
        let f = frame(1, Landmarks(p));
        assert_eq!(measure(ChallengeKind::LookUp, &f, None), None);

        let mut t = GestureTracker::new(ChallengeKind::LookUp, GestureConfig::default());
        assert!(!t.observe(&frame(0, Landmarks(neutral()))));
        assert!(t.observe(&f));
    }

    #[test]
    fn test_look_down() {
        let mut p = neutral();
        p[Landmarks::NOSE_TIP].y = 150.0;
        let v = measure(ChallengeKind::LookDown, &frame(0, Landmarks(p)), None).unwrap();
        assert!(satisfies(ChallengeKind::LookDown, v, &GestureConfig::default()));
    }

    #[test]
    fn test_degenerate_geometry_never_satisfies() {
        let collapsed = Landmarks([Point::new(5.0, 5.0); LANDMARK_COUNT]);
        let f = frame(0, collapsed);
        for kind in ChallengeKind::ALL {
            assert_eq!(measure(kind, &f, Some(&collapsed)), None, "{kind}");
        }
        assert!(!satisfies(ChallengeKind::Blink, f32::NAN, &GestureConfig::default()));
    }

    #[test]
    fn test_tracker_sets_flag_once() {
        let mut t = GestureTracker::new(ChallengeKind::LookRight, GestureConfig::default());
        assert!(!t.observe(&frame(0, turned(0.0))));
        assert!(t.observe(&frame(1, turned(30.0))));
        assert!(!t.observe(&frame(2, turned(40.0))));
        assert!(!t.observe(&frame(3, turned(0.0))));
        assert!(t.detected());
        assert_eq!(t.detected_frame(), Some(1));
    }

    #[test]
    fn test_tracker_ignores_frames_without_geometry() {
        let mut t = GestureTracker::new(ChallengeKind::OpenMouth, GestureConfig::default());
        assert!(!t.observe(&FrameRecord::new(0, 0, 0)));
        assert_eq!(t.measured(), 0);
    }
}
