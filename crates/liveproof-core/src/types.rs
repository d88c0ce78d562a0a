use serde::{Deserialize, Serialize};

/// A 2-D point in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned box in corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Intersection over union; 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// SCRFD 5-point keypoints: left eye, right eye, nose, left mouth, right mouth.
pub type Keypoints = [Point; 5];

/// A single face found by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<Keypoints>,
    /// Model name and version that produced this detection.
    pub model: String,
}

pub const LANDMARK_COUNT: usize = 14;

/// Fixed 14-point facial landmark set.
///
/// The first five points follow the SCRFD keypoint order so that detector
/// keypoints and client landmarks can be compared directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f32; 2]>", into = "Vec<[f32; 2]>")]
pub struct Landmarks(pub [Point; LANDMARK_COUNT]);

impl Landmarks {
    pub const LEFT_EYE: usize = 0;
    pub const RIGHT_EYE: usize = 1;
    pub const NOSE_TIP: usize = 2;
    pub const MOUTH_LEFT: usize = 3;
    pub const MOUTH_RIGHT: usize = 4;
    pub const MOUTH_TOP: usize = 5;
    pub const MOUTH_BOTTOM: usize = 6;
    pub const CHIN: usize = 7;
    pub const LEFT_BROW: usize = 8;
    pub const RIGHT_BROW: usize = 9;
    pub const LEFT_EYE_TOP: usize = 10;
    pub const LEFT_EYE_BOTTOM: usize = 11;
    pub const RIGHT_EYE_TOP: usize = 12;
    pub const RIGHT_EYE_BOTTOM: usize = 13;

    pub fn point(&self, index: usize) -> Point {
        self.0[index]
    }

    /// The SCRFD-compatible subset of the landmark set.
    pub fn keypoints(&self) -> Keypoints {
        [self.0[0], self.0[1], self.0[2], self.0[3], self.0[4]]
    }
}

impl TryFrom<Vec<[f32; 2]>> for Landmarks {
    type Error = String;

    fn try_from(pairs: Vec<[f32; 2]>) -> Result<Self, Self::Error> {
        if pairs.len() != LANDMARK_COUNT {
            return Err(format!(
                "expected {LANDMARK_COUNT} landmarks, got {}",
                pairs.len()
            ));
        }
        let mut points = [Point::default(); LANDMARK_COUNT];
        for (slot, [x, y]) in points.iter_mut().zip(pairs) {
            *slot = Point::new(x, y);
            if !slot.is_finite() {
                return Err("landmark coordinates must be finite".to_string());
            }
        }
        Ok(Self(points))
    }
}

impl From<Landmarks> for Vec<[f32; 2]> {
    fn from(landmarks: Landmarks) -> Self {
        landmarks.0.iter().map(|p| [p.x, p.y]).collect()
    }
}

/// Challenge types a client can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    #[serde(alias = "look-left", alias = "turn-left")]
    LookLeft,
    #[serde(alias = "look-right", alias = "turn-right")]
    LookRight,
    #[serde(alias = "look-up", alias = "head-up")]
    LookUp,
    #[serde(alias = "look-down", alias = "head-down")]
    LookDown,
    #[serde(alias = "open-mouth")]
    OpenMouth,
    Blink,
}

impl ChallengeKind {
    pub const ALL: [ChallengeKind; 6] = [
        ChallengeKind::LookLeft,
        ChallengeKind::LookRight,
        ChallengeKind::LookUp,
        ChallengeKind::LookDown,
        ChallengeKind::OpenMouth,
        ChallengeKind::Blink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::LookLeft => "look_left",
            ChallengeKind::LookRight => "look_right",
            ChallengeKind::LookUp => "look_up",
            ChallengeKind::LookDown => "look_down",
            ChallengeKind::OpenMouth => "open_mouth",
            ChallengeKind::Blink => "blink",
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChallengeKind {
    type Err = String;

    /// Accepts snake_case, kebab-case and the legacy turn/head names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "look_left" | "turn_left" => Ok(ChallengeKind::LookLeft),
            "look_right" | "turn_right" => Ok(ChallengeKind::LookRight),
            "look_up" | "head_up" => Ok(ChallengeKind::LookUp),
            "look_down" | "head_down" => Ok(ChallengeKind::LookDown),
            "open_mouth" => Ok(ChallengeKind::OpenMouth),
            "blink" => Ok(ChallengeKind::Blink),
            other => Err(format!("unknown challenge kind: {other}")),
        }
    }
}

/// Where a frame's face-presence verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSource {
    /// Server-side detector ran on the frame image.
    Server,
    /// Only the client's advisory report is available.
    Client,
    /// Nothing is known about the frame.
    None,
}

/// Client-reported capture telemetry. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTelemetry {
    #[serde(default)]
    pub fps: Option<f32>,
    #[serde(default)]
    pub rtt_ms: Option<u32>,
    #[serde(default)]
    pub cam_width: Option<u32>,
    #[serde(default)]
    pub cam_height: Option<u32>,
}

/// Coarse square grayscale thumbnail used for flicker scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayGrid {
    pub size: u32,
    pub pixels: Vec<u8>,
}

/// One frame as held by a challenge buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub frame_id: u64,
    /// Client capture timestamp (ms).
    pub timestamp_ms: u64,
    /// Server receipt time (ms since the Unix epoch).
    pub received_at_ms: u64,
    pub image: Option<Vec<u8>>,
    pub motion_score: Option<f32>,
    pub client_hash: Option<u64>,
    pub server_hash: Option<u64>,
    pub gray: Option<GrayGrid>,
    pub face: Option<FaceDetection>,
    pub face_present: bool,
    pub face_source: FaceSource,
    pub landmarks: Option<Landmarks>,
    pub telemetry: Option<FrameTelemetry>,
}

impl FrameRecord {
    /// A bare record with no payload or signals attached.
    pub fn new(frame_id: u64, timestamp_ms: u64, received_at_ms: u64) -> Self {
        Self {
            frame_id,
            timestamp_ms,
            received_at_ms,
            image: None,
            motion_score: None,
            client_hash: None,
            server_hash: None,
            gray: None,
            face: None,
            face_present: false,
            face_source: FaceSource::None,
            landmarks: None,
            telemetry: None,
        }
    }

    /// Approximate heap + inline footprint, used for the global byte budget.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.image.as_ref().map_or(0, Vec::len)
            + self.gray.as_ref().map_or(0, |g| g.pixels.len())
            + self.face.as_ref().map_or(0, |f| f.model.len())
    }

    /// Perceptual hash to use for duplicate detection: server-computed when
    /// available, otherwise the client's advisory value.
    pub fn effective_hash(&self) -> Option<u64> {
        self.server_hash.or(self.client_hash)
    }

    /// Keypoints for stability analysis, preferring detector output.
    pub fn keypoints(&self) -> Option<Keypoints> {
        self.face
            .as_ref()
            .and_then(|f| f.keypoints)
            .or_else(|| self.landmarks.map(|l| l.keypoints()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        let b = BoundingBox { x1: 20.0, y1: 20.0, x2: 30.0, y2: 30.0 };
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn landmarks_require_exact_count() {
        let short: Result<Landmarks, _> = Landmarks::try_from(vec![[0.0, 0.0]; 5]);
        assert!(short.is_err());
        let ok = Landmarks::try_from(vec![[1.0, 2.0]; LANDMARK_COUNT]).unwrap();
        assert_eq!(ok.point(Landmarks::CHIN), Point::new(1.0, 2.0));
    }

    #[test]
    fn landmarks_reject_non_finite() {
        let mut pairs = vec![[1.0, 2.0]; LANDMARK_COUNT];
        pairs[3] = [f32::NAN, 0.0];
        assert!(Landmarks::try_from(pairs).is_err());
    }

    #[test]
    fn challenge_kind_accepts_legacy_names() {
        let k: ChallengeKind = serde_json::from_str("\"turn-right\"").unwrap();
        assert_eq!(k, ChallengeKind::LookRight);
        let k: ChallengeKind = serde_json::from_str("\"look_right\"").unwrap();
        assert_eq!(k, ChallengeKind::LookRight);
        assert_eq!(serde_json::to_string(&ChallengeKind::OpenMouth).unwrap(), "\"open_mouth\"");
    }

    #[test]
    fn challenge_kind_from_str() {
        assert_eq!("Head-Down".parse::<ChallengeKind>(), Ok(ChallengeKind::LookDown));
        assert_eq!("blink".parse::<ChallengeKind>(), Ok(ChallengeKind::Blink));
        assert!("smile".parse::<ChallengeKind>().is_err());
    }

    #[test]
    fn effective_hash_prefers_server() {
        let mut r = FrameRecord::new(1, 10, 20);
        r.client_hash = Some(1);
        assert_eq!(r.effective_hash(), Some(1));
        r.server_hash = Some(2);
        assert_eq!(r.effective_hash(), Some(2));
    }
}
