//! Server-side liveness verification primitives.
//!
//! Everything here is synchronous and transport-agnostic. The daemon owns the
//! session lifecycle and decides when to call into these modules.

pub mod buffer;
pub mod detector;
pub mod fusion;
pub mod gesture;
pub mod pad;
pub mod types;

pub use buffer::{BufferFull, ByteBudget, FrameBuffer, FrameSnapshot};
pub use detector::{DetectorConfig, DetectorError, FaceDetect, ScrfdDetector};
pub use fusion::{
    fuse_attempt, fuse_challenge, AttemptDecision, ChallengeAnalysis, ChallengeDecision,
    ChallengeOutcome, DecisionConfig,
};
pub use gesture::{GestureConfig, GestureTracker};
pub use pad::{PadConfig, PadKind, PadReport, PadSignal};
pub use types::{
    BoundingBox, ChallengeKind, FaceDetection, FaceSource, FrameRecord, FrameTelemetry,
    GrayGrid, Keypoints, Landmarks, Point,
};
