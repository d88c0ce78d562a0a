use std::sync::Arc;
use std::time::Duration;

use liveproof_core::detector::{DetectorError, FaceDetect};
use liveproof_core::pad::hash::{average_hash, gray_grid};
use liveproof_core::{FaceDetection, GrayGrid};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("all inference workers are busy")]
    Saturated,
    #[error("inference did not answer within {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn inference worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("inference worker exited")]
    ChannelClosed,
}

/// Server-side measurements of one decoded frame.
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub width: u32,
    pub height: u32,
    pub ahash: u64,
    pub gray: GrayGrid,
    pub face: Option<FaceDetection>,
    /// False when the worker has no detector or inference failed; `face`
    /// then carries no information.
    pub detector_ran: bool,
}

struct AnalyzeRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<FrameAnalysis, EngineError>>,
}

/// Builds the detector owned by worker `n`. `Ok(None)` runs that worker
/// without a detector.
pub type DetectorFactory =
    dyn Fn(usize) -> Result<Option<Box<dyn FaceDetect>>, DetectorError> + Send + Sync;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub timeout: Duration,
    pub grid_size: u32,
}

/// Clone-safe handle to the inference worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<[mpsc::Sender<AnalyzeRequest>]>,
    timeout: Duration,
    detector_available: bool,
    model_tag: Option<String>,
}

impl EngineHandle {
    /// Decode, hash and run detection on one encoded image.
    ///
    /// The request goes to the first worker with queue room. A saturated
    /// pool or a late reply is an error the caller treats as "no detection".
    pub async fn analyze(&self, image: Vec<u8>) -> Result<FrameAnalysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut req = AnalyzeRequest {
            image,
            reply: reply_tx,
        };
        let mut sent = false;
        for worker in self.workers.iter() {
            match worker.try_send(req) {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(TrySendError::Full(r)) | Err(TrySendError::Closed(r)) => req = r,
            }
        }
        if !sent {
            return Err(EngineError::Saturated);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ChannelClosed),
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }

    pub fn detector_available(&self) -> bool {
        self.detector_available
    }

    pub fn model_tag(&self) -> Option<&str> {
        self.model_tag.as_deref()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

/// Spawn the inference pool: one OS thread per worker, each owning its own
/// detector and fed by its own bounded queue.
///
/// A worker whose detector fails to load still decodes and hashes frames.
pub fn spawn_pool(config: PoolConfig, factory: &DetectorFactory) -> Result<EngineHandle, EngineError> {
    let workers = config.workers.max(1);
    let mut senders = Vec::with_capacity(workers);
    let mut detector_available = false;
    let mut model_tag = None;

    for n in 0..workers {
        let detector = match factory(n) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(worker = n, error = %e, "detector unavailable, worker runs degraded");
                None
            }
        };
        if let Some(d) = &detector {
            detector_available = true;
            model_tag.get_or_insert_with(|| d.model_tag().to_string());
        }

        let (tx, rx) = mpsc::channel::<AnalyzeRequest>(config.queue_depth.max(1));
        let grid_size = config.grid_size;
        std::thread::Builder::new()
            .name(format!("liveproof-infer-{n}"))
            .spawn(move || worker_loop(n, rx, detector, grid_size))
            .map_err(EngineError::Spawn)?;
        senders.push(tx);
    }

    tracing::info!(
        workers,
        queue_depth = config.queue_depth,
        detector = detector_available,
        "inference pool started"
    );

    Ok(EngineHandle {
        workers: senders.into(),
        timeout: config.timeout,
        detector_available,
        model_tag,
    })
}

fn worker_loop(
    n: usize,
    mut rx: mpsc::Receiver<AnalyzeRequest>,
    mut detector: Option<Box<dyn FaceDetect>>,
    grid_size: u32,
) {
    tracing::debug!(worker = n, "inference worker started");
    while let Some(req) = rx.blocking_recv() {
        if req.reply.is_closed() {
            continue;
        }
        let result = analyze_frame(&req.image, detector.as_deref_mut(), grid_size);
        let _ = req.reply.send(result);
    }
    tracing::debug!(worker = n, "inference worker exiting");
}

/// Largest width or height a worker will decode.
const MAX_FRAME_DIMENSION: u32 = 4096;
const MAX_DECODE_ALLOC: u64 = 64 * 1024 * 1024;

/// Decode untrusted frame bytes under fixed dimension and allocation caps.
fn decode_frame(bytes: &[u8]) -> Result<image::DynamicImage, EngineError> {
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(MAX_FRAME_DIMENSION);
    limits.max_image_height = Some(MAX_FRAME_DIMENSION);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);

    let mut reader = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;
    reader.limits(limits);
    Ok(reader.decode()?)
}

fn analyze_frame(
    bytes: &[u8],
    detector: Option<&mut (dyn FaceDetect + '_)>,
    grid_size: u32,
) -> Result<FrameAnalysis, EngineError> {
    let image = decode_frame(bytes)?;
    let (face, detector_ran) = match detector {
        Some(d) => match d.detect(&image) {
            Ok(face) => (face, true),
            Err(e) => {
                tracing::warn!(error = %e, "inference failed, frame degraded");
                (None, false)
            }
        },
        None => (None, false),
    };

    Ok(FrameAnalysis {
        width: image.width(),
        height: image.height(),
        ahash: average_hash(&image),
        gray: gray_grid(&image, grid_size),
        face,
        detector_ran,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use liveproof_core::BoundingBox;

    /// Detector that reports a fixed face, optionally after a delay.
    pub(crate) struct FixedDetector {
        pub delay: Duration,
    }

    impl FaceDetect for FixedDetector {
        fn detect(&mut self, image: &DynamicImage) -> Result<Option<FaceDetection>, DetectorError> {
            std::thread::sleep(self.delay);
            Ok(Some(FaceDetection {
                bbox: BoundingBox {
                    x1: 0.0,
                    y1: 0.0,
                    x2: image.width() as f32 / 2.0,
                    y2: image.height() as f32 / 2.0,
                },
                confidence: 0.93,
                keypoints: None,
                model: "fixed@test".into(),
            }))
        }

        fn model_tag(&self) -> &str {
            "fixed@test"
        }
    }

    struct FailingDetector;

    impl FaceDetect for FailingDetector {
        fn detect(&mut self, _: &DynamicImage) -> Result<Option<FaceDetection>, DetectorError> {
            Err(DetectorError::Inference("boom".into()))
        }

        fn model_tag(&self) -> &str {
            "failing"
        }
    }

    pub(crate) fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([shade, (x % 256) as u8, (y % 256) as u8])
        }));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn pool(workers: usize, queue_depth: usize, timeout: Duration, delay: Duration) -> EngineHandle {
        let factory = move |_: usize| -> Result<Option<Box<dyn FaceDetect>>, DetectorError> {
            Ok(Some(Box::new(FixedDetector { delay })))
        };
        spawn_pool(
            PoolConfig {
                workers,
                queue_depth,
                timeout,
                grid_size: 16,
            },
            &factory,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_analyze_returns_detection_and_hashes() {
        let engine = pool(2, 4, Duration::from_secs(5), Duration::ZERO);
        assert!(engine.detector_available());
        assert_eq!(engine.model_tag(), Some("fixed@test"));

        let a = engine.analyze(png(64, 48, 10)).await.unwrap();
        assert!(a.detector_ran);
        assert_eq!((a.width, a.height), (64, 48));
        assert_eq!(a.gray.pixels.len(), 16 * 16);
        assert_eq!(a.face.unwrap().confidence, 0.93);
    }

    #[tokio::test]
    async fn test_undecodable_image_is_an_error() {
        let engine = pool(1, 1, Duration::from_secs(5), Duration::ZERO);
        let err = engine.analyze(vec![0u8; 200]).await.unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_oversized_image_is_refused() {
        let engine = pool(1, 1, Duration::from_secs(5), Duration::ZERO);
        let err = engine
            .analyze(png(MAX_FRAME_DIMENSION + 1, 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Decode(image::ImageError::Limits(_))));

        let a = engine.analyze(png(MAX_FRAME_DIMENSION, 1, 0)).await.unwrap();
        assert_eq!(a.width, MAX_FRAME_DIMENSION);
    }

    #[tokio::test]
    async fn test_missing_detector_degrades() {
        let factory = |_: usize| -> Result<Option<Box<dyn FaceDetect>>, DetectorError> {
            Err(DetectorError::Load {
                path: "det.onnx".into(),
                message: "missing".into(),
            })
        };
        let engine = spawn_pool(
            PoolConfig {
                workers: 1,
                queue_depth: 1,
                timeout: Duration::from_secs(5),
                grid_size: 8,
            },
            &factory,
        )
        .unwrap();
        assert!(!engine.detector_available());
        let a = engine.analyze(png(32, 32, 200)).await.unwrap();
        assert!(!a.detector_ran);
        assert!(a.face.is_none());
    }

    #[tokio::test]
    async fn test_inference_error_degrades() {
        let factory = |_: usize| -> Result<Option<Box<dyn FaceDetect>>, DetectorError> {
            Ok(Some(Box::new(FailingDetector)))
        };
        let engine = spawn_pool(
            PoolConfig {
                workers: 1,
                queue_depth: 1,
                timeout: Duration::from_secs(5),
                grid_size: 8,
            },
            &factory,
        )
        .unwrap();
        let a = engine.analyze(png(32, 32, 0)).await.unwrap();
        assert!(!a.detector_ran);
    }

    #[tokio::test]
    async fn test_slow_inference_times_out() {
        let engine = pool(1, 1, Duration::from_millis(50), Duration::from_millis(500));
        let err = engine.analyze(png(16, 16, 0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let engine = pool(1, 1, Duration::from_secs(10), Duration::from_millis(800));
        let busy = engine.clone();
        let first = tokio::spawn(async move { busy.analyze(png(16, 16, 0)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let queued = engine.clone();
        let second = tokio::spawn(async move { queued.analyze(png(16, 16, 1)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = engine.analyze(png(16, 16, 2)).await.unwrap_err();
        assert!(matches!(err, EngineError::Saturated));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }
}
