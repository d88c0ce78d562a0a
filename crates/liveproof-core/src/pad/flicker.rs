//! Motion consistency between consecutive frames.
//!
//! A printed photo held still produces almost no change between frames; a
//! screen replay with refresh artefacts or a swapped image produces far more
//! than a face moving naturally.

use super::{PadConfig, PadKind, PadSignal};
use crate::types::{FrameRecord, GrayGrid};

/// Mean absolute difference between two grids, normalised to `[0, 1]`.
pub fn grid_difference(a: &GrayGrid, b: &GrayGrid) -> Option<f32> {
    if a.size != b.size || a.pixels.len() != b.pixels.len() || a.pixels.is_empty() {
        return None;
    }
    let total: u64 = a
        .pixels
        .iter()
        .zip(&b.pixels)
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    Some(total as f32 / (a.pixels.len() as f32 * 255.0))
}

pub(super) fn flicker_signal(frames: &[FrameRecord], cfg: &PadConfig) -> PadSignal {
    let weight = cfg.flicker_weight;

    let grids: Vec<&GrayGrid> = frames.iter().filter_map(|f| f.gray.as_ref()).collect();
    let server: Vec<f32> = grids
        .windows(2)
        .filter_map(|w| grid_difference(w[0], w[1]))
        .collect();

    let (samples, source) = if !server.is_empty() {
        (server, "server")
    } else {
        let client: Vec<f32> = frames
            .iter()
            .filter_map(|f| f.motion_score)
            .filter(|m| m.is_finite())
            .map(|m| m.clamp(0.0, 1.0))
            .collect();
        (client, "client")
    };

    if samples.is_empty() {
        return PadSignal::quiet(PadKind::Flicker, weight, "no motion data");
    }
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;

    let (triggered, score, label) = if mean < cfg.flicker_min {
        let score = if cfg.flicker_min > 0.0 {
            1.0 - mean / cfg.flicker_min
        } else {
            1.0
        };
        (true, score, "frozen")
    } else if mean > cfg.flicker_max {
        let score = if cfg.flicker_max > 0.0 {
            mean / cfg.flicker_max - 1.0
        } else {
            1.0
        };
        (true, score, "erratic")
    } else {
        (false, 0.0, "natural")
    };

    PadSignal {
        kind: PadKind::Flicker,
        score: score.clamp(0.0, 1.0),
        weight,
        triggered,
        detail: format!("{label} motion, mean {mean:.4} over {} {source} samples", samples.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(value: u8) -> GrayGrid {
        GrayGrid {
            size: 4,
            pixels: vec![value; 16],
        }
    }

    fn framed(id: u64, g: GrayGrid) -> FrameRecord {
        let mut f = FrameRecord::new(id, id, id);
        f.gray = Some(g);
        f
    }

    #[test]
    fn test_grid_difference_bounds() {
        assert_eq!(grid_difference(&grid(0), &grid(0)), Some(0.0));
        assert_eq!(grid_difference(&grid(0), &grid(255)), Some(1.0));
        let other = GrayGrid {
            size: 2,
            pixels: vec![0; 4],
        };
        assert_eq!(grid_difference(&grid(0), &other), None);
    }

    #[test]
    fn test_frozen_stream_triggers() {
        let frames: Vec<_> = (0..5).map(|i| framed(i, grid(128))).collect();
        let s = flicker_signal(&frames, &PadConfig::default());
        assert!(s.triggered);
        assert_eq!(s.score, 1.0);
    }

    #[test]
    fn test_natural_motion_passes() {
        // 10/255 ≈ 0.039 per step.
        let frames: Vec<_> = (0..5).map(|i| framed(i, grid(100 + (i as u8 % 2) * 10))).collect();
        let s = flicker_signal(&frames, &PadConfig::default());
        assert!(!s.triggered, "{}", s.detail);
    }

    #[test]
    fn test_erratic_stream_triggers() {
        let frames: Vec<_> = (0..5)
            .map(|i| framed(i, grid(if i % 2 == 0 { 0 } else { 255 })))
            .collect();
        let s = flicker_signal(&frames, &PadConfig::default());
        assert!(s.triggered);
        assert!(s.score > 0.9);
    }

    #[test]
    fn test_client_motion_fallback() {
        let frames: Vec<_> = (0..4)
            .map(|i| {
                let mut f = FrameRecord::new(i, i, i);
                f.motion_score = Some(0.0);
                f
            })
            .collect();
        let s = flicker_signal(&frames, &PadConfig::default());
        assert!(s.triggered);
        assert!(s.detail.contains("client"));
    }

    #[test]
    fn test_no_data_is_quiet() {
        let frames = vec![FrameRecord::new(0, 0, 0)];
        assert!(!flicker_signal(&frames, &PadConfig::default()).triggered);
    }
}
