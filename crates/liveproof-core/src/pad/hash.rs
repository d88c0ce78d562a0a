//! Perceptual hashing and the duplicate/loop heuristic.

use std::collections::VecDeque;

use image::{imageops::FilterType, DynamicImage};

use super::{PadConfig, PadKind, PadSignal};
use crate::types::{FrameRecord, GrayGrid};

const HASH_SIDE: u32 = 8;

/// 64-bit average hash: 8x8 grayscale, one bit per pixel at or above the mean,
/// row-major with the first pixel in the most significant bit.
pub fn average_hash(image: &DynamicImage) -> u64 {
    let small = image
        .resize_exact(HASH_SIDE, HASH_SIDE, FilterType::Triangle)
        .to_luma8();
    let sum: u32 = small.pixels().map(|p| p[0] as u32).sum();
    let mean = sum / (HASH_SIDE * HASH_SIDE);
    small
        .pixels()
        .fold(0u64, |acc, p| (acc << 1) | u64::from(p[0] as u32 >= mean))
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Parse a client-reported hash (16 hex characters).
pub fn parse_hex_hash(s: &str) -> Option<u64> {
    if s.len() != 16 {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Downsample to a `size` x `size` grayscale grid.
pub fn gray_grid(image: &DynamicImage, size: u32) -> GrayGrid {
    let size = size.max(1);
    let gray = image.resize_exact(size, size, FilterType::Triangle).to_luma8();
    GrayGrid {
        size,
        pixels: gray.into_raw(),
    }
}

pub(super) fn duplicate_signal(frames: &[FrameRecord], cfg: &PadConfig) -> PadSignal {
    let weight = cfg.duplicate_weight;
    let window = cfg.max_recent_hashes.max(1);
    let mut recent: VecDeque<u64> = VecDeque::with_capacity(window);
    let mut hashed = 0usize;
    let mut duplicates = 0usize;

    for h in frames.iter().filter_map(FrameRecord::effective_hash) {
        hashed += 1;
        if recent
            .iter()
            .any(|&prev| hamming(prev, h) <= cfg.duplicate_hamming_threshold)
        {
            duplicates += 1;
        }
        recent.push_back(h);
        if recent.len() > window {
            recent.pop_front();
        }
    }

    if hashed < 2 {
        return PadSignal::quiet(PadKind::DuplicateHash, weight, "not enough hashed frames");
    }
    if duplicates == 0 {
        return PadSignal::quiet(PadKind::DuplicateHash, weight, format!("{hashed} distinct hashes"));
    }
    PadSignal {
        kind: PadKind::DuplicateHash,
        score: duplicates as f32 / hashed as f32,
        weight,
        triggered: true,
        detail: format!("{duplicates} of {hashed} frames repeat a recent hash"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn hashed(id: u64, h: u64) -> FrameRecord {
        let mut f = FrameRecord::new(id, id, id);
        f.server_hash = Some(h);
        f
    }

    fn split_image(left_dark: bool) -> DynamicImage {
        let img = GrayImage::from_fn(64, 64, |x, _| {
            let dark = (x < 32) == left_dark;
            Luma([if dark { 10 } else { 240 }])
        });
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn test_average_hash_is_deterministic_and_discriminative() {
        let a = average_hash(&split_image(true));
        let b = average_hash(&split_image(false));
        assert_eq!(a, average_hash(&split_image(true)));
        assert_eq!(hamming(a, b), 64);
    }

    #[test]
    fn test_parse_hex_hash() {
        assert_eq!(parse_hex_hash("00000000000000ff"), Some(255));
        assert_eq!(parse_hex_hash("ff"), None);
        assert_eq!(parse_hex_hash("zzzzzzzzzzzzzzzz"), None);
    }

    #[test]
    fn test_gray_grid_size() {
        let g = gray_grid(&split_image(true), 32);
        assert_eq!(g.size, 32);
        assert_eq!(g.pixels.len(), 32 * 32);
    }

    #[test]
    fn test_identical_hashes_trigger() {
        let frames: Vec<_> = (0..10).map(|i| hashed(i, 0xabcd_ef01_2345_6789)).collect();
        let s = duplicate_signal(&frames, &PadConfig::default());
        assert!(s.triggered);
        assert!((s.score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_maximally_different_hashes_do_not_trigger() {
        // Each hash sets a different byte, so every pair differs in 16 bits.
        let frames: Vec<_> = (0..8u64).map(|i| hashed(i, 0xff << (i * 8))).collect();
        let s = duplicate_signal(&frames, &PadConfig::default());
        assert!(!s.triggered, "{}", s.detail);
        assert_eq!(s.score, 0.0);
    }

    #[test]
    fn test_client_hash_used_as_fallback() {
        let mut a = FrameRecord::new(1, 1, 1);
        a.client_hash = Some(42);
        let mut b = FrameRecord::new(2, 2, 2);
        b.client_hash = Some(42);
        assert!(duplicate_signal(&[a, b], &PadConfig::default()).triggered);
    }
}
