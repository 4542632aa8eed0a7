use std::path::Path;

use image::DynamicImage;
use image::imageops::FilterType;
use rustdct::DctPlanner;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dedup_core::error::{DedupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    DHash,
    PHash,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::DHash => "dhash",
            HashAlgorithm::PHash => "phash",
        }
    }

    pub fn parse(s: &str) -> Option<HashAlgorithm> {
        match s {
            "dhash" => Some(HashAlgorithm::DHash),
            "phash" => Some(HashAlgorithm::PHash),
            _ => None,
        }
    }
}

/// One perceptual hash row. At most one per (file, algorithm); recomputed
/// only when the file's mtime or size changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSignature {
    pub file_id: Uuid,
    pub algorithm: HashAlgorithm,
    pub hash: u64,
    pub width: u32,
    pub height: u32,
    pub computed_at: OffsetDateTime,
}

/// Number of differing bits between two 64-bit hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Hashes computed for a single decoded image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashOutcome {
    pub width: u32,
    pub height: u32,
    pub dhash: u64,
    pub phash: Option<u64>,
}

/// Decode an image and compute its perceptual hashes. Returns `None` when
/// the shorter side is below `min_dimension`.
pub fn hash_image_file(
    path: &Path,
    min_dimension: u32,
    with_phash: bool,
) -> Result<Option<HashOutcome>> {
    let img = image::open(path).map_err(|e| {
        log::debug!("image decode failed for {}: {}", path.display(), e);
        DedupError::DecodeFailure {
            path: path.to_path_buf(),
            stage: "image-decode",
        }
    })?;
    Ok(hash_image(&img, min_dimension, with_phash))
}

pub fn hash_image(img: &DynamicImage, min_dimension: u32, with_phash: bool) -> Option<HashOutcome> {
    let (width, height) = (img.width(), img.height());
    if width.min(height) < min_dimension {
        return None;
    }
    Some(HashOutcome {
        width,
        height,
        dhash: dhash(img),
        phash: with_phash.then(|| phash(img)),
    })
}

/// Difference hash: 9x8 luminance grid, bit `row*8 + col` set iff the pixel
/// at (row, col) is brighter than its right neighbor.
pub fn dhash(img: &DynamicImage) -> u64 {
    let grid = img.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut hash = 0u64;
    for row in 0..8u32 {
        for col in 0..8u32 {
            let left = grid.get_pixel(col, row)[0];
            let right = grid.get_pixel(col + 1, row)[0];
            if left > right {
                hash |= 1 << (row * 8 + col);
            }
        }
    }
    hash
}

/// Perceptual hash: 32x32 luminance, 2-D DCT-II, threshold the top-left 8x8
/// coefficient block (excluding the DC term) at its median. Bit 0 is the DC
/// slot and stays clear.
pub fn phash(img: &DynamicImage) -> u64 {
    let gray = img.resize_exact(32, 32, FilterType::Triangle).to_luma8();
    let mut values: Vec<f32> = gray.pixels().map(|p| p[0] as f32).collect();
    let mut scratch = vec![0.0f32; 32 * 32];

    let dct = DctPlanner::new().plan_dct2(32);
    for row in values.chunks_exact_mut(32) {
        dct.process_dct2(row);
    }
    transpose::transpose(&values, &mut scratch, 32, 32);
    for row in scratch.chunks_exact_mut(32) {
        dct.process_dct2(row);
    }
    transpose::transpose(&scratch, &mut values, 32, 32);

    let mut coefficients = Vec::with_capacity(63);
    for row in 0..8usize {
        for col in 0..8usize {
            if row == 0 && col == 0 {
                continue;
            }
            coefficients.push(values[row * 32 + col]);
        }
    }
    let mut sorted = coefficients.clone();
    sorted.sort_by(f32::total_cmp);
    let median = sorted[sorted.len() / 2];

    let mut hash = 0u64;
    for (i, coefficient) in coefficients.iter().enumerate() {
        if *coefficient > median {
            hash |= 1 << (i + 1);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    /// 18x16 image whose luminance strictly decreases left to right in 2x2
    /// blocks, so every dhash comparison fires.
    fn descending_gradient() -> DynamicImage {
        let img = ImageBuffer::from_fn(18, 16, |x, _y| {
            let band = x / 2;
            Luma([(255 - band * 24) as u8])
        });
        DynamicImage::ImageLuma8(img)
    }

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_pixel(width, height, Luma([value])))
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(u64::MAX, 0), 64);
        assert_eq!(hamming_distance(0b1011, 0b0010), 2);
    }

    #[test]
    fn test_dhash_descending_gradient_sets_all_bits() {
        assert_eq!(dhash(&descending_gradient()), u64::MAX);
    }

    #[test]
    fn test_dhash_uniform_image_is_zero() {
        assert_eq!(dhash(&solid(64, 64, 128)), 0);
    }

    #[test]
    fn test_dhash_is_scale_invariant_for_simple_content() {
        let small = descending_gradient();
        let large = small.resize_exact(180, 160, FilterType::Triangle);
        assert_eq!(dhash(&small), dhash(&large));
    }

    #[test]
    fn test_minimum_dimension_boundary() {
        // 31 on the shorter side must skip, 32 must hash.
        assert!(hash_image(&solid(31, 40, 10), 32, false).is_none());
        let outcome = hash_image(&solid(32, 40, 10), 32, false).unwrap();
        assert_eq!(outcome.width, 32);
        assert_eq!(outcome.dhash, 0);
        assert!(outcome.phash.is_none());
    }

    #[test]
    fn test_phash_opt_in() {
        let outcome = hash_image(&descending_gradient(), 16, true).unwrap();
        assert!(outcome.phash.is_some());
    }

    #[test]
    fn test_phash_deterministic_with_clear_dc_slot() {
        let img = descending_gradient();
        assert_eq!(phash(&img), phash(&img));
        // DC slot never contributes.
        assert_eq!(phash(&img) & 1, 0);
        assert_eq!(phash(&solid(64, 64, 200)) & 1, 0);
    }

    #[test]
    fn test_phash_distinguishes_structure() {
        let gradient = phash(&descending_gradient());
        // 16px blocks keep the checkerboard's energy inside the low
        // frequency window the hash samples.
        let checker = ImageBuffer::from_fn(64, 64, |x, y| {
            Luma([if (x / 16 + y / 16) % 2 == 0 { 255u8 } else { 0 }])
        });
        let checker = phash(&DynamicImage::ImageLuma8(checker));
        assert!(hamming_distance(gradient, checker) > 5);
    }
}
