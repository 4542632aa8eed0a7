use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dedup_core::error::{DedupError, Result};

/// All knobs recognized by the detection pipeline. Loaded from a JSON file
/// or built from CLI flags; every section falls back to its defaults when
/// absent, unknown keys are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DetectOptions {
    pub thresholds: Thresholds,
    pub limits: Limits,
    pub policies: Policies,
    pub weights: Weights,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    /// Hamming cutoff for the image duplicate signal.
    pub image_distance: u32,
    /// Hamming cutoff for the image near-duplicate signal.
    pub image_near_distance: u32,
    /// Per-frame Hamming cutoff for video frame matches.
    pub video_frame_distance: u32,
    /// Video duration tolerance as a fraction of the shorter duration.
    pub duration_tolerance_pct: f64,
    /// Absolute video duration tolerance floor, in seconds.
    pub duration_tolerance_seconds: f64,
    /// Minimum aggregate score for a `duplicate` verdict.
    pub confidence_duplicate: f64,
    /// Minimum aggregate score for a `similar` verdict (the union cutoff).
    pub confidence_similar: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            image_distance: 0,
            image_near_distance: 5,
            video_frame_distance: 5,
            duration_tolerance_pct: 0.05,
            duration_tolerance_seconds: 0.5,
            confidence_duplicate: 0.9,
            confidence_similar: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Groups over this size are still emitted but marked incomplete.
    pub max_group_size: usize,
    /// Images with a shorter side below this are never hashed.
    pub min_image_dimension: u32,
    /// Videos shorter than this sample a single frame at the midpoint.
    pub short_video_threshold_secs: f64,
    /// Distance from the end for the last video sample point.
    pub video_end_offset_secs: f64,
    /// Longest side for decoded video frames.
    pub max_frame_dimension: u32,
    /// Frames mismatched beyond this many still count as `duplicate`.
    pub max_mismatched_frames_for_duplicate: usize,
    /// Wall-clock ceiling for a single frame decode, in seconds.
    pub frame_decode_timeout_secs: u64,
    /// Upper bound on extraction workers; clamped to the core count.
    pub max_workers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_group_size: 100,
            min_image_dimension: 32,
            short_video_threshold_secs: 2.0,
            video_end_offset_secs: 1.0,
            max_frame_dimension: 720,
            max_mismatched_frames_for_duplicate: 1,
            frame_decode_timeout_secs: 5,
            max_workers: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Policies {
    /// Skip files whose (path, size, mtime) are unchanged since a prior scan.
    pub incremental: bool,
    pub incremental_lookback_hours: u64,
    pub follow_symlinks: bool,
    /// Move losers to the trash staging area instead of deleting permanently.
    pub move_to_trash: bool,
    /// Enforce the temp-copy-then-rename sequence for keeper writes.
    pub atomic_writes: bool,
    /// Block merges without an explicit go from the caller.
    pub require_confirmation: bool,
    /// Also compute pHash signatures (dHash is always computed).
    pub enable_phash: bool,
    /// Days a committed merge stays undoable.
    pub retention_days: u64,
    /// How many committed transactions back undo may reach.
    pub undo_depth: usize,
}

impl Default for Policies {
    fn default() -> Self {
        Policies {
            incremental: false,
            incremental_lookback_hours: 24,
            follow_symlinks: false,
            move_to_trash: true,
            atomic_writes: true,
            require_confirmation: true,
            enable_phash: false,
            retention_days: 30,
            undo_depth: 10,
        }
    }
}

/// Per-signal weight overrides. Signals add, penalties subtract; a pair is
/// unioned when the net score reaches `thresholds.confidence_similar`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Weights {
    pub exact_bytes: f64,
    pub dhash_duplicate: f64,
    pub dhash_near: f64,
    pub video_duplicate: f64,
    pub video_similar: f64,
    pub dimensions: f64,
    pub duration: f64,
    pub capture_time: f64,
    pub filename: f64,
    pub penalty_aspect_ratio: f64,
    pub penalty_size_delta: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Weights {
            exact_bytes: 1.0,
            dhash_duplicate: 0.9,
            dhash_near: 0.7,
            video_duplicate: 0.9,
            video_similar: 0.6,
            dimensions: 0.15,
            duration: 0.2,
            capture_time: 0.25,
            filename: 0.15,
            penalty_aspect_ratio: 0.5,
            penalty_size_delta: 0.15,
        }
    }
}

impl DetectOptions {
    /// Load options from a JSON file. Missing sections keep their defaults;
    /// unrecognized keys are an error so typos don't silently no-op.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let options: DetectOptions = serde_json::from_str(&raw)
            .map_err(|e| DedupError::Argument(format!("bad config {}: {}", path.display(), e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.thresholds.confidence_similar)
            || !(0.0..=1.0).contains(&self.thresholds.confidence_duplicate)
        {
            return Err(DedupError::Argument(
                "confidence thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.thresholds.image_near_distance < self.thresholds.image_distance {
            return Err(DedupError::Argument(
                "image_near_distance must be >= image_distance".to_string(),
            ));
        }
        if self.limits.max_group_size < 2 {
            return Err(DedupError::Argument(
                "max_group_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let options = DetectOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.thresholds.image_distance, 0);
        assert_eq!(options.thresholds.image_near_distance, 5);
        assert_eq!(options.limits.min_image_dimension, 32);
        assert!(options.policies.move_to_trash);
        assert!(!options.policies.enable_phash);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let json = r#"{"thresholds": {"image_near_distance": 8}, "policies": {"incremental": true}}"#;
        let options: DetectOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.thresholds.image_near_distance, 8);
        assert_eq!(options.thresholds.video_frame_distance, 5);
        assert!(options.policies.incremental);
        assert!(options.policies.atomic_writes);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let json = r#"{"thresholds": {"imge_distance": 3}}"#;
        assert!(serde_json::from_str::<DetectOptions>(json).is_err());
    }

    #[test]
    fn test_bad_confidence_rejected() {
        let mut options = DetectOptions::default();
        options.thresholds.confidence_similar = 1.5;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_roundtrip() {
        let options = DetectOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: DetectOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(options, back);
    }
}
