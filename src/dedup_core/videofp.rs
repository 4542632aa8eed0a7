use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;
use wait_timeout::ChildExt;

use crate::dedup_core::imagehash::{self, hamming_distance};
use crate::dedup_core::options::DetectOptions;

/// Frame-sampling fingerprint for one video. A frame whose decode exceeded
/// the wall-clock ceiling is recorded as `None`; the signature is then
/// incomplete but still usable for comparison on the remaining frames.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSignature {
    pub file_id: Uuid,
    pub duration_sec: f64,
    pub width: u32,
    pub height: u32,
    pub frame_hashes: Vec<Option<u64>>,
    pub sample_times_sec: Vec<f64>,
    pub computed_at: OffsetDateTime,
}

impl VideoSignature {
    pub fn is_incomplete(&self) -> bool {
        self.frame_hashes.is_empty() || self.frame_hashes.iter().any(Option::is_none)
    }

    pub fn usable_frames(&self) -> usize {
        self.frame_hashes.iter().flatten().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoVerdict {
    Duplicate,
    Similar,
    Different,
    InsufficientData,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoComparisonOptions {
    pub per_frame_match_threshold: u32,
    pub duration_tolerance_seconds: f64,
    pub duration_tolerance_fraction: f64,
    pub max_mismatched_frames_for_duplicate: usize,
}

impl VideoComparisonOptions {
    pub fn from_options(options: &DetectOptions) -> Self {
        VideoComparisonOptions {
            per_frame_match_threshold: options.thresholds.video_frame_distance,
            duration_tolerance_seconds: options.thresholds.duration_tolerance_seconds,
            duration_tolerance_fraction: options.thresholds.duration_tolerance_pct,
            max_mismatched_frames_for_duplicate: options.limits.max_mismatched_frames_for_duplicate,
        }
    }
}

impl Default for VideoComparisonOptions {
    fn default() -> Self {
        VideoComparisonOptions::from_options(&DetectOptions::default())
    }
}

/// Sample points for a video of the given duration. Clips at or below the
/// short threshold get a single midpoint sample; longer clips sample the
/// start, midpoint, and `end_offset` before the end.
pub fn sample_times(duration: f64, short_threshold: f64, end_offset: f64) -> Vec<f64> {
    if duration <= short_threshold {
        vec![duration / 2.0]
    } else {
        vec![0.0, duration / 2.0, (duration - end_offset).max(0.0)]
    }
}

/// Frame hashes and their sample points, before a file id is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSamples {
    pub frame_hashes: Vec<Option<u64>>,
    pub sample_times_sec: Vec<f64>,
}

/// Decode frames at the sample points and hash their luminance with dHash.
pub fn sample_frames(path: &Path, duration_sec: f64, options: &DetectOptions) -> FrameSamples {
    let times = sample_times(
        duration_sec,
        options.limits.short_video_threshold_secs,
        options.limits.video_end_offset_secs,
    );
    let timeout = Duration::from_secs(options.limits.frame_decode_timeout_secs);
    let mut frame_hashes = Vec::with_capacity(times.len());
    for &t in &times {
        let hash = decode_frame_hash(path, t, options.limits.max_frame_dimension, timeout);
        if hash.is_none() {
            log::warn!(
                "frame decode at {:.2}s failed or timed out for {}",
                t,
                path.display()
            );
        }
        frame_hashes.push(hash);
    }
    FrameSamples {
        frame_hashes,
        sample_times_sec: times,
    }
}

/// Extract a single frame via ffmpeg, bounded to `max_dimension` on the
/// longest side, and dHash it. Returns `None` on decode failure or timeout.
fn decode_frame_hash(path: &Path, at_sec: f64, max_dimension: u32, timeout: Duration) -> Option<u64> {
    let frame_file = tempfile::Builder::new()
        .prefix("mediadedup-frame-")
        .suffix(".png")
        .tempfile()
        .ok()?;

    let seek = format!("{:.3}", at_sec);
    let scale = format!(
        "scale=w={0}:h={0}:force_original_aspect_ratio=decrease",
        max_dimension
    );
    let mut child = Command::new("ffmpeg")
        .args(["-v", "error", "-ss", seek.as_str(), "-i"])
        .arg(path)
        .args(["-frames:v", "1", "-vf", scale.as_str(), "-y"])
        .arg(frame_file.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    match child.wait_timeout(timeout).ok()? {
        Some(status) if status.success() => {}
        Some(_) => return None,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return None;
        }
    }

    let img = image::open(frame_file.path()).ok()?;
    Some(imagehash::dhash(&img))
}

/// Compare two fingerprints. Durations must agree within tolerance for any
/// positive verdict; frame positions missing on either side (timed out, or
/// beyond the shorter hash list) count as mismatched.
pub fn compare_signatures(
    a: &VideoSignature,
    b: &VideoSignature,
    options: &VideoComparisonOptions,
) -> VideoVerdict {
    if a.usable_frames() == 0 || b.usable_frames() == 0 {
        return VideoVerdict::InsufficientData;
    }

    let tolerance = options
        .duration_tolerance_seconds
        .max(options.duration_tolerance_fraction * a.duration_sec.min(b.duration_sec));
    if (a.duration_sec - b.duration_sec).abs() > tolerance {
        return VideoVerdict::Different;
    }

    let total = a.frame_hashes.len().max(b.frame_hashes.len());
    let mut matched = 0usize;
    let mut mismatched = 0usize;
    let mut usable_positions = 0usize;
    for i in 0..total {
        match (
            a.frame_hashes.get(i).copied().flatten(),
            b.frame_hashes.get(i).copied().flatten(),
        ) {
            (Some(ha), Some(hb)) => {
                usable_positions += 1;
                if hamming_distance(ha, hb) <= options.per_frame_match_threshold {
                    matched += 1;
                } else {
                    mismatched += 1;
                }
            }
            _ => mismatched += 1,
        }
    }

    if usable_positions == 0 {
        return VideoVerdict::InsufficientData;
    }
    if mismatched <= options.max_mismatched_frames_for_duplicate {
        VideoVerdict::Duplicate
    } else if matched >= 1 {
        VideoVerdict::Similar
    } else {
        VideoVerdict::Different
    }
}

/// Check if ffmpeg is available on the system.
pub fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(duration: f64, hashes: &[Option<u64>]) -> VideoSignature {
        VideoSignature {
            file_id: Uuid::new_v4(),
            duration_sec: duration,
            width: 1920,
            height: 1080,
            frame_hashes: hashes.to_vec(),
            sample_times_sec: hashes.iter().enumerate().map(|(i, _)| i as f64).collect(),
            computed_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_sample_times_short_clip() {
        assert_eq!(sample_times(1.5, 2.0, 1.0), vec![0.75]);
    }

    #[test]
    fn test_sample_times_threshold_boundary_takes_single_sample() {
        assert_eq!(sample_times(2.0, 2.0, 1.0), vec![1.0]);
    }

    #[test]
    fn test_sample_times_long_clip() {
        assert_eq!(sample_times(30.0, 2.0, 1.0), vec![0.0, 15.0, 29.0]);
    }

    #[test]
    fn test_near_duplicate_clips() {
        // 30.05s vs 29.98s with per-frame distances {2, 3, 4}.
        let a = signature(30.05, &[Some(0), Some(0), Some(0)]);
        let b = signature(
            29.98,
            &[Some(0b11), Some(0b111), Some(0b1111)],
        );
        assert_eq!(
            compare_signatures(&a, &b, &VideoComparisonOptions::default()),
            VideoVerdict::Duplicate
        );
    }

    #[test]
    fn test_duration_out_of_tolerance_is_different() {
        let a = signature(30.0, &[Some(0), Some(0), Some(0)]);
        let b = signature(40.0, &[Some(0), Some(0), Some(0)]);
        assert_eq!(
            compare_signatures(&a, &b, &VideoComparisonOptions::default()),
            VideoVerdict::Different
        );
    }

    #[test]
    fn test_one_bad_frame_still_duplicate() {
        let far = u64::MAX;
        let a = signature(30.0, &[Some(0), Some(0), Some(far)]);
        let b = signature(30.0, &[Some(0), Some(0), Some(0)]);
        assert_eq!(
            compare_signatures(&a, &b, &VideoComparisonOptions::default()),
            VideoVerdict::Duplicate
        );
    }

    #[test]
    fn test_partial_match_is_similar() {
        let far = u64::MAX;
        let a = signature(30.0, &[Some(0), Some(far), Some(far)]);
        let b = signature(30.0, &[Some(0), Some(0), Some(0)]);
        assert_eq!(
            compare_signatures(&a, &b, &VideoComparisonOptions::default()),
            VideoVerdict::Similar
        );
    }

    #[test]
    fn test_no_frames_is_insufficient() {
        let a = signature(30.0, &[None, None, None]);
        let b = signature(30.0, &[Some(0), Some(0), Some(0)]);
        assert_eq!(
            compare_signatures(&a, &b, &VideoComparisonOptions::default()),
            VideoVerdict::InsufficientData
        );
    }

    #[test]
    fn test_timed_out_frame_counts_as_mismatch() {
        let a = signature(30.0, &[Some(0), None, None]);
        let b = signature(30.0, &[Some(0), Some(0), Some(0)]);
        // Two unusable positions exceed the duplicate allowance but the
        // matching first frame keeps the pair similar.
        assert_eq!(
            compare_signatures(&a, &b, &VideoComparisonOptions::default()),
            VideoVerdict::Similar
        );
    }

    #[test]
    fn test_single_sample_vs_three_sample() {
        let a = signature(2.0, &[Some(0)]);
        let b = signature(2.2, &[Some(0), Some(0), Some(0)]);
        // Positions beyond the shorter list count as mismatched.
        assert_eq!(
            compare_signatures(&a, &b, &VideoComparisonOptions::default()),
            VideoVerdict::Similar
        );
    }

    #[test]
    fn test_incomplete_flag() {
        assert!(signature(10.0, &[Some(1), None]).is_incomplete());
        assert!(!signature(10.0, &[Some(1), Some(2)]).is_incomplete());
        assert!(signature(10.0, &[]).is_incomplete());
    }
}
