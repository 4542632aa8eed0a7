use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use exiftool::ExifTool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::dedup_core::error::{DedupError, Result};
use crate::dedup_core::media::{self, MediaClass};

/// Date format used in EXIF data.
const EXIF_DATE_FORMAT: &[time::format_description::FormatItem] =
    time::macros::format_description!("[year]:[month]:[day] [hour]:[minute]:[second]");

/// Normalized metadata for one media file. This struct is the transaction
/// snapshot format: `to_snapshot_json`/`from_snapshot_json` must be lossless
/// for every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub media_class: MediaClass,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub capture_date: Option<OffsetDateTime>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_sec: Option<f64>,
    pub camera_model: Option<String>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub content_type: String,
}

impl MediaMetadata {
    pub fn to_snapshot_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_snapshot_json(json: &str) -> Result<MediaMetadata> {
        Ok(serde_json::from_str(json)?)
    }

    /// Fraction of {captureDate, GPS, camera, keywords-or-tags} present.
    pub fn completeness_score(&self) -> f64 {
        let mut present = 0u32;
        if self.capture_date.is_some() {
            present += 1;
        }
        if self.gps_lat.is_some() && self.gps_lon.is_some() {
            present += 1;
        }
        if self.camera_model.as_deref().is_some_and(|m| !m.is_empty()) {
            present += 1;
        }
        if !self.keywords.is_empty() || !self.tags.is_empty() {
            present += 1;
        }
        present as f64 / 4.0
    }

    /// Fill derived fields: captureDate falls back to createdAt then
    /// modifiedAt, GPS coordinates are rounded, keyword sets unique-sorted.
    pub fn normalize(&mut self) {
        if self.capture_date.is_none() {
            self.capture_date = self.created_at.or(self.modified_at);
        }
        self.gps_lat = self.gps_lat.map(round_gps);
        self.gps_lon = self.gps_lon.map(round_gps);
        normalize_terms(&mut self.keywords);
        normalize_terms(&mut self.tags);
    }
}

/// Round a coordinate to 6 decimal places.
pub fn round_gps(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn normalize_terms(terms: &mut Vec<String>) {
    terms.retain(|t| !t.trim().is_empty());
    for t in terms.iter_mut() {
        *t = t.trim().to_string();
    }
    terms.sort();
    terms.dedup();
}

/// Raw EXIF/IPTC fields from exiftool, using flexible Value types for
/// fields whose JSON shape varies across files.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase")]
struct RawExifInfo {
    #[serde(default)]
    date_time_original: String,
    #[serde(default)]
    create_date: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(rename = "GPSLatitude", default)]
    gps_latitude: Option<Value>, // Can be string "45 deg 30' 16.91\" N" or number
    #[serde(rename = "GPSLongitude", default)]
    gps_longitude: Option<Value>,
    #[serde(default)]
    keywords: Option<Value>, // Single string or array
    #[serde(default)]
    category: Option<Value>,
    #[serde(rename = "SupplementalCategories", default)]
    supplemental_categories: Option<Value>,
}

/// Reads filesystem attributes plus per-class container metadata and
/// produces a normalized `MediaMetadata`. Purely functional over the file;
/// never mutates anything on disk.
pub struct MetadataExtractor {
    exiftool: Option<ExifTool>,
}

impl MetadataExtractor {
    /// One extractor per worker; each holds its own exiftool process. When
    /// the binary is unavailable the extractor degrades to filesystem and
    /// container attributes only.
    pub fn new() -> Self {
        let exiftool = match ExifTool::new() {
            Ok(tool) => Some(tool),
            Err(e) => {
                log::warn!("exiftool unavailable, EXIF/IPTC extraction disabled: {}", e);
                None
            }
        };
        MetadataExtractor { exiftool }
    }

    pub fn extract(&mut self, path: &Path, class: MediaClass) -> Result<MediaMetadata> {
        let file_info = fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DedupError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => DedupError::AccessDenied(path.to_path_buf()),
            _ => DedupError::Io(e),
        })?;

        let mut meta = MediaMetadata {
            file_name: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            file_size: file_info.len(),
            media_class: class,
            created_at: file_info.created().ok().map(OffsetDateTime::from),
            modified_at: file_info.modified().ok().map(OffsetDateTime::from),
            capture_date: None,
            width: None,
            height: None,
            duration_sec: None,
            camera_model: None,
            gps_lat: None,
            gps_lon: None,
            keywords: Vec::new(),
            tags: Vec::new(),
            content_type: media::infer_content_type(path, None).unwrap_or_default(),
        };

        match class {
            MediaClass::Photo => self.extract_photo(path, &mut meta),
            MediaClass::Video => extract_container(path, &mut meta, true),
            MediaClass::Audio => extract_container(path, &mut meta, false),
        }

        meta.normalize();
        Ok(meta)
    }

    fn extract_photo(&mut self, path: &Path, meta: &mut MediaMetadata) {
        if let Ok((width, height)) = image::image_dimensions(path) {
            meta.width = Some(width);
            meta.height = Some(height);
        }

        let Some(exiftool) = self.exiftool.as_mut() else {
            return;
        };
        let raw: RawExifInfo = match exiftool.read_metadata(path, &[]) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("failed to read EXIF for {}: {}", path.display(), e);
                return;
            }
        };

        meta.capture_date = parse_exif_date(&raw.date_time_original)
            .or_else(|| parse_exif_date(&raw.create_date));
        meta.camera_model = raw.model.filter(|m| !m.trim().is_empty());
        meta.gps_lat = raw.gps_latitude.as_ref().and_then(value_to_f64);
        meta.gps_lon = raw.gps_longitude.as_ref().and_then(value_to_f64);
        meta.keywords = raw.keywords.as_ref().map(value_to_terms).unwrap_or_default();
        let mut tags: Vec<String> = Vec::new();
        if let Some(category) = raw.category.as_ref() {
            tags.extend(value_to_terms(category));
        }
        if let Some(supplemental) = raw.supplemental_categories.as_ref() {
            tags.extend(value_to_terms(supplemental));
        }
        meta.tags = tags;
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        MetadataExtractor::new()
    }
}

#[derive(Deserialize, Debug, Default)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize, Debug, Default)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Deserialize, Debug, Default)]
struct FfprobeSideData {
    rotation: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
struct FfprobeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// Container metadata for videos and audio, via ffprobe.
fn extract_container(path: &Path, meta: &mut MediaMetadata, want_video_stream: bool) {
    let Some(probe) = run_ffprobe(path) else {
        return;
    };

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            probe
                .streams
                .iter()
                .find_map(|s| s.duration.as_deref().and_then(|d| d.parse::<f64>().ok()))
        });
    // Only finite positive durations count.
    meta.duration_sec = duration.filter(|d| d.is_finite() && *d > 0.0);

    if want_video_stream {
        if let Some(stream) = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
        {
            let rotation = stream
                .side_data_list
                .iter()
                .find_map(|sd| sd.rotation)
                .map(|r| r.abs() as u32 % 360)
                .unwrap_or(0);
            let (mut width, mut height) = (stream.width, stream.height);
            if rotation == 90 || rotation == 270 {
                std::mem::swap(&mut width, &mut height);
            }
            meta.width = width;
            meta.height = height;
        }
    }

    let tags = probe.format.map(|f| f.tags).unwrap_or_default();
    for (key, value) in &tags {
        match key.to_lowercase().as_str() {
            "keywords" | "keyword" => meta
                .keywords
                .extend(value.split(',').map(|k| k.trim().to_string())),
            "subject" | "category" | "genre" => meta.tags.push(value.trim().to_string()),
            "title" | "artist" | "album" if meta.media_class == MediaClass::Audio => {
                meta.tags.push(value.trim().to_string())
            }
            "creation_time" => {
                if meta.capture_date.is_none() {
                    meta.capture_date = OffsetDateTime::parse(value, &Rfc3339).ok();
                }
            }
            _ => {}
        }
    }
}

fn run_ffprobe(path: &Path) -> Option<FfprobeOutput> {
    let output = Command::new("ffprobe")
        .args([
            "-v", "error",
            "-print_format", "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()
        .ok()?;
    if !output.status.success() {
        log::warn!("ffprobe failed for {}", path.display());
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

/// Check if the exiftool binary is available on the system.
pub fn exiftool_available() -> bool {
    Command::new("exiftool")
        .arg("-ver")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Parse an EXIF date string (`YYYY:MM:DD HH:MM:SS`, UTC) with an ISO-8601
/// fallback.
fn parse_exif_date(date_str: &str) -> Option<OffsetDateTime> {
    if date_str.is_empty() {
        return None;
    }
    PrimitiveDateTime::parse(date_str, EXIF_DATE_FORMAT)
        .map(|dt| dt.assume_utc())
        .or_else(|_| OffsetDateTime::parse(date_str, &Rfc3339))
        .ok()
}

/// Extract f64 from a Value (handles both string and number forms).
fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            if let Some(degrees) = parse_gps_string(s) {
                return Some(degrees);
            }
            s.trim().parse().ok()
        }
        _ => None,
    }
}

/// Parse a GPS string like "45 deg 30' 16.91\" N" to signed decimal degrees.
fn parse_gps_string(s: &str) -> Option<f64> {
    if s.trim().is_empty() {
        return None;
    }

    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    let degrees: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[2].trim_end_matches('\'').parse().ok()?;
    let seconds: f64 = parts[3]
        .trim_end_matches('"')
        .trim_end_matches('\'')
        .parse()
        .ok()?;
    let direction = parts.get(4).and_then(|s| s.chars().next());

    let mut result = degrees + (minutes / 60.0) + (seconds / 3600.0);

    // South and West are negative
    if direction == Some('S') || direction == Some('W') {
        result = -result;
    }

    Some(result)
}

/// A keyword field may arrive as a single string or an array of strings.
fn value_to_terms(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.trim().to_string()],
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str().map(|s| s.trim().to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_metadata() -> MediaMetadata {
        MediaMetadata {
            file_name: "IMG_0001.jpg".to_string(),
            file_size: 1024,
            media_class: MediaClass::Photo,
            created_at: None,
            modified_at: None,
            capture_date: None,
            width: Some(4000),
            height: Some(3000),
            duration_sec: None,
            camera_model: None,
            gps_lat: None,
            gps_lon: None,
            keywords: Vec::new(),
            tags: Vec::new(),
            content_type: "image/jpeg".to_string(),
        }
    }

    #[test]
    fn test_parse_exif_date() {
        let dt = parse_exif_date("2024:05:21 12:30:00").unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month() as u8, 5);
        assert_eq!(dt.day(), 21);
        assert_eq!(dt.offset().whole_seconds(), 0);
    }

    #[test]
    fn test_parse_exif_date_iso_fallback() {
        let dt = parse_exif_date("2024-12-25T08:00:00Z").unwrap();
        assert_eq!(dt.month() as u8, 12);
        assert!(parse_exif_date("").is_none());
        assert!(parse_exif_date("not a date").is_none());
    }

    #[test]
    fn test_parse_gps_string() {
        let lat = parse_gps_string("45 deg 30' 16.91\" N").unwrap();
        assert!((lat - 45.50469722).abs() < 0.0001);

        let lon = parse_gps_string("122 deg 40' 30.12\" W").unwrap();
        assert!(lon < 0.0);
        assert!((lon - (-122.675033)).abs() < 0.0001);

        assert!(parse_gps_string("").is_none());
        assert!(parse_gps_string("   ").is_none());
    }

    #[test]
    fn test_value_to_f64() {
        assert_eq!(value_to_f64(&json!(45.5)), Some(45.5));
        assert_eq!(value_to_f64(&json!("123.45")), Some(123.45));
        let gps = value_to_f64(&json!("45 deg 30' 16.91\" N")).unwrap();
        assert!((gps - 45.50469722).abs() < 0.0001);
    }

    #[test]
    fn test_round_gps() {
        assert_eq!(round_gps(12.345678444), 12.345678);
        assert_eq!(round_gps(-98.76543299), -98.765433);
        assert_eq!(round_gps(12.3456789), 12.345679);
    }

    #[test]
    fn test_capture_date_fallback_chain() {
        let created = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let modified = OffsetDateTime::from_unix_timestamp(1_700_100_000).unwrap();

        let mut meta = base_metadata();
        meta.created_at = Some(created);
        meta.modified_at = Some(modified);
        meta.normalize();
        assert_eq!(meta.capture_date, Some(created));

        let mut meta = base_metadata();
        meta.modified_at = Some(modified);
        meta.normalize();
        assert_eq!(meta.capture_date, Some(modified));

        // Pre-set capture dates are never overwritten.
        let capture = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();
        let mut meta = base_metadata();
        meta.created_at = Some(created);
        meta.capture_date = Some(capture);
        meta.normalize();
        assert_eq!(meta.capture_date, Some(capture));
    }

    #[test]
    fn test_normalize_rounds_and_sorts() {
        let mut meta = base_metadata();
        meta.gps_lat = Some(12.34567844444);
        meta.gps_lon = Some(-98.76543255555);
        meta.keywords = vec![
            "zebra".to_string(),
            "  alpha ".to_string(),
            "zebra".to_string(),
            "".to_string(),
        ];
        meta.normalize();
        assert_eq!(meta.gps_lat, Some(12.345678));
        assert_eq!(meta.gps_lon, Some(-98.765433));
        assert_eq!(meta.keywords, vec!["alpha", "zebra"]);
    }

    #[test]
    fn test_value_to_terms() {
        assert_eq!(value_to_terms(&json!("travel")), vec!["travel"]);
        assert_eq!(
            value_to_terms(&json!(["a", "b"])),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(value_to_terms(&json!(42)).is_empty());
    }

    #[test]
    fn test_completeness_score() {
        let mut meta = base_metadata();
        assert_eq!(meta.completeness_score(), 0.0);
        meta.capture_date = Some(OffsetDateTime::now_utc());
        meta.camera_model = Some("NIKON Z 6".to_string());
        assert_eq!(meta.completeness_score(), 0.5);
        meta.gps_lat = Some(1.0);
        meta.gps_lon = Some(2.0);
        meta.tags = vec!["travel".to_string()];
        assert_eq!(meta.completeness_score(), 1.0);
    }

    #[test]
    fn test_snapshot_roundtrip_is_lossless() {
        let mut meta = base_metadata();
        meta.created_at = Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap());
        meta.capture_date = Some(OffsetDateTime::from_unix_timestamp(1_690_000_000).unwrap());
        meta.duration_sec = Some(12.5);
        meta.camera_model = Some("Canon EOS R5".to_string());
        meta.gps_lat = Some(12.345678);
        meta.gps_lon = Some(-98.765432);
        meta.keywords = vec!["holiday".to_string()];
        meta.tags = vec!["family".to_string()];

        let json = meta.to_snapshot_json().unwrap();
        let back = MediaMetadata::from_snapshot_json(&json).unwrap();
        assert_eq!(meta, back);
        // And the snapshot of the snapshot is bit-identical.
        assert_eq!(json, back.to_snapshot_json().unwrap());
    }

    #[test]
    fn test_extract_without_exiftool_still_sets_capture_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        let img = image::ImageBuffer::from_pixel(40, 30, image::Luma([128u8]));
        img.save(&path).unwrap();

        let mut extractor = MetadataExtractor::new();
        let meta = extractor.extract(&path, MediaClass::Photo).unwrap();
        assert_eq!(meta.width, Some(40));
        assert_eq!(meta.height, Some(30));
        assert_eq!(meta.media_class, MediaClass::Photo);
        // Filesystem timestamps always exist, so normalization fills this.
        assert!(meta.capture_date.is_some());
        assert_eq!(meta.content_type, "image/png");
    }

    #[test]
    fn test_extract_missing_file_is_not_found() {
        let mut extractor = MetadataExtractor::new();
        let err = extractor
            .extract(Path::new("/nonexistent/file.jpg"), MediaClass::Photo)
            .unwrap_err();
        assert!(matches!(err, DedupError::NotFound(_)));
    }
}
