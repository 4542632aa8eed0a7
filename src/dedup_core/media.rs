use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

/// Media classes the pipeline distinguishes. Audio files are cataloged but
/// never grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaClass {
    Photo,
    Video,
    Audio,
}

impl MediaClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaClass::Photo => "photo",
            MediaClass::Video => "video",
            MediaClass::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> Option<MediaClass> {
        match s {
            "photo" => Some(MediaClass::Photo),
            "video" => Some(MediaClass::Video),
            "audio" => Some(MediaClass::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Photo extensions (lowercase, closed set) with their content types.
const PHOTO_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
    ("tiff", "image/tiff"),
    ("tif", "image/tiff"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("raw", "image/x-raw"),
    ("cr2", "image/x-canon-cr2"),
    ("cr3", "image/x-canon-cr3"),
    ("nef", "image/x-nikon-nef"),
    ("nrw", "image/x-nikon-nrw"),
    ("arw", "image/x-sony-arw"),
    ("dng", "image/x-adobe-dng"),
    ("orf", "image/x-olympus-orf"),
    ("pef", "image/x-pentax-pef"),
    ("rw2", "image/x-panasonic-rw2"),
    ("sr2", "image/x-sony-sr2"),
    ("x3f", "image/x-sigma-x3f"),
    ("erf", "image/x-epson-erf"),
    ("raf", "image/x-fuji-raf"),
    ("dcr", "image/x-kodak-dcr"),
    ("kdc", "image/x-kodak-kdc"),
    ("mrw", "image/x-minolta-mrw"),
    ("mos", "image/x-leaf-mos"),
    ("srw", "image/x-samsung-srw"),
    ("fff", "image/x-hasselblad-fff"),
    ("psd", "image/vnd.adobe.photoshop"),
    ("ai", "application/illustrator"),
    ("eps", "application/postscript"),
    ("svg", "image/svg+xml"),
];

/// Video extensions (lowercase, closed set) with their content types.
const VIDEO_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("wmv", "video/x-ms-wmv"),
    ("flv", "video/x-flv"),
    ("webm", "video/webm"),
    ("m4v", "video/x-m4v"),
    ("3gp", "video/3gpp"),
    ("mts", "video/mp2t"),
    ("m2ts", "video/mp2t"),
    ("ogv", "video/ogg"),
    ("prores", "video/x-prores"),
    ("dnxhd", "video/x-dnxhd"),
    ("xdcam", "video/x-xdcam"),
    ("xavc", "video/x-xavc"),
    ("r3d", "video/x-red-r3d"),
    ("ari", "video/x-arri-ari"),
    ("arri", "video/x-arri-ari"),
];

/// Audio extensions (lowercase, closed set) with their content types.
const AUDIO_TYPES: &[(&str, &str)] = &[
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("aac", "audio/aac"),
    ("m4a", "audio/mp4"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("oga", "audio/ogg"),
    ("opus", "audio/opus"),
    ("alac", "audio/alac"),
    ("ape", "audio/x-ape"),
    ("wv", "audio/x-wavpack"),
    ("tak", "audio/x-tak"),
    ("tta", "audio/x-tta"),
    ("aiff", "audio/aiff"),
    ("aif", "audio/aiff"),
    ("au", "audio/basic"),
    ("ra", "audio/x-realaudio"),
    ("rm", "audio/x-realaudio"),
    ("wma", "audio/x-ms-wma"),
    ("ac3", "audio/ac3"),
    ("dts", "audio/vnd.dts"),
    ("mpc", "audio/x-musepack"),
    ("spx", "audio/x-speex"),
    ("vorbis", "audio/vorbis"),
    ("amr", "audio/amr"),
    ("3ga", "audio/3ga"),
];

/// Extensions whose system registry entries are unreliable; the registry
/// lookup always yields these fixed types instead.
const TYPE_OVERRIDES: &[(&str, &str)] = &[
    ("webp", "image/webp"),
    ("mkv", "video/x-matroska"),
    ("flv", "video/x-flv"),
    ("dnxhd", "video/x-dnxhd"),
    ("xavc", "video/x-xavc"),
    ("r3d", "video/x-red-r3d"),
    ("ari", "video/x-arri-ari"),
];

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn lookup(table: &'static [(&'static str, &'static str)], ext: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// Detect a file's media class. Extension membership in the closed sets is
/// primary; a content-type probe is the fallback for unknown extensions.
pub fn detect_media_class(path: &Path) -> Option<MediaClass> {
    if let Some(ext) = lowercase_extension(path) {
        if lookup(PHOTO_TYPES, &ext).is_some() {
            return Some(MediaClass::Photo);
        }
        if lookup(VIDEO_TYPES, &ext).is_some() {
            return Some(MediaClass::Video);
        }
        if lookup(AUDIO_TYPES, &ext).is_some() {
            return Some(MediaClass::Audio);
        }
    }
    infer_content_type(path, None).and_then(|ct| class_for_content_type(&ct))
}

/// Map a content type onto a media class by hierarchy conformance.
pub fn class_for_content_type(content_type: &str) -> Option<MediaClass> {
    if content_type.starts_with("image/") {
        Some(MediaClass::Photo)
    } else if content_type.starts_with("video/") {
        Some(MediaClass::Video)
    } else if content_type.starts_with("audio/") {
        Some(MediaClass::Audio)
    } else {
        None
    }
}

/// A system-provided identifier that carries no real information.
fn is_generic_sentinel(hint: &str) -> bool {
    let tail = hint
        .rsplit(['/', '.'])
        .next()
        .unwrap_or(hint)
        .to_lowercase();
    matches!(tail.as_str(), "data" | "item" | "content" | "octet-stream")
}

/// Infer a content type for `path`. Cascading, first hit wins:
/// a system-provided hint (unless generic), the extension registry with its
/// override table, a magic-number scan of the first 16 bytes, and finally a
/// decoder probe.
pub fn infer_content_type(path: &Path, system_hint: Option<&str>) -> Option<String> {
    if let Some(hint) = system_hint {
        if !hint.is_empty() && !is_generic_sentinel(hint) {
            return Some(hint.to_string());
        }
    }

    if let Some(ext) = lowercase_extension(path) {
        if let Some(mime) = lookup(TYPE_OVERRIDES, &ext) {
            return Some(mime.to_string());
        }
        if let Some(mime) = lookup(PHOTO_TYPES, &ext)
            .or_else(|| lookup(VIDEO_TYPES, &ext))
            .or_else(|| lookup(AUDIO_TYPES, &ext))
        {
            return Some(mime.to_string());
        }
    }

    if let Some(mime) = sniff_magic_number(path) {
        return Some(mime.to_string());
    }

    probe_decoders(path)
}

/// Identify a content type from the first 16 bytes on disk.
fn sniff_magic_number(path: &Path) -> Option<&'static str> {
    let mut file = File::open(path).ok()?;
    let mut buf = [0u8; 16];
    let n = file.read(&mut buf).ok()?;
    sniff_magic_bytes(&buf[..n])
}

fn sniff_magic_bytes(buf: &[u8]) -> Option<&'static str> {
    if buf.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if buf.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return Some("image/png");
    }
    if buf.starts_with(&[0x47, 0x49, 0x46, 0x38]) {
        return Some("image/gif");
    }
    if buf.len() >= 12 && buf.starts_with(b"RIFF") && &buf[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if buf.starts_with(&[0x42, 0x4D]) {
        return Some("image/bmp");
    }
    if buf.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || buf.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
        return Some("image/tiff");
    }
    if buf.starts_with(&[0x00, 0x00, 0x01, 0xBA]) || buf.starts_with(&[0x00, 0x00, 0x01, 0xB3]) {
        return Some("video/mpeg");
    }
    if buf.starts_with(&[0x00, 0x00, 0x00, 0x18]) || buf.starts_with(&[0x00, 0x00, 0x00, 0x20]) {
        return Some("video/quicktime");
    }
    if buf.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/x-matroska");
    }
    if buf.starts_with(&[0x46, 0x4C, 0x56, 0x01]) {
        return Some("video/x-flv");
    }
    if buf.starts_with(&[0x4F, 0x67, 0x67, 0x53]) {
        return Some("audio/ogg");
    }
    if buf.starts_with(&[0xFF, 0xFB]) || buf.starts_with(&[0xFF, 0xF3]) || buf.starts_with(&[0xFF, 0xF2])
    {
        return Some("audio/mpeg");
    }
    None
}

/// Last-resort probe: try the image decoders, then stream inspection.
fn probe_decoders(path: &Path) -> Option<String> {
    if let Ok(reader) = image::ImageReader::open(path) {
        if let Ok(reader) = reader.with_guessed_format() {
            if let Some(format) = reader.format() {
                return Some(format.to_mime_type().to_string());
            }
        }
    }
    match probe_stream_kind(path) {
        Some("video") => Some("video/x-unknown".to_string()),
        Some("audio") => Some("audio/x-unknown".to_string()),
        _ => None,
    }
}

/// Use ffprobe to classify the first stream of a container.
fn probe_stream_kind(path: &Path) -> Option<&'static str> {
    let output = Command::new("ffprobe")
        .args([
            "-v", "error",
            "-show_entries", "stream=codec_type",
            "-of", "csv=p=0",
        ])
        .arg(path)
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut kinds = stdout.lines().map(str::trim);
    if kinds.clone().any(|k| k == "video") {
        Some("video")
    } else if kinds.any(|k| k == "audio") {
        Some("audio")
    } else {
        None
    }
}

/// Check if ffprobe is available on the system.
pub fn ffprobe_available() -> bool {
    Command::new("ffprobe")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detect_photo_extensions() {
        assert_eq!(detect_media_class(Path::new("a.jpg")), Some(MediaClass::Photo));
        assert_eq!(detect_media_class(Path::new("a.HEIC")), Some(MediaClass::Photo));
        assert_eq!(detect_media_class(Path::new("a.cr3")), Some(MediaClass::Photo));
        assert_eq!(detect_media_class(Path::new("a.DNG")), Some(MediaClass::Photo));
        assert_eq!(detect_media_class(Path::new("a.svg")), Some(MediaClass::Photo));
    }

    #[test]
    fn test_detect_video_and_audio_extensions() {
        assert_eq!(detect_media_class(Path::new("v.mp4")), Some(MediaClass::Video));
        assert_eq!(detect_media_class(Path::new("v.M2TS")), Some(MediaClass::Video));
        assert_eq!(detect_media_class(Path::new("v.r3d")), Some(MediaClass::Video));
        assert_eq!(detect_media_class(Path::new("s.mp3")), Some(MediaClass::Audio));
        assert_eq!(detect_media_class(Path::new("s.flac")), Some(MediaClass::Audio));
        assert_eq!(detect_media_class(Path::new("s.3ga")), Some(MediaClass::Audio));
    }

    #[test]
    fn test_generic_sentinels_ignored() {
        assert!(is_generic_sentinel("public.data"));
        assert!(is_generic_sentinel("public.item"));
        assert!(is_generic_sentinel("public.content"));
        assert!(is_generic_sentinel("application/octet-stream"));
        assert!(!is_generic_sentinel("image/jpeg"));
    }

    #[test]
    fn test_hint_wins_unless_generic() {
        let path = Path::new("whatever.bin");
        assert_eq!(
            infer_content_type(path, Some("image/heic")),
            Some("image/heic".to_string())
        );
        // Generic hint falls through, and the .bin extension matches nothing.
        let temp = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(infer_content_type(temp.path(), Some("public.data")), None);
    }

    #[test]
    fn test_override_table() {
        assert_eq!(
            infer_content_type(Path::new("clip.mkv"), None),
            Some("video/x-matroska".to_string())
        );
        assert_eq!(
            infer_content_type(Path::new("pic.webp"), None),
            Some("image/webp".to_string())
        );
    }

    #[test]
    fn test_magic_numbers() {
        assert_eq!(sniff_magic_bytes(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_magic_bytes(&[0x89, 0x50, 0x4E, 0x47, 0x0D]), Some("image/png"));
        assert_eq!(sniff_magic_bytes(b"GIF89a"), Some("image/gif"));
        assert_eq!(sniff_magic_bytes(&[0x42, 0x4D, 0x00]), Some("image/bmp"));
        assert_eq!(sniff_magic_bytes(&[0x49, 0x49, 0x2A, 0x00]), Some("image/tiff"));
        assert_eq!(sniff_magic_bytes(&[0x4D, 0x4D, 0x00, 0x2A]), Some("image/tiff"));
        assert_eq!(sniff_magic_bytes(b"RIFF\x00\x00\x00\x00WEBP"), Some("image/webp"));
        assert_eq!(sniff_magic_bytes(&[0x00, 0x00, 0x01, 0xBA]), Some("video/mpeg"));
        assert_eq!(sniff_magic_bytes(&[0x00, 0x00, 0x00, 0x18]), Some("video/quicktime"));
        assert_eq!(sniff_magic_bytes(&[0x1A, 0x45, 0xDF, 0xA3]), Some("video/x-matroska"));
        assert_eq!(sniff_magic_bytes(&[0x46, 0x4C, 0x56, 0x01]), Some("video/x-flv"));
        assert_eq!(sniff_magic_bytes(&[0xFF, 0xFB, 0x90]), Some("audio/mpeg"));
        assert_eq!(sniff_magic_bytes(&[0xFF, 0xF3, 0x90]), Some("audio/mpeg"));
        assert_eq!(sniff_magic_bytes(b"OggS"), Some("audio/ogg"));
        assert_eq!(sniff_magic_bytes(b"plain text"), None);
    }

    #[test]
    fn test_magic_sniff_on_extensionless_file() {
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]).unwrap();
        temp.flush().unwrap();
        assert_eq!(
            infer_content_type(temp.path(), None),
            Some("image/png".to_string())
        );
        assert_eq!(class_for_content_type("image/png"), Some(MediaClass::Photo));
    }
}
