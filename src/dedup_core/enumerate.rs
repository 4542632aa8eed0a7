use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use globset::{Glob, GlobMatcher};
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::dedup_core::error::{DedupError, Result};
use crate::dedup_core::events::PipelineEvent;
use crate::dedup_core::index::ScanStamp;
use crate::dedup_core::media::{self, MediaClass};
use crate::dedup_core::options::DetectOptions;
use crate::dedup_core::pipeline::CancelToken;

/// Name of the per-root trash staging directory; always excluded.
pub const TRASH_DIR_NAME: &str = ".mediadedup-trash";

/// Directory extensions treated as opaque package bundles.
const BUNDLE_EXTENSIONS: &[&str] = &["app", "framework", "bundle"];

/// Substrings identifying cloud-sync roots.
const CLOUD_SYNC_MARKERS: &[&str] = &["icloud", "dropbox", "google drive", "onedrive", "box"];

/// Substrings identifying managed photo libraries which this tool refuses
/// to enumerate.
const MANAGED_LIBRARY_MARKERS: &[&str] = &[
    "photos library.photoslibrary",
    ".lightroom",
    ".aperture",
    ".iphoto",
];

/// A file surfaced by enumeration, before extraction.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub class: MediaClass,
    pub size: u64,
    pub mtime: Option<OffsetDateTime>,
    pub ctime: Option<OffsetDateTime>,
    pub inode: Option<u64>,
}

/// One composable exclusion rule; rules are evaluated in order, first
/// match wins.
#[derive(Debug, Clone)]
pub enum ExclusionRule {
    PathPrefix(PathBuf),
    PathSuffix(String),
    PathContains(String),
    Glob(GlobMatcher),
    HiddenFiles,
    PackageBundles,
    CloudSyncRoots,
}

impl ExclusionRule {
    pub fn glob(pattern: &str) -> Result<ExclusionRule> {
        let matcher = Glob::new(pattern)
            .map_err(|e| DedupError::Argument(format!("bad exclude glob {pattern}: {e}")))?
            .compile_matcher();
        Ok(ExclusionRule::Glob(matcher))
    }

    /// The reason string when this rule excludes `path`, else `None`.
    fn matches(&self, path: &Path) -> Option<String> {
        let lower = path.to_string_lossy().to_lowercase();
        match self {
            ExclusionRule::PathPrefix(prefix) => path
                .starts_with(prefix)
                .then(|| format!("excluded prefix {}", prefix.display())),
            ExclusionRule::PathSuffix(suffix) => lower
                .ends_with(&suffix.to_lowercase())
                .then(|| format!("excluded suffix {suffix}")),
            ExclusionRule::PathContains(needle) => lower
                .contains(&needle.to_lowercase())
                .then(|| format!("excluded substring {needle}")),
            ExclusionRule::Glob(matcher) => matcher
                .is_match(path)
                .then(|| format!("excluded glob {}", matcher.glob())),
            ExclusionRule::HiddenFiles => {
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                hidden.then(|| "hidden file".to_string())
            }
            ExclusionRule::PackageBundles => is_bundle(path).then(|| "package bundle".to_string()),
            ExclusionRule::CloudSyncRoots => CLOUD_SYNC_MARKERS
                .iter()
                .find(|marker| lower.contains(*marker))
                .map(|marker| format!("cloud sync root ({marker})")),
        }
    }
}

/// Ordered rule list. The default set skips hidden files, package bundles,
/// and cloud-sync roots; callers prepend their own rules.
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    rules: Vec<ExclusionRule>,
}

impl Default for ExclusionRules {
    fn default() -> Self {
        ExclusionRules {
            rules: vec![
                ExclusionRule::HiddenFiles,
                ExclusionRule::PackageBundles,
                ExclusionRule::CloudSyncRoots,
            ],
        }
    }
}

impl ExclusionRules {
    pub fn new(rules: Vec<ExclusionRule>) -> Self {
        ExclusionRules { rules }
    }

    pub fn with_rule(mut self, rule: ExclusionRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn exclusion_reason(&self, path: &Path) -> Option<String> {
        self.rules.iter().find_map(|rule| rule.matches(path))
    }
}

fn is_bundle(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BUNDLE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn managed_library_marker(path: &Path) -> Option<&'static str> {
    let lower = path.to_string_lossy().to_lowercase();
    MANAGED_LIBRARY_MARKERS
        .iter()
        .find(|marker| lower.contains(*marker))
        .copied()
}

/// Prior-scan state for incremental mode; a value copy of the index scan
/// stamps so the walk never touches the store.
#[derive(Debug)]
pub struct IncrementalFilter {
    stamps: HashMap<PathBuf, ScanStamp>,
    cutoff: OffsetDateTime,
}

impl IncrementalFilter {
    pub fn new(stamps: HashMap<PathBuf, ScanStamp>, cutoff: OffsetDateTime) -> Self {
        IncrementalFilter { stamps, cutoff }
    }

    fn should_skip(&self, path: &Path, mtime: Option<OffsetDateTime>, size: u64) -> bool {
        self.stamps
            .get(path)
            .is_some_and(|stamp| stamp.allows_skip(mtime, size, self.cutoff))
    }
}

/// Per-root walk totals.
#[derive(Debug, Default, Clone)]
pub struct EnumerationSummary {
    pub emitted: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Walks one authorized root and emits candidate files. Single producer:
/// one walk per root, candidates flow into a bounded channel so a slow
/// consumer throttles the walk.
pub struct Enumerator<'a> {
    options: &'a DetectOptions,
    rules: ExclusionRules,
    incremental: Option<IncrementalFilter>,
}

impl<'a> Enumerator<'a> {
    pub fn new(
        options: &'a DetectOptions,
        rules: ExclusionRules,
        incremental: Option<IncrementalFilter>,
    ) -> Self {
        Enumerator {
            options,
            rules,
            incremental,
        }
    }

    pub fn enumerate(
        &self,
        root: &Path,
        candidates: &Sender<CandidateFile>,
        events: &Sender<PipelineEvent>,
        cancel: &CancelToken,
    ) -> Result<EnumerationSummary> {
        let mut summary = EnumerationSummary::default();

        if let Some(marker) = managed_library_marker(root) {
            let error = DedupError::ManagedLibraryRefusal(root.to_path_buf());
            log::warn!("refusing managed library root ({marker}): {}", root.display());
            let _ = events.send(PipelineEvent::Error {
                path: root.to_path_buf(),
                reason: error.to_string(),
            });
            summary.errors += 1;
            return Ok(summary);
        }

        let _ = events.send(PipelineEvent::Started {
            root: root.to_path_buf(),
        });

        let rules = &self.rules;
        let events_for_filter = events.clone();
        let walker = WalkDir::new(root)
            .follow_links(self.options.policies.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let path = entry.path();
                if path.file_name().is_some_and(|n| n == TRASH_DIR_NAME) {
                    return false;
                }
                if entry.file_type().is_dir() {
                    if let Some(marker) = managed_library_marker(path) {
                        let _ = events_for_filter.send(PipelineEvent::Error {
                            path: path.to_path_buf(),
                            reason: DedupError::ManagedLibraryRefusal(path.to_path_buf())
                                .to_string(),
                        });
                        log::warn!("skipping managed library ({marker}): {}", path.display());
                        return false;
                    }
                    // Bundles and excluded directories are pruned, never
                    // recursed into.
                    if rules.exclusion_reason(path).is_some() {
                        return false;
                    }
                }
                true
            });

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(DedupError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    summary.errors += 1;
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    let _ = events.send(PipelineEvent::Error {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            if let Some(reason) = self.rules.exclusion_reason(path) {
                summary.skipped += 1;
                let _ = events.send(PipelineEvent::Skipped {
                    path: path.to_path_buf(),
                    reason,
                });
                continue;
            }

            let Some(class) = media::detect_media_class(path) else {
                summary.skipped += 1;
                let _ = events.send(PipelineEvent::Skipped {
                    path: path.to_path_buf(),
                    reason: "unsupported media".to_string(),
                });
                continue;
            };

            let file_info = match fs::metadata(path) {
                Ok(info) => info,
                Err(e) => {
                    summary.errors += 1;
                    let _ = events.send(PipelineEvent::Error {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let size = file_info.len();
            let mtime = file_info.modified().ok().map(OffsetDateTime::from);
            let ctime = file_info.created().ok().map(OffsetDateTime::from);

            if let Some(filter) = &self.incremental {
                if filter.should_skip(path, mtime, size) {
                    summary.skipped += 1;
                    let _ = events.send(PipelineEvent::Skipped {
                        path: path.to_path_buf(),
                        reason: "unchanged since last scan".to_string(),
                    });
                    continue;
                }
            }

            let candidate = CandidateFile {
                path: path.to_path_buf(),
                class,
                size,
                mtime,
                ctime,
                inode: file_inode(&file_info),
            };
            let _ = events.send(PipelineEvent::Item {
                path: candidate.path.clone(),
                class,
            });
            if candidates.send(candidate).is_err() {
                // Consumer is gone; treat as cancellation.
                return Err(DedupError::Cancelled);
            }
            summary.emitted += 1;
            if summary.emitted % 100 == 0 {
                let _ = events.send(PipelineEvent::Progress {
                    scanned: summary.emitted,
                });
            }
        }

        Ok(summary)
    }
}

#[cfg(unix)]
fn file_inode(info: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(info.ino())
}

#[cfg(not(unix))]
fn file_inode(_info: &fs::Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::fs::File;
    use std::io::Write;

    fn touch(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = File::create(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    fn run_enumerator(
        root: &Path,
        options: &DetectOptions,
        rules: ExclusionRules,
        incremental: Option<IncrementalFilter>,
    ) -> (Vec<CandidateFile>, Vec<PipelineEvent>, EnumerationSummary) {
        let (cand_tx, cand_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let enumerator = Enumerator::new(options, rules, incremental);
        let summary = enumerator
            .enumerate(root, &cand_tx, &event_tx, &CancelToken::new())
            .unwrap();
        drop(cand_tx);
        drop(event_tx);
        (
            cand_rx.iter().collect(),
            event_rx.iter().collect(),
            summary,
        )
    }

    #[test]
    fn test_enumerates_media_and_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.jpg"), b"x");
        touch(&dir.path().join("b.mp4"), b"x");
        touch(&dir.path().join("c.mp3"), b"x");
        touch(&dir.path().join("notes.txt"), b"x");
        touch(&dir.path().join(".hidden.jpg"), b"x");
        touch(&dir.path().join(format!("{TRASH_DIR_NAME}/old.jpg")), b"x");

        let options = DetectOptions::default();
        let (candidates, events, summary) =
            run_enumerator(dir.path(), &options, ExclusionRules::default(), None);

        let mut classes: Vec<(String, MediaClass)> = candidates
            .iter()
            .map(|c| {
                (
                    c.path.file_name().unwrap().to_string_lossy().to_string(),
                    c.class,
                )
            })
            .collect();
        classes.sort();
        assert_eq!(
            classes,
            vec![
                ("a.jpg".to_string(), MediaClass::Photo),
                ("b.mp4".to_string(), MediaClass::Video),
                ("c.mp3".to_string(), MediaClass::Audio),
            ]
        );
        assert_eq!(summary.emitted, 3);
        // notes.txt (unsupported) and .hidden.jpg (hidden); the trash
        // staging dir is pruned silently.
        assert_eq!(summary.skipped, 2);
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::Started { .. })));
        assert!(candidates.iter().all(|c| c.size == 1));
        assert!(candidates.iter().all(|c| c.mtime.is_some()));
    }

    #[test]
    fn test_bundles_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("Photos.app/internal.jpg"), b"x");
        touch(&dir.path().join("tool.framework/res.png"), b"x");
        touch(&dir.path().join("ok.jpg"), b"x");

        let options = DetectOptions::default();
        let (candidates, _, _) =
            run_enumerator(dir.path(), &options, ExclusionRules::default(), None);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].path.ends_with("ok.jpg"));
    }

    #[test]
    fn test_cloud_sync_roots_excluded() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("Dropbox/photo.jpg"), b"x");
        touch(&dir.path().join("local/photo.jpg"), b"x");

        let options = DetectOptions::default();
        let (candidates, events, _) =
            run_enumerator(dir.path(), &options, ExclusionRules::default(), None);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].path.to_string_lossy().contains("local"));
        // The dropbox dir was pruned, so no Skipped event for its file.
        assert!(events.iter().all(|e| match e {
            PipelineEvent::Skipped { path, .. } => !path.to_string_lossy().contains("Dropbox"),
            _ => true,
        }));
    }

    #[test]
    fn test_managed_library_refusal() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("Photos Library.photoslibrary");
        touch(&library.join("masters/img.jpg"), b"x");

        let options = DetectOptions::default();
        let (candidates, events, summary) =
            run_enumerator(&library, &options, ExclusionRules::default(), None);
        assert!(candidates.is_empty());
        assert_eq!(summary.errors, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Error { reason, .. } if reason.contains("managed photo library")
        )));

        // A managed library nested under a normal root is pruned with an
        // error event while the rest of the tree proceeds.
        touch(&dir.path().join("loose.jpg"), b"x");
        let (candidates, events, _) =
            run_enumerator(dir.path(), &options, ExclusionRules::default(), None);
        assert_eq!(candidates.len(), 1);
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::Error { .. })));
    }

    #[test]
    fn test_custom_rules_order_and_glob() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("keep.jpg"), b"x");
        touch(&dir.path().join("drop.jpg"), b"x");
        touch(&dir.path().join("export-final.jpg"), b"x");

        let options = DetectOptions::default();
        let rules = ExclusionRules::default()
            .with_rule(ExclusionRule::glob("**/drop.*").unwrap())
            .with_rule(ExclusionRule::PathContains("export".to_string()));
        let (candidates, events, _) = run_enumerator(dir.path(), &options, rules, None);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].path.ends_with("keep.jpg"));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Skipped { reason, .. } if reason.contains("glob")
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Skipped { reason, .. } if reason.contains("substring")
        )));
    }

    #[test]
    fn test_incremental_skip() {
        let dir = tempfile::tempdir().unwrap();
        let unchanged = dir.path().join("old.jpg");
        let fresh = dir.path().join("new.jpg");
        touch(&unchanged, b"xx");
        touch(&fresh, b"yy");

        let mtime = fs::metadata(&unchanged)
            .unwrap()
            .modified()
            .map(OffsetDateTime::from)
            .unwrap();
        // The cutoff must fall strictly after the mtime and at or before
        // the recorded scan time for the skip to apply.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let cutoff = OffsetDateTime::now_utc();
        let mut stamps = HashMap::new();
        stamps.insert(
            unchanged.clone(),
            ScanStamp {
                size: 2,
                modified_at: Some(mtime),
                last_scanned_at: cutoff + time::Duration::seconds(1),
            },
        );

        let options = DetectOptions::default();
        let filter = IncrementalFilter::new(stamps, cutoff);
        let (candidates, events, summary) =
            run_enumerator(dir.path(), &options, ExclusionRules::default(), Some(filter));

        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.skipped, 1);
        assert!(candidates[0].path.ends_with("new.jpg"));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Skipped { reason, .. } if reason.contains("unchanged")
        )));
    }

    #[test]
    fn test_cancellation_stops_walk() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.jpg"), b"x");

        let (cand_tx, _cand_rx) = unbounded();
        let (event_tx, _event_rx) = unbounded();
        let options = DetectOptions::default();
        let enumerator = Enumerator::new(&options, ExclusionRules::default(), None);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = enumerator
            .enumerate(dir.path(), &cand_tx, &event_tx, &cancel)
            .unwrap_err();
        assert!(matches!(err, DedupError::Cancelled));
    }
}
