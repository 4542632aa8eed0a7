use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;
use time::{Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

use crate::dedup_core::error::{DedupError, Result};
use crate::dedup_core::groups::GroupState;
use crate::dedup_core::index::{FileIndex, NewMergeTransaction, TransactionState};
use crate::dedup_core::keeper::MergePlan;
use crate::dedup_core::metadata::{self, MediaMetadata};
use crate::dedup_core::options::DetectOptions;

/// Outcome of executing (or dry-running) a merge plan.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub transaction_id: Option<i64>,
    pub group_id: i64,
    pub keeper_file_id: Uuid,
    pub merged_fields: Vec<String>,
    pub trashed: Vec<PathBuf>,
    pub was_dry_run: bool,
}

/// Outcome of undoing the newest committed merge.
#[derive(Debug, Clone)]
pub struct UndoResult {
    pub transaction_id: i64,
    pub group_id: i64,
    pub keeper_file_id: Uuid,
    pub metadata_restored: bool,
    pub losers_in_trash: Vec<PathBuf>,
    /// True when losers were permanently deleted and cannot be recovered.
    pub partial: bool,
}

/// Executes validated merge plans: atomic keeper writes, loser trashing,
/// and the durable undo log. Single-threaded per group by construction.
pub struct MergeExecutor<'a> {
    index: &'a mut FileIndex,
    options: &'a DetectOptions,
    trash_base: PathBuf,
}

impl<'a> MergeExecutor<'a> {
    pub fn new(index: &'a mut FileIndex, options: &'a DetectOptions, trash_base: PathBuf) -> Self {
        MergeExecutor {
            index,
            options,
            trash_base,
        }
    }

    /// Preflight, then execute. Dry runs stop after preflight and plan
    /// computation; nothing on disk or in the index moves.
    pub fn execute(&mut self, plan: &MergePlan, dry_run: bool) -> Result<MergeResult> {
        let loser_paths = self.preflight(plan)?;

        if dry_run {
            return Ok(MergeResult {
                transaction_id: None,
                group_id: plan.group_id,
                keeper_file_id: plan.keeper_file_id,
                merged_fields: plan.merged_fields(),
                trashed: loser_paths,
                was_dry_run: true,
            });
        }

        // The snapshot is the keeper's indexed state immediately before
        // this transaction.
        let snapshot = self
            .index
            .metadata(plan.keeper_file_id)?
            .ok_or_else(|| {
                DedupError::IncompleteTransaction("keeper has no indexed metadata".to_string())
            })?
            .to_snapshot_json()?;

        if !plan.exif_writes.is_empty() {
            self.write_keeper(&plan.keeper_path, &plan.exif_writes)?;
        }
        self.index
            .save_metadata(plan.keeper_file_id, &plan.merged_metadata)?;

        // Keeper is written; from here on a failure aborts the remaining
        // moves and records the transaction as failed.
        let mut trashed_paths = Vec::new();
        let mut trashed_ids = Vec::new();
        let trash_dir = self.trash_base.join(format!("group-{}", plan.group_id));
        for (loser_id, loser_path) in plan.trash_list.iter().zip(&loser_paths) {
            let moved = if self.options.policies.move_to_trash {
                move_to_staging(loser_path, &trash_dir)
            } else {
                fs::remove_file(loser_path)
                    .map(|_| loser_path.clone())
                    .map_err(DedupError::Io)
            };
            match moved {
                Ok(destination) => {
                    self.index.remove_file(*loser_id)?;
                    trashed_ids.push(*loser_id);
                    trashed_paths.push(destination);
                }
                Err(e) => {
                    log::error!(
                        "failed to trash {} after keeper write: {}",
                        loser_path.display(),
                        e
                    );
                    self.index.record_transaction(&NewMergeTransaction {
                        group_id: plan.group_id,
                        keeper_file_id: plan.keeper_file_id,
                        removed_file_ids: trashed_ids,
                        undo_deadline: self.undo_deadline(),
                        metadata_snapshot_json: snapshot,
                        state: TransactionState::Failed,
                    })?;
                    return Err(e);
                }
            }
        }

        let transaction_id = self.index.record_transaction(&NewMergeTransaction {
            group_id: plan.group_id,
            keeper_file_id: plan.keeper_file_id,
            removed_file_ids: trashed_ids,
            undo_deadline: self.undo_deadline(),
            metadata_snapshot_json: snapshot,
            state: TransactionState::Committed,
        })?;

        Ok(MergeResult {
            transaction_id: Some(transaction_id),
            group_id: plan.group_id,
            keeper_file_id: plan.keeper_file_id,
            merged_fields: plan.merged_fields(),
            trashed: trashed_paths,
            was_dry_run: false,
        })
    }

    /// Undo the newest committed merge: restore keeper metadata from the
    /// snapshot and leave the losers in trash staging for user recovery.
    pub fn undo_last(&mut self) -> Result<Option<UndoResult>> {
        let now = OffsetDateTime::now_utc();
        let Some(tx) = self
            .index
            .undo_last_transaction(now, self.options.policies.undo_depth)?
        else {
            return Ok(None);
        };

        let snapshot = MediaMetadata::from_snapshot_json(&tx.metadata_snapshot_json)
            .map_err(|_| DedupError::IncompleteTransaction(format!("bad snapshot in tx {}", tx.id)))?;

        let current = self.index.metadata(tx.keeper_file_id)?;
        if let Some(keeper_path) = self.index.resolve_path(tx.keeper_file_id)? {
            if let Some(current) = current.as_ref() {
                let reverts = revert_writes(&snapshot, current);
                if !reverts.is_empty() && keeper_path.exists() {
                    if metadata::exiftool_available() {
                        self.write_keeper(&keeper_path, &reverts)?;
                    } else {
                        log::warn!(
                            "exiftool unavailable, file tags on {} not reverted",
                            keeper_path.display()
                        );
                    }
                }
            }
        }
        self.index.save_metadata(tx.keeper_file_id, &snapshot)?;

        let trash_dir = self.trash_base.join(format!("group-{}", tx.group_id));
        let mut losers_in_trash: Vec<PathBuf> = Vec::new();
        if trash_dir.is_dir() {
            for entry in fs::read_dir(&trash_dir)? {
                losers_in_trash.push(entry?.path());
            }
            losers_in_trash.sort();
        }
        let partial = losers_in_trash.is_empty() && !tx.removed_file_ids.is_empty();

        if let Err(e) =
            self.index
                .update_group_state(tx.group_id, GroupState::Merged, GroupState::Undone)
        {
            log::warn!("could not mark group {} undone: {}", tx.group_id, e);
        }

        Ok(Some(UndoResult {
            transaction_id: tx.id,
            group_id: tx.group_id,
            keeper_file_id: tx.keeper_file_id,
            metadata_restored: true,
            losers_in_trash,
            partial,
        }))
    }

    /// Keeper path writable, every loser readable, keeper not in the trash
    /// list. Returns the resolved loser paths.
    fn preflight(&self, plan: &MergePlan) -> Result<Vec<PathBuf>> {
        if plan.trash_list.contains(&plan.keeper_file_id) {
            return Err(DedupError::Argument(
                "merge plan lists the keeper for trashing".to_string(),
            ));
        }
        if plan.trash_list.is_empty() {
            return Err(DedupError::Argument("merge plan has no losers".to_string()));
        }

        let keeper_meta = fs::metadata(&plan.keeper_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => DedupError::NotFound(plan.keeper_path.clone()),
            _ => DedupError::AccessDenied(plan.keeper_path.clone()),
        })?;
        if keeper_meta.permissions().readonly() {
            return Err(DedupError::AccessDenied(plan.keeper_path.clone()));
        }
        if !plan.exif_writes.is_empty() && !metadata::exiftool_available() {
            return Err(DedupError::AtomicWriteFailed {
                path: plan.keeper_path.clone(),
                reason: "exiftool is required for metadata writes but was not found".to_string(),
            });
        }

        let mut loser_paths = Vec::with_capacity(plan.trash_list.len());
        for loser_id in &plan.trash_list {
            let path = self.index.resolve_path(*loser_id)?.ok_or_else(|| {
                DedupError::IncompleteTransaction(format!("loser {loser_id} is not indexed"))
            })?;
            fs::File::open(&path).map_err(|e| match e.kind() {
                ErrorKind::NotFound => DedupError::NotFound(path.clone()),
                _ => DedupError::AccessDenied(path.clone()),
            })?;
            loser_paths.push(path);
        }
        Ok(loser_paths)
    }

    fn undo_deadline(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + TimeDuration::days(self.options.policies.retention_days as i64)
    }

    /// Write EXIF/IPTC keys to the keeper. With atomic writes on, the
    /// mutation happens on a same-directory temp copy which then atomically
    /// replaces the original; readers only ever observe the pre-image or
    /// the post-image.
    fn write_keeper(&self, path: &Path, writes: &BTreeMap<String, String>) -> Result<()> {
        if self.options.policies.atomic_writes {
            let staged = stage_copy(path)?;
            apply_exif(staged.path(), writes, path)?;
            validate_copy(path, staged.path())?;
            commit_replace(staged, path)?;
        } else {
            apply_exif(path, writes, path)?;
        }
        Ok(())
    }
}

/// Remove staging directories of expired transactions and drop them from
/// the log. Returns how many transactions were cleaned up.
pub fn cleanup_expired(
    index: &mut FileIndex,
    trash_base: &Path,
    now: OffsetDateTime,
) -> Result<usize> {
    let expired = index.cleanup_transactions(now)?;
    for tx in &expired {
        let dir = trash_base.join(format!("group-{}", tx.group_id));
        if dir.is_dir() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::warn!("could not empty trash staging {}: {}", dir.display(), e);
            }
        }
    }
    Ok(expired.len())
}

/// Copy `path` to a uniquely named temp file in the same directory, so the
/// final rename stays on one volume.
fn stage_copy(path: &Path) -> Result<NamedTempFile> {
    let parent = path.parent().ok_or_else(|| DedupError::AtomicWriteFailed {
        path: path.to_path_buf(),
        reason: "no parent directory".to_string(),
    })?;
    let staged = tempfile::Builder::new()
        .prefix(".mediadedup-staged-")
        .tempfile_in(parent)
        .map_err(|e| DedupError::AtomicWriteFailed {
            path: path.to_path_buf(),
            reason: format!("staging temp: {e}"),
        })?;
    fs::copy(path, staged.path()).map_err(|e| DedupError::AtomicWriteFailed {
        path: path.to_path_buf(),
        reason: format!("staging copy: {e}"),
    })?;
    Ok(staged)
}

/// Atomically swap the staged file over the target. The temp is deleted
/// automatically if anything fails before the rename.
fn commit_replace(staged: NamedTempFile, path: &Path) -> Result<()> {
    staged
        .persist(path)
        .map_err(|e| DedupError::AtomicWriteFailed {
            path: path.to_path_buf(),
            reason: format!("atomic replace: {e}"),
        })?;
    Ok(())
}

/// Apply tag writes with exiftool. An empty value deletes the tag.
/// `reported` is the path surfaced in errors (the real keeper, not the
/// temp).
fn apply_exif(target: &Path, writes: &BTreeMap<String, String>, reported: &Path) -> Result<()> {
    let mut command = Command::new("exiftool");
    command.arg("-overwrite_original");
    for (key, value) in writes {
        command.arg(format!("-{key}={value}"));
    }
    command.arg(target);
    let output = command.output().map_err(|e| DedupError::AtomicWriteFailed {
        path: reported.to_path_buf(),
        reason: format!("exiftool spawn: {e}"),
    })?;
    if !output.status.success() {
        return Err(DedupError::AtomicWriteFailed {
            path: reported.to_path_buf(),
            reason: format!(
                "exiftool: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Sanity-check the staged copy before it replaces the original: it must
/// be non-empty and still decode to the original's pixel dimensions.
fn validate_copy(original: &Path, staged: &Path) -> Result<()> {
    let staged_len = fs::metadata(staged)
        .map(|m| m.len())
        .unwrap_or_default();
    if staged_len == 0 {
        return Err(DedupError::AtomicWriteFailed {
            path: original.to_path_buf(),
            reason: "staged copy is empty".to_string(),
        });
    }
    if let Ok(original_dims) = image::image_dimensions(original) {
        match image::image_dimensions(staged) {
            Ok(staged_dims) if staged_dims == original_dims => {}
            _ => {
                return Err(DedupError::AtomicWriteFailed {
                    path: original.to_path_buf(),
                    reason: "staged copy no longer decodes to the original dimensions".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Move a loser into the staging directory, keeping its filename and
/// suffixing on collision. Falls back to copy+delete across volumes.
fn move_to_staging(path: &Path, trash_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(trash_dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| DedupError::NotFound(path.to_path_buf()))?
        .to_string_lossy()
        .to_string();

    let mut destination = trash_dir.join(&file_name);
    let mut counter = 1;
    while destination.exists() {
        destination = trash_dir.join(format!("{counter}-{file_name}"));
        counter += 1;
    }

    match fs::rename(path, &destination) {
        Ok(()) => Ok(destination),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            fs::copy(path, &destination)?;
            fs::remove_file(path)?;
            Ok(destination)
        }
        Err(e) => Err(e.into()),
    }
}

/// Tag writes that take the keeper file back to its snapshot values. Only
/// fields the merge could have added are considered; a field absent from
/// the snapshot but present now is cleared.
fn revert_writes(snapshot: &MediaMetadata, current: &MediaMetadata) -> BTreeMap<String, String> {
    let mut writes = BTreeMap::new();

    if snapshot.capture_date != current.capture_date {
        let value = snapshot
            .capture_date
            .and_then(|d| {
                d.format(time::macros::format_description!(
                    "[year]:[month]:[day] [hour]:[minute]:[second]"
                ))
                .ok()
            })
            .unwrap_or_default();
        writes.insert("DateTimeOriginal".to_string(), value);
    }
    if snapshot.gps_lat != current.gps_lat || snapshot.gps_lon != current.gps_lon {
        match (snapshot.gps_lat, snapshot.gps_lon) {
            (Some(lat), Some(lon)) => {
                writes.insert("GPSLatitude".to_string(), format!("{}", lat.abs()));
                writes.insert(
                    "GPSLatitudeRef".to_string(),
                    if lat < 0.0 { "S" } else { "N" }.to_string(),
                );
                writes.insert("GPSLongitude".to_string(), format!("{}", lon.abs()));
                writes.insert(
                    "GPSLongitudeRef".to_string(),
                    if lon < 0.0 { "W" } else { "E" }.to_string(),
                );
            }
            _ => {
                writes.insert("GPSLatitude".to_string(), String::new());
                writes.insert("GPSLatitudeRef".to_string(), String::new());
                writes.insert("GPSLongitude".to_string(), String::new());
                writes.insert("GPSLongitudeRef".to_string(), String::new());
            }
        }
    }
    if snapshot.camera_model != current.camera_model {
        writes.insert(
            "Model".to_string(),
            snapshot.camera_model.clone().unwrap_or_default(),
        );
    }
    if snapshot.keywords != current.keywords {
        writes.insert("Keywords".to_string(), snapshot.keywords.join(", "));
    }
    if snapshot.tags != current.tags {
        writes.insert("Subject".to_string(), snapshot.tags.join(", "));
    }
    writes
}
