use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::{Engine, engine::general_purpose};
use crossbeam_channel::{Sender, bounded, unbounded};
use sha2::{Digest, Sha256};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::dedup_core::enumerate::{CandidateFile, Enumerator, ExclusionRules, IncrementalFilter};
use crate::dedup_core::error::{DedupError, Result};
use crate::dedup_core::events::{PipelineEvent, ScanMetrics};
use crate::dedup_core::groups::{DuplicateGroup, GroupBuilder, GroupState};
use crate::dedup_core::imagehash::{self, HashAlgorithm, HashOutcome, ImageSignature};
use crate::dedup_core::index::{CandidateCriteria, FileFacts, FileIndex};
use crate::dedup_core::keeper::{self, MemberSnapshot, MergePlan};
use crate::dedup_core::media::{self, MediaClass};
use crate::dedup_core::merge::{MergeExecutor, MergeResult, UndoResult, cleanup_expired};
use crate::dedup_core::metadata::{MediaMetadata, MetadataExtractor};
use crate::dedup_core::options::DetectOptions;
use crate::dedup_core::videofp::{self, FrameSamples, VideoSignature};

/// Cooperative cancellation flag, one per orchestration. Workers poll it at
/// every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Calculate the SHA256 hash of a file, returned as base64.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let hash = hasher.finalize();
    Ok(general_purpose::STANDARD.encode(hash))
}

/// Everything a worker produced for one candidate.
struct ProcessedFile {
    candidate: CandidateFile,
    content_type: String,
    metadata: MediaMetadata,
    content_hash: Option<String>,
    image_hashes: Option<HashOutcome>,
    frames: Option<FrameSamples>,
    /// Signatures were intentionally left alone (file unchanged and
    /// already signed).
    signature_skipped: bool,
    /// Decode failure, reported per-file; the catalog entry still lands.
    decode_error: Option<String>,
}

enum WorkerOutcome {
    Processed(Box<ProcessedFile>),
    Failed { path: PathBuf, error: DedupError },
}

/// Bounded-channel capacity between stages.
const STAGE_CHANNEL_CAPACITY: usize = 256;

/// Drives the pipeline: enumeration, parallel extraction and hashing,
/// index upserts, grouping, planning, and merge execution. The index is
/// only ever touched from the collector thread, so all persistence is
/// single-writer.
pub struct Orchestrator {
    index: FileIndex,
    options: DetectOptions,
    events: Sender<PipelineEvent>,
    cancel: CancelToken,
    trash_base: PathBuf,
}

impl Orchestrator {
    pub fn new(
        index: FileIndex,
        options: DetectOptions,
        events: Sender<PipelineEvent>,
        trash_base: PathBuf,
    ) -> Self {
        Orchestrator {
            index,
            options,
            events,
            cancel: CancelToken::new(),
            trash_base,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    pub fn options(&self) -> &DetectOptions {
        &self.options
    }

    /// Full detection pass: scan all roots, then form groups. Emits the
    /// final `Finished` event with aggregate metrics.
    pub fn run_detection(
        &mut self,
        roots: &[PathBuf],
        rules: ExclusionRules,
    ) -> Result<(ScanMetrics, Vec<DuplicateGroup>)> {
        let mut metrics = self.scan(roots, rules)?;
        let groups = self.build_groups()?;
        metrics.groups_formed = groups.len() as u64;
        let _ = self.events.send(PipelineEvent::Finished {
            metrics: metrics.clone(),
        });
        Ok((metrics, groups))
    }

    /// Enumerate roots and run extraction/hashing across a bounded worker
    /// pool; all results land in the index.
    pub fn scan(&mut self, roots: &[PathBuf], rules: ExclusionRules) -> Result<ScanMetrics> {
        let incremental = if self.options.policies.incremental {
            let cutoff = OffsetDateTime::now_utc()
                - TimeDuration::hours(self.options.policies.incremental_lookback_hours as i64);
            Some(IncrementalFilter::new(self.index.scan_stamps()?, cutoff))
        } else {
            None
        };
        let stamps = Arc::new(self.index.scan_stamps()?);
        let signed = Arc::new(self.index.signed_paths(self.options.policies.enable_phash)?);

        let worker_count = num_cpus::get()
            .min(self.options.limits.max_workers)
            .max(1);
        let (candidate_tx, candidate_rx) = bounded::<CandidateFile>(STAGE_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = bounded::<WorkerOutcome>(STAGE_CHANNEL_CAPACITY);
        let (summary_tx, summary_rx) = unbounded::<Result<(u64, u64, u64)>>();

        let options = &self.options;
        let events = &self.events;
        let cancel = &self.cancel;
        let index = &mut self.index;
        let roots: Vec<PathBuf> = roots.to_vec();

        let mut metrics = ScanMetrics::default();

        rayon::scope(|s| -> Result<()> {
            // Single producer walking every root in order.
            s.spawn({
                let candidate_tx = candidate_tx.clone();
                let events = events.clone();
                let cancel = cancel.clone();
                let summary_tx = summary_tx.clone();
                move |_| {
                    let enumerator = Enumerator::new(options, rules, incremental);
                    let mut emitted = 0;
                    let mut skipped = 0;
                    let mut errors = 0;
                    for root in &roots {
                        match enumerator.enumerate(root, &candidate_tx, &events, &cancel) {
                            Ok(summary) => {
                                emitted += summary.emitted;
                                skipped += summary.skipped;
                                errors += summary.errors;
                            }
                            Err(e) => {
                                let _ = summary_tx.send(Err(e));
                                return;
                            }
                        }
                    }
                    let _ = summary_tx.send(Ok((emitted, skipped, errors)));
                }
            });

            // Data-parallel extraction and hashing workers.
            for _ in 0..worker_count {
                let candidate_rx = candidate_rx.clone();
                let result_tx = result_tx.clone();
                let cancel = cancel.clone();
                let stamps = Arc::clone(&stamps);
                let signed = Arc::clone(&signed);
                s.spawn(move |_| {
                    let mut extractor = MetadataExtractor::new();
                    for candidate in candidate_rx {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let outcome = process_candidate(
                            candidate, &mut extractor, options, &stamps, &signed,
                        );
                        if result_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }

            // The channel clones held above keep the loop alive; dropping
            // ours lets it end when producer and workers finish.
            drop(candidate_tx);
            drop(result_tx);
            drop(summary_tx);

            // Collector: the only index writer.
            for outcome in result_rx {
                if cancel.is_cancelled() {
                    break;
                }
                match outcome {
                    WorkerOutcome::Processed(processed) => {
                        if let Err(e) = record_processed(index, events, &mut metrics, *processed) {
                            if e.is_fatal() {
                                return Err(e);
                            }
                            metrics.errors += 1;
                        }
                    }
                    WorkerOutcome::Failed { path, error } => {
                        metrics.errors += 1;
                        log::warn!("pipeline error for {}: {}", path.display(), error);
                        let _ = events.send(PipelineEvent::Error {
                            path,
                            reason: error.to_string(),
                        });
                    }
                }
            }
            Ok(())
        })?;

        if self.cancel.is_cancelled() {
            return Err(DedupError::Cancelled);
        }

        match summary_rx.try_recv() {
            Ok(Ok((emitted, skipped, errors))) => {
                metrics.enumerated = emitted;
                metrics.skipped = skipped;
                metrics.errors += errors;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {}
        }

        Ok(metrics)
    }

    /// Rebuild duplicate groups from the indexed candidates. Merged and
    /// undone history is preserved; stale unmerged groups are replaced.
    pub fn build_groups(&mut self) -> Result<Vec<DuplicateGroup>> {
        self.index.prune_unmerged_groups()?;

        let builder = GroupBuilder::new(&self.options);
        let mut saved = Vec::new();
        for class in [MediaClass::Photo, MediaClass::Video] {
            if self.cancel.is_cancelled() {
                return Err(DedupError::Cancelled);
            }
            let candidates = self
                .index
                .fetch_candidates(class, &CandidateCriteria::default())?;
            for mut group in builder.build(&candidates) {
                let id = self.index.save_group(&group)?;
                group.id = id;
                self.index
                    .update_group_state(id, GroupState::Open, GroupState::Complete)?;
                group.state = GroupState::Complete;
                let _ = self.events.send(PipelineEvent::GroupFormed {
                    group_id: id,
                    class,
                    members: group.members.len(),
                    confidence: group.confidence,
                });
                saved.push(group);
            }
        }
        Ok(saved)
    }

    /// Compute the merge plan for a complete group and mark it planned.
    pub fn plan_group(&mut self, group: &DuplicateGroup) -> Result<MergePlan> {
        let mut members = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let path = self.index.resolve_path(member.file_id)?.ok_or_else(|| {
                DedupError::IncompleteTransaction(format!(
                    "group member {} is not indexed",
                    member.file_id
                ))
            })?;
            let metadata = self.index.metadata(member.file_id)?.ok_or_else(|| {
                DedupError::IncompleteTransaction(format!(
                    "group member {} has no metadata",
                    member.file_id
                ))
            })?;
            members.push(MemberSnapshot {
                file_id: member.file_id,
                path,
                metadata,
            });
        }

        let plan = keeper::plan_merge(group.id, &members)?;
        // Re-planning an already planned group (e.g. after a dry run) is
        // fine; the stored state simply stays planned.
        match self
            .index
            .update_group_state(group.id, GroupState::Complete, GroupState::Planned)
        {
            Ok(()) => {}
            Err(DedupError::StateMismatch { found, .. }) if found == "planned" => {}
            Err(e) => return Err(e),
        }
        let _ = self.events.send(PipelineEvent::MergePlanned {
            group_id: group.id,
            keeper: plan.keeper_file_id,
            merged_fields: plan.merged_fields(),
        });
        Ok(plan)
    }

    /// Execute a plan. `confirmed` is the explicit user go; without it a
    /// non-dry-run merge is refused when the confirmation policy is on.
    pub fn execute_plan(
        &mut self,
        plan: &MergePlan,
        dry_run: bool,
        confirmed: bool,
    ) -> Result<MergeResult> {
        if !dry_run && self.options.policies.require_confirmation && !confirmed {
            return Err(DedupError::Argument(
                "merge requires explicit confirmation".to_string(),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(DedupError::Cancelled);
        }

        let mut executor =
            MergeExecutor::new(&mut self.index, &self.options, self.trash_base.clone());
        let result = executor.execute(plan, dry_run)?;
        if !dry_run {
            self.index
                .update_group_state(plan.group_id, GroupState::Planned, GroupState::Merged)?;
            if let Some(transaction_id) = result.transaction_id {
                let _ = self.events.send(PipelineEvent::MergeCommitted {
                    transaction_id,
                    group_id: plan.group_id,
                });
            }
        }
        Ok(result)
    }

    /// Undo the newest committed merge.
    pub fn undo_last(&mut self) -> Result<Option<UndoResult>> {
        let mut executor =
            MergeExecutor::new(&mut self.index, &self.options, self.trash_base.clone());
        let result = executor.undo_last()?;
        if let Some(undo) = &result {
            let _ = self.events.send(PipelineEvent::MergeUndone {
                transaction_id: undo.transaction_id,
            });
        }
        Ok(result)
    }

    /// Drop expired transactions and empty their trash staging.
    pub fn cleanup(&mut self) -> Result<usize> {
        cleanup_expired(
            &mut self.index,
            &self.trash_base,
            OffsetDateTime::now_utc(),
        )
    }

    /// Mark a complete or planned group as not worth merging.
    pub fn abandon_group(&mut self, group: &DuplicateGroup) -> Result<()> {
        self.index
            .update_group_state(group.id, group.state, GroupState::Abandoned)
    }
}

/// Worker body: content type, metadata, content hash, and the per-class
/// signature work for one candidate.
fn process_candidate(
    candidate: CandidateFile,
    extractor: &mut MetadataExtractor,
    options: &DetectOptions,
    stamps: &std::collections::HashMap<PathBuf, crate::dedup_core::index::ScanStamp>,
    signed: &std::collections::HashSet<PathBuf>,
) -> WorkerOutcome {
    let path = candidate.path.clone();
    match process_candidate_inner(candidate, extractor, options, stamps, signed) {
        Ok(processed) => WorkerOutcome::Processed(Box::new(processed)),
        Err(error) => WorkerOutcome::Failed { path, error },
    }
}

fn process_candidate_inner(
    candidate: CandidateFile,
    extractor: &mut MetadataExtractor,
    options: &DetectOptions,
    stamps: &std::collections::HashMap<PathBuf, crate::dedup_core::index::ScanStamp>,
    signed: &std::collections::HashSet<PathBuf>,
) -> Result<ProcessedFile> {
    let content_type = media::infer_content_type(&candidate.path, None).unwrap_or_default();
    let metadata = extractor.extract(&candidate.path, candidate.class)?;

    let unchanged = stamps.get(&candidate.path).is_some_and(|stamp| {
        stamp.size == candidate.size && stamp.modified_at == candidate.mtime
    });
    let signature_skipped = unchanged && signed.contains(&candidate.path);

    let content_hash = match hash_file(&candidate.path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            log::warn!("could not hash {}: {}", candidate.path.display(), e);
            None
        }
    };

    let mut image_hashes = None;
    let mut frames = None;
    let mut decode_error = None;
    if !signature_skipped {
        match candidate.class {
            MediaClass::Photo => {
                // A failed decode still catalogs the file; the group it
                // lands in is simply marked incomplete.
                match imagehash::hash_image_file(
                    &candidate.path,
                    options.limits.min_image_dimension,
                    options.policies.enable_phash,
                ) {
                    Ok(hashes) => image_hashes = hashes,
                    Err(e) => decode_error = Some(e.to_string()),
                }
            }
            MediaClass::Video => {
                if let Some(duration) = metadata.duration_sec {
                    frames = Some(videofp::sample_frames(&candidate.path, duration, options));
                }
            }
            MediaClass::Audio => {}
        }
    }

    Ok(ProcessedFile {
        candidate,
        content_type,
        metadata,
        content_hash,
        image_hashes,
        frames,
        signature_skipped,
        decode_error,
    })
}

/// Collector body: upsert the file and persist metadata and signatures,
/// emitting per-file events in pipeline order.
fn record_processed(
    index: &mut FileIndex,
    events: &Sender<PipelineEvent>,
    metrics: &mut ScanMetrics,
    processed: ProcessedFile,
) -> Result<()> {
    let candidate = &processed.candidate;
    let outcome = index.upsert_file(&FileFacts {
        path: candidate.path.clone(),
        inode: candidate.inode,
        size: candidate.size,
        created_at: candidate.ctime,
        modified_at: candidate.mtime,
        class: candidate.class,
        content_type: processed.content_type.clone(),
    })?;

    if let Some(hash) = &processed.content_hash {
        index.set_content_hash(outcome.file_id, hash)?;
    }
    index.save_metadata(outcome.file_id, &processed.metadata)?;
    let _ = events.send(PipelineEvent::MetadataExtracted {
        file_id: outcome.file_id,
    });
    if let Some(reason) = &processed.decode_error {
        metrics.errors += 1;
        let _ = events.send(PipelineEvent::Error {
            path: candidate.path.clone(),
            reason: reason.clone(),
        });
    }

    match candidate.class {
        MediaClass::Photo => metrics.photos += 1,
        MediaClass::Video => metrics.videos += 1,
        MediaClass::Audio => metrics.audio += 1,
    }

    let now = OffsetDateTime::now_utc();
    if let Some(hashes) = processed.image_hashes {
        index.save_image_signature(&ImageSignature {
            file_id: outcome.file_id,
            algorithm: HashAlgorithm::DHash,
            hash: hashes.dhash,
            width: hashes.width,
            height: hashes.height,
            computed_at: now,
        })?;
        if let Some(phash) = hashes.phash {
            index.save_image_signature(&ImageSignature {
                file_id: outcome.file_id,
                algorithm: HashAlgorithm::PHash,
                hash: phash,
                width: hashes.width,
                height: hashes.height,
                computed_at: now,
            })?;
        }
        metrics.signatures_computed += 1;
        let _ = events.send(PipelineEvent::SignatureComputed {
            file_id: outcome.file_id,
            incomplete: false,
        });
    } else if let Some(frames) = processed.frames {
        let incomplete = frames.frame_hashes.iter().any(Option::is_none);
        index.save_video_signature(&VideoSignature {
            file_id: outcome.file_id,
            duration_sec: processed.metadata.duration_sec.unwrap_or_default(),
            width: processed.metadata.width.unwrap_or_default(),
            height: processed.metadata.height.unwrap_or_default(),
            frame_hashes: frames.frame_hashes,
            sample_times_sec: frames.sample_times_sec,
            computed_at: now,
        })?;
        metrics.signatures_computed += 1;
        if incomplete {
            metrics.signatures_incomplete += 1;
        }
        let _ = events.send(PipelineEvent::SignatureComputed {
            file_id: outcome.file_id,
            incomplete,
        });
    }

    Ok(())
}
