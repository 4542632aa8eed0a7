use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::dedup_core::media::MediaClass;

/// Everything the pipeline reports upward, merged into a single stream.
/// Events for one file arrive in pipeline order (Item, MetadataExtracted,
/// SignatureComputed, GroupFormed); events across files are unordered.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        root: PathBuf,
    },
    Progress {
        scanned: u64,
    },
    Item {
        path: PathBuf,
        class: MediaClass,
    },
    Skipped {
        path: PathBuf,
        reason: String,
    },
    Error {
        path: PathBuf,
        reason: String,
    },
    MetadataExtracted {
        file_id: Uuid,
    },
    SignatureComputed {
        file_id: Uuid,
        incomplete: bool,
    },
    GroupFormed {
        group_id: i64,
        class: MediaClass,
        members: usize,
        confidence: f64,
    },
    MergePlanned {
        group_id: i64,
        keeper: Uuid,
        merged_fields: Vec<String>,
    },
    MergeCommitted {
        transaction_id: i64,
        group_id: i64,
    },
    MergeUndone {
        transaction_id: i64,
    },
    Finished {
        metrics: ScanMetrics,
    },
}

/// Counters accumulated over one orchestration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanMetrics {
    pub enumerated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub photos: u64,
    pub videos: u64,
    pub audio: u64,
    pub signatures_computed: u64,
    pub signatures_incomplete: u64,
    pub groups_formed: u64,
}
