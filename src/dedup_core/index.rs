use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::dedup_core::error::{DedupError, Result};
use crate::dedup_core::groups::{DuplicateGroup, GroupMember, GroupState, Penalty, Signal};
use crate::dedup_core::imagehash::{HashAlgorithm, ImageSignature};
use crate::dedup_core::media::MediaClass;
use crate::dedup_core::metadata::MediaMetadata;
use crate::dedup_core::videofp::VideoSignature;

/// Durable catalog of scanned files, signatures, groups, and the merge
/// transaction log. The index exclusively owns all persistent rows; every
/// other component works on ids and value copies.
pub struct FileIndex {
    conn: Connection,
}

/// Observed facts about a file at enumeration time.
#[derive(Debug, Clone)]
pub struct FileFacts {
    pub path: PathBuf,
    pub inode: Option<u64>,
    pub size: u64,
    pub created_at: Option<OffsetDateTime>,
    pub modified_at: Option<OffsetDateTime>,
    pub class: MediaClass,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub file_id: Uuid,
    /// True when the row is new or its size/mtime moved; signatures are
    /// recomputed only in that case.
    pub changed: bool,
}

/// Prior-scan stamp for the incremental filter.
#[derive(Debug, Clone)]
pub struct ScanStamp {
    pub size: u64,
    pub modified_at: Option<OffsetDateTime>,
    pub last_scanned_at: OffsetDateTime,
}

impl ScanStamp {
    /// Incremental skip rule: scanned since the cutoff, size and mtime
    /// unchanged, and the mtime strictly before the cutoff (a file touched
    /// exactly at the cutoff instant must rescan).
    pub fn allows_skip(
        &self,
        mtime: Option<OffsetDateTime>,
        size: u64,
        cutoff: OffsetDateTime,
    ) -> bool {
        let Some(mtime) = mtime else {
            return false;
        };
        self.last_scanned_at >= cutoff
            && self.size == size
            && self.modified_at == Some(mtime)
            && mtime < cutoff
    }
}

/// Per-class streaming row for the group builder.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub file_id: Uuid,
    pub path: PathBuf,
    pub file_name: String,
    pub class: MediaClass,
    pub size: u64,
    pub content_hash: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_sec: Option<f64>,
    pub capture_date: Option<OffsetDateTime>,
    pub dhash: Option<u64>,
    pub video: Option<VideoSignature>,
}

impl CandidateRow {
    pub fn has_expected_signature(&self) -> bool {
        match self.class {
            MediaClass::Photo => self.dhash.is_some(),
            MediaClass::Video => self.video.as_ref().is_some_and(|v| v.usable_frames() > 0),
            MediaClass::Audio => true,
        }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width.unwrap_or(0) as u64 * self.height.unwrap_or(0) as u64
    }
}

#[derive(Debug, Default, Clone)]
pub struct CandidateCriteria {
    pub min_width: Option<u32>,
    pub max_width: Option<u32>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    /// Top 16 bits of the dHash; rows without a dHash never match.
    pub dhash_prefix: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Committed,
    Undone,
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Committed => "committed",
            TransactionState::Undone => "undone",
            TransactionState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<TransactionState> {
        match s {
            "committed" => Some(TransactionState::Committed),
            "undone" => Some(TransactionState::Undone),
            "failed" => Some(TransactionState::Failed),
            _ => None,
        }
    }
}

/// One durable record in the merge transaction log.
#[derive(Debug, Clone)]
pub struct MergeTransaction {
    pub id: i64,
    pub group_id: i64,
    pub keeper_file_id: Uuid,
    pub removed_file_ids: Vec<Uuid>,
    pub created_at: OffsetDateTime,
    pub undo_deadline: OffsetDateTime,
    pub metadata_snapshot_json: String,
    pub state: TransactionState,
}

/// A transaction about to be appended; the id is assigned by the log.
#[derive(Debug, Clone)]
pub struct NewMergeTransaction {
    pub group_id: i64,
    pub keeper_file_id: Uuid,
    pub removed_file_ids: Vec<Uuid>,
    pub undo_deadline: OffsetDateTime,
    pub metadata_snapshot_json: String,
    pub state: TransactionState,
}

#[derive(Debug, Default, Clone)]
pub struct IndexStats {
    pub photos: u64,
    pub videos: u64,
    pub audio: u64,
    pub image_signatures: u64,
    pub video_signatures: u64,
    pub groups: u64,
    pub committed_transactions: u64,
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            inode INTEGER,
            size INTEGER NOT NULL,
            created_at TEXT,
            modified_at TEXT,
            class TEXT NOT NULL,
            content_type TEXT NOT NULL,
            content_hash TEXT,
            last_scanned_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_files_inode ON files (inode, size);
        CREATE INDEX IF NOT EXISTS idx_files_class ON files (class);
        CREATE TABLE IF NOT EXISTS metadata (
            file_id TEXT PRIMARY KEY REFERENCES files (id) ON DELETE CASCADE,
            file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            media_class TEXT NOT NULL,
            created_at TEXT,
            modified_at TEXT,
            capture_date TEXT,
            width INTEGER,
            height INTEGER,
            duration_sec REAL,
            camera_model TEXT,
            gps_lat REAL,
            gps_lon REAL,
            keywords TEXT NOT NULL,
            tags TEXT NOT NULL,
            content_type TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS image_signatures (
            file_id TEXT NOT NULL REFERENCES files (id) ON DELETE CASCADE,
            algorithm TEXT NOT NULL,
            hash INTEGER NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY (file_id, algorithm)
        );
        CREATE TABLE IF NOT EXISTS video_signatures (
            file_id TEXT PRIMARY KEY REFERENCES files (id) ON DELETE CASCADE,
            duration_sec REAL NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            frame_hashes TEXT NOT NULL,
            sample_times TEXT NOT NULL,
            computed_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS duplicate_groups (
            id INTEGER PRIMARY KEY,
            media_class TEXT NOT NULL,
            confidence REAL NOT NULL,
            rationale TEXT NOT NULL,
            incomplete INTEGER NOT NULL,
            state TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS group_members (
            group_id INTEGER NOT NULL REFERENCES duplicate_groups (id) ON DELETE CASCADE,
            file_id TEXT NOT NULL REFERENCES files (id) ON DELETE CASCADE,
            confidence REAL NOT NULL,
            signals TEXT NOT NULL,
            penalties TEXT NOT NULL,
            keeper_suggestion INTEGER NOT NULL,
            PRIMARY KEY (group_id, file_id)
        );
        CREATE TABLE IF NOT EXISTS merge_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL,
            keeper_file_id TEXT NOT NULL,
            removed_file_ids TEXT NOT NULL,
            created_at TEXT NOT NULL,
            undo_deadline TEXT NOT NULL,
            metadata_snapshot TEXT NOT NULL,
            state TEXT NOT NULL
        );
        "#,
    )])
}

fn fmt_ts(t: &OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap()
}

fn fmt_ts_opt(t: &Option<OffsetDateTime>) -> Option<String> {
    t.as_ref().map(fmt_ts)
}

fn parse_ts(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

fn parse_ts_opt(s: Option<String>) -> Option<OffsetDateTime> {
    s.as_deref().and_then(parse_ts)
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Retry a conflicting write with exponential backoff, up to 5 attempts.
fn with_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(10);
    for _ in 0..5 {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) => {
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(DedupError::IndexConflict)
}

impl FileIndex {
    /// Open (or create) the index at the given path, running migrations.
    /// A corrupted schema refuses to open.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        FileIndex::initialize(conn)
    }

    /// In-memory index for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        FileIndex::initialize(conn)
    }

    fn initialize(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // Log appends must be durable before record_transaction returns.
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(DedupError::SchemaCorrupted(check));
        }

        migrations().to_latest(&mut conn)?;
        Ok(FileIndex { conn })
    }

    /// Insert or update a file row, matching by path first, then by
    /// (inode, size) to follow renames. Returns the stable id.
    pub fn upsert_file(&mut self, facts: &FileFacts) -> Result<UpsertOutcome> {
        let path_str = facts.path.to_string_lossy().to_string();
        let now = fmt_ts(&OffsetDateTime::now_utc());
        let mtime = fmt_ts_opt(&facts.modified_at);
        let ctime = fmt_ts_opt(&facts.created_at);

        let tx = self.conn.transaction()?;

        let mut existing: Option<(String, i64, Option<String>)> = tx
            .query_row(
                "SELECT id, size, modified_at FROM files WHERE path = ?1",
                params![path_str],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if existing.is_none() {
            if let Some(inode) = facts.inode {
                // Same inode and size at a new path: treat as a rename.
                existing = tx
                    .query_row(
                        "SELECT id, size, modified_at FROM files
                         WHERE inode = ?1 AND size = ?2",
                        params![inode as i64, facts.size as i64],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
            }
        }

        let outcome = match existing {
            Some((id, old_size, old_mtime)) => {
                let changed = old_size != facts.size as i64 || old_mtime != mtime;
                tx.execute(
                    "UPDATE files
                     SET path = ?1, inode = ?2, size = ?3, created_at = ?4,
                         modified_at = ?5, class = ?6, content_type = ?7,
                         last_scanned_at = ?8
                     WHERE id = ?9",
                    params![
                        path_str,
                        facts.inode.map(|i| i as i64),
                        facts.size as i64,
                        ctime,
                        mtime,
                        facts.class.as_str(),
                        facts.content_type,
                        now,
                        id,
                    ],
                )?;
                UpsertOutcome {
                    file_id: Uuid::parse_str(&id)
                        .map_err(|_| DedupError::SchemaCorrupted(format!("bad file id {id}")))?,
                    changed,
                }
            }
            None => {
                let id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO files
                       (id, path, inode, size, created_at, modified_at, class,
                        content_type, last_scanned_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id.to_string(),
                        path_str,
                        facts.inode.map(|i| i as i64),
                        facts.size as i64,
                        ctime,
                        mtime,
                        facts.class.as_str(),
                        facts.content_type,
                        now,
                    ],
                )?;
                UpsertOutcome {
                    file_id: id,
                    changed: true,
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn set_content_hash(&mut self, file_id: Uuid, hash: &str) -> Result<()> {
        with_retry(|| {
            self.conn.execute(
                "UPDATE files SET content_hash = ?1 WHERE id = ?2",
                params![hash, file_id.to_string()],
            )
        })?;
        Ok(())
    }

    /// Replace the metadata row for a file.
    pub fn save_metadata(&mut self, file_id: Uuid, meta: &MediaMetadata) -> Result<()> {
        let keywords = serde_json::to_string(&meta.keywords)?;
        let tags = serde_json::to_string(&meta.tags)?;
        with_retry(|| {
            self.conn.execute(
                "INSERT OR REPLACE INTO metadata
                   (file_id, file_name, file_size, media_class, created_at,
                    modified_at, capture_date, width, height, duration_sec,
                    camera_model, gps_lat, gps_lon, keywords, tags, content_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    file_id.to_string(),
                    meta.file_name,
                    meta.file_size as i64,
                    meta.media_class.as_str(),
                    fmt_ts_opt(&meta.created_at),
                    fmt_ts_opt(&meta.modified_at),
                    fmt_ts_opt(&meta.capture_date),
                    meta.width,
                    meta.height,
                    meta.duration_sec,
                    meta.camera_model,
                    meta.gps_lat,
                    meta.gps_lon,
                    keywords,
                    tags,
                    meta.content_type,
                ],
            )
        })?;
        Ok(())
    }

    pub fn metadata(&self, file_id: Uuid) -> Result<Option<MediaMetadata>> {
        self.conn
            .query_row(
                "SELECT file_name, file_size, media_class, created_at, modified_at,
                        capture_date, width, height, duration_sec, camera_model,
                        gps_lat, gps_lon, keywords, tags, content_type
                 FROM metadata WHERE file_id = ?1",
                params![file_id.to_string()],
                |row| {
                    Ok(MediaMetadata {
                        file_name: row.get(0)?,
                        file_size: row.get::<_, i64>(1)? as u64,
                        media_class: MediaClass::parse(&row.get::<_, String>(2)?)
                            .unwrap_or(MediaClass::Photo),
                        created_at: parse_ts_opt(row.get(3)?),
                        modified_at: parse_ts_opt(row.get(4)?),
                        capture_date: parse_ts_opt(row.get(5)?),
                        width: row.get(6)?,
                        height: row.get(7)?,
                        duration_sec: row.get(8)?,
                        camera_model: row.get(9)?,
                        gps_lat: row.get(10)?,
                        gps_lon: row.get(11)?,
                        keywords: serde_json::from_str(&row.get::<_, String>(12)?)
                            .unwrap_or_default(),
                        tags: serde_json::from_str(&row.get::<_, String>(13)?)
                            .unwrap_or_default(),
                        content_type: row.get(14)?,
                    })
                },
            )
            .optional()
            .map_err(DedupError::from)
    }

    /// Idempotent upsert keyed by (file, algorithm).
    pub fn save_image_signature(&mut self, sig: &ImageSignature) -> Result<()> {
        with_retry(|| {
            self.conn.execute(
                "INSERT OR REPLACE INTO image_signatures
                   (file_id, algorithm, hash, width, height, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sig.file_id.to_string(),
                    sig.algorithm.as_str(),
                    sig.hash as i64,
                    sig.width,
                    sig.height,
                    fmt_ts(&sig.computed_at),
                ],
            )
        })?;
        Ok(())
    }

    pub fn has_image_signature(&self, file_id: Uuid, algorithm: HashAlgorithm) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM image_signatures WHERE file_id = ?1 AND algorithm = ?2",
            params![file_id.to_string(), algorithm.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Idempotent upsert keyed by file.
    pub fn save_video_signature(&mut self, sig: &VideoSignature) -> Result<()> {
        let frame_hashes = serde_json::to_string(&sig.frame_hashes)?;
        let sample_times = serde_json::to_string(&sig.sample_times_sec)?;
        with_retry(|| {
            self.conn.execute(
                "INSERT OR REPLACE INTO video_signatures
                   (file_id, duration_sec, width, height, frame_hashes,
                    sample_times, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sig.file_id.to_string(),
                    sig.duration_sec,
                    sig.width,
                    sig.height,
                    frame_hashes,
                    sample_times,
                    fmt_ts(&sig.computed_at),
                ],
            )
        })?;
        Ok(())
    }

    pub fn has_video_signature(&self, file_id: Uuid) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM video_signatures WHERE file_id = ?1",
            params![file_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Paths whose required signatures are already present: dHash (and
    /// pHash when demanded) for photos, frame hashes for videos. Workers
    /// consult this so hashes are recomputed only when mtime or size moved.
    pub fn signed_paths(&self, require_phash: bool) -> Result<std::collections::HashSet<PathBuf>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.path FROM files f
               JOIN image_signatures d ON d.file_id = f.id AND d.algorithm = 'dhash'
             WHERE f.class = 'photo'
               AND (?1 = 0 OR EXISTS (
                   SELECT 1 FROM image_signatures p
                   WHERE p.file_id = f.id AND p.algorithm = 'phash'))
             UNION
             SELECT f.path FROM files f
               JOIN video_signatures v ON v.file_id = f.id",
        )?;
        let rows = stmt.query_map(params![require_phash as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut paths = std::collections::HashSet::new();
        for row in rows {
            paths.insert(PathBuf::from(row?));
        }
        Ok(paths)
    }

    /// True iff the path was scanned at or after the cutoff and its
    /// size/mtime are unchanged.
    pub fn should_skip(
        &self,
        path: &Path,
        mtime: Option<OffsetDateTime>,
        size: u64,
        cutoff: OffsetDateTime,
    ) -> Result<bool> {
        let row: Option<ScanStamp> = self
            .conn
            .query_row(
                "SELECT size, modified_at, last_scanned_at FROM files WHERE path = ?1",
                params![path.to_string_lossy()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .and_then(|(size, mtime, scanned)| {
                Some(ScanStamp {
                    size: size as u64,
                    modified_at: parse_ts_opt(mtime),
                    last_scanned_at: parse_ts(&scanned)?,
                })
            });
        Ok(row.is_some_and(|stamp| stamp.allows_skip(mtime, size, cutoff)))
    }

    /// Snapshot of all scan stamps, handed to the enumerator so the
    /// incremental filter runs without touching the connection.
    pub fn scan_stamps(&self) -> Result<HashMap<PathBuf, ScanStamp>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, size, modified_at, last_scanned_at FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut stamps = HashMap::new();
        for row in rows {
            let (path, size, mtime, scanned) = row?;
            let Some(last_scanned_at) = parse_ts(&scanned) else {
                continue;
            };
            stamps.insert(
                PathBuf::from(path),
                ScanStamp {
                    size: size as u64,
                    modified_at: parse_ts_opt(mtime),
                    last_scanned_at,
                },
            );
        }
        Ok(stamps)
    }

    /// Candidate rows for grouping, ordered by path for determinism.
    pub fn fetch_candidates(
        &self,
        class: MediaClass,
        criteria: &CandidateCriteria,
    ) -> Result<Vec<CandidateRow>> {
        let mut sql = String::from(
            "SELECT f.id, f.path, f.size, f.content_hash,
                    m.file_name, m.width, m.height, m.duration_sec, m.capture_date,
                    s.hash,
                    v.duration_sec, v.width, v.height, v.frame_hashes, v.sample_times, v.computed_at
             FROM files f
             LEFT JOIN metadata m ON m.file_id = f.id
             LEFT JOIN image_signatures s ON s.file_id = f.id AND s.algorithm = 'dhash'
             LEFT JOIN video_signatures v ON v.file_id = f.id
             WHERE f.class = ?",
        );
        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(class.as_str().to_string())];

        if let Some(min_width) = criteria.min_width {
            sql.push_str(" AND m.width >= ?");
            bindings.push(Box::new(min_width));
        }
        if let Some(max_width) = criteria.max_width {
            sql.push_str(" AND m.width <= ?");
            bindings.push(Box::new(max_width));
        }
        if let Some(min_duration) = criteria.min_duration {
            sql.push_str(" AND m.duration_sec >= ?");
            bindings.push(Box::new(min_duration));
        }
        if let Some(max_duration) = criteria.max_duration {
            sql.push_str(" AND m.duration_sec <= ?");
            bindings.push(Box::new(max_duration));
        }
        sql.push_str(" ORDER BY f.path");

        let mut stmt = self.conn.prepare(&sql)?;
        let binding_refs: Vec<&dyn rusqlite::ToSql> =
            bindings.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(binding_refs.as_slice(), |row| {
            let file_id: String = row.get(0)?;
            let path: String = row.get(1)?;
            let size: i64 = row.get(2)?;
            let content_hash: Option<String> = row.get(3)?;
            let file_name: Option<String> = row.get(4)?;
            let width: Option<u32> = row.get(5)?;
            let height: Option<u32> = row.get(6)?;
            let duration_sec: Option<f64> = row.get(7)?;
            let capture_date: Option<String> = row.get(8)?;
            let dhash: Option<i64> = row.get(9)?;
            let video_duration: Option<f64> = row.get(10)?;
            let video_width: Option<u32> = row.get(11)?;
            let video_height: Option<u32> = row.get(12)?;
            let frame_hashes: Option<String> = row.get(13)?;
            let sample_times: Option<String> = row.get(14)?;
            let video_computed_at: Option<String> = row.get(15)?;
            Ok((
                file_id,
                path,
                size,
                content_hash,
                file_name,
                width,
                height,
                duration_sec,
                capture_date,
                dhash,
                video_duration,
                video_width,
                video_height,
                frame_hashes,
                sample_times,
                video_computed_at,
            ))
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let (
                file_id,
                path,
                size,
                content_hash,
                file_name,
                width,
                height,
                duration_sec,
                capture_date,
                dhash,
                video_duration,
                video_width,
                video_height,
                frame_hashes,
                sample_times,
                video_computed_at,
            ) = row?;

            let file_id = Uuid::parse_str(&file_id)
                .map_err(|_| DedupError::SchemaCorrupted(format!("bad file id {file_id}")))?;
            let path = PathBuf::from(path);
            let dhash = dhash.map(|h| h as u64);

            if let Some(prefix) = criteria.dhash_prefix {
                if dhash.map(|h| (h >> 48) as u16) != Some(prefix) {
                    continue;
                }
            }

            let video = match (video_duration, frame_hashes, sample_times) {
                (Some(duration_sec), Some(hashes), Some(times)) => Some(VideoSignature {
                    file_id,
                    duration_sec,
                    width: video_width.unwrap_or(0),
                    height: video_height.unwrap_or(0),
                    frame_hashes: serde_json::from_str(&hashes).unwrap_or_default(),
                    sample_times_sec: serde_json::from_str(&times).unwrap_or_default(),
                    computed_at: video_computed_at
                        .as_deref()
                        .and_then(parse_ts)
                        .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                }),
                _ => None,
            };

            let file_name = file_name.unwrap_or_else(|| {
                path.file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string()
            });

            candidates.push(CandidateRow {
                file_id,
                path,
                file_name,
                class,
                size: size as u64,
                content_hash,
                width,
                height,
                duration_sec,
                capture_date: parse_ts_opt(capture_date),
                dhash,
                video,
            });
        }
        Ok(candidates)
    }

    /// Reverse lookup from a file id to its current path.
    pub fn resolve_path(&self, file_id: Uuid) -> Result<Option<PathBuf>> {
        self.conn
            .query_row(
                "SELECT path FROM files WHERE id = ?1",
                params![file_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|p| p.map(PathBuf::from))
            .map_err(DedupError::from)
    }

    /// Explicit un-index of a file; signatures, metadata and memberships
    /// cascade.
    pub fn remove_file(&mut self, file_id: Uuid) -> Result<()> {
        with_retry(|| {
            self.conn.execute(
                "DELETE FROM files WHERE id = ?1",
                params![file_id.to_string()],
            )
        })?;
        Ok(())
    }

    /// Persist a freshly built group and its members; returns the group id.
    pub fn save_group(&mut self, group: &DuplicateGroup) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO duplicate_groups
               (media_class, confidence, rationale, incomplete, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                group.media_class.as_str(),
                group.confidence,
                serde_json::to_string(&group.rationale)?,
                group.incomplete as i64,
                group.state.as_str(),
                fmt_ts(&OffsetDateTime::now_utc()),
            ],
        )?;
        let group_id = tx.last_insert_rowid();
        for member in &group.members {
            tx.execute(
                "INSERT INTO group_members
                   (group_id, file_id, confidence, signals, penalties, keeper_suggestion)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    group_id,
                    member.file_id.to_string(),
                    member.confidence,
                    serde_json::to_string(&member.signals)?,
                    serde_json::to_string(&member.penalties)?,
                    member.keeper_suggestion as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(group_id)
    }

    pub fn fetch_group(&self, group_id: i64) -> Result<Option<DuplicateGroup>> {
        let header = self
            .conn
            .query_row(
                "SELECT media_class, confidence, rationale, incomplete, state
                 FROM duplicate_groups WHERE id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((class, confidence, rationale, incomplete, state)) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT file_id, confidence, signals, penalties, keeper_suggestion
             FROM group_members WHERE group_id = ?1 ORDER BY file_id",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut members = Vec::new();
        for row in rows {
            let (file_id, confidence, signals, penalties, keeper_suggestion) = row?;
            members.push(GroupMember {
                file_id: Uuid::parse_str(&file_id)
                    .map_err(|_| DedupError::SchemaCorrupted(format!("bad file id {file_id}")))?,
                confidence,
                signals: serde_json::from_str::<Vec<Signal>>(&signals).unwrap_or_default(),
                penalties: serde_json::from_str::<Vec<Penalty>>(&penalties).unwrap_or_default(),
                keeper_suggestion: keeper_suggestion != 0,
            });
        }

        Ok(Some(DuplicateGroup {
            id: group_id,
            media_class: MediaClass::parse(&class)
                .ok_or_else(|| DedupError::SchemaCorrupted(format!("bad media class {class}")))?,
            confidence,
            rationale: serde_json::from_str(&rationale).unwrap_or_default(),
            incomplete: incomplete != 0,
            state: GroupState::parse(&state)
                .ok_or_else(|| DedupError::SchemaCorrupted(format!("bad group state {state}")))?,
            members,
        }))
    }

    pub fn fetch_groups(&self, state: Option<GroupState>) -> Result<Vec<DuplicateGroup>> {
        let ids: Vec<i64> = match state {
            Some(state) => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT id FROM duplicate_groups WHERE state = ?1 ORDER BY id")?;
                let rows = stmt.query_map(params![state.as_str()], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT id FROM duplicate_groups ORDER BY id")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(group) = self.fetch_group(id)? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// Advance a group through its lifecycle. The stored state must match
    /// `expected` and the transition must be legal.
    pub fn update_group_state(
        &mut self,
        group_id: i64,
        expected: GroupState,
        next: GroupState,
    ) -> Result<()> {
        if !expected.can_transition(next) {
            return Err(DedupError::StateMismatch {
                expected: format!("transition from {}", expected.as_str()),
                found: next.as_str().to_string(),
            });
        }
        let updated = with_retry(|| {
            self.conn.execute(
                "UPDATE duplicate_groups SET state = ?1 WHERE id = ?2 AND state = ?3",
                params![next.as_str(), group_id, expected.as_str()],
            )
        })?;
        if updated != 1 {
            let found: Option<String> = self
                .conn
                .query_row(
                    "SELECT state FROM duplicate_groups WHERE id = ?1",
                    params![group_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(DedupError::StateMismatch {
                expected: expected.as_str().to_string(),
                found: found.unwrap_or_else(|| "missing".to_string()),
            });
        }
        Ok(())
    }

    /// Drop groups from earlier runs that never reached a merge, keeping
    /// merged/undone history intact.
    pub fn prune_unmerged_groups(&mut self) -> Result<usize> {
        let deleted = with_retry(|| {
            self.conn.execute(
                "DELETE FROM duplicate_groups WHERE state IN ('open', 'complete', 'planned', 'abandoned')",
                [],
            )
        })?;
        Ok(deleted)
    }

    /// Append to the transaction log. Durable once this returns.
    pub fn record_transaction(&mut self, tx: &NewMergeTransaction) -> Result<i64> {
        let removed = serde_json::to_string(
            &tx.removed_file_ids
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>(),
        )?;
        with_retry(|| {
            self.conn.execute(
                "INSERT INTO merge_transactions
                   (group_id, keeper_file_id, removed_file_ids, created_at,
                    undo_deadline, metadata_snapshot, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tx.group_id,
                    tx.keeper_file_id.to_string(),
                    removed,
                    fmt_ts(&OffsetDateTime::now_utc()),
                    fmt_ts(&tx.undo_deadline),
                    tx.metadata_snapshot_json,
                    tx.state.as_str(),
                ],
            )
        })?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn transaction(&self, id: i64) -> Result<Option<MergeTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, keeper_file_id, removed_file_ids, created_at,
                    undo_deadline, metadata_snapshot, state
             FROM merge_transactions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], transaction_from_row)?;
        rows.next().transpose().map_err(DedupError::from)
    }

    fn newest_committed(&self) -> Result<Option<MergeTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, keeper_file_id, removed_file_ids, created_at,
                    undo_deadline, metadata_snapshot, state
             FROM merge_transactions WHERE state = 'committed'
             ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], transaction_from_row)?;
        rows.next().transpose().map_err(DedupError::from)
    }

    /// Atomically mark the newest committed transaction undone and return
    /// it. A transaction is undoable iff it is committed, within its undo
    /// deadline, and within `undo_depth` positions of the top of the log.
    pub fn undo_last_transaction(
        &mut self,
        now: OffsetDateTime,
        undo_depth: usize,
    ) -> Result<Option<MergeTransaction>> {
        let Some(mut tx) = self.newest_committed()? else {
            return Ok(None);
        };

        if now > tx.undo_deadline {
            return Err(DedupError::StateMismatch {
                expected: "within undo deadline".to_string(),
                found: format!("deadline passed at {}", fmt_ts(&tx.undo_deadline)),
            });
        }
        let newer: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM merge_transactions WHERE id > ?1",
            params![tx.id],
            |row| row.get(0),
        )?;
        if newer as usize + 1 > undo_depth {
            return Err(DedupError::StateMismatch {
                expected: format!("position within undo depth {undo_depth}"),
                found: format!("position {}", newer + 1),
            });
        }

        let updated = with_retry(|| {
            self.conn.execute(
                "UPDATE merge_transactions SET state = 'undone'
                 WHERE id = ?1 AND state = 'committed'",
                params![tx.id],
            )
        })?;
        if updated != 1 {
            return Err(DedupError::StateMismatch {
                expected: "committed".to_string(),
                found: "concurrently changed".to_string(),
            });
        }
        tx.state = TransactionState::Undone;
        Ok(Some(tx))
    }

    pub fn mark_transaction(&mut self, id: i64, state: TransactionState) -> Result<()> {
        let updated = with_retry(|| {
            self.conn.execute(
                "UPDATE merge_transactions SET state = ?1 WHERE id = ?2",
                params![state.as_str(), id],
            )
        })?;
        if updated != 1 {
            return Err(DedupError::TransactionNotFound);
        }
        Ok(())
    }

    /// Delete transactions past their undo deadline and return them so the
    /// caller can empty their trash staging directories.
    pub fn cleanup_transactions(&mut self, now: OffsetDateTime) -> Result<Vec<MergeTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, keeper_file_id, removed_file_ids, created_at,
                    undo_deadline, metadata_snapshot, state
             FROM merge_transactions ORDER BY id",
        )?;
        let rows = stmt.query_map([], transaction_from_row)?;
        let mut expired = Vec::new();
        for row in rows {
            let tx = row?;
            if now > tx.undo_deadline {
                expired.push(tx);
            }
        }
        drop(stmt);

        for tx in &expired {
            with_retry(|| {
                self.conn.execute(
                    "DELETE FROM merge_transactions WHERE id = ?1",
                    params![tx.id],
                )
            })?;
        }
        Ok(expired)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let mut stats = IndexStats::default();
        let mut stmt = self
            .conn
            .prepare("SELECT class, COUNT(*) FROM files GROUP BY class")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (class, count) = row?;
            match MediaClass::parse(&class) {
                Some(MediaClass::Photo) => stats.photos = count as u64,
                Some(MediaClass::Video) => stats.videos = count as u64,
                Some(MediaClass::Audio) => stats.audio = count as u64,
                None => {}
            }
        }
        drop(stmt);

        stats.image_signatures = self
            .conn
            .query_row("SELECT COUNT(*) FROM image_signatures", [], |r| {
                r.get::<_, i64>(0)
            })? as u64;
        stats.video_signatures = self
            .conn
            .query_row("SELECT COUNT(*) FROM video_signatures", [], |r| {
                r.get::<_, i64>(0)
            })? as u64;
        stats.groups = self
            .conn
            .query_row("SELECT COUNT(*) FROM duplicate_groups", [], |r| {
                r.get::<_, i64>(0)
            })? as u64;
        stats.committed_transactions = self.conn.query_row(
            "SELECT COUNT(*) FROM merge_transactions WHERE state = 'committed'",
            [],
            |r| r.get::<_, i64>(0),
        )? as u64;
        Ok(stats)
    }
}

fn transaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeTransaction> {
    let id: i64 = row.get(0)?;
    let group_id: i64 = row.get(1)?;
    let keeper: String = row.get(2)?;
    let removed: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let undo_deadline: String = row.get(5)?;
    let metadata_snapshot_json: String = row.get(6)?;
    let state: String = row.get(7)?;

    let removed_file_ids = serde_json::from_str::<Vec<String>>(&removed)
        .unwrap_or_default()
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();

    Ok(MergeTransaction {
        id,
        group_id,
        keeper_file_id: Uuid::parse_str(&keeper).unwrap_or_default(),
        removed_file_ids,
        created_at: parse_ts(&created_at).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        undo_deadline: parse_ts(&undo_deadline).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        metadata_snapshot_json,
        state: TransactionState::parse(&state).unwrap_or(TransactionState::Failed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration as TimeDuration;

    fn facts(path: &str, size: u64, mtime_epoch: i64) -> FileFacts {
        FileFacts {
            path: PathBuf::from(path),
            inode: None,
            size,
            created_at: None,
            modified_at: Some(OffsetDateTime::from_unix_timestamp(mtime_epoch).unwrap()),
            class: MediaClass::Photo,
            content_type: "image/jpeg".to_string(),
        }
    }

    #[test]
    fn test_upsert_is_stable_by_path() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let first = index.upsert_file(&facts("/p/a.jpg", 100, 1_700_000_000)).unwrap();
        assert!(first.changed);
        let second = index.upsert_file(&facts("/p/a.jpg", 100, 1_700_000_000)).unwrap();
        assert_eq!(first.file_id, second.file_id);
        assert!(!second.changed);
        let third = index.upsert_file(&facts("/p/a.jpg", 120, 1_700_000_000)).unwrap();
        assert_eq!(first.file_id, third.file_id);
        assert!(third.changed);
    }

    #[test]
    fn test_upsert_follows_rename_by_inode() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let mut original = facts("/p/a.jpg", 100, 1_700_000_000);
        original.inode = Some(42);
        let first = index.upsert_file(&original).unwrap();

        let mut renamed = facts("/p/b.jpg", 100, 1_700_000_000);
        renamed.inode = Some(42);
        let second = index.upsert_file(&renamed).unwrap();
        assert_eq!(first.file_id, second.file_id);
        assert_eq!(
            index.resolve_path(first.file_id).unwrap(),
            Some(PathBuf::from("/p/b.jpg"))
        );
    }

    #[test]
    fn test_image_signature_idempotent() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let outcome = index.upsert_file(&facts("/p/a.jpg", 100, 1_700_000_000)).unwrap();
        let sig = ImageSignature {
            file_id: outcome.file_id,
            algorithm: HashAlgorithm::DHash,
            hash: u64::MAX - 3,
            width: 4000,
            height: 3000,
            computed_at: OffsetDateTime::now_utc(),
        };
        index.save_image_signature(&sig).unwrap();
        index.save_image_signature(&sig).unwrap();
        assert!(index.has_image_signature(outcome.file_id, HashAlgorithm::DHash).unwrap());
        assert!(!index.has_image_signature(outcome.file_id, HashAlgorithm::PHash).unwrap());

        let candidates = index
            .fetch_candidates(MediaClass::Photo, &CandidateCriteria::default())
            .unwrap();
        assert_eq!(candidates.len(), 1);
        // u64 hashes survive the i64 storage round-trip.
        assert_eq!(candidates[0].dhash, Some(u64::MAX - 3));
    }

    #[test]
    fn test_should_skip_boundaries() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let mtime = OffsetDateTime::now_utc() - TimeDuration::hours(48);
        let mut f = facts("/p/a.jpg", 100, 0);
        f.modified_at = Some(mtime);
        index.upsert_file(&f).unwrap();

        let cutoff = OffsetDateTime::now_utc() - TimeDuration::hours(24);
        assert!(index.should_skip(Path::new("/p/a.jpg"), Some(mtime), 100, cutoff).unwrap());
        // Changed size rescans.
        assert!(!index.should_skip(Path::new("/p/a.jpg"), Some(mtime), 101, cutoff).unwrap());
        // Changed mtime rescans.
        assert!(
            !index
                .should_skip(
                    Path::new("/p/a.jpg"),
                    Some(mtime + TimeDuration::seconds(1)),
                    100,
                    cutoff
                )
                .unwrap()
        );
        // Unknown path rescans.
        assert!(!index.should_skip(Path::new("/p/x.jpg"), Some(mtime), 100, cutoff).unwrap());
        // mtime exactly at the cutoff rescans.
        let mut f2 = facts("/p/edge.jpg", 50, 0);
        f2.modified_at = Some(cutoff);
        index.upsert_file(&f2).unwrap();
        assert!(!index.should_skip(Path::new("/p/edge.jpg"), Some(cutoff), 50, cutoff).unwrap());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let outcome = index.upsert_file(&facts("/p/a.jpg", 100, 1_700_000_000)).unwrap();
        let mut meta = MediaMetadata {
            file_name: "a.jpg".to_string(),
            file_size: 100,
            media_class: MediaClass::Photo,
            created_at: Some(OffsetDateTime::from_unix_timestamp(1_690_000_000).unwrap()),
            modified_at: Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()),
            capture_date: None,
            width: Some(4000),
            height: Some(3000),
            duration_sec: None,
            camera_model: Some("X100V".to_string()),
            gps_lat: Some(12.345678),
            gps_lon: Some(-98.765432),
            keywords: vec!["alps".to_string()],
            tags: vec!["travel".to_string()],
            content_type: "image/jpeg".to_string(),
        };
        meta.normalize();
        index.save_metadata(outcome.file_id, &meta).unwrap();
        let loaded = index.metadata(outcome.file_id).unwrap().unwrap();
        assert_eq!(meta, loaded);
    }

    #[test]
    fn test_transaction_log_and_undo() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let keeper = Uuid::new_v4();
        let loser = Uuid::new_v4();
        let deadline = OffsetDateTime::now_utc() + TimeDuration::days(30);
        let tx_id = index
            .record_transaction(&NewMergeTransaction {
                group_id: 1,
                keeper_file_id: keeper,
                removed_file_ids: vec![loser],
                undo_deadline: deadline,
                metadata_snapshot_json: "{}".to_string(),
                state: TransactionState::Committed,
            })
            .unwrap();

        let now = OffsetDateTime::now_utc();
        let undone = index.undo_last_transaction(now, 10).unwrap().unwrap();
        assert_eq!(undone.id, tx_id);
        assert_eq!(undone.keeper_file_id, keeper);
        assert_eq!(undone.removed_file_ids, vec![loser]);
        assert_eq!(undone.state, TransactionState::Undone);

        // Nothing committed is left.
        assert!(index.undo_last_transaction(now, 10).unwrap().is_none());
        assert_eq!(
            index.transaction(tx_id).unwrap().unwrap().state,
            TransactionState::Undone
        );
    }

    #[test]
    fn test_undo_respects_deadline_and_depth() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let expired = NewMergeTransaction {
            group_id: 1,
            keeper_file_id: Uuid::new_v4(),
            removed_file_ids: vec![],
            undo_deadline: OffsetDateTime::now_utc() - TimeDuration::days(1),
            metadata_snapshot_json: "{}".to_string(),
            state: TransactionState::Committed,
        };
        index.record_transaction(&expired).unwrap();
        let err = index
            .undo_last_transaction(OffsetDateTime::now_utc(), 10)
            .unwrap_err();
        assert!(matches!(err, DedupError::StateMismatch { .. }));

        // A committed transaction buried under newer entries is beyond the
        // undo depth.
        let mut index = FileIndex::open_in_memory().unwrap();
        let fresh = NewMergeTransaction {
            undo_deadline: OffsetDateTime::now_utc() + TimeDuration::days(30),
            ..expired.clone()
        };
        index.record_transaction(&fresh).unwrap();
        let failed = NewMergeTransaction {
            state: TransactionState::Failed,
            ..fresh.clone()
        };
        index.record_transaction(&failed).unwrap();
        let err = index
            .undo_last_transaction(OffsetDateTime::now_utc(), 1)
            .unwrap_err();
        assert!(matches!(err, DedupError::StateMismatch { .. }));
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let mut index = FileIndex::open_in_memory().unwrap();
        let base = NewMergeTransaction {
            group_id: 7,
            keeper_file_id: Uuid::new_v4(),
            removed_file_ids: vec![],
            undo_deadline: OffsetDateTime::now_utc() - TimeDuration::days(2),
            metadata_snapshot_json: "{}".to_string(),
            state: TransactionState::Committed,
        };
        index.record_transaction(&base).unwrap();
        let keep = NewMergeTransaction {
            undo_deadline: OffsetDateTime::now_utc() + TimeDuration::days(2),
            ..base
        };
        index.record_transaction(&keep).unwrap();

        let expired = index.cleanup_transactions(OffsetDateTime::now_utc()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].group_id, 7);
        assert_eq!(
            index.stats().unwrap().committed_transactions,
            1
        );
    }
}
