//! Embedded SQLite store for the indexing daemon.
//!
//! One database per library root at `<root>/.slidemanager/index.sqlite`.
//! Every operation is a single short transaction; payload writes and the
//! matching artifact/task transitions always commit together, so a reader
//! can never observe a `ready` artifact without its payload row.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::ErrorCode;
use crate::pptx::Aspect;

pub const DATA_DIR: &str = ".slidemanager";
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    path            TEXT NOT NULL UNIQUE,
    size            INTEGER NOT NULL,
    mtime           INTEGER NOT NULL,
    slide_count     INTEGER NOT NULL DEFAULT 0,
    slide_aspect    TEXT NOT NULL DEFAULT 'unknown',
    last_scanned_at TEXT,
    scan_error      TEXT,
    missing         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS pages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id    INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    page_no    INTEGER NOT NULL,
    aspect     TEXT NOT NULL DEFAULT 'unknown',
    src_size   INTEGER NOT NULL,
    src_mtime  INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (file_id, page_no)
);

CREATE TABLE IF NOT EXISTS artifacts (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id       INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    kind          TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'missing',
    updated_at    TEXT NOT NULL,
    params_json   TEXT,
    error_code    TEXT,
    error_message TEXT,
    attempts      INTEGER NOT NULL DEFAULT 0,
    UNIQUE (page_id, kind)
);

CREATE TABLE IF NOT EXISTS page_text (
    page_id    INTEGER PRIMARY KEY REFERENCES pages(id) ON DELETE CASCADE,
    raw_text   TEXT NOT NULL,
    norm_text  TEXT NOT NULL,
    text_sig   TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thumbnails (
    page_id    INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    aspect     TEXT NOT NULL,
    width      INTEGER NOT NULL,
    height     INTEGER NOT NULL,
    image_path TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (page_id, aspect, width, height)
);

CREATE TABLE IF NOT EXISTS embedding_cache_text (
    model      TEXT NOT NULL,
    text_sig   TEXT NOT NULL,
    dim        INTEGER NOT NULL,
    vector     BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (model, text_sig)
);

CREATE TABLE IF NOT EXISTS page_text_embedding (
    page_id    INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    model      TEXT NOT NULL,
    text_sig   TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (page_id, model),
    FOREIGN KEY (model, text_sig) REFERENCES embedding_cache_text(model, text_sig)
);

CREATE TABLE IF NOT EXISTS page_image_embedding (
    page_id    INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    model      TEXT NOT NULL,
    dim        INTEGER NOT NULL,
    vector     BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (page_id, model)
);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_pages USING fts5(
    page_id UNINDEXED,
    norm_text
);

CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    library_root TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'created',
    options_json TEXT NOT NULL,
    summary_json TEXT,
    created_at   TEXT NOT NULL,
    started_at   INTEGER,
    finished_at  INTEGER
);

CREATE TABLE IF NOT EXISTS tasks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id        TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    page_id       INTEGER REFERENCES pages(id) ON DELETE CASCADE,
    file_id       INTEGER REFERENCES files(id) ON DELETE CASCADE,
    kind          TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'queued',
    priority      INTEGER NOT NULL DEFAULT 0,
    depends_on    INTEGER REFERENCES tasks(id),
    started_at    INTEGER,
    heartbeat_at  INTEGER,
    finished_at   INTEGER,
    progress      REAL NOT NULL DEFAULT 0,
    message       TEXT,
    error_code    TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_job_kind_status ON tasks(job_id, kind, status);
CREATE INDEX IF NOT EXISTS idx_artifacts_kind_status ON artifacts(kind, status);

CREATE TABLE IF NOT EXISTS events (
    job_id       TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    seq          INTEGER NOT NULL,
    event_type   TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (job_id, seq)
);
"#;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("store corrupted: {0}")]
    Corrupted(String),
    #[error("stored vector is {actual} bytes, expected {expected} for dim {dim}")]
    DimMismatch {
        dim: usize,
        expected: usize,
        actual: usize,
    },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DimMismatch { .. } => ErrorCode::EmbedDimMismatch,
            Self::Corrupted(_) => ErrorCode::JsonCorrupted,
            _ => ErrorCode::StoreConflict,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Row vocabulary
// ---------------------------------------------------------------------------

/// The five per-page artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Text,
    Thumb,
    TextVec,
    ImgVec,
    Bm25,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        Self::Text,
        Self::Thumb,
        Self::TextVec,
        Self::ImgVec,
        Self::Bm25,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thumb => "thumb",
            Self::TextVec => "text_vec",
            Self::ImgVec => "img_vec",
            Self::Bm25 => "bm25",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Missing,
    Queued,
    Running,
    Ready,
    Skipped,
    Error,
    Cancelled,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "missing" => Self::Missing,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "ready" => Self::Ready,
            "skipped" => Self::Skipped,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

/// Task kinds: the five artifact kinds plus the file-scoped PDF conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Text,
    Pdf,
    Thumb,
    TextVec,
    ImgVec,
    Bm25,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Pdf => "pdf",
            Self::Thumb => "thumb",
            Self::TextVec => "text_vec",
            Self::ImgVec => "img_vec",
            Self::Bm25 => "bm25",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "text" => Self::Text,
            "pdf" => Self::Pdf,
            "thumb" => Self::Thumb,
            "text_vec" => Self::TextVec,
            "img_vec" => Self::ImgVec,
            "bm25" => Self::Bm25,
            _ => return None,
        })
    }

    /// The artifact a task of this kind materializes; `None` for the
    /// file-scoped PDF task.
    pub fn artifact_kind(&self) -> Option<ArtifactKind> {
        match self {
            Self::Text => Some(ArtifactKind::Text),
            Self::Pdf => None,
            Self::Thumb => Some(ArtifactKind::Thumb),
            Self::TextVec => Some(ArtifactKind::TextVec),
            Self::ImgVec => Some(ArtifactKind::ImgVec),
            Self::Bm25 => Some(ArtifactKind::Bm25),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Finished,
    Error,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "finished" => Self::Finished,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            "skipped" => Self::Skipped,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Planning,
    Running,
    Paused,
    CancelRequested,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::CancelRequested => "cancel_requested",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "planning" => Self::Planning,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "cancel_requested" => Self::CancelRequested,
            "cancelled" => Self::Cancelled,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub mtime: i64,
    pub slide_count: u32,
    pub slide_aspect: Aspect,
    pub scan_error: Option<String>,
    pub missing: bool,
}

#[derive(Debug, Clone)]
pub struct PageRow {
    pub id: i64,
    pub file_id: i64,
    pub page_no: u32,
    pub aspect: Aspect,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub job_id: String,
    pub page_id: Option<i64>,
    pub file_id: Option<i64>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub heartbeat_at: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub library_root: String,
    pub status: JobStatus,
    pub options_json: String,
    pub summary_json: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct PageTextRow {
    pub page_id: i64,
    pub raw_text: String,
    pub norm_text: String,
    pub text_sig: String,
}

#[derive(Debug, Clone)]
pub struct ThumbnailRow {
    pub page_id: i64,
    pub aspect: Aspect,
    pub width: u32,
    pub height: u32,
    pub image_path: String,
}

/// Artifact status counts for one kind.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KindCounters {
    pub queued: u64,
    pub running: u64,
    pub ready: u64,
    pub error: u64,
    pub cancelled: u64,
}

/// The full five-kind counter block carried by snapshots and status reads.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub text: KindCounters,
    pub thumb: KindCounters,
    pub text_vec: KindCounters,
    pub img_vec: KindCounters,
    pub bm25: KindCounters,
}

impl Counters {
    pub fn kind(&self, kind: ArtifactKind) -> &KindCounters {
        match kind {
            ArtifactKind::Text => &self.text,
            ArtifactKind::Thumb => &self.thumb,
            ArtifactKind::TextVec => &self.text_vec,
            ArtifactKind::ImgVec => &self.img_vec,
            ArtifactKind::Bm25 => &self.bm25,
        }
    }

    fn kind_mut(&mut self, kind: ArtifactKind) -> &mut KindCounters {
        match kind {
            ArtifactKind::Text => &mut self.text,
            ArtifactKind::Thumb => &mut self.thumb,
            ArtifactKind::TextVec => &mut self.text_vec,
            ArtifactKind::ImgVec => &mut self.img_vec,
            ArtifactKind::Bm25 => &mut self.bm25,
        }
    }
}

/// Identity of the task a snapshot reports as currently running.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    pub task_id: i64,
    pub kind: String,
    pub page_id: Option<i64>,
    pub file_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCount {
    pub code: String,
    pub count: u64,
}

/// A page-text checkpoint entry for batched commits.
#[derive(Debug, Clone)]
pub struct PageTextCommit {
    pub task_id: i64,
    pub page_id: i64,
    pub raw_text: String,
    pub norm_text: String,
    pub text_sig: String,
}

// ---------------------------------------------------------------------------
// Blob helpers
// ---------------------------------------------------------------------------

/// Encode a vector as contiguous little-endian f32 bytes.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    library_root: PathBuf,
    data_dir: PathBuf,
}

impl Store {
    /// Open (or create) the store for a library root.
    pub fn open(library_root: &Path) -> StoreResult<Self> {
        let data_dir = library_root.join(DATA_DIR);
        std::fs::create_dir_all(data_dir.join("thumbs"))?;
        std::fs::create_dir_all(data_dir.join("pdf"))?;
        std::fs::create_dir_all(data_dir.join("logs").join("jobs"))?;

        let db_path = data_dir.join("index.sqlite");
        let conn = Connection::open(&db_path)?;
        configure(&conn)?;
        migrate(&conn, &db_path)?;

        Ok(Self {
            conn: Mutex::new(conn),
            library_root: library_root.to_path_buf(),
            data_dir,
        })
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs").join("jobs")
    }

    pub fn pdf_path(&self, file_id: i64) -> PathBuf {
        self.data_dir.join("pdf").join(format!("{file_id}.pdf"))
    }

    pub fn thumb_path(
        &self,
        file_id: i64,
        page_no: u32,
        aspect: Aspect,
        width: u32,
        height: u32,
    ) -> PathBuf {
        let aspect = aspect.as_str().replace(':', "x");
        self.data_dir
            .join("thumbs")
            .join(file_id.to_string())
            .join(format!("{page_no}_{aspect}_{width}x{height}.jpg"))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    // -- files ---------------------------------------------------------------

    pub fn file_by_path(&self, path: &str) -> StoreResult<Option<FileRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, path, size, mtime, slide_count, slide_aspect, scan_error, missing
                 FROM files WHERE path = ?1",
                params![path],
                file_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn file(&self, file_id: i64) -> StoreResult<Option<FileRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, path, size, mtime, slide_count, slide_aspect, scan_error, missing
                 FROM files WHERE id = ?1",
                params![file_id],
                file_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or update a file row, keeping its id stable. Clears any
    /// previous missing flag and scan error.
    pub fn upsert_file(
        &self,
        path: &str,
        size: i64,
        mtime: i64,
        slide_count: u32,
        aspect: Aspect,
        scan_error: Option<&str>,
    ) -> StoreResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO files (path, size, mtime, slide_count, slide_aspect, last_scanned_at, scan_error, missing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
             ON CONFLICT(path) DO UPDATE SET
                 size = excluded.size,
                 mtime = excluded.mtime,
                 slide_count = excluded.slide_count,
                 slide_aspect = excluded.slide_aspect,
                 last_scanned_at = excluded.last_scanned_at,
                 scan_error = excluded.scan_error,
                 missing = 0",
            params![path, size, mtime, slide_count, aspect.as_str(), now_rfc3339(), scan_error],
        )?;
        let id = conn.query_row(
            "SELECT id FROM files WHERE path = ?1",
            params![path],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Flag files under this root that were not seen by the last scan.
    /// Rows are never deleted implicitly; `remove_file` is the explicit path.
    pub fn mark_missing_except(&self, seen_paths: &[String]) -> StoreResult<u64> {
        let seen: std::collections::HashSet<&str> =
            seen_paths.iter().map(String::as_str).collect();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut flagged = 0;
        {
            let mut stmt = tx.prepare("SELECT id, path FROM files WHERE missing = 0")?;
            let rows: Vec<(i64, String)> = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<_, _>>()?;
            for (id, path) in rows {
                if !seen.contains(path.as_str()) {
                    tx.execute("UPDATE files SET missing = 1 WHERE id = ?1", params![id])?;
                    flagged += 1;
                }
            }
        }
        tx.commit()?;
        Ok(flagged)
    }

    /// Explicit user-driven removal: cascades to pages, artifacts, payloads.
    pub fn remove_file(&self, file_id: i64) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let page_ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM pages WHERE file_id = ?1")?;
            let ids = stmt
                .query_map(params![file_id], |r| r.get(0))?
                .collect::<Result<_, _>>()?;
            ids
        };
        for page_id in page_ids {
            tx.execute("DELETE FROM fts_pages WHERE page_id = ?1", params![page_id])?;
        }
        tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        tx.commit()?;
        Ok(())
    }

    // -- pages & artifacts ---------------------------------------------------

    /// Make page rows match the file's slide count: create missing pages
    /// (with their five artifact rows) and drop pages past the count.
    /// Idempotent on unchanged files.
    pub fn sync_pages(
        &self,
        file_id: i64,
        slide_count: u32,
        aspect: Aspect,
        src_size: i64,
        src_mtime: i64,
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        for page_no in 1..=slide_count {
            tx.execute(
                "INSERT INTO pages (file_id, page_no, aspect, src_size, src_mtime, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(file_id, page_no) DO UPDATE SET
                     aspect = excluded.aspect,
                     src_size = excluded.src_size,
                     src_mtime = excluded.src_mtime",
                params![file_id, page_no, aspect.as_str(), src_size, src_mtime, now],
            )?;
            let page_id: i64 = tx.query_row(
                "SELECT id FROM pages WHERE file_id = ?1 AND page_no = ?2",
                params![file_id, page_no],
                |r| r.get(0),
            )?;
            for kind in ArtifactKind::ALL {
                tx.execute(
                    "INSERT OR IGNORE INTO artifacts (page_id, kind, status, updated_at)
                     VALUES (?1, ?2, 'missing', ?3)",
                    params![page_id, kind.as_str(), now],
                )?;
            }
        }
        {
            let mut stmt =
                tx.prepare("SELECT id FROM pages WHERE file_id = ?1 AND page_no > ?2")?;
            let stale: Vec<i64> = stmt
                .query_map(params![file_id, slide_count], |r| r.get(0))?
                .collect::<Result<_, _>>()?;
            for page_id in stale {
                tx.execute("DELETE FROM fts_pages WHERE page_id = ?1", params![page_id])?;
                tx.execute("DELETE FROM pages WHERE id = ?1", params![page_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Reset a changed file's artifacts to `missing` so the next plan
    /// re-derives them. Content-addressed caches make unchanged text free.
    pub fn reset_file_artifacts(&self, file_id: i64) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE artifacts SET status = 'missing', error_code = NULL, error_message = NULL,
                    updated_at = ?2
             WHERE page_id IN (SELECT id FROM pages WHERE file_id = ?1)",
            params![file_id, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn page(&self, page_id: i64) -> StoreResult<Option<PageRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, file_id, page_no, aspect FROM pages WHERE id = ?1",
                params![page_id],
                page_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn pages_for_file(&self, file_id: i64) -> StoreResult<Vec<PageRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, file_id, page_no, aspect FROM pages WHERE file_id = ?1 ORDER BY page_no",
        )?;
        let rows = stmt
            .query_map(params![file_id], page_from_row)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn artifact_status(
        &self,
        page_id: i64,
        kind: ArtifactKind,
    ) -> StoreResult<Option<ArtifactStatus>> {
        let conn = self.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM artifacts WHERE page_id = ?1 AND kind = ?2",
                params![page_id, kind.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| ArtifactStatus::parse(&s)))
    }

    pub fn artifact_error_code(
        &self,
        page_id: i64,
        kind: ArtifactKind,
    ) -> StoreResult<Option<String>> {
        let conn = self.lock();
        let code: Option<Option<String>> = conn
            .query_row(
                "SELECT error_code FROM artifacts WHERE page_id = ?1 AND kind = ?2",
                params![page_id, kind.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(code.flatten())
    }

    // -- planning ------------------------------------------------------------

    /// Queue work for one file: artifacts in `missing` (or any non-terminal
    /// leftovers from a dead job; everything under `force_rebuild`) become
    /// `queued` with one task each, plus a file-scoped PDF task when
    /// thumbnails are wanted. Returns the number of tasks inserted.
    pub fn plan_file(
        &self,
        job_id: &str,
        file_id: i64,
        options: &crate::config::IndexOptions,
    ) -> StoreResult<u64> {
        let enabled: Vec<ArtifactKind> = ArtifactKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                ArtifactKind::Text => options.enable_text,
                ArtifactKind::Thumb => options.enable_thumb,
                ArtifactKind::TextVec => options.enable_text_vec,
                ArtifactKind::ImgVec => options.enable_img_vec,
                ArtifactKind::Bm25 => options.enable_bm25,
            })
            .collect();

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let mut inserted = 0u64;

        let page_ids: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT id FROM pages WHERE file_id = ?1 ORDER BY page_no")?;
            let ids = stmt
                .query_map(params![file_id], |r| r.get(0))?
                .collect::<Result<_, _>>()?;
            ids
        };

        let mut thumbs_queued = false;
        for kind in &enabled {
            for &page_id in &page_ids {
                // A dependent kind whose dependency is disabled and not
                // already materialized can never run; leave it `missing`
                // rather than queueing unsatisfiable work.
                let dependency = match kind {
                    ArtifactKind::TextVec | ArtifactKind::Bm25 if !options.enable_text => {
                        Some(ArtifactKind::Text)
                    }
                    ArtifactKind::ImgVec if !options.enable_thumb => Some(ArtifactKind::Thumb),
                    _ => None,
                };
                if let Some(dep) = dependency {
                    let dep_status: String = tx.query_row(
                        "SELECT status FROM artifacts WHERE page_id = ?1 AND kind = ?2",
                        params![page_id, dep.as_str()],
                        |r| r.get(0),
                    )?;
                    if dep_status != "ready" {
                        continue;
                    }
                }
                let status: String = tx.query_row(
                    "SELECT status FROM artifacts WHERE page_id = ?1 AND kind = ?2",
                    params![page_id, kind.as_str()],
                    |r| r.get(0),
                )?;
                let requeue = if options.force_rebuild {
                    true
                } else {
                    // `queued`/`running` without a live task are leftovers
                    // from a job that died; adopt them.
                    matches!(status.as_str(), "missing" | "queued" | "running")
                };
                if !requeue {
                    continue;
                }
                let live_tasks: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM tasks
                     WHERE job_id = ?1 AND page_id = ?2 AND kind = ?3
                       AND status IN ('queued', 'running')",
                    params![job_id, page_id, kind.as_str()],
                    |r| r.get(0),
                )?;
                if live_tasks > 0 {
                    continue;
                }
                tx.execute(
                    "UPDATE artifacts SET status = 'queued', error_code = NULL,
                            error_message = NULL, updated_at = ?3
                     WHERE page_id = ?1 AND kind = ?2",
                    params![page_id, kind.as_str(), now],
                )?;
                tx.execute(
                    "INSERT INTO tasks (job_id, page_id, file_id, kind, status)
                     VALUES (?1, ?2, ?3, ?4, 'queued')",
                    params![job_id, page_id, file_id, kind.as_str()],
                )?;
                inserted += 1;
                if *kind == ArtifactKind::Thumb {
                    thumbs_queued = true;
                }
            }
        }

        if thumbs_queued {
            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND file_id = ?2 AND kind = 'pdf'",
                params![job_id, file_id],
                |r| r.get(0),
            )?;
            if existing == 0 {
                tx.execute(
                    "INSERT INTO tasks (job_id, file_id, kind, status, priority)
                     VALUES (?1, ?2, 'pdf', 'queued', 10)",
                    params![job_id, file_id],
                )?;
                inserted += 1;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    // -- task lifecycle ------------------------------------------------------

    /// Atomically claim the next runnable task of a kind, honoring the
    /// dependency order: thumb waits for the file's PDF, text_vec/bm25 wait
    /// for text=ready, img_vec waits for thumb=ready.
    pub fn claim_next_task(&self, job_id: &str, kind: TaskKind) -> StoreResult<Option<TaskRow>> {
        let dep_clause = match kind {
            TaskKind::Text | TaskKind::Pdf => "",
            TaskKind::Thumb => {
                "AND EXISTS (SELECT 1 FROM tasks d JOIN pages pg ON pg.id = t.page_id
                             WHERE d.job_id = t.job_id AND d.kind = 'pdf'
                               AND d.file_id = pg.file_id AND d.status = 'finished')"
            }
            TaskKind::TextVec | TaskKind::Bm25 => {
                "AND EXISTS (SELECT 1 FROM artifacts a WHERE a.page_id = t.page_id
                               AND a.kind = 'text' AND a.status = 'ready')"
            }
            TaskKind::ImgVec => {
                "AND EXISTS (SELECT 1 FROM artifacts a WHERE a.page_id = t.page_id
                               AND a.kind = 'thumb' AND a.status = 'ready')"
            }
        };
        let sql = format!(
            "SELECT t.id, t.page_id, t.file_id FROM tasks t
             WHERE t.job_id = ?1 AND t.kind = ?2 AND t.status = 'queued' {dep_clause}
             ORDER BY t.priority DESC, t.id LIMIT 1"
        );

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let claimed = tx
            .query_row(&sql, params![job_id, kind.as_str()], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<i64>>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                ))
            })
            .optional()?;
        let Some((task_id, page_id, file_id)) = claimed else {
            return Ok(None);
        };
        let now = now_epoch();
        tx.execute(
            "UPDATE tasks SET status = 'running', started_at = ?2, heartbeat_at = ?2
             WHERE id = ?1",
            params![task_id, now],
        )?;
        if let (Some(page_id), Some(artifact)) = (page_id, kind.artifact_kind()) {
            tx.execute(
                "UPDATE artifacts SET status = 'running', attempts = attempts + 1,
                        updated_at = ?3
                 WHERE page_id = ?1 AND kind = ?2",
                params![page_id, artifact.as_str(), now_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(Some(TaskRow {
            id: task_id,
            job_id: job_id.to_string(),
            page_id,
            file_id,
            kind,
            status: TaskStatus::Running,
            heartbeat_at: Some(now),
            error_code: None,
            error_message: None,
        }))
    }

    pub fn heartbeat(&self, task_id: i64) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET heartbeat_at = ?2 WHERE id = ?1 AND status = 'running'",
            params![task_id, now_epoch()],
        )?;
        Ok(())
    }

    /// Tasks of this kind that are not yet terminal (queued or running).
    pub fn pending_count(&self, job_id: &str, kind: TaskKind) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE job_id = ?1 AND kind = ?2 AND status IN ('queued', 'running')",
            params![job_id, kind.as_str()],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn non_terminal_task_count(&self, job_id: &str) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND status IN ('queued', 'running')",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    // -- per-page checkpoints ------------------------------------------------

    /// The text checkpoint: payload, artifact `ready`, task `finished`, one
    /// transaction.
    pub fn commit_page_text(
        &self,
        task_id: i64,
        page_id: i64,
        raw_text: &str,
        norm_text: &str,
        text_sig: &str,
    ) -> StoreResult<()> {
        self.commit_page_text_batch(std::slice::from_ref(&PageTextCommit {
            task_id,
            page_id,
            raw_text: raw_text.to_string(),
            norm_text: norm_text.to_string(),
            text_sig: text_sig.to_string(),
        }))
    }

    /// Batched variant for `commit_every_pages > 1`: all entries become
    /// durable together.
    pub fn commit_page_text_batch(&self, entries: &[PageTextCommit]) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        for entry in entries {
            tx.execute(
                "INSERT OR REPLACE INTO page_text (page_id, raw_text, norm_text, text_sig, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![entry.page_id, entry.raw_text, entry.norm_text, entry.text_sig, now],
            )?;
            tx.execute(
                "UPDATE artifacts SET status = 'ready', error_code = NULL, error_message = NULL,
                        updated_at = ?2
                 WHERE page_id = ?1 AND kind = 'text'",
                params![entry.page_id, now],
            )?;
            finish_task(&tx, entry.task_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_page_text(&self, page_id: i64) -> StoreResult<Option<PageTextRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT page_id, raw_text, norm_text, text_sig FROM page_text WHERE page_id = ?1",
                params![page_id],
                |r| {
                    Ok(PageTextRow {
                        page_id: r.get(0)?,
                        raw_text: r.get(1)?,
                        norm_text: r.get(2)?,
                        text_sig: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn commit_thumbnail(
        &self,
        task_id: i64,
        page_id: i64,
        aspect: Aspect,
        width: u32,
        height: u32,
        image_path: &str,
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        tx.execute(
            "INSERT OR REPLACE INTO thumbnails (page_id, aspect, width, height, image_path, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![page_id, aspect.as_str(), width, height, image_path, now],
        )?;
        tx.execute(
            "UPDATE artifacts SET status = 'ready', error_code = NULL, error_message = NULL,
                    updated_at = ?2
             WHERE page_id = ?1 AND kind = 'thumb'",
            params![page_id, now],
        )?;
        finish_task(&tx, task_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_thumbnail(&self, page_id: i64) -> StoreResult<Option<ThumbnailRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT page_id, aspect, width, height, image_path FROM thumbnails
                 WHERE page_id = ?1 ORDER BY updated_at DESC LIMIT 1",
                params![page_id],
                |r| {
                    Ok(ThumbnailRow {
                        page_id: r.get(0)?,
                        aspect: Aspect::parse(&r.get::<_, String>(1)?),
                        width: r.get(2)?,
                        height: r.get(3)?,
                        image_path: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Look up the cached dim for a model, from any row.
    pub fn embedding_dim_for_model(&self, model: &str) -> StoreResult<Option<usize>> {
        let conn = self.lock();
        let dim: Option<i64> = conn
            .query_row(
                "SELECT dim FROM embedding_cache_text WHERE model = ?1 LIMIT 1",
                params![model],
                |r| r.get(0),
            )
            .optional()?;
        Ok(dim.map(|d| d as usize))
    }

    /// Content-addressed cache probe: `Some(dim)` on hit.
    pub fn text_embedding_cached(&self, model: &str, text_sig: &str) -> StoreResult<Option<usize>> {
        let conn = self.lock();
        let dim: Option<i64> = conn
            .query_row(
                "SELECT dim FROM embedding_cache_text WHERE model = ?1 AND text_sig = ?2",
                params![model, text_sig],
                |r| r.get(0),
            )
            .optional()?;
        Ok(dim.map(|d| d as usize))
    }

    /// Read a cached vector, validating blob length against its dim.
    pub fn get_cached_text_vector(
        &self,
        model: &str,
        text_sig: &str,
    ) -> StoreResult<Option<Vec<f32>>> {
        let conn = self.lock();
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT dim, vector FROM embedding_cache_text WHERE model = ?1 AND text_sig = ?2",
                params![model, text_sig],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((dim, blob)) => {
                let dim = dim as usize;
                if blob.len() != dim * 4 {
                    return Err(StoreError::DimMismatch {
                        dim,
                        expected: dim * 4,
                        actual: blob.len(),
                    });
                }
                Ok(Some(blob_to_vector(&blob)))
            }
        }
    }

    /// The text-vector checkpoint. `new_cache_entry` carries `(dim, blob)`
    /// when the vector came from upstream (or is the canonical zero vector)
    /// rather than the cache.
    pub fn commit_text_embedding(
        &self,
        task_id: i64,
        page_id: i64,
        model: &str,
        text_sig: &str,
        new_cache_entry: Option<(usize, &[u8])>,
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        if let Some((dim, blob)) = new_cache_entry {
            tx.execute(
                "INSERT OR IGNORE INTO embedding_cache_text (model, text_sig, dim, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![model, text_sig, dim as i64, blob, now],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO page_text_embedding (page_id, model, text_sig, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![page_id, model, text_sig, now],
        )?;
        tx.execute(
            "UPDATE artifacts SET status = 'ready', error_code = NULL, error_message = NULL,
                    updated_at = ?2
             WHERE page_id = ?1 AND kind = 'text_vec'",
            params![page_id, now],
        )?;
        finish_task(&tx, task_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_page_text_embedding_sig(
        &self,
        page_id: i64,
        model: &str,
    ) -> StoreResult<Option<String>> {
        let conn = self.lock();
        let sig = conn
            .query_row(
                "SELECT text_sig FROM page_text_embedding WHERE page_id = ?1 AND model = ?2",
                params![page_id, model],
                |r| r.get(0),
            )
            .optional()?;
        Ok(sig)
    }

    pub fn commit_image_embedding(
        &self,
        task_id: i64,
        page_id: i64,
        model: &str,
        dim: usize,
        blob: &[u8],
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        tx.execute(
            "INSERT OR REPLACE INTO page_image_embedding (page_id, model, dim, vector, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![page_id, model, dim as i64, blob, now],
        )?;
        tx.execute(
            "UPDATE artifacts SET status = 'ready', error_code = NULL, error_message = NULL,
                    updated_at = ?2
             WHERE page_id = ?1 AND kind = 'img_vec'",
            params![page_id, now],
        )?;
        finish_task(&tx, task_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Standalone FTS upsert (no task attached). Empty text keeps a row so
    /// deletion counts stay coherent.
    pub fn upsert_fts_page(&self, page_id: i64, norm_text: &str) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        fts_upsert(&tx, page_id, norm_text)?;
        tx.commit()?;
        Ok(())
    }

    /// The BM25 checkpoint.
    pub fn commit_fts_page(
        &self,
        task_id: i64,
        page_id: i64,
        norm_text: &str,
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        fts_upsert(&tx, page_id, norm_text)?;
        tx.execute(
            "UPDATE artifacts SET status = 'ready', error_code = NULL, error_message = NULL,
                    updated_at = ?2
             WHERE page_id = ?1 AND kind = 'bm25'",
            params![page_id, now_rfc3339()],
        )?;
        finish_task(&tx, task_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn fts_row_count(&self) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM fts_pages", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// PDF conversion has no artifact of its own; the task just finishes.
    pub fn finish_pdf_task(&self, task_id: i64) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        finish_task(&tx, task_id)?;
        tx.commit()?;
        Ok(())
    }

    // -- failure handling ----------------------------------------------------

    /// Page-scoped failure: task and artifact go to `error`, dependents are
    /// resolved so the queue drains. A failed `text` makes its page's
    /// text_vec/bm25 `skipped`; a failed `thumb` makes img_vec `error`.
    pub fn fail_page_task(
        &self,
        task_id: i64,
        page_id: i64,
        kind: ArtifactKind,
        code: ErrorCode,
        message: &str,
    ) -> StoreResult<Vec<(i64, ArtifactKind, ArtifactStatus)>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        mark_task_error(&tx, task_id, code, message)?;
        tx.execute(
            "UPDATE artifacts SET status = 'error', error_code = ?3, error_message = ?4,
                    updated_at = ?2
             WHERE page_id = ?1 AND kind = ?5",
            params![page_id, now, code.as_str(), message, kind.as_str()],
        )?;
        let cascaded = cascade_dependents(&tx, page_id, kind, code, message)?;
        tx.commit()?;
        Ok(cascaded)
    }

    /// File-scoped PDF failure sweep: the conversion task errors, and every
    /// page of the file gets thumb and img_vec errored in one transaction.
    /// Text and bm25 are untouched. Returns affected page ids.
    pub fn fail_pdf_task(
        &self,
        task_id: i64,
        file_id: i64,
        code: ErrorCode,
        message: &str,
    ) -> StoreResult<Vec<i64>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let job_id: String = tx.query_row(
            "SELECT job_id FROM tasks WHERE id = ?1",
            params![task_id],
            |r| r.get(0),
        )?;
        mark_task_error(&tx, task_id, code, message)?;
        let page_ids = sweep_pdf_failure(&tx, &job_id, file_id, code, message)?;
        tx.commit()?;
        Ok(page_ids)
    }

    /// Abort every queued task of one kind (used when auth fails: remaining
    /// text_vec work cannot succeed). Returns `(task_id, page_id)` pairs.
    pub fn abort_kind_tasks(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        code: ErrorCode,
        message: &str,
    ) -> StoreResult<Vec<(i64, i64)>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let rows: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, page_id FROM tasks
                 WHERE job_id = ?1 AND kind = ?2 AND status = 'queued'",
            )?;
            let rows = stmt
                .query_map(params![job_id, kind.as_str()], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?
                .collect::<Result<_, _>>()?;
            rows
        };
        for (task_id, page_id) in &rows {
            mark_task_error(&tx, *task_id, code, message)?;
            tx.execute(
                "UPDATE artifacts SET status = 'error', error_code = ?3, error_message = ?4,
                        updated_at = ?2
                 WHERE page_id = ?1 AND kind = ?5",
                params![page_id, now, code.as_str(), message, kind.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(rows)
    }

    /// Mid-work cancellation checkpoint.
    pub fn cancel_task(
        &self,
        task_id: i64,
        page_id: Option<i64>,
        kind: Option<ArtifactKind>,
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE tasks SET status = 'cancelled', finished_at = ?2 WHERE id = ?1",
            params![task_id, now_epoch()],
        )?;
        if let (Some(page_id), Some(kind)) = (page_id, kind) {
            tx.execute(
                "UPDATE artifacts SET status = 'cancelled', updated_at = ?2
                 WHERE page_id = ?1 AND kind = ?3",
                params![page_id, now_rfc3339(), kind.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Cancel sweep: all queued tasks (and their artifacts) become
    /// `cancelled`. Running tasks are preempted by their workers at the
    /// next checkpoint.
    pub fn cancel_pending(&self, job_id: &str) -> StoreResult<u64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let rows: Vec<(i64, Option<i64>, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, page_id, kind FROM tasks WHERE job_id = ?1 AND status = 'queued'",
            )?;
            let rows = stmt
                .query_map(params![job_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<Result<_, _>>()?;
            rows
        };
        for (task_id, page_id, kind) in &rows {
            tx.execute(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?2 WHERE id = ?1",
                params![task_id, now_epoch()],
            )?;
            if let (Some(page_id), Some(artifact)) = (
                page_id,
                TaskKind::parse(kind).and_then(|k| k.artifact_kind()),
            ) {
                tx.execute(
                    "UPDATE artifacts SET status = 'cancelled', updated_at = ?2
                     WHERE page_id = ?1 AND kind = ?3 AND status IN ('queued', 'running')",
                    params![page_id, now, artifact.as_str()],
                )?;
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    /// Terminal sweep: nothing may stay queued/running once the job ends.
    pub fn finalize_tasks(&self, job_id: &str, job_status: JobStatus) -> StoreResult<u64> {
        let target = if job_status == JobStatus::Cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Skipped
        };
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let rows: Vec<(i64, Option<i64>, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, page_id, kind FROM tasks
                 WHERE job_id = ?1 AND status IN ('queued', 'running')",
            )?;
            let rows = stmt
                .query_map(params![job_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<Result<_, _>>()?;
            rows
        };
        for (task_id, page_id, kind) in &rows {
            tx.execute(
                "UPDATE tasks SET status = ?2, finished_at = ?3 WHERE id = ?1",
                params![task_id, target.as_str(), now_epoch()],
            )?;
            if let (Some(page_id), Some(artifact)) = (
                page_id,
                TaskKind::parse(kind).and_then(|k| k.artifact_kind()),
            ) {
                tx.execute(
                    "UPDATE artifacts SET status = ?3, updated_at = ?2
                     WHERE page_id = ?1 AND kind = ?4 AND status IN ('queued', 'running')",
                    params![page_id, now, target.as_str(), artifact.as_str()],
                )?;
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    /// Watchdog sweep: running tasks whose heartbeat is older than the
    /// threshold become `error` with `WATCHDOG_TIMEOUT`; their artifacts
    /// follow. Returns the expired rows for event emission.
    pub fn expire_stale_tasks(
        &self,
        job_id: &str,
        threshold_sec: u64,
        now: i64,
    ) -> StoreResult<Vec<TaskRow>> {
        let cutoff = now - threshold_sec as i64;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let rows: Vec<(i64, Option<i64>, Option<i64>, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, page_id, file_id, kind FROM tasks
                 WHERE job_id = ?1 AND status = 'running' AND heartbeat_at < ?2",
            )?;
            let rows = stmt
                .query_map(params![job_id, cutoff], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<Result<_, _>>()?;
            rows
        };
        let message = format!("no heartbeat for over {threshold_sec}s");
        let mut expired = Vec::with_capacity(rows.len());
        for (task_id, page_id, file_id, kind) in rows {
            mark_task_error(&tx, task_id, ErrorCode::WatchdogTimeout, &message)?;
            let kind = TaskKind::parse(&kind)
                .ok_or_else(|| StoreError::Corrupted(format!("unknown task kind: {kind}")))?;
            if let (Some(page_id), Some(artifact)) = (page_id, kind.artifact_kind()) {
                tx.execute(
                    "UPDATE artifacts SET status = 'error', error_code = ?3, error_message = ?4,
                            updated_at = ?2
                     WHERE page_id = ?1 AND kind = ?5",
                    params![
                        page_id,
                        now_rfc3339(),
                        ErrorCode::WatchdogTimeout.as_str(),
                        message,
                        artifact.as_str()
                    ],
                )?;
                // A stalled dependency blocks its dependents the same way a
                // failed one does.
                cascade_dependents(&tx, page_id, artifact, ErrorCode::WatchdogTimeout, &message)?;
            }
            if kind == TaskKind::Pdf {
                if let Some(file_id) = file_id {
                    sweep_pdf_failure(&tx, job_id, file_id, ErrorCode::WatchdogTimeout, &message)?;
                }
            }
            expired.push(TaskRow {
                id: task_id,
                job_id: job_id.to_string(),
                page_id,
                file_id,
                kind,
                status: TaskStatus::Error,
                heartbeat_at: None,
                error_code: Some(ErrorCode::WatchdogTimeout.as_str().to_string()),
                error_message: Some(message.clone()),
            });
        }
        tx.commit()?;
        Ok(expired)
    }

    // -- jobs ----------------------------------------------------------------

    pub fn insert_job(&self, job_id: &str, library_root: &str, options_json: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO jobs (id, library_root, status, options_json, created_at)
             VALUES (?1, ?2, 'created', ?3, ?4)",
            params![job_id, library_root, options_json, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_job_status(&self, job_id: &str, status: JobStatus) -> StoreResult<()> {
        let conn = self.lock();
        let now = now_epoch();
        conn.execute(
            "UPDATE jobs SET status = ?2,
                    started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL
                                      THEN ?3 ELSE started_at END,
                    finished_at = CASE WHEN ?2 IN ('cancelled', 'completed', 'failed')
                                       THEN ?3 ELSE finished_at END
             WHERE id = ?1",
            params![job_id, status.as_str(), now],
        )?;
        Ok(())
    }

    pub fn set_job_summary(&self, job_id: &str, summary_json: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET summary_json = ?2 WHERE id = ?1",
            params![job_id, summary_json],
        )?;
        Ok(())
    }

    pub fn job(&self, job_id: &str) -> StoreResult<Option<JobRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, library_root, status, options_json, summary_json, created_at
                 FROM jobs WHERE id = ?1",
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_jobs(&self) -> StoreResult<Vec<JobRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, library_root, status, options_json, summary_json, created_at
             FROM jobs ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], job_from_row)?.collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // -- observation ---------------------------------------------------------

    pub fn counters(&self) -> StoreResult<Counters> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT kind, status, COUNT(*) FROM artifacts GROUP BY kind, status")?;
        let rows: Vec<(String, String, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<_, _>>()?;
        let by_kind: HashMap<&str, ArtifactKind> = ArtifactKind::ALL
            .iter()
            .map(|k| (k.as_str(), *k))
            .collect();
        let mut counters = Counters::default();
        for (kind, status, count) in rows {
            let Some(kind) = by_kind.get(kind.as_str()) else {
                continue;
            };
            let bucket = counters.kind_mut(*kind);
            let count = count as u64;
            match status.as_str() {
                "queued" => bucket.queued += count,
                "running" => bucket.running += count,
                "ready" => bucket.ready += count,
                "error" => bucket.error += count,
                "cancelled" => bucket.cancelled += count,
                _ => {}
            }
        }
        Ok(counters)
    }

    pub fn now_running(&self, job_id: &str) -> StoreResult<Option<RunningTask>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, kind, page_id, file_id FROM tasks
                 WHERE job_id = ?1 AND status = 'running'
                 ORDER BY started_at LIMIT 1",
                params![job_id],
                |r| {
                    Ok(RunningTask {
                        task_id: r.get(0)?,
                        kind: r.get(1)?,
                        page_id: r.get(2)?,
                        file_id: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn errors_summary(&self, job_id: &str) -> StoreResult<Vec<ErrorCount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT error_code, COUNT(*) FROM tasks
             WHERE job_id = ?1 AND error_code IS NOT NULL
             GROUP BY error_code ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt
            .query_map(params![job_id], |r| {
                Ok(ErrorCount {
                    code: r.get(0)?,
                    count: r.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn task(&self, task_id: i64) -> StoreResult<Option<TaskRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, job_id, page_id, file_id, kind, status, heartbeat_at,
                        error_code, error_message
                 FROM tasks WHERE id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn append_event(
        &self,
        job_id: &str,
        seq: u64,
        event_type: &str,
        payload_json: &str,
    ) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO events (job_id, seq, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, seq as i64, event_type, payload_json, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Test hook: inject a raw task row (e.g. a synthetic stale `running`
    /// task for watchdog checks).
    pub fn insert_raw_task(
        &self,
        job_id: &str,
        page_id: Option<i64>,
        file_id: Option<i64>,
        kind: TaskKind,
        status: TaskStatus,
        heartbeat_at: Option<i64>,
    ) -> StoreResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (job_id, page_id, file_id, kind, status, started_at, heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                job_id,
                page_id,
                file_id,
                kind.as_str(),
                status.as_str(),
                heartbeat_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn configure(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn migrate(conn: &Connection, db_path: &Path) -> StoreResult<()> {
    let has_meta: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
        [],
        |r| r.get(0),
    )?;
    if has_meta == 0 {
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        return Ok(());
    }

    let raw: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |r| r.get(0),
    )?;
    let found: i64 = raw
        .parse()
        .map_err(|_| StoreError::Corrupted(format!("bad schema_version: {raw}")))?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found < SCHEMA_VERSION {
        // Preserve the raw file before touching anything.
        std::fs::copy(db_path, db_path.with_extension("sqlite.bak"))?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
            params![SCHEMA_VERSION.to_string()],
        )?;
    }
    Ok(())
}

fn finish_task(tx: &rusqlite::Transaction<'_>, task_id: i64) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE tasks SET status = 'finished', finished_at = ?2, progress = 1.0 WHERE id = ?1",
        params![task_id, now_epoch()],
    )?;
    Ok(())
}

fn mark_task_error(
    tx: &rusqlite::Transaction<'_>,
    task_id: i64,
    code: ErrorCode,
    message: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE tasks SET status = 'error', finished_at = ?2, error_code = ?3, error_message = ?4
         WHERE id = ?1",
        params![task_id, now_epoch(), code.as_str(), message],
    )?;
    Ok(())
}

/// Resolve a page's dependents after a dependency failure so the queue
/// drains: text -> text_vec/bm25 become `skipped`, thumb -> img_vec becomes
/// `error` (matching the file-level PDF cascade).
fn cascade_dependents(
    tx: &rusqlite::Transaction<'_>,
    page_id: i64,
    kind: ArtifactKind,
    code: ErrorCode,
    message: &str,
) -> rusqlite::Result<Vec<(i64, ArtifactKind, ArtifactStatus)>> {
    let now = now_rfc3339();
    let mut cascaded = Vec::new();
    match kind {
        ArtifactKind::Text => {
            for dep in [ArtifactKind::TextVec, ArtifactKind::Bm25] {
                let n = tx.execute(
                    "UPDATE artifacts SET status = 'skipped', updated_at = ?2
                     WHERE page_id = ?1 AND kind = ?3 AND status IN ('missing', 'queued')",
                    params![page_id, now, dep.as_str()],
                )?;
                if n > 0 {
                    cascaded.push((page_id, dep, ArtifactStatus::Skipped));
                }
                tx.execute(
                    "UPDATE tasks SET status = 'skipped', finished_at = ?2,
                            message = 'dependency text failed'
                     WHERE page_id = ?1 AND kind = ?3 AND status = 'queued'",
                    params![page_id, now_epoch(), dep.as_str()],
                )?;
            }
        }
        ArtifactKind::Thumb => {
            let n = tx.execute(
                "UPDATE artifacts SET status = 'error', error_code = ?3,
                        error_message = ?4, updated_at = ?2
                 WHERE page_id = ?1 AND kind = 'img_vec' AND status IN ('missing', 'queued')",
                params![page_id, now, code.as_str(), message],
            )?;
            if n > 0 {
                cascaded.push((page_id, ArtifactKind::ImgVec, ArtifactStatus::Error));
            }
            tx.execute(
                "UPDATE tasks SET status = 'error', finished_at = ?2, error_code = ?3,
                        error_message = 'dependency thumb failed'
                 WHERE page_id = ?1 AND kind = 'img_vec' AND status = 'queued'",
                params![page_id, now_epoch(), code.as_str()],
            )?;
        }
        _ => {}
    }
    Ok(cascaded)
}

/// File-level PDF failure: thumb and img_vec artifacts of every page error
/// out, along with their queued tasks. Text and bm25 are untouched.
fn sweep_pdf_failure(
    tx: &rusqlite::Transaction<'_>,
    job_id: &str,
    file_id: i64,
    code: ErrorCode,
    message: &str,
) -> rusqlite::Result<Vec<i64>> {
    let now = now_rfc3339();
    let page_ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM pages WHERE file_id = ?1")?;
        let ids = stmt
            .query_map(params![file_id], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        ids
    };
    for &page_id in &page_ids {
        tx.execute(
            "UPDATE artifacts SET status = 'error', error_code = ?3, error_message = ?4,
                    updated_at = ?2
             WHERE page_id = ?1 AND kind IN ('thumb', 'img_vec') AND status != 'ready'",
            params![page_id, now, code.as_str(), message],
        )?;
    }
    tx.execute(
        "UPDATE tasks SET status = 'error', finished_at = ?3, error_code = ?4,
                error_message = ?5
         WHERE file_id = ?1 AND job_id = ?2 AND kind IN ('thumb', 'img_vec')
           AND status = 'queued'",
        params![file_id, job_id, now_epoch(), code.as_str(), message],
    )?;
    Ok(page_ids)
}

fn fts_upsert(tx: &rusqlite::Transaction<'_>, page_id: i64, norm_text: &str) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM fts_pages WHERE page_id = ?1", params![page_id])?;
    tx.execute(
        "INSERT INTO fts_pages (page_id, norm_text) VALUES (?1, ?2)",
        params![page_id, norm_text],
    )?;
    Ok(())
}

fn file_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        id: r.get(0)?,
        path: r.get(1)?,
        size: r.get(2)?,
        mtime: r.get(3)?,
        slide_count: r.get(4)?,
        slide_aspect: Aspect::parse(&r.get::<_, String>(5)?),
        scan_error: r.get(6)?,
        missing: r.get::<_, i64>(7)? != 0,
    })
}

fn page_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PageRow> {
    Ok(PageRow {
        id: r.get(0)?,
        file_id: r.get(1)?,
        page_no: r.get(2)?,
        aspect: Aspect::parse(&r.get::<_, String>(3)?),
    })
}

fn task_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    let kind: String = r.get(4)?;
    let status: String = r.get(5)?;
    Ok(TaskRow {
        id: r.get(0)?,
        job_id: r.get(1)?,
        page_id: r.get(2)?,
        file_id: r.get(3)?,
        kind: TaskKind::parse(&kind).unwrap_or(TaskKind::Text),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Queued),
        heartbeat_at: r.get(6)?,
        error_code: r.get(7)?,
        error_message: r.get(8)?,
    })
}

fn job_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    let status: String = r.get(2)?;
    Ok(JobRow {
        id: r.get(0)?,
        library_root: r.get(1)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Created),
        options_json: r.get(3)?,
        summary_json: r.get(4)?,
        created_at: r.get(5)?,
    })
}
