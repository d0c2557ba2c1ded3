//! Library scanning and work planning.
//!
//! Scanning upserts file rows, materializes page and artifact rows, and
//! queues tasks for everything the options enable. Unreadable packages are
//! recorded on the file row and skipped; indexing never aborts on one bad
//! deck.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::config::IndexOptions;
use crate::pptx;
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a planning pass did, persisted into the job summary.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PlanSummary {
    pub files_seen: u64,
    pub files_changed: u64,
    pub files_unreadable: u64,
    pub files_missing: u64,
    pub pages_total: u64,
    pub tasks_queued: u64,
}

/// List `.pptx` files under a root in deterministic order. Non-recursive
/// by default; a recursive scan skips the `.slidemanager` data directory
/// and hidden directories.
pub fn scan_files_under(root: &Path, recursive: bool) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_pptx(root, recursive, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_pptx(dir: &Path, recursive: bool, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if file_type.is_dir() {
            if recursive && !name.starts_with('.') {
                collect_pptx(&path, recursive, found)?;
            }
            continue;
        }
        if name.starts_with('.') {
            continue;
        }
        let is_pptx = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("pptx"))
            .unwrap_or(false);
        if is_pptx {
            found.push(path);
        }
    }
    Ok(())
}

/// True iff size or mtime differ from the last persisted scan.
pub fn file_changed(store: &Store, path: &str, size: i64, mtime: i64) -> Result<bool, StoreError> {
    match store.file_by_path(path)? {
        Some(row) => Ok(row.size != size || row.mtime != mtime),
        None => Ok(true),
    }
}

/// Scan the library root and queue work for one job. `progress` is called
/// after each file with (files scanned, pages so far, path).
pub fn plan_job(
    store: &Store,
    job_id: &str,
    root: &Path,
    options: &IndexOptions,
    mut progress: impl FnMut(u64, u64, &Path),
) -> Result<PlanSummary, PlanError> {
    let paths = scan_files_under(root, options.recursive)?;
    let mut summary = PlanSummary::default();
    let mut seen_paths = Vec::with_capacity(paths.len());

    for path in &paths {
        let path_str = path.to_string_lossy().into_owned();
        let meta = std::fs::metadata(path)?;
        let size = meta.len() as i64;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        summary.files_seen += 1;
        seen_paths.push(path_str.clone());

        let changed = file_changed(store, &path_str, size, mtime)?;
        if changed {
            summary.files_changed += 1;
            match pptx::slide_count(path) {
                Ok(slide_count) => {
                    let aspect = pptx::detect_aspect(path);
                    let file_id =
                        store.upsert_file(&path_str, size, mtime, slide_count, aspect, None)?;
                    store.sync_pages(file_id, slide_count, aspect, size, mtime)?;
                    // Changed content invalidates derived artifacts; the
                    // text-sig cache keeps unchanged text free downstream.
                    store.reset_file_artifacts(file_id)?;
                }
                Err(e) => {
                    summary.files_unreadable += 1;
                    tracing::warn!(path = %path_str, error = %e, "unreadable package");
                    let scan_error = e.to_string();
                    let file_id = store.upsert_file(
                        &path_str,
                        size,
                        mtime,
                        0,
                        pptx::Aspect::Unknown,
                        Some(scan_error.as_str()),
                    )?;
                    store.sync_pages(file_id, 0, pptx::Aspect::Unknown, size, mtime)?;
                }
            }
        }

        let Some(file) = store.file_by_path(&path_str)? else {
            continue;
        };
        summary.pages_total += u64::from(file.slide_count);
        if file.scan_error.is_none() {
            summary.tasks_queued += store.plan_file(job_id, file.id, options)?;
        }
        progress(summary.files_seen, summary.pages_total, path);
    }

    summary.files_missing = store.mark_missing_except(&seen_paths)?;
    tracing::info!(
        job_id,
        files = summary.files_seen,
        changed = summary.files_changed,
        pages = summary.pages_total,
        tasks = summary.tasks_queued,
        "planning complete"
    );
    Ok(summary)
}
