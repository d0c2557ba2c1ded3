//! Worker pools for the five artifact kinds plus PDF conversion.
//!
//! Every worker follows the same loop: check the control token, claim a
//! task from the persistent queue, execute with heartbeats, and commit a
//! per-page checkpoint (payload + artifact + task in one transaction).
//! Page-scoped failures never escape the loop; the next task proceeds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::embeddings::{self, EmbedError};
use crate::error::ErrorCode;
use crate::events::JobEvent;
use crate::pptx;
use crate::store::{
    vector_to_blob, ArtifactKind, ArtifactStatus, PageTextCommit, Store, TaskKind, TaskRow,
};
use crate::thumbs;

use super::JobContext;

/// How long an idle worker sleeps before re-polling the queue.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Wait between cache probes while another worker embeds the same sig.
const INFLIGHT_WAIT: Duration = Duration::from_millis(100);

pub(crate) fn spawn_all(ctx: &JobContext) -> Vec<JoinHandle<()>> {
    let pools = ctx.options.pools.clone();
    let mut handles = Vec::new();
    if ctx.options.enable_text {
        for i in 0..pools.text.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { text_worker(ctx, i).await }));
        }
    }
    if ctx.options.enable_thumb {
        for i in 0..pools.pdf.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { pdf_worker(ctx, i).await }));
        }
        for i in 0..pools.thumb.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { thumb_worker(ctx, i).await }));
        }
    }
    if ctx.options.enable_text_vec {
        for i in 0..pools.text_vec.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { text_vec_worker(ctx, i).await }));
        }
    }
    if ctx.options.enable_img_vec {
        for i in 0..pools.img_vec.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { img_vec_worker(ctx, i).await }));
        }
    }
    if ctx.options.enable_bm25 {
        for i in 0..pools.bm25.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { bm25_worker(ctx, i).await }));
        }
    }
    handles
}

fn heartbeat_interval(ctx: &JobContext) -> Duration {
    Duration::from_secs((ctx.options.watchdog_threshold_sec / 4).max(1))
}

/// Drive `work` while refreshing the task heartbeat. The first tick fires
/// immediately, so a freshly claimed task is never stale.
async fn with_heartbeat<F, T>(store: Arc<Store>, task_id: i64, interval: Duration, work: F) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            out = &mut work => return out,
            _ = ticker.tick() => {
                if let Err(e) = store.heartbeat(task_id) {
                    tracing::warn!(task_id, error = %e, "heartbeat update failed");
                }
            }
        }
    }
}

/// Claim the next runnable task of a kind, honoring pause and cancel.
/// Returns `None` when the job is cancelled or no work of this kind
/// remains.
async fn next_task(ctx: &JobContext, kind: TaskKind) -> Option<TaskRow> {
    loop {
        if ctx.control.is_cancelled() {
            return None;
        }
        ctx.control.wait_if_paused().await;
        if ctx.control.is_cancelled() {
            return None;
        }
        match ctx.store.claim_next_task(&ctx.job_id, kind) {
            Ok(Some(task)) => return Some(task),
            Ok(None) => match ctx.store.pending_count(&ctx.job_id, kind) {
                Ok(0) => return None,
                // Tasks exist but are dependency-blocked or running
                // elsewhere; poll until they resolve.
                Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    tracing::error!(error = %e, kind = %kind, "pending count failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            },
            Err(e) => {
                tracing::error!(error = %e, kind = %kind, "task claim failed");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

fn emit_started(ctx: &JobContext, task: &TaskRow) {
    ctx.emitter.emit(JobEvent::TaskStarted {
        job_id: ctx.job_id.clone(),
        task_id: task.id,
        kind: task.kind.as_str().to_string(),
        page_id: task.page_id,
        file_id: task.file_id,
    });
}

fn emit_finished(ctx: &JobContext, task: &TaskRow, page_id: i64, kind: ArtifactKind) {
    ctx.emitter.emit(JobEvent::ArtifactStateChanged {
        job_id: ctx.job_id.clone(),
        page_id,
        kind: kind.as_str().to_string(),
        status: ArtifactStatus::Ready.as_str().to_string(),
    });
    ctx.emitter.emit(JobEvent::TaskProgress {
        job_id: ctx.job_id.clone(),
        task_id: task.id,
        kind: task.kind.as_str().to_string(),
        progress: 1.0,
    });
}

/// Record a page-scoped failure: rows, cascade, events. Never panics; a
/// store error here is logged and the loop continues.
fn record_page_failure(
    ctx: &JobContext,
    task: &TaskRow,
    page_id: i64,
    kind: ArtifactKind,
    code: ErrorCode,
    message: &str,
) {
    ctx.emitter.emit(JobEvent::TaskError {
        job_id: ctx.job_id.clone(),
        task_id: task.id,
        kind: task.kind.as_str().to_string(),
        error_code: code.as_str().to_string(),
        error_message: message.to_string(),
    });
    match ctx.store.fail_page_task(task.id, page_id, kind, code, message) {
        Ok(cascaded) => {
            ctx.emitter.emit(JobEvent::ArtifactStateChanged {
                job_id: ctx.job_id.clone(),
                page_id,
                kind: kind.as_str().to_string(),
                status: ArtifactStatus::Error.as_str().to_string(),
            });
            for (page_id, kind, status) in cascaded {
                ctx.emitter.emit(JobEvent::ArtifactStateChanged {
                    job_id: ctx.job_id.clone(),
                    page_id,
                    kind: kind.as_str().to_string(),
                    status: status.as_str().to_string(),
                });
            }
        }
        Err(e) => tracing::error!(task_id = task.id, error = %e, "failed to record task failure"),
    }
}

/// Resolve the absolute source path for a task's file.
fn source_path(ctx: &JobContext, file_id: Option<i64>) -> Option<std::path::PathBuf> {
    let file = ctx.store.file(file_id?).ok().flatten()?;
    Some(std::path::PathBuf::from(file.path))
}

// ---------------------------------------------------------------------------
// Text extraction
// ---------------------------------------------------------------------------

/// Buffers text checkpoints when `commit_every_pages > 1`, flushing by size
/// or age (`commit_every_sec`).
struct TextCommitBuffer {
    entries: Vec<PageTextCommit>,
    oldest: Option<Instant>,
    max_pages: usize,
    max_age: Duration,
}

impl TextCommitBuffer {
    fn new(max_pages: u32, max_age_sec: u64) -> Self {
        Self {
            entries: Vec::new(),
            oldest: None,
            max_pages: max_pages.max(1) as usize,
            max_age: Duration::from_secs(max_age_sec.max(1)),
        }
    }

    fn push(&mut self, entry: PageTextCommit) {
        if self.entries.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.entries.push(entry);
    }

    fn should_flush(&self) -> bool {
        self.entries.len() >= self.max_pages
            || self
                .oldest
                .map(|t| t.elapsed() >= self.max_age)
                .unwrap_or(false)
    }

    fn take(&mut self) -> Vec<PageTextCommit> {
        self.oldest = None;
        std::mem::take(&mut self.entries)
    }
}

async fn text_worker(ctx: JobContext, worker: usize) {
    tracing::debug!(worker, "text worker started");
    let mut buffer = TextCommitBuffer::new(
        ctx.options.commit_every_pages,
        ctx.options.commit_every_sec,
    );
    let hb = heartbeat_interval(&ctx);

    while let Some(task) = next_task(&ctx, TaskKind::Text).await {
        let Some(page_id) = task.page_id else { continue };
        emit_started(&ctx, &task);
        if ctx.control.is_cancelled() {
            let _ = ctx
                .store
                .cancel_task(task.id, Some(page_id), Some(ArtifactKind::Text));
            break;
        }

        let Some(page) = ctx.store.page(page_id).ok().flatten() else {
            continue;
        };
        let Some(path) = source_path(&ctx, task.file_id) else {
            record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::Text,
                ErrorCode::TextExtractFail,
                "source file row vanished",
            );
            continue;
        };

        let page_no = page.page_no;
        let extracted = with_heartbeat(ctx.store.clone(), task.id, hb, async {
            tokio::task::spawn_blocking(move || pptx::extract_slide_text(&path, page_no)).await
        })
        .await;

        match extracted {
            Ok(Ok(raw)) => {
                let norm = pptx::normalize_text(&raw);
                let sig = pptx::fast_text_sig(&norm);
                let entry = PageTextCommit {
                    task_id: task.id,
                    page_id,
                    raw_text: raw,
                    norm_text: norm,
                    text_sig: sig,
                };
                if ctx.options.commit_every_pages <= 1 {
                    match ctx.store.commit_page_text_batch(std::slice::from_ref(&entry)) {
                        Ok(()) => emit_finished(&ctx, &task, page_id, ArtifactKind::Text),
                        Err(e) => record_page_failure(
                            &ctx,
                            &task,
                            page_id,
                            ArtifactKind::Text,
                            e.code(),
                            &e.to_string(),
                        ),
                    }
                } else {
                    buffer.push(entry);
                    if buffer.should_flush() {
                        flush_text_buffer(&ctx, &mut buffer);
                    }
                }
            }
            Ok(Err(e)) => {
                record_page_failure(
                    &ctx,
                    &task,
                    page_id,
                    ArtifactKind::Text,
                    ErrorCode::TextExtractFail,
                    &e.to_string(),
                );
            }
            Err(join_err) => {
                record_page_failure(
                    &ctx,
                    &task,
                    page_id,
                    ArtifactKind::Text,
                    ErrorCode::TextExtractFail,
                    &join_err.to_string(),
                );
            }
        }
    }

    flush_text_buffer(&ctx, &mut buffer);
    tracing::debug!(worker, "text worker stopped");
}

fn flush_text_buffer(ctx: &JobContext, buffer: &mut TextCommitBuffer) {
    let entries = buffer.take();
    if entries.is_empty() {
        return;
    }
    match ctx.store.commit_page_text_batch(&entries) {
        Ok(()) => {
            for entry in &entries {
                ctx.emitter.emit(JobEvent::ArtifactStateChanged {
                    job_id: ctx.job_id.clone(),
                    page_id: entry.page_id,
                    kind: ArtifactKind::Text.as_str().to_string(),
                    status: ArtifactStatus::Ready.as_str().to_string(),
                });
            }
        }
        Err(e) => tracing::error!(error = %e, "batched text commit failed"),
    }
}

// ---------------------------------------------------------------------------
// PDF conversion (file-scoped)
// ---------------------------------------------------------------------------

async fn pdf_worker(ctx: JobContext, worker: usize) {
    tracing::debug!(worker, "pdf worker started");
    let hb = heartbeat_interval(&ctx);

    while let Some(task) = next_task(&ctx, TaskKind::Pdf).await {
        let Some(file_id) = task.file_id else { continue };
        emit_started(&ctx, &task);
        if ctx.control.is_cancelled() {
            let _ = ctx.store.cancel_task(task.id, None, None);
            break;
        }
        let Some(path) = source_path(&ctx, Some(file_id)) else {
            record_pdf_failure(
                &ctx,
                &task,
                file_id,
                ErrorCode::PdfConvertFail,
                "source file row vanished",
            );
            continue;
        };

        let out_pdf = ctx.store.pdf_path(file_id);
        let result = with_heartbeat(
            ctx.store.clone(),
            task.id,
            hb,
            ctx.converter.convert(&path, &out_pdf),
        )
        .await;

        match result {
            Ok(()) => {
                if let Err(e) = ctx.store.finish_pdf_task(task.id) {
                    tracing::error!(task_id = task.id, error = %e, "finish pdf task failed");
                }
                ctx.emitter.emit(JobEvent::TaskProgress {
                    job_id: ctx.job_id.clone(),
                    task_id: task.id,
                    kind: task.kind.as_str().to_string(),
                    progress: 1.0,
                });
            }
            Err(e) => record_pdf_failure(&ctx, &task, file_id, e.code(), &e.to_string()),
        }
    }
    tracing::debug!(worker, "pdf worker stopped");
}

/// A failed conversion fails the file task and every derived thumb/img_vec
/// artifact in one sweep; the text pipeline is untouched.
fn record_pdf_failure(
    ctx: &JobContext,
    task: &TaskRow,
    file_id: i64,
    code: ErrorCode,
    message: &str,
) {
    ctx.emitter.emit(JobEvent::TaskError {
        job_id: ctx.job_id.clone(),
        task_id: task.id,
        kind: task.kind.as_str().to_string(),
        error_code: code.as_str().to_string(),
        error_message: message.to_string(),
    });
    match ctx.store.fail_pdf_task(task.id, file_id, code, message) {
        Ok(page_ids) => {
            for page_id in page_ids {
                for kind in [ArtifactKind::Thumb, ArtifactKind::ImgVec] {
                    ctx.emitter.emit(JobEvent::ArtifactStateChanged {
                        job_id: ctx.job_id.clone(),
                        page_id,
                        kind: kind.as_str().to_string(),
                        status: ArtifactStatus::Error.as_str().to_string(),
                    });
                }
            }
        }
        Err(e) => tracing::error!(task_id = task.id, error = %e, "failed to record pdf failure"),
    }
}

// ---------------------------------------------------------------------------
// Thumbnails
// ---------------------------------------------------------------------------

async fn thumb_worker(ctx: JobContext, worker: usize) {
    tracing::debug!(worker, "thumb worker started");
    let hb = heartbeat_interval(&ctx);

    while let Some(task) = next_task(&ctx, TaskKind::Thumb).await {
        let Some(page_id) = task.page_id else { continue };
        emit_started(&ctx, &task);
        if ctx.control.is_cancelled() {
            let _ = ctx
                .store
                .cancel_task(task.id, Some(page_id), Some(ArtifactKind::Thumb));
            break;
        }
        let Some(page) = ctx.store.page(page_id).ok().flatten() else {
            continue;
        };
        let Some(file_id) = task.file_id else { continue };

        let size = thumbs::thumb_size(page.aspect, ctx.options.thumb_default_aspect);
        let pdf = ctx.store.pdf_path(file_id);
        let out = ctx
            .store
            .thumb_path(file_id, page.page_no, page.aspect, size.0, size.1);
        let page_no = page.page_no;

        let rendered = with_heartbeat(ctx.store.clone(), task.id, hb, async {
            tokio::task::spawn_blocking(move || {
                thumbs::render_pdf_page_to_thumb(&pdf, page_no, &out, size)
            })
            .await
        })
        .await;

        match rendered {
            Ok(Ok((width, height))) => {
                let out = ctx
                    .store
                    .thumb_path(file_id, page.page_no, page.aspect, size.0, size.1);
                match ctx.store.commit_thumbnail(
                    task.id,
                    page_id,
                    page.aspect,
                    width,
                    height,
                    &out.to_string_lossy(),
                ) {
                    Ok(()) => emit_finished(&ctx, &task, page_id, ArtifactKind::Thumb),
                    Err(e) => record_page_failure(
                        &ctx,
                        &task,
                        page_id,
                        ArtifactKind::Thumb,
                        e.code(),
                        &e.to_string(),
                    ),
                }
            }
            Ok(Err(e)) => record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::Thumb,
                ErrorCode::ThumbRenderFail,
                &e.to_string(),
            ),
            Err(join_err) => record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::Thumb,
                ErrorCode::ThumbRenderFail,
                &join_err.to_string(),
            ),
        }
    }
    tracing::debug!(worker, "thumb worker stopped");
}

// ---------------------------------------------------------------------------
// Text embeddings
// ---------------------------------------------------------------------------

async fn text_vec_worker(ctx: JobContext, worker: usize) {
    tracing::debug!(worker, "text_vec worker started");
    let hb = heartbeat_interval(&ctx);
    let model = ctx.options.text_embed_model.clone();

    while let Some(task) = next_task(&ctx, TaskKind::TextVec).await {
        let Some(page_id) = task.page_id else { continue };
        emit_started(&ctx, &task);
        if ctx.control.is_cancelled() {
            let _ = ctx
                .store
                .cancel_task(task.id, Some(page_id), Some(ArtifactKind::TextVec));
            break;
        }
        if ctx.control.auth_failed() {
            record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::TextVec,
                ErrorCode::OpenaiAuth,
                "embedding credentials rejected earlier in this job",
            );
            continue;
        }

        match embed_page_text(&ctx, &task, page_id, &model, hb).await {
            Ok(()) => emit_finished(&ctx, &task, page_id, ArtifactKind::TextVec),
            Err(EmbedWorkerError::Embed(e)) => {
                let auth = matches!(e, EmbedError::Auth);
                record_page_failure(
                    &ctx,
                    &task,
                    page_id,
                    ArtifactKind::TextVec,
                    e.code(),
                    &e.to_string(),
                );
                if auth {
                    abort_text_vec_pipeline(&ctx);
                }
            }
            Err(EmbedWorkerError::Store(e)) => record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::TextVec,
                e.code(),
                &e.to_string(),
            ),
            Err(EmbedWorkerError::Cancelled) => {
                let _ = ctx
                    .store
                    .cancel_task(task.id, Some(page_id), Some(ArtifactKind::TextVec));
                break;
            }
        }
    }
    tracing::debug!(worker, "text_vec worker stopped");
}

enum EmbedWorkerError {
    Embed(EmbedError),
    Store(crate::store::StoreError),
    Cancelled,
}

impl From<crate::store::StoreError> for EmbedWorkerError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Store(e)
    }
}

/// Resolve one page's text vector: empty text short-circuits to the zero
/// vector, the content-addressed cache satisfies repeats, and exactly one
/// worker pays upstream for any given signature.
async fn embed_page_text(
    ctx: &JobContext,
    task: &TaskRow,
    page_id: i64,
    model: &str,
    hb: Duration,
) -> Result<(), EmbedWorkerError> {
    let Some(page_text) = ctx.store.get_page_text(page_id)? else {
        return Err(EmbedWorkerError::Store(crate::store::StoreError::Corrupted(
            format!("page {page_id} text artifact is ready but payload is missing"),
        )));
    };
    let sig = page_text.text_sig.clone();

    // Empty page: canonical zero vector, no remote call.
    if sig.is_empty() {
        let dim = ctx
            .store
            .embedding_dim_for_model(model)?
            .unwrap_or_else(|| ctx.embed_client.dim());
        ctx.embed_client.note_dim(dim);
        let blob = embeddings::zero_vector(dim);
        ctx.store
            .commit_text_embedding(task.id, page_id, model, "", Some((dim, &blob)))?;
        return Ok(());
    }

    loop {
        if let Some(dim) = ctx.store.text_embedding_cached(model, &sig)? {
            ctx.embed_client.note_dim(dim);
            ctx.store
                .commit_text_embedding(task.id, page_id, model, &sig, None)?;
            return Ok(());
        }
        if ctx.control.is_cancelled() {
            return Err(EmbedWorkerError::Cancelled);
        }

        if !ctx.control.try_claim_sig(model, &sig) {
            // Another worker is embedding this signature; its cache insert
            // will satisfy the probe above.
            tokio::time::sleep(INFLIGHT_WAIT).await;
            continue;
        }
        // Re-probe under the claim: the previous holder may have filled the
        // cache between our miss and the claim.
        match ctx.store.text_embedding_cached(model, &sig) {
            Ok(None) => {}
            Ok(Some(dim)) => {
                ctx.control.release_sig(model, &sig);
                ctx.embed_client.note_dim(dim);
                ctx.store
                    .commit_text_embedding(task.id, page_id, model, &sig, None)?;
                return Ok(());
            }
            Err(e) => {
                ctx.control.release_sig(model, &sig);
                return Err(e.into());
            }
        }

        let inputs = std::slice::from_ref(&page_text.norm_text);
        let result = with_heartbeat(
            ctx.store.clone(),
            task.id,
            hb,
            ctx.embed_client.embed_text_batch(model, inputs),
        )
        .await;
        ctx.control.release_sig(model, &sig);

        return match result {
            Ok(vectors) => {
                let Some(vector) = vectors.into_iter().next() else {
                    return Err(EmbedWorkerError::Embed(EmbedError::Api {
                        status: 0,
                        message: "empty embedding batch response".to_string(),
                    }));
                };
                let blob = vector_to_blob(&vector);
                ctx.store.commit_text_embedding(
                    task.id,
                    page_id,
                    model,
                    &sig,
                    Some((vector.len(), &blob)),
                )?;
                Ok(())
            }
            Err(e) => Err(EmbedWorkerError::Embed(e)),
        };
    }
}

/// Auth failure is job-fatal for this pipeline only: remaining queued
/// text_vec work cannot succeed, so it errors out in one sweep.
fn abort_text_vec_pipeline(ctx: &JobContext) {
    ctx.control.set_auth_failed();
    match ctx.store.abort_kind_tasks(
        &ctx.job_id,
        ArtifactKind::TextVec,
        ErrorCode::OpenaiAuth,
        "embedding credentials rejected",
    ) {
        Ok(aborted) => {
            for (task_id, page_id) in aborted {
                ctx.emitter.emit(JobEvent::TaskError {
                    job_id: ctx.job_id.clone(),
                    task_id,
                    kind: TaskKind::TextVec.as_str().to_string(),
                    error_code: ErrorCode::OpenaiAuth.as_str().to_string(),
                    error_message: "embedding credentials rejected".to_string(),
                });
                ctx.emitter.emit(JobEvent::ArtifactStateChanged {
                    job_id: ctx.job_id.clone(),
                    page_id,
                    kind: ArtifactKind::TextVec.as_str().to_string(),
                    status: ArtifactStatus::Error.as_str().to_string(),
                });
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to abort text_vec pipeline"),
    }
}

// ---------------------------------------------------------------------------
// Image embeddings
// ---------------------------------------------------------------------------

async fn img_vec_worker(ctx: JobContext, worker: usize) {
    tracing::debug!(worker, "img_vec worker started");
    let hb = heartbeat_interval(&ctx);
    let model = ctx.options.image_embed_model.clone();

    while let Some(task) = next_task(&ctx, TaskKind::ImgVec).await {
        let Some(page_id) = task.page_id else { continue };
        emit_started(&ctx, &task);
        if ctx.control.is_cancelled() {
            let _ = ctx
                .store
                .cancel_task(task.id, Some(page_id), Some(ArtifactKind::ImgVec));
            break;
        }

        let thumb = match ctx.store.get_thumbnail(page_id) {
            Ok(Some(thumb)) => thumb,
            Ok(None) => {
                record_page_failure(
                    &ctx,
                    &task,
                    page_id,
                    ArtifactKind::ImgVec,
                    ErrorCode::ThumbRenderFail,
                    "thumbnail row missing for ready artifact",
                );
                continue;
            }
            Err(e) => {
                record_page_failure(
                    &ctx,
                    &task,
                    page_id,
                    ArtifactKind::ImgVec,
                    e.code(),
                    &e.to_string(),
                );
                continue;
            }
        };

        let image_path = std::path::PathBuf::from(&thumb.image_path);
        let embedded = with_heartbeat(ctx.store.clone(), task.id, hb, async {
            tokio::task::spawn_blocking(move || embeddings::embed_thumbnail(&image_path)).await
        })
        .await;

        match embedded {
            Ok(Ok(vector)) => {
                let blob = vector_to_blob(&vector);
                match ctx.store.commit_image_embedding(
                    task.id,
                    page_id,
                    &model,
                    vector.len(),
                    &blob,
                ) {
                    Ok(()) => emit_finished(&ctx, &task, page_id, ArtifactKind::ImgVec),
                    Err(e) => record_page_failure(
                        &ctx,
                        &task,
                        page_id,
                        ArtifactKind::ImgVec,
                        e.code(),
                        &e.to_string(),
                    ),
                }
            }
            Ok(Err(e)) => record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::ImgVec,
                ErrorCode::ThumbRenderFail,
                &e.to_string(),
            ),
            Err(join_err) => record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::ImgVec,
                ErrorCode::ThumbRenderFail,
                &join_err.to_string(),
            ),
        }
    }
    tracing::debug!(worker, "img_vec worker stopped");
}

// ---------------------------------------------------------------------------
// BM25 / FTS
// ---------------------------------------------------------------------------

async fn bm25_worker(ctx: JobContext, worker: usize) {
    tracing::debug!(worker, "bm25 worker started");

    while let Some(task) = next_task(&ctx, TaskKind::Bm25).await {
        let Some(page_id) = task.page_id else { continue };
        emit_started(&ctx, &task);
        if ctx.control.is_cancelled() {
            let _ = ctx
                .store
                .cancel_task(task.id, Some(page_id), Some(ArtifactKind::Bm25));
            break;
        }

        let result = ctx.store.get_page_text(page_id).and_then(|text| {
            let norm = text.map(|t| t.norm_text).unwrap_or_default();
            ctx.store.commit_fts_page(task.id, page_id, &norm)
        });
        match result {
            Ok(()) => emit_finished(&ctx, &task, page_id, ArtifactKind::Bm25),
            Err(e) => record_page_failure(
                &ctx,
                &task,
                page_id,
                ArtifactKind::Bm25,
                e.code(),
                &e.to_string(),
            ),
        }
    }
    tracing::debug!(worker, "bm25 worker stopped");
}
