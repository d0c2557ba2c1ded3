//! The job manager: owns per-root stores, runs jobs, and serves the
//! control plane (pause / resume / cancel / status / events).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::IndexOptions;
use crate::convert::PdfConverter;
use crate::embeddings::{EmbeddingApi, EmbeddingClient};
use crate::events::{Envelope, EventBus, JobEvent, JobLogWriter, Rates};
use crate::limiter::{Backoff, RateLimiter};
use crate::planner::{self, PlanSummary};
use crate::store::{ErrorCount, Counters, JobStatus, RunningTask, Store, StoreError};

use super::{workers, JobContext, JobControl, JobEmitter};

/// Backoff for remote embedding retries.
const EMBED_BACKOFF_BASE: Duration = Duration::from_millis(500);
const EMBED_BACKOFF_CAP: Duration = Duration::from_secs(30);
const EMBED_BACKOFF_JITTER: f64 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("library root '{0}' is not a directory")]
    InvalidRoot(PathBuf),
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode job options: {0}")]
    Options(#[from] serde_json::Error),
}

/// Status payload for `GET /jobs/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub status: String,
    pub counters: Counters,
    pub now_running: Option<RunningTask>,
    pub errors_summary: Vec<ErrorCount>,
}

/// One line of `GET /jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct JobListEntry {
    pub job_id: String,
    pub status: String,
    pub library_root: String,
    pub created_at: String,
}

#[derive(Clone)]
struct JobEntry {
    store: Arc<Store>,
    control: JobControl,
    emitter: Arc<JobEmitter>,
}

pub struct JobManager {
    bus: Arc<EventBus>,
    embedding_api: Arc<dyn EmbeddingApi>,
    converter_bin: PathBuf,
    stores: RwLock<HashMap<PathBuf, Arc<Store>>>,
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl JobManager {
    pub fn new(
        bus: Arc<EventBus>,
        embedding_api: Arc<dyn EmbeddingApi>,
        converter_bin: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bus,
            embedding_api,
            converter_bin: converter_bin.into(),
            stores: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    async fn store_for_root(&self, root: &Path) -> Result<Arc<Store>, JobError> {
        if let Some(store) = self.stores.read().await.get(root) {
            return Ok(store.clone());
        }
        let store = Arc::new(Store::open(root)?);
        self.stores
            .write()
            .await
            .insert(root.to_path_buf(), store.clone());
        Ok(store)
    }

    /// Create an indexing job over a library root and start running it.
    pub async fn create_index_job(
        &self,
        library_root: &Path,
        options: IndexOptions,
    ) -> Result<String, JobError> {
        if !library_root.is_dir() {
            return Err(JobError::InvalidRoot(library_root.to_path_buf()));
        }
        let root = library_root
            .canonicalize()
            .map_err(|_| JobError::InvalidRoot(library_root.to_path_buf()))?;

        let store = self.store_for_root(&root).await?;
        let job_id = uuid::Uuid::new_v4().to_string();
        store.insert_job(&job_id, &root.to_string_lossy(), &serde_json::to_string(&options)?)?;

        let log = match JobLogWriter::create(&store.logs_dir(), &job_id) {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!(error = %e, "job log unavailable");
                None
            }
        };
        let emitter = Arc::new(JobEmitter::new(
            job_id.clone(),
            store.clone(),
            self.bus.clone(),
            log,
        ));
        emitter.emit(JobEvent::JobCreated {
            job_id: job_id.clone(),
            library_root: root.to_string_lossy().into_owned(),
        });

        let control = JobControl::new();
        let limiter = Arc::new(RateLimiter::new(options.req_per_min, options.tok_per_min));
        let embed_client = Arc::new(EmbeddingClient::new(
            self.embedding_api.clone(),
            limiter,
            Backoff::new(EMBED_BACKOFF_BASE, EMBED_BACKOFF_CAP, EMBED_BACKOFF_JITTER),
            options.max_retries,
            options.text_embed_dim_fallback,
        ));
        let converter = PdfConverter::new(
            self.converter_bin.clone(),
            Duration::from_secs(options.pdf_timeout_sec.max(1)),
        );

        let ctx = JobContext {
            job_id: job_id.clone(),
            store: store.clone(),
            emitter: emitter.clone(),
            options,
            control: control.clone(),
            embed_client,
            converter,
        };
        self.jobs.write().await.insert(
            job_id.clone(),
            JobEntry {
                store,
                control,
                emitter,
            },
        );
        tokio::spawn(run_job(ctx));
        tracing::info!(job_id, root = %root.display(), "index job created");
        Ok(job_id)
    }

    async fn entry(&self, job_id: &str) -> Option<JobEntry> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Pause a job. Workers may finish the page in flight but start no new
    /// one. Idempotent, including on terminal jobs.
    pub async fn pause_job(&self, job_id: &str) -> Result<(), JobError> {
        let entry = self
            .entry(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let job = entry
            .store
            .job(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(());
        }
        entry.control.pause();
        if matches!(job.status, JobStatus::Planning | JobStatus::Running) {
            entry.store.set_job_status(job_id, JobStatus::Paused)?;
            entry.emitter.emit(JobEvent::JobStateChanged {
                job_id: job_id.to_string(),
                status: JobStatus::Paused.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Resume a paused job from the persistent queue. Idempotent.
    pub async fn resume_job(&self, job_id: &str) -> Result<(), JobError> {
        let entry = self
            .entry(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let job = entry
            .store
            .job(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(());
        }
        entry.control.resume();
        if job.status == JobStatus::Paused {
            entry.store.set_job_status(job_id, JobStatus::Running)?;
            entry.emitter.emit(JobEvent::JobStateChanged {
                job_id: job_id.to_string(),
                status: JobStatus::Running.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Request cancellation: queued work is swept immediately, running
    /// workers stop at their next checkpoint, and the run loop emits the
    /// final `job_finished`. Idempotent on terminal and repeated calls.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), JobError> {
        if let Some(entry) = self.entry(job_id).await {
            let job = entry
                .store
                .job(job_id)?
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(());
            }
            if job.status != JobStatus::CancelRequested {
                entry.store.set_job_status(job_id, JobStatus::CancelRequested)?;
                entry.emitter.emit(JobEvent::JobStateChanged {
                    job_id: job_id.to_string(),
                    status: JobStatus::CancelRequested.as_str().to_string(),
                });
            }
            entry.control.request_cancel();
            entry.store.cancel_pending(job_id)?;
            return Ok(());
        }

        // No live run loop (daemon restarted): finalize directly from rows.
        let store = self
            .find_store_for_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let job = store
            .job(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(());
        }
        store.cancel_pending(job_id)?;
        store.finalize_tasks(job_id, JobStatus::Cancelled)?;
        store.set_job_status(job_id, JobStatus::Cancelled)?;
        self.bus.publish(
            job_id,
            JobEvent::JobFinished {
                job_id: job_id.to_string(),
                status: JobStatus::Cancelled.as_str().to_string(),
                summary: serde_json::Value::Null,
            },
        );
        Ok(())
    }

    async fn find_store_for_job(&self, job_id: &str) -> Result<Option<Arc<Store>>, JobError> {
        if let Some(entry) = self.entry(job_id).await {
            return Ok(Some(entry.store));
        }
        for store in self.stores.read().await.values() {
            if store.job(job_id)?.is_some() {
                return Ok(Some(store.clone()));
            }
        }
        Ok(None)
    }

    /// Progress read, always available from the store even after the event
    /// stream disconnects.
    pub async fn job_status(&self, job_id: &str) -> Result<Option<JobStatusReport>, JobError> {
        let Some(store) = self.find_store_for_job(job_id).await? else {
            return Ok(None);
        };
        let Some(job) = store.job(job_id)? else {
            return Ok(None);
        };
        Ok(Some(JobStatusReport {
            job_id: job.id,
            status: job.status.as_str().to_string(),
            counters: store.counters()?,
            now_running: store.now_running(job_id)?,
            errors_summary: store.errors_summary(job_id)?,
        }))
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobListEntry>, JobError> {
        let mut entries = Vec::new();
        for store in self.stores.read().await.values() {
            for job in store.list_jobs()? {
                entries.push(JobListEntry {
                    job_id: job.id,
                    status: job.status.as_str().to_string(),
                    library_root: job.library_root,
                    created_at: job.created_at,
                });
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    pub async fn job_exists(&self, job_id: &str) -> Result<bool, JobError> {
        Ok(self.find_store_for_job(job_id).await?.is_some())
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe(job_id)
    }
}

/// One watchdog pass: expire running tasks with stale heartbeats and emit
/// their `task_error` events. Exposed standalone so tests can drive a
/// single tick.
pub fn watchdog_tick(
    store: &Store,
    emitter: &JobEmitter,
    job_id: &str,
    threshold_sec: u64,
) -> Result<u64, StoreError> {
    let expired = store.expire_stale_tasks(job_id, threshold_sec, crate::store::now_epoch())?;
    for task in &expired {
        tracing::warn!(task_id = task.id, kind = %task.kind, "watchdog expired stale task");
        emitter.emit(JobEvent::TaskError {
            job_id: job_id.to_string(),
            task_id: task.id,
            kind: task.kind.as_str().to_string(),
            error_code: crate::error::ErrorCode::WatchdogTimeout.as_str().to_string(),
            error_message: task
                .error_message
                .clone()
                .unwrap_or_else(|| "heartbeat stalled".to_string()),
        });
        if let (Some(page_id), Some(artifact)) = (task.page_id, task.kind.artifact_kind()) {
            emitter.emit(JobEvent::ArtifactStateChanged {
                job_id: job_id.to_string(),
                page_id,
                kind: artifact.as_str().to_string(),
                status: crate::store::ArtifactStatus::Error.as_str().to_string(),
            });
        }
    }
    Ok(expired.len() as u64)
}

fn set_status(ctx: &JobContext, status: JobStatus) {
    if let Err(e) = ctx.store.set_job_status(&ctx.job_id, status) {
        tracing::error!(job_id = %ctx.job_id, error = %e, "failed to persist job status");
    }
    ctx.emitter.emit(JobEvent::JobStateChanged {
        job_id: ctx.job_id.clone(),
        status: status.as_str().to_string(),
    });
}

async fn run_job(ctx: JobContext) {
    set_status(&ctx, JobStatus::Planning);

    let plan = {
        let emitter = ctx.emitter.clone();
        let job_id = ctx.job_id.clone();
        let root = ctx.store.library_root().to_path_buf();
        planner::plan_job(&ctx.store, &ctx.job_id, &root, &ctx.options, |files, pages, path| {
            emitter.emit(JobEvent::PlanningProgress {
                job_id: job_id.clone(),
                files_scanned: files,
                pages_planned: pages,
                path: Some(path.display().to_string()),
            });
        })
    };
    let plan = match plan {
        Ok(plan) => plan,
        Err(e) => {
            tracing::error!(job_id = %ctx.job_id, error = %e, "planning failed");
            finish_job(&ctx, PlanSummary::default(), JobStatus::Failed, Some(e.to_string()));
            return;
        }
    };

    if ctx.control.is_cancelled() {
        finish_job(&ctx, plan, JobStatus::Cancelled, None);
        return;
    }
    if !ctx.control.is_paused() {
        set_status(&ctx, JobStatus::Running);
    }

    let done = CancellationToken::new();
    let stats = tokio::spawn(stats_loop(ctx.clone(), done.clone()));
    let watchdog = tokio::spawn(watchdog_loop(ctx.clone(), done.clone()));

    for handle in workers::spawn_all(&ctx) {
        if let Err(e) = handle.await {
            tracing::error!(job_id = %ctx.job_id, error = %e, "worker panicked");
        }
    }
    done.cancel();
    let _ = stats.await;
    let _ = watchdog.await;

    let status = if ctx.control.is_cancelled() {
        JobStatus::Cancelled
    } else {
        JobStatus::Completed
    };
    finish_job(&ctx, plan, status, None);
}

fn finish_job(ctx: &JobContext, plan: PlanSummary, status: JobStatus, error: Option<String>) {
    if let Err(e) = ctx.store.finalize_tasks(&ctx.job_id, status) {
        tracing::error!(job_id = %ctx.job_id, error = %e, "terminal sweep failed");
    }
    if let Err(e) = ctx.store.set_job_status(&ctx.job_id, status) {
        tracing::error!(job_id = %ctx.job_id, error = %e, "failed to persist terminal status");
    }

    let counters = ctx.store.counters().unwrap_or_default();
    let errors = ctx.store.errors_summary(&ctx.job_id).unwrap_or_default();
    let summary = serde_json::json!({
        "plan": plan,
        "counters": counters,
        "errors": errors,
        "error": error,
    });
    if let Err(e) = ctx.store.set_job_summary(&ctx.job_id, &summary.to_string()) {
        tracing::warn!(job_id = %ctx.job_id, error = %e, "failed to persist job summary");
    }

    ctx.emitter.emit(JobEvent::JobStateChanged {
        job_id: ctx.job_id.clone(),
        status: status.as_str().to_string(),
    });
    ctx.emitter.emit(JobEvent::JobFinished {
        job_id: ctx.job_id.clone(),
        status: status.as_str().to_string(),
        summary,
    });
    tracing::info!(job_id = %ctx.job_id, status = %status, "job finished");
}

/// Emit a `stats_snapshot` at 1 Hz while the job runs.
async fn stats_loop(ctx: JobContext, done: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_ready: u64 = 0;
    let mut last_tick = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let counters = match ctx.store.counters() {
            Ok(counters) => counters,
            Err(e) => {
                tracing::warn!(error = %e, "stats counters unavailable");
                continue;
            }
        };
        let ready_total = [
            counters.text.ready,
            counters.thumb.ready,
            counters.text_vec.ready,
            counters.img_vec.ready,
            counters.bm25.ready,
        ]
        .iter()
        .sum::<u64>();
        let dt = last_tick.elapsed().as_secs_f64().max(1e-3);
        let rates = Rates {
            pages_per_sec: (ready_total.saturating_sub(last_ready)) as f64 / dt,
            tasks_finished: ready_total,
        };
        last_ready = ready_total;
        last_tick = tokio::time::Instant::now();
        let now_running = ctx.store.now_running(&ctx.job_id).ok().flatten();
        ctx.emitter.emit(JobEvent::StatsSnapshot {
            job_id: ctx.job_id.clone(),
            counters,
            now_running,
            rates,
        });
    }
}

async fn watchdog_loop(ctx: JobContext, done: CancellationToken) {
    let threshold = ctx.options.watchdog_threshold_sec.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs((threshold / 2).max(1)));
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match watchdog_tick(&ctx.store, &ctx.emitter, &ctx.job_id, threshold) {
            Ok(0) => {}
            Ok(n) => tracing::warn!(job_id = %ctx.job_id, expired = n, "watchdog expired tasks"),
            Err(e) => tracing::error!(job_id = %ctx.job_id, error = %e, "watchdog tick failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbedError;
    use crate::pptx::Aspect;
    use crate::store::{ArtifactKind, ArtifactStatus, TaskKind, TaskStatus};
    use crate::test_util::{build_pptx, build_pptx_with_raw_slides};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counting mock for the embeddings API; optionally scripted failures.
    struct CountingApi {
        calls: AtomicUsize,
        dim: usize,
        script: Mutex<VecDeque<EmbedError>>,
    }

    impl CountingApi {
        fn ok(dim: usize) -> Arc<Self> {
            Self::scripted(dim, vec![])
        }

        fn scripted(dim: usize, failures: Vec<EmbedError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                dim,
                script: Mutex::new(failures.into()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingApi for CountingApi {
        async fn embed(
            &self,
            _model: &str,
            inputs: &[String],
        ) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(failure) = self.script.lock().unwrap().pop_front() {
                return Err(failure);
            }
            Ok(inputs.iter().map(|_| vec![0.5; self.dim]).collect())
        }
    }

    fn manager(api: Arc<dyn EmbeddingApi>) -> Arc<JobManager> {
        Arc::new(JobManager::new(
            Arc::new(EventBus::new()),
            api,
            "soffice-unavailable-in-tests",
        ))
    }

    fn text_only(pool: usize) -> IndexOptions {
        IndexOptions {
            enable_thumb: false,
            enable_text_vec: false,
            enable_img_vec: false,
            enable_bm25: false,
            pools: crate::config::WorkerPools {
                text: pool,
                ..Default::default()
            },
            ..IndexOptions::default()
        }
    }

    async fn wait_terminal(mgr: &JobManager, job_id: &str) -> JobStatusReport {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if let Some(report) = mgr.job_status(job_id).await.unwrap() {
                let status = JobStatus::parse(&report.status).unwrap();
                if status.is_terminal() {
                    return report;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} did not reach a terminal status in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn assert_all_tasks_terminal(root: &Path, job_id: &str) {
        let store = Store::open(root).unwrap();
        assert_eq!(store.non_terminal_task_count(job_id).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_text_and_bm25_job_completes() {
        let dir = tempfile::tempdir().unwrap();
        build_pptx(&dir.path().join("deck.pptx"), &["alpha", "beta", "gamma"], None);
        let mgr = manager(CountingApi::ok(8));
        let options = IndexOptions {
            enable_thumb: false,
            enable_text_vec: false,
            enable_img_vec: false,
            ..IndexOptions::default()
        };

        let job_id = mgr.create_index_job(dir.path(), options).await.unwrap();
        let report = wait_terminal(&mgr, &job_id).await;

        assert_eq!(report.status, "completed");
        assert_eq!(report.counters.text.ready, 3);
        assert_eq!(report.counters.bm25.ready, 3);
        assert!(report.errors_summary.is_empty());
        assert_all_tasks_terminal(dir.path(), &job_id);

        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.fts_row_count().unwrap(), 3);
    }

    /// S3: a malformed slide errors that page only; the job completes.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_poisoned_page_stays_on_page_boundary() {
        let dir = tempfile::tempdir().unwrap();
        build_pptx_with_raw_slides(
            &dir.path().join("deck.pptx"),
            &["page one", "ignored", "page three"],
            &[(2, "<p:sld><a:p><a:t>broken</a:mismatch></a:p></p:sld>")],
            None,
        );
        let mgr = manager(CountingApi::ok(8));
        let options = IndexOptions {
            enable_thumb: false,
            enable_text_vec: false,
            enable_img_vec: false,
            ..IndexOptions::default()
        };

        let job_id = mgr.create_index_job(dir.path(), options).await.unwrap();
        let report = wait_terminal(&mgr, &job_id).await;
        assert_eq!(report.status, "completed");

        let store = Store::open(dir.path()).unwrap();
        let file = store
            .file_by_path(&dir.path().join("deck.pptx").to_string_lossy())
            .unwrap()
            .unwrap();
        let pages = store.pages_for_file(file.id).unwrap();
        assert_eq!(
            store.artifact_status(pages[0].id, ArtifactKind::Text).unwrap(),
            Some(ArtifactStatus::Ready)
        );
        assert_eq!(
            store.artifact_status(pages[1].id, ArtifactKind::Text).unwrap(),
            Some(ArtifactStatus::Error)
        );
        assert_eq!(
            store
                .artifact_error_code(pages[1].id, ArtifactKind::Text)
                .unwrap()
                .as_deref(),
            Some("TEXT_EXTRACT_FAIL")
        );
        assert_eq!(
            store.artifact_status(pages[2].id, ArtifactKind::Text).unwrap(),
            Some(ArtifactStatus::Ready)
        );
        // The poisoned page's bm25 is skipped, the others are ready.
        assert_eq!(
            store.artifact_status(pages[1].id, ArtifactKind::Bm25).unwrap(),
            Some(ArtifactStatus::Skipped)
        );
        assert_eq!(
            store.artifact_status(pages[0].id, ArtifactKind::Bm25).unwrap(),
            Some(ArtifactStatus::Ready)
        );
        assert!(report
            .errors_summary
            .iter()
            .any(|e| e.code == "TEXT_EXTRACT_FAIL"));
        assert_all_tasks_terminal(dir.path(), &job_id);
    }

    /// S2: two pages with identical text cost exactly one upstream call.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_shared_text_dedup_hits_upstream_once() {
        let dir = tempfile::tempdir().unwrap();
        build_pptx(
            &dir.path().join("deck.pptx"),
            &["hello world", "hello world"],
            None,
        );
        let api = CountingApi::ok(8);
        let mgr = manager(api.clone());
        let options = IndexOptions {
            enable_thumb: false,
            enable_img_vec: false,
            enable_bm25: false,
            pools: crate::config::WorkerPools {
                text_vec: 1,
                ..Default::default()
            },
            ..IndexOptions::default()
        };

        let job_id = mgr.create_index_job(dir.path(), options).await.unwrap();
        let report = wait_terminal(&mgr, &job_id).await;
        assert_eq!(report.status, "completed");
        assert_eq!(report.counters.text_vec.ready, 2);
        assert_eq!(api.call_count(), 1);

        let store = Store::open(dir.path()).unwrap();
        let file = store
            .file_by_path(&dir.path().join("deck.pptx").to_string_lossy())
            .unwrap()
            .unwrap();
        let pages = store.pages_for_file(file.id).unwrap();
        let sig_a = store
            .get_page_text_embedding_sig(pages[0].id, "text-embedding-3-large")
            .unwrap()
            .unwrap();
        let sig_b = store
            .get_page_text_embedding_sig(pages[1].id, "text-embedding-3-large")
            .unwrap()
            .unwrap();
        assert_eq!(sig_a, sig_b);
    }

    /// Empty pages embed as the canonical zero vector with zero remote calls.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_page_short_circuits_embedding() {
        let dir = tempfile::tempdir().unwrap();
        build_pptx(&dir.path().join("deck.pptx"), &[""], None);
        let api = CountingApi::ok(8);
        let mgr = manager(api.clone());
        let options = IndexOptions {
            enable_thumb: false,
            enable_img_vec: false,
            enable_bm25: false,
            text_embed_dim_fallback: 8,
            ..IndexOptions::default()
        };

        let job_id = mgr.create_index_job(dir.path(), options).await.unwrap();
        let report = wait_terminal(&mgr, &job_id).await;
        assert_eq!(report.status, "completed");
        assert_eq!(api.call_count(), 0);

        let store = Store::open(dir.path()).unwrap();
        let vector = store
            .get_cached_text_vector("text-embedding-3-large", "")
            .unwrap()
            .unwrap();
        assert_eq!(vector, vec![0.0; 8]);
    }

    /// S1: touching mtime re-extracts text, but unchanged signatures mean
    /// zero new upstream calls.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_incremental_reindex_reuses_embedding_cache() {
        let dir = tempfile::tempdir().unwrap();
        let deck = dir.path().join("deck.pptx");
        build_pptx(&deck, &["one", "two", "three"], None);
        let api = CountingApi::ok(8);
        let mgr = manager(api.clone());
        let options = IndexOptions {
            enable_thumb: false,
            enable_img_vec: false,
            enable_bm25: false,
            ..IndexOptions::default()
        };

        let first = mgr
            .create_index_job(dir.path(), options.clone())
            .await
            .unwrap();
        let report = wait_terminal(&mgr, &first).await;
        assert_eq!(report.status, "completed");
        assert_eq!(report.counters.text_vec.ready, 3);
        let calls_after_first = api.call_count();
        assert_eq!(calls_after_first, 3);

        // Same content, newer mtime.
        let file = std::fs::OpenOptions::new().write(true).open(&deck).unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        let second = mgr.create_index_job(dir.path(), options).await.unwrap();
        let report = wait_terminal(&mgr, &second).await;
        assert_eq!(report.status, "completed");
        assert_eq!(report.counters.text.ready, 3);
        assert_eq!(report.counters.text_vec.ready, 3);
        assert_eq!(api.call_count(), calls_after_first);
        assert_all_tasks_terminal(dir.path(), &second);
    }

    /// Auth failure kills the text_vec pipeline, nothing else.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_failure_aborts_only_embedding_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        build_pptx(&dir.path().join("deck.pptx"), &["a", "b", "c"], None);
        let api = CountingApi::scripted(8, vec![EmbedError::Auth]);
        let mgr = manager(api.clone());
        let options = IndexOptions {
            enable_thumb: false,
            enable_img_vec: false,
            pools: crate::config::WorkerPools {
                text_vec: 1,
                ..Default::default()
            },
            ..IndexOptions::default()
        };

        let job_id = mgr.create_index_job(dir.path(), options).await.unwrap();
        let report = wait_terminal(&mgr, &job_id).await;
        assert_eq!(report.status, "completed");
        // One attempt hit the API; the sweep killed the rest without calls.
        assert_eq!(api.call_count(), 1);
        assert_eq!(report.counters.text_vec.error, 3);
        assert_eq!(report.counters.text.ready, 3);
        assert_eq!(report.counters.bm25.ready, 3);
        assert!(report.errors_summary.iter().any(|e| e.code == "OPENAI_AUTH"));
        assert_all_tasks_terminal(dir.path(), &job_id);
    }

    /// S5: pause stops new ready transitions (beyond the in-flight tail),
    /// resume completes the job from the persistent queue.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_freezes_progress_and_resume_completes() {
        let dir = tempfile::tempdir().unwrap();
        let slides: Vec<String> = (0..300).map(|i| format!("slide number {i}")).collect();
        let slide_refs: Vec<&str> = slides.iter().map(String::as_str).collect();
        build_pptx(&dir.path().join("big.pptx"), &slide_refs, None);
        let mgr = manager(CountingApi::ok(8));

        let job_id = mgr
            .create_index_job(dir.path(), text_only(1))
            .await
            .unwrap();
        let mut rx = mgr.subscribe(&job_id);

        // Pause as soon as the first page lands.
        loop {
            match rx.recv().await {
                Ok(env) => {
                    if let crate::events::JobEvent::ArtifactStateChanged { status, .. } =
                        &env.event
                    {
                        if status == "ready" {
                            break;
                        }
                    }
                    if let crate::events::JobEvent::JobFinished { .. } = &env.event {
                        panic!("job finished before the first ready event was observed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event stream closed early: {e}"),
            }
        }
        mgr.pause_job(&job_id).await.unwrap();
        let at_pause = mgr
            .job_status(&job_id)
            .await
            .unwrap()
            .unwrap()
            .counters
            .text
            .ready;

        // Allow the in-flight page to finish, then verify progress froze.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let settled = mgr
            .job_status(&job_id)
            .await
            .unwrap()
            .unwrap()
            .counters
            .text
            .ready;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let still = mgr
            .job_status(&job_id)
            .await
            .unwrap()
            .unwrap()
            .counters
            .text
            .ready;
        assert_eq!(settled, still, "ready count kept growing while paused");
        // One worker means at most one in-flight page past the pause point.
        assert!(settled <= at_pause + 1, "paused at {at_pause}, settled {settled}");

        mgr.resume_job(&job_id).await.unwrap();
        let report = wait_terminal(&mgr, &job_id).await;
        assert_eq!(report.status, "completed");
        assert_eq!(report.counters.text.ready, 300);
        assert_all_tasks_terminal(dir.path(), &job_id);
    }

    /// Property 8: cancel is idempotent and converges to `cancelled`.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let slides: Vec<String> = (0..200).map(|i| format!("slide {i}")).collect();
        let slide_refs: Vec<&str> = slides.iter().map(String::as_str).collect();
        build_pptx(&dir.path().join("big.pptx"), &slide_refs, None);
        let mgr = manager(CountingApi::ok(8));

        let job_id = mgr
            .create_index_job(dir.path(), text_only(1))
            .await
            .unwrap();
        mgr.cancel_job(&job_id).await.unwrap();
        mgr.cancel_job(&job_id).await.unwrap();

        let report = wait_terminal(&mgr, &job_id).await;
        assert_eq!(report.status, "cancelled");
        assert_all_tasks_terminal(dir.path(), &job_id);

        // Cancelling a terminal job is a no-op success with identical state.
        let before = mgr.job_status(&job_id).await.unwrap().unwrap();
        mgr.cancel_job(&job_id).await.unwrap();
        let after = mgr.job_status(&job_id).await.unwrap().unwrap();
        assert_eq!(before.status, after.status);
        assert_eq!(before.counters.text.ready, after.counters.text.ready);
        assert_eq!(before.counters.text.cancelled, after.counters.text.cancelled);
    }

    /// S6: a synthetic stale task is expired by one watchdog tick.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_watchdog_tick_expires_stale_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        store.insert_job("j1", &dir.path().to_string_lossy(), "{}").unwrap();
        let file_id = store
            .upsert_file("/lib/deck.pptx", 1, 1, 1, Aspect::FourThree, None)
            .unwrap();
        store.sync_pages(file_id, 1, Aspect::FourThree, 1, 1).unwrap();
        let page = &store.pages_for_file(file_id).unwrap()[0];
        let task_id = store
            .insert_raw_task(
                "j1",
                Some(page.id),
                Some(file_id),
                TaskKind::Text,
                TaskStatus::Running,
                Some(crate::store::now_epoch() - 999),
            )
            .unwrap();

        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe("j1");
        let emitter = JobEmitter::new("j1".to_string(), store.clone(), bus.clone(), None);

        let expired = watchdog_tick(&store, &emitter, "j1", 120).unwrap();
        assert_eq!(expired, 1);

        let task = store.task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_code.as_deref(), Some("WATCHDOG_TIMEOUT"));

        let env = rx.try_recv().unwrap();
        match env.event {
            crate::events::JobEvent::TaskError {
                task_id: evt_task,
                error_code,
                ..
            } => {
                assert_eq!(evt_task, task_id);
                assert_eq!(error_code, "WATCHDOG_TIMEOUT");
            }
            other => panic!("expected task_error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_root_is_rejected() {
        let mgr = manager(CountingApi::ok(8));
        let err = mgr
            .create_index_job(Path::new("/nonexistent/library"), IndexOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRoot(_)));
    }

    /// S4: a hung conversion times out, killing thumb/img_vec for the file
    /// while the text pipeline proceeds.
    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_pdf_timeout_fails_derived_artifacts_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        build_pptx(&dir.path().join("deck.pptx"), &["a", "b", "c"], None);
        let bin = dir.path().join("hanging-soffice.sh");
        std::fs::write(&bin, "#!/bin/sh\nsleep 600\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mgr = Arc::new(JobManager::new(
            Arc::new(EventBus::new()),
            CountingApi::ok(8),
            &bin,
        ));
        let options = IndexOptions {
            enable_text_vec: false,
            enable_bm25: false,
            pdf_timeout_sec: 1,
            ..IndexOptions::default()
        };

        let job_id = mgr.create_index_job(dir.path(), options).await.unwrap();
        let report = wait_terminal(&mgr, &job_id).await;
        assert_eq!(report.status, "completed");
        assert_eq!(report.counters.text.ready, 3);
        assert_eq!(report.counters.thumb.error, 3);
        assert_eq!(report.counters.img_vec.error, 3);

        let store = Store::open(dir.path()).unwrap();
        let file = store
            .file_by_path(&dir.path().join("deck.pptx").to_string_lossy())
            .unwrap()
            .unwrap();
        for page in store.pages_for_file(file.id).unwrap() {
            assert_eq!(
                store
                    .artifact_error_code(page.id, ArtifactKind::Thumb)
                    .unwrap()
                    .as_deref(),
                Some("PDF_CONVERT_TIMEOUT")
            );
        }
        assert!(report
            .errors_summary
            .iter()
            .any(|e| e.code == "PDF_CONVERT_TIMEOUT"));
        assert_all_tasks_terminal(dir.path(), &job_id);
    }
}
