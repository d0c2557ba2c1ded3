//! Job orchestration: planning, worker pools, control plane, watchdog.
//!
//! A job runs as a set of tokio tasks inside the daemon: one pool per task
//! kind reading from the persistent queue in the store, a stats loop, and a
//! watchdog. Pause, resume, and cancel are cooperative; the database is the
//! only authoritative pending-set, so a restarted daemon resumes from it.

mod manager;
mod workers;

pub use manager::{watchdog_tick, JobError, JobManager, JobStatusReport};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::IndexOptions;
use crate::convert::PdfConverter;
use crate::embeddings::EmbeddingClient;
use crate::events::{EventBus, JobEvent, JobLogWriter};
use crate::store::Store;

/// Cooperative control token shared by every worker of a job.
#[derive(Clone)]
pub struct JobControl {
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    resume: Arc<Notify>,
    auth_failed: Arc<AtomicBool>,
    /// Text signatures with an embedding call in flight, so two workers
    /// never pay upstream twice for the same content.
    inflight_sigs: Arc<Mutex<HashSet<String>>>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            resume: Arc::new(Notify::new()),
            auth_failed: Arc::new(AtomicBool::new(false)),
            inflight_sigs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
        // Wake paused workers so they can observe the cancellation.
        self.resume.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Block while paused. Returns immediately once resumed or cancelled.
    pub async fn wait_if_paused(&self) {
        loop {
            if !self.is_paused() || self.is_cancelled() {
                return;
            }
            let resumed = self.resume.notified();
            if !self.is_paused() || self.is_cancelled() {
                return;
            }
            resumed.await;
        }
    }

    pub fn set_auth_failed(&self) {
        self.auth_failed.store(true, Ordering::SeqCst);
    }

    pub fn auth_failed(&self) -> bool {
        self.auth_failed.load(Ordering::SeqCst)
    }

    fn sig_key(model: &str, sig: &str) -> String {
        format!("{model}\u{1}{sig}")
    }

    /// Claim an in-flight embedding slot for a signature. The caller must
    /// release it, success or not.
    pub fn try_claim_sig(&self, model: &str, sig: &str) -> bool {
        self.inflight_sigs
            .lock()
            .expect("inflight lock poisoned")
            .insert(Self::sig_key(model, sig))
    }

    pub fn release_sig(&self, model: &str, sig: &str) {
        self.inflight_sigs
            .lock()
            .expect("inflight lock poisoned")
            .remove(&Self::sig_key(model, sig));
    }
}

/// Event sink for one job: publishes on the bus, persists the row, and
/// appends the JSONL log line. Snapshots are bus-only (derivable, >= 1 Hz).
pub struct JobEmitter {
    job_id: String,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    log: Option<JobLogWriter>,
}

impl JobEmitter {
    pub fn new(
        job_id: String,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        log: Option<JobLogWriter>,
    ) -> Self {
        Self {
            job_id,
            store,
            bus,
            log,
        }
    }

    pub fn emit(&self, event: JobEvent) {
        let envelope = self.bus.publish(&self.job_id, event);
        if !matches!(envelope.event, JobEvent::StatsSnapshot { .. }) {
            match serde_json::to_string(&envelope.event) {
                Ok(payload) => {
                    if let Err(e) = self.store.append_event(
                        &self.job_id,
                        envelope.seq,
                        envelope.event.type_name(),
                        &payload,
                    ) {
                        tracing::warn!(error = %e, "failed to persist event");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
            }
        }
        if let Some(log) = &self.log {
            log.append(&envelope);
        }
    }
}

/// Everything a worker needs, passed explicitly instead of via globals.
#[derive(Clone)]
pub(crate) struct JobContext {
    pub job_id: String,
    pub store: Arc<Store>,
    pub emitter: Arc<JobEmitter>,
    pub options: IndexOptions,
    pub control: JobControl,
    pub embed_client: Arc<EmbeddingClient>,
    pub converter: PdfConverter,
}
