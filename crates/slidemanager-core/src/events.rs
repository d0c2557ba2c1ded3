//! Per-job event stream with bounded, drop-oldest delivery.
//!
//! Publishing never blocks: the channel is a bounded broadcast ring and a
//! lagging subscriber skips the oldest events (sequence gaps, never
//! reordering). Sequence numbers are job-local, assigned at publish time
//! under the channel lock, and strictly increasing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::{Counters, RunningTask};

/// Ring capacity per job. A slow SSE consumer misses middle events but
/// always sees the most recent ones.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Rate estimates included in stats snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Rates {
    pub pages_per_sec: f64,
    pub tasks_finished: u64,
}

/// Everything observable about a job, as published on its bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Hello {
        job_id: String,
    },
    JobCreated {
        job_id: String,
        library_root: String,
    },
    JobStateChanged {
        job_id: String,
        status: String,
    },
    PlanningProgress {
        job_id: String,
        files_scanned: u64,
        pages_planned: u64,
        path: Option<String>,
    },
    TaskStarted {
        job_id: String,
        task_id: i64,
        kind: String,
        page_id: Option<i64>,
        file_id: Option<i64>,
    },
    TaskProgress {
        job_id: String,
        task_id: i64,
        kind: String,
        progress: f64,
    },
    TaskError {
        job_id: String,
        task_id: i64,
        kind: String,
        error_code: String,
        error_message: String,
    },
    ArtifactStateChanged {
        job_id: String,
        page_id: i64,
        kind: String,
        status: String,
    },
    /// Emitted at >= 1 Hz while a job runs. All three fields are always
    /// present; `now_running` is null when no task is active.
    StatsSnapshot {
        job_id: String,
        counters: Counters,
        now_running: Option<RunningTask>,
        rates: Rates,
    },
    JobFinished {
        job_id: String,
        status: String,
        summary: serde_json::Value,
    },
}

impl JobEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::JobCreated { .. } => "job_created",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::PlanningProgress { .. } => "planning_progress",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskError { .. } => "task_error",
            Self::ArtifactStateChanged { .. } => "artifact_state_changed",
            Self::StatsSnapshot { .. } => "stats_snapshot",
            Self::JobFinished { .. } => "job_finished",
        }
    }
}

/// An event plus its job-local sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(flatten)]
    pub event: JobEvent,
}

struct JobChannel {
    tx: broadcast::Sender<Envelope>,
    next_seq: u64,
}

/// One bounded channel per job.
pub struct EventBus {
    capacity: usize,
    channels: Mutex<HashMap<String, JobChannel>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event, assigning the next sequence number. Never blocks;
    /// send errors (no subscribers) are ignored.
    pub fn publish(&self, job_id: &str, event: JobEvent) -> Envelope {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        let channel = channels
            .entry(job_id.to_string())
            .or_insert_with(|| JobChannel {
                tx: broadcast::channel(self.capacity).0,
                next_seq: 0,
            });
        let envelope = Envelope {
            seq: channel.next_seq,
            event,
        };
        channel.next_seq += 1;
        let _ = channel.tx.send(envelope.clone());
        envelope
    }

    /// Subscribe to a job's stream. Only events published after this call
    /// are delivered.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<Envelope> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| JobChannel {
                tx: broadcast::channel(self.capacity).0,
                next_seq: 0,
            })
            .tx
            .subscribe()
    }

    /// Drop a finished job's channel.
    pub fn remove(&self, job_id: &str) {
        self.channels
            .lock()
            .expect("event bus lock poisoned")
            .remove(job_id);
    }
}

/// Render one envelope as a server-sent-events frame.
pub fn sse_frame(envelope: &Envelope) -> String {
    let json = serde_json::to_string(envelope).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize event");
        "{}".to_string()
    });
    format!("data: {json}\n\n")
}

/// Appends each published event as one JSON line under
/// `logs/jobs/<job_id>.log.jsonl`. Best-effort: a failed write is logged
/// and indexing continues.
pub struct JobLogWriter {
    file: Mutex<File>,
}

impl JobLogWriter {
    pub fn create(logs_dir: &Path, job_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join(format!("{job_id}.log.jsonl")))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, envelope: &Envelope) {
        let Ok(json) = serde_json::to_string(envelope) else {
            return;
        };
        let mut file = self.file.lock().expect("job log lock poisoned");
        if let Err(e) = writeln!(file, "{json}") {
            tracing::warn!(error = %e, "failed to append job log line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event(job: &str, status: &str) -> JobEvent {
        JobEvent::JobStateChanged {
            job_id: job.to_string(),
            status: status.to_string(),
        }
    }

    #[test]
    fn test_seq_strictly_increasing_in_publish_order() {
        let bus = EventBus::new();
        let mut last = None;
        for i in 0..20 {
            let env = bus.publish("job-1", state_event("job-1", &format!("s{i}")));
            if let Some(prev) = last {
                assert!(env.seq > prev);
            }
            last = Some(env.seq);
        }
    }

    #[test]
    fn test_seq_is_per_job() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("a", state_event("a", "running")).seq, 0);
        assert_eq!(bus.publish("b", state_event("b", "running")).seq, 0);
        assert_eq!(bus.publish("a", state_event("a", "paused")).seq, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_but_sees_latest() {
        let bus = EventBus::with_capacity(4);
        let mut rx = bus.subscribe("job-1");
        for i in 0..10 {
            bus.publish("job-1", state_event("job-1", &format!("s{i}")));
        }
        // The ring kept only the newest 4; the receiver reports the lag
        // then resumes, still in order.
        let first = loop {
            match rx.recv().await {
                Ok(env) => break env,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    assert!(skipped > 0);
                }
                Err(e) => panic!("unexpected recv error: {e}"),
            }
        };
        assert!(first.seq >= 6);
        let mut last_seq = first.seq;
        while let Ok(env) = rx.try_recv() {
            assert!(env.seq > last_seq);
            last_seq = env.seq;
        }
        assert_eq!(last_seq, 9);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_block_or_fail() {
        let bus = EventBus::with_capacity(2);
        for i in 0..100 {
            bus.publish("job-1", state_event("job-1", &format!("s{i}")));
        }
    }

    #[test]
    fn test_sse_frame_shape() {
        let bus = EventBus::new();
        let env = bus.publish(
            "job-1",
            JobEvent::Hello {
                job_id: "job-1".to_string(),
            },
        );
        let frame = sse_frame(&env);
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"hello\""));
        assert!(frame.contains("\"seq\":0"));
    }

    #[test]
    fn test_snapshot_payload_always_has_required_fields() {
        let bus = EventBus::new();
        let env = bus.publish(
            "job-1",
            JobEvent::StatsSnapshot {
                job_id: "job-1".to_string(),
                counters: Counters::default(),
                now_running: None,
                rates: Rates::default(),
            },
        );
        let value: serde_json::Value = serde_json::from_str(
            sse_frame(&env)
                .trim_start_matches("data: ")
                .trim_end(),
        )
        .unwrap();
        assert!(value.get("counters").is_some());
        // Present and null, not absent.
        assert!(value.get("now_running").is_some());
        assert!(value["now_running"].is_null());
        assert!(value.get("rates").is_some());
        for kind in ["text", "thumb", "text_vec", "img_vec", "bm25"] {
            assert!(value["counters"].get(kind).is_some(), "missing {kind}");
        }
    }

    #[test]
    fn test_job_log_writer_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JobLogWriter::create(dir.path(), "job-1").unwrap();
        let bus = EventBus::new();
        for i in 0..3 {
            let env = bus.publish("job-1", state_event("job-1", &format!("s{i}")));
            writer.append(&env);
        }
        let content = std::fs::read_to_string(dir.path().join("job-1.log.jsonl")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["type"], "job_state_changed");
        }
    }
}
