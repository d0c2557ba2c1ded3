//! SlideManager Core - the indexing daemon behind the desktop app
//!
//! This crate turns a library of .pptx files into a per-page, incrementally
//! updatable artifact store. It contains:
//! - Embedded SQLite persistence with per-page checkpoints (store)
//! - Presentation parsing: slide text, signatures, aspect (pptx)
//! - External converter supervision, presentation -> PDF (convert)
//! - PDF page rasterization into thumbnails (thumbs)
//! - Rate-limited OpenAI text embeddings + local image embeddings
//!   (embeddings, limiter)
//! - Library scanning and work planning (planner)
//! - Job orchestration: worker pools, pause/resume/cancel, watchdog (jobs)
//! - Per-job bounded event streams with SSE framing (events)
//!
//! The HTTP control surface lives in the daemon crate; nothing here depends
//! on it.

pub mod config;
pub mod convert;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod jobs;
pub mod limiter;
pub mod planner;
pub mod pptx;
pub mod store;
pub mod thumbs;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{IndexOptions, WorkerPools};
pub use embeddings::{EmbeddingApi, OpenAiEmbeddingApi};
pub use error::ErrorCode;
pub use events::{sse_frame, EventBus, JobEvent};
pub use jobs::{JobError, JobManager, JobStatusReport};
pub use pptx::Aspect;
pub use store::Store;
