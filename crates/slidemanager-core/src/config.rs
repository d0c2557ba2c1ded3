//! Typed job options.
//!
//! Every field has a serde default so API callers only send what they want
//! to override.

use serde::{Deserialize, Serialize};

use crate::pptx::Aspect;

/// Per-pool worker parallelism.
///
/// PDF conversion defaults to a single worker: each invocation spawns the
/// external converter with its own user profile, and the tool is expensive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPools {
    #[serde(default = "default_text_workers")]
    pub text: usize,
    #[serde(default = "default_pdf_workers")]
    pub pdf: usize,
    #[serde(default = "default_thumb_workers")]
    pub thumb: usize,
    #[serde(default = "default_text_vec_workers")]
    pub text_vec: usize,
    #[serde(default = "default_img_vec_workers")]
    pub img_vec: usize,
    #[serde(default = "default_bm25_workers")]
    pub bm25: usize,
}

fn default_text_workers() -> usize {
    4
}
fn default_pdf_workers() -> usize {
    1
}
fn default_thumb_workers() -> usize {
    2
}
fn default_text_vec_workers() -> usize {
    2
}
fn default_img_vec_workers() -> usize {
    2
}
fn default_bm25_workers() -> usize {
    2
}

impl Default for WorkerPools {
    fn default() -> Self {
        Self {
            text: default_text_workers(),
            pdf: default_pdf_workers(),
            thumb: default_thumb_workers(),
            text_vec: default_text_vec_workers(),
            img_vec: default_img_vec_workers(),
            bm25: default_bm25_workers(),
        }
    }
}

/// Options for one indexing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default = "default_true")]
    pub enable_text: bool,
    #[serde(default = "default_true")]
    pub enable_thumb: bool,
    #[serde(default = "default_true")]
    pub enable_text_vec: bool,
    #[serde(default = "default_true")]
    pub enable_img_vec: bool,
    #[serde(default = "default_true")]
    pub enable_bm25: bool,
    /// Re-derive every artifact even if already `ready`.
    #[serde(default)]
    pub force_rebuild: bool,
    /// Pages per durable commit. 1 (the default) checkpoints every page.
    #[serde(default = "default_commit_every_pages")]
    pub commit_every_pages: u32,
    /// Secondary flush trigger when `commit_every_pages > 1`.
    #[serde(default = "default_commit_every_sec")]
    pub commit_every_sec: u64,
    /// Whether the scan descends into subdirectories of the library root.
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_pdf_timeout_sec")]
    pub pdf_timeout_sec: u64,
    #[serde(default = "default_text_embed_model")]
    pub text_embed_model: String,
    /// Vector dim assumed before the first successful embedding call reveals
    /// the real one (needed to store zero vectors for empty pages).
    #[serde(default = "default_text_embed_dim_fallback")]
    pub text_embed_dim_fallback: usize,
    #[serde(default = "default_image_embed_model")]
    pub image_embed_model: String,
    /// Aspect whose thumbnail size is used for decks with unknown aspect.
    #[serde(default = "default_thumb_default_aspect")]
    pub thumb_default_aspect: Aspect,
    #[serde(default = "default_watchdog_threshold_sec")]
    pub watchdog_threshold_sec: u64,
    #[serde(default = "default_req_per_min")]
    pub req_per_min: u32,
    #[serde(default = "default_tok_per_min")]
    pub tok_per_min: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub pools: WorkerPools,
}

fn default_true() -> bool {
    true
}
fn default_commit_every_pages() -> u32 {
    1
}
fn default_commit_every_sec() -> u64 {
    5
}
fn default_pdf_timeout_sec() -> u64 {
    120
}
fn default_text_embed_model() -> String {
    "text-embedding-3-large".to_string()
}
fn default_text_embed_dim_fallback() -> usize {
    3072
}
fn default_image_embed_model() -> String {
    crate::embeddings::TILE_LUMA_MODEL.to_string()
}
fn default_thumb_default_aspect() -> Aspect {
    Aspect::FourThree
}
fn default_watchdog_threshold_sec() -> u64 {
    120
}
fn default_req_per_min() -> u32 {
    300
}
fn default_tok_per_min() -> u32 {
    150_000
}
fn default_max_retries() -> u32 {
    5
}

impl Default for IndexOptions {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty options object must deserialize")
    }
}
