//! Presentation package parsing: per-slide text and deck aspect ratio.

pub mod aspect;
pub mod extractor;

pub use aspect::{detect_aspect, Aspect};
pub use extractor::{
    extract_slide_text, fast_text_sig, normalize_text, slide_count, ExtractError,
};
