//! Stable error codes surfaced on task and artifact rows.
//!
//! The UI matches on these strings, so they never change once shipped.

use serde::Serialize;

/// Machine-readable failure classification recorded on tasks and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "&'static str")]
pub enum ErrorCode {
    TextExtractFail,
    PdfConvertTimeout,
    PdfConvertFail,
    ThumbRenderFail,
    OpenaiRateLimit,
    OpenaiAuth,
    OpenaiApi,
    EmbedDimMismatch,
    WatchdogTimeout,
    StoreConflict,
    JsonCorrupted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextExtractFail => "TEXT_EXTRACT_FAIL",
            Self::PdfConvertTimeout => "PDF_CONVERT_TIMEOUT",
            Self::PdfConvertFail => "PDF_CONVERT_FAIL",
            Self::ThumbRenderFail => "THUMB_RENDER_FAIL",
            Self::OpenaiRateLimit => "OPENAI_RATE_LIMIT",
            Self::OpenaiAuth => "OPENAI_AUTH",
            Self::OpenaiApi => "OPENAI_API",
            Self::EmbedDimMismatch => "EMBED_DIM_MISMATCH",
            Self::WatchdogTimeout => "WATCHDOG_TIMEOUT",
            Self::StoreConflict => "STORE_CONFLICT",
            Self::JsonCorrupted => "JSON_CORRUPTED",
        }
    }
}

impl From<ErrorCode> for &'static str {
    fn from(code: ErrorCode) -> Self {
        code.as_str()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
