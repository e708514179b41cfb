//! Error types for the edgequake-table2latex library.
//!
//! Four error types reflect four distinct failure scopes:
//!
//! * [`TableFormulaError`] — **Fatal**: the run cannot proceed at all (bad
//!   input bytes, document cannot be opened, vision backend not configured).
//!   Returned as `Err(TableFormulaError)` from the top-level `extract*`
//!   functions.
//!
//! * [`CellError`] — **Non-fatal**: a single cell could not be rendered or
//!   recognised. Recorded in [`crate::output::Diagnostics`] while the cell
//!   itself stays in the result with `latex` unset.
//!
//! * [`PageError`] — a single page could not be read or rasterised. Folded
//!   into a page-level diagnostic.
//!
//! * [`RecognitionError`] — the failure type of the vision capability
//!   ([`crate::pipeline::vision::FormulaRecognizer`]). The orchestrator folds
//!   it into a [`CellError`]; it never escapes a run.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-table2latex library.
#[derive(Debug, Error)]
pub enum TableFormulaError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The uploaded document contained no bytes.
    #[error("Empty document: no bytes were provided")]
    EmptyDocument,

    /// The bytes do not start with the `%PDF` magic.
    #[error("Input is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// The document cannot be opened or parsed at all.
    #[error("PDF is corrupt and cannot be opened: {detail}")]
    CorruptPdf { detail: String },

    /// PDF requires a password.
    #[error("PDF is encrypted and requires a password")]
    PasswordRequired,

    // ── Vision errors ─────────────────────────────────────────────────────
    /// No vision backend could be resolved (missing API key etc.).
    #[error("Vision provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed or a run argument is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single cell.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellError {
    /// The clamped crop region has zero area.
    #[error("crop of {width}x{height} px is empty after clamping to the page raster")]
    DegenerateCrop { width: u32, height: u32 },

    /// Cropping or PNG encoding failed.
    #[error("render failed: {detail}")]
    RenderFailed { detail: String },

    /// Writing the PNG to storage failed.
    #[error("storing '{path}' failed: {detail}")]
    StoreFailed { path: String, detail: String },

    /// The vision call failed (transport, HTTP status, malformed reply).
    #[error("recognition failed: {detail}")]
    RecognitionFailed { detail: String },

    /// The vision call exceeded its per-call timeout.
    #[error("recognition timed out after {secs}s")]
    RecognitionTimeout { secs: u64 },

    /// The run was cancelled before this cell's recognition was issued.
    #[error("recognition skipped: run cancelled")]
    RecognitionSkipped,
}

/// Failure reading or rasterising one page.
///
/// Recorded as a page-level diagnostic; the run moves on to the next page.
#[derive(Debug, Clone, Error)]
pub enum PageError {
    /// The page could not be loaded from the document.
    #[error("page {page} could not be loaded: {detail}")]
    Load { page: usize, detail: String },

    /// The page's objects or text could not be read.
    #[error("page {page} content could not be read: {detail}")]
    Content { page: usize, detail: String },

    /// The page could not be rendered to a bitmap.
    #[error("page {page} could not be rasterised: {detail}")]
    Raster { page: usize, detail: String },
}

/// Failure of a single vision recognition call.
#[derive(Debug, Clone, Error)]
pub enum RecognitionError {
    /// The service answered with a non-2xx status.
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never produced a response (DNS, TLS, connection reset…).
    #[error("request failed: {0}")]
    Transport(String),

    /// The HTTP client gave up waiting for the service.
    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The reply did not contain a usable `{"latex": …}` object.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// An edgequake-llm provider reported an error.
    #[error("provider error: {0}")]
    Provider(String),
}

impl RecognitionError {
    /// Whether a retry could plausibly succeed (rate limits, 5xx, transport).
    pub fn is_transient(&self) -> bool {
        match self {
            RecognitionError::Http { status, .. } => *status == 429 || *status >= 500,
            RecognitionError::Transport(_) => true,
            RecognitionError::Provider(msg) => msg.contains("429") || msg.contains("rate limit"),
            RecognitionError::Timeout { .. } | RecognitionError::MalformedResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_a_pdf_display() {
        let e = TableFormulaError::NotAPdf { magic: *b"PK\x03\x04" };
        assert!(e.to_string().contains("not a valid PDF"));
    }

    #[test]
    fn cell_error_serialises_with_kind_tag() {
        let e = CellError::RecognitionTimeout { secs: 30 };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "recognition_timeout");
        assert_eq!(json["secs"], 30);
    }

    #[test]
    fn cell_error_display() {
        let e = CellError::DegenerateCrop { width: 0, height: 12 };
        assert!(e.to_string().contains("0x12"), "got: {e}");
    }

    #[test]
    fn rate_limits_are_transient() {
        let e = RecognitionError::Http {
            status: 429,
            body: "too many requests".into(),
        };
        assert!(e.is_transient());
        let e = RecognitionError::Http {
            status: 401,
            body: "bad key".into(),
        };
        assert!(!e.is_transient());
        assert!(!RecognitionError::MalformedResponse("x".into()).is_transient());
        assert!(!RecognitionError::Timeout { secs: 5 }.is_transient());
    }
}
