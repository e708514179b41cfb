//! # edgequake-table2latex
//!
//! Recognise the formulas inside PDF table cells with Vision Language Models
//! and backfill them into a structured table/cell result as LaTeX.
//!
//! ## Why this crate?
//!
//! Text extraction gets table *structure* right but mangles formulas:
//! sub- and superscripts, fractions and Greek letters come out as loose
//! glyphs. This crate keeps the structure from the PDF's own geometry and
//! asks a vision model only about what it is good at: reading the formula
//! in one small cell image.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes
//!  │
//!  ├─ 1. Extract   ruling lines → tables → cell boxes + text (pdfium)
//!  ├─ 2. Dedup     collapse duplicate cells by rounded bbox
//!  ├─ 3. Render    one raster per page, one PNG crop per cell
//!  ├─ 4. Recognise concurrent vision calls (GLM / gpt-4.1-nano / claude / …)
//!  └─ 5. Backfill  LaTeX into cells by bbox + diagnostics for every miss
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_table2latex::{extract_table_formulas, RecognitionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Backend from GLM_API_KEY, or OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = RecognitionConfig::default();
//!     let bytes = std::fs::read("paper.pdf")?;
//!     let result = extract_table_formulas(bytes, "my-project", &config).await?;
//!     for table in &result.tables {
//!         println!("page {} table {}: {} cells", table.page, table.table_index, table.cells.len());
//!     }
//!     println!("{}", serde_json::to_string_pretty(&result.diagnostics)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `table2latex` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-table2latex = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PagePlan, RecognitionConfig, RecognitionConfigBuilder};
pub use error::{CellError, PageError, RecognitionError, TableFormulaError};
pub use extract::{
    extract_from_input, extract_sync, extract_table_formulas, extract_with_cancel, extract_with_source,
    CancellationFlag, RunStage,
};
pub use output::{
    BoundingBox, BoxKey, Cell, Diagnostic, DiagnosticKind, Diagnostics, PipelineResult, RenderedCellImage,
    TableRegion,
};
pub use pipeline::source::{InMemoryPage, InMemorySource, PageScan, PageSource, PdfiumSource};
pub use pipeline::vision::{CellImage, FormulaRecognizer};
pub use progress::{NoopProgressCallback, ProgressCallback, RecognitionProgressCallback};
