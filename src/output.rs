//! Output types: the table/cell structure, image references and diagnostics
//! returned by a run.
//!
//! Everything here is `Serialize` so the caller (an HTTP handler, the CLI's
//! `--output` writer) can hand a [`PipelineResult`] straight to `serde_json`.
//! The wire shape of a table is `{page, table_index, cells: [{content, bbox,
//! latex}]}`; the extra grid fields ride along.

use crate::error::CellError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of decimal places kept when a bounding box is used as an identity key.
///
/// Table detection produces coordinates with float jitter in the 1e-4 pt
/// range; 0.01 pt is far below anything visible on a rendered page.
pub const BBOX_PRECISION_DIGITS: u32 = 2;

const BBOX_KEY_SCALE: f64 = 100.0;

/// A rectangle in page space (points, origin at the top-left corner).
///
/// Serialised as `{x0, top, x1, bottom}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    #[serde(rename = "top")]
    pub y0: f64,
    pub x1: f64,
    #[serde(rename = "bottom")]
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    /// True unless `x1 > x0` and `y1 > y0` (NaN coordinates are degenerate).
    pub fn is_degenerate(&self) -> bool {
        !(self.x1 > self.x0 && self.y1 > self.y0)
    }

    /// The identity key of this box, rounded to [`BBOX_PRECISION_DIGITS`].
    pub fn key(&self) -> BoxKey {
        let r = |v: f64| (v * BBOX_KEY_SCALE).round() as i64;
        BoxKey(r(self.x0), r(self.y0), r(self.x1), r(self.y1))
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

/// Hashable, rounded identity of a [`BoundingBox`].
///
/// Two boxes whose coordinates agree to [`BBOX_PRECISION_DIGITS`] decimals
/// have equal keys and denote the same cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxKey(pub i64, pub i64, pub i64, pub i64);

impl BoxKey {
    /// Stable text form used in file names, e.g. `7200_9000_14400_10800`.
    pub fn slug(&self) -> String {
        format!("{}_{}_{}_{}", self.0, self.1, self.2, self.3)
    }
}

/// One logical table entry.
///
/// `latex` starts unset and is assigned at most once, by backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Raw extracted text (may be empty).
    pub content: String,
    pub bbox: BoundingBox,
    /// Recognised formula markup, verbatim from the vision model.
    pub latex: Option<String>,
    /// Grid anchor row (0-based).
    pub row: usize,
    /// Grid anchor column (0-based).
    pub col: usize,
    pub rowspan: usize,
    pub colspan: usize,
}

impl Cell {
    pub fn new(content: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            content: content.into(),
            bbox,
            latex: None,
            row: 0,
            col: 0,
            rowspan: 1,
            colspan: 1,
        }
    }
}

/// A detected table on one page with its canonical (deduplicated) cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRegion {
    /// 1-based page number.
    pub page: usize,
    /// Order of detection within the page (0-based).
    pub table_index: usize,
    pub rows: usize,
    pub cols: usize,
    pub bbox: BoundingBox,
    pub cells: Vec<Cell>,
}

/// A persisted cell crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedCellImage {
    pub page: usize,
    pub table_index: usize,
    /// Position of the cell inside its table's `cells`.
    pub cell_index: usize,
    pub filename: String,
    /// Addressable reference served by the static file server.
    pub url: String,
    /// Location on disk.
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub bbox: BoundingBox,
}

/// What a single diagnostic entry is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// `page_end < page_start`; the effective range is empty.
    InvalidPageRange {
        page_start: Option<usize>,
        page_end: Option<usize>,
    },
    /// `page_start` is past the last page; the effective range is empty.
    PageRangeOutOfDocument { page_start: usize, total_pages: usize },
    /// The requested range was cut by the document length or `max_pages`.
    PageRangeClamped { requested: usize, effective: usize },
    /// The run was cancelled before these pages (1-based) were scanned.
    RunCancelled { pages_skipped: Vec<usize> },
    /// The page was read but no structured table was found.
    NoTablesFound {
        /// The page carries raster images but no vector rules or text.
        image_only: bool,
    },
    /// The page could not be read for table detection.
    TableDetectionFailed { detail: String },
    /// A cell could not be rendered or recognised.
    CellFailed { error: CellError },
}

/// One non-fatal issue encountered during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub page: Option<usize>,
    pub table_index: Option<usize>,
    pub bbox: Option<BoundingBox>,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Per-page extraction summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page: usize,
    pub tables_found: usize,
    /// Cells after deduplication, summed over the page's tables.
    pub cells_found: usize,
}

/// Append-only record of a run's non-fatal outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub pages_scanned: usize,
    pub tables_found: usize,
    pub cells_found: usize,
    pub duplicate_cells_dropped: usize,
    pub cells_rendered: usize,
    pub render_failures: usize,
    pub cells_recognized: usize,
    pub recognition_failures: usize,
    pub recognition_timeouts: usize,
    pub recognition_skipped: usize,
    pub pages: Vec<PageSummary>,
    pub entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Append an entry, keeping the failure counters in step.
    pub fn push(&mut self, entry: Diagnostic) {
        if let DiagnosticKind::CellFailed { error } = &entry.kind {
            match error {
                CellError::DegenerateCrop { .. }
                | CellError::RenderFailed { .. }
                | CellError::StoreFailed { .. } => self.render_failures += 1,
                CellError::RecognitionFailed { .. } => self.recognition_failures += 1,
                CellError::RecognitionTimeout { .. } => self.recognition_timeouts += 1,
                CellError::RecognitionSkipped => self.recognition_skipped += 1,
            }
        }
        self.entries.push(entry);
    }

    /// Record a page-level entry.
    pub fn page(&mut self, page: usize, kind: DiagnosticKind, message: impl Into<String>) {
        self.push(Diagnostic {
            page: Some(page),
            table_index: None,
            bbox: None,
            kind,
            message: message.into(),
        });
    }

    /// Record a cell-level failure.
    pub fn cell(&mut self, page: usize, table_index: usize, bbox: BoundingBox, error: CellError) {
        let message = error.to_string();
        self.push(Diagnostic {
            page: Some(page),
            table_index: Some(table_index),
            bbox: Some(bbox),
            kind: DiagnosticKind::CellFailed { error },
            message,
        });
    }

    /// Entries about pages that produced no table (empty or unreadable).
    pub fn page_failures(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| {
            matches!(
                d.kind,
                DiagnosticKind::NoTablesFound { .. } | DiagnosticKind::TableDetectionFailed { .. }
            )
        })
    }

    /// Run-level entries: page range problems and cancellation.
    pub fn run_notes(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.page.is_none())
    }

    /// The failure recorded for one cell, if any.
    pub fn cell_failure(&self, page: usize, table_index: usize, bbox: &BoundingBox) -> Option<&CellError> {
        let key = bbox.key();
        self.entries.iter().find_map(|d| match &d.kind {
            DiagnosticKind::CellFailed { error }
                if d.page == Some(page)
                    && d.table_index == Some(table_index)
                    && d.bbox.map(|b| b.key()) == Some(key) =>
            {
                Some(error)
            }
            _ => None,
        })
    }
}

/// The page bounds a run was asked for and what it actually processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLimits {
    pub page_start: Option<usize>,
    pub page_end: Option<usize>,
    pub max_pages: usize,
    pub render_scale: f32,
    /// 1-based page numbers actually scanned. A cancelled run lists only
    /// the pages it reached.
    pub effective_pages: Vec<usize>,
}

/// Timing of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_duration_ms: u64,
    pub extraction_duration_ms: u64,
    pub render_duration_ms: u64,
    pub recognition_duration_ms: u64,
}

/// Everything a run produced. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub project_id: String,
    pub model: String,
    pub limits: RunLimits,
    pub tables: Vec<TableRegion>,
    pub rendered_cell_images: Vec<RenderedCellImage>,
    pub diagnostics: Diagnostics,
    pub stats: RunStats,
    pub extracted_at: DateTime<Utc>,
}

impl PipelineResult {
    /// All cells of all tables, in table order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.tables.iter().flat_map(|t| t.cells.iter())
    }

    /// Image reference for a cell, matched by table identity and rounded bbox.
    pub fn image_for(&self, page: usize, table_index: usize, bbox: &BoundingBox) -> Option<&RenderedCellImage> {
        let key = bbox.key();
        self.rendered_cell_images
            .iter()
            .find(|img| img.page == page && img.table_index == table_index && img.bbox.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_key_absorbs_sub_precision_jitter() {
        let a = BoundingBox::new(72.0, 90.0, 144.0, 108.0);
        let b = BoundingBox::new(72.0004, 89.9996, 144.001, 108.003);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn bbox_key_separates_visible_differences() {
        let a = BoundingBox::new(72.0, 90.0, 144.0, 108.0);
        let b = BoundingBox::new(72.02, 90.0, 144.0, 108.0);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn degenerate_boxes() {
        assert!(BoundingBox::new(10.0, 10.0, 10.0, 20.0).is_degenerate());
        assert!(BoundingBox::new(10.0, 20.0, 30.0, 5.0).is_degenerate());
        assert!(BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0).is_degenerate());
        assert!(!BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_degenerate());
    }

    #[test]
    fn bbox_serialises_with_top_and_bottom() {
        let json = serde_json::to_value(BoundingBox::new(1.0, 2.0, 3.0, 4.0)).unwrap();
        assert_eq!(json["x0"], 1.0);
        assert_eq!(json["top"], 2.0);
        assert_eq!(json["x1"], 3.0);
        assert_eq!(json["bottom"], 4.0);
    }

    #[test]
    fn unset_latex_serialises_as_null() {
        let cell = Cell::new("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        let json = serde_json::to_value(&cell).unwrap();
        assert!(json["latex"].is_null());
        assert_eq!(json["content"], "a");
    }

    #[test]
    fn diagnostics_counters_follow_entries() {
        let mut d = Diagnostics::default();
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        d.cell(1, 0, bbox, CellError::RecognitionTimeout { secs: 5 });
        d.cell(1, 0, bbox, CellError::DegenerateCrop { width: 0, height: 0 });
        d.page(2, DiagnosticKind::NoTablesFound { image_only: true }, "scanned");
        assert_eq!(d.recognition_timeouts, 1);
        assert_eq!(d.render_failures, 1);
        assert_eq!(d.page_failures().count(), 1);
        assert!(d.cell_failure(1, 0, &bbox).is_some());
        assert!(d.cell_failure(1, 1, &bbox).is_none());
    }

    #[test]
    fn run_notes_are_entries_without_a_page() {
        let mut d = Diagnostics::default();
        d.push(Diagnostic {
            page: None,
            table_index: None,
            bbox: None,
            kind: DiagnosticKind::RunCancelled { pages_skipped: vec![2] },
            message: "cancelled".into(),
        });
        d.page(1, DiagnosticKind::NoTablesFound { image_only: false }, "none");
        let notes: Vec<_> = d.run_notes().collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, "cancelled");
        let json = serde_json::to_value(notes[0]).unwrap();
        assert_eq!(json["kind"], "run_cancelled");
        assert_eq!(json["pages_skipped"][0], 2);
    }

    #[test]
    fn diagnostic_kind_is_flattened() {
        let mut d = Diagnostics::default();
        d.page(3, DiagnosticKind::NoTablesFound { image_only: false }, "none");
        let json = serde_json::to_value(&d.entries[0]).unwrap();
        assert_eq!(json["kind"], "no_tables_found");
        assert_eq!(json["image_only"], false);
        assert_eq!(json["page"], 3);
    }
}
