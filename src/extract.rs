//! Run orchestration: extract → dedup → render → recognise → backfill.
//!
//! A run moves through the stages of [`RunStage`]. Pages are processed one
//! after another because a page's table geometry must be known before its
//! cells can be cropped. Within a page, storing crops and recognising them
//! fan out over a pool bounded by `config.concurrency`.
//!
//! Only a document that cannot be opened fails the run. Every page, render
//! and recognition problem is folded into [`Diagnostics`], so the caller
//! always gets a best-effort [`PipelineResult`].
//!
//! Diagnostics are only ever appended by the task driving the run; worker
//! futures hand their outcomes back instead of touching shared state.

use crate::config::{PagePlan, RecognitionConfig};
use crate::error::{CellError, TableFormulaError};
use crate::output::{
    BoxKey, Diagnostic, DiagnosticKind, Diagnostics, PageSummary, PipelineResult, RenderedCellImage, RunLimits,
    RunStats, TableRegion,
};
use crate::pipeline::backfill::backfill;
use crate::pipeline::dedup::dedup_cells;
use crate::pipeline::geometry::{build_region, extract_tables};
use crate::pipeline::input::{load_input, validate_pdf_bytes};
use crate::pipeline::lattice::LatticeSettings;
use crate::pipeline::render::{render_cells, CellCrop, CropJob};
use crate::pipeline::source::{PageScan, PageSource, PdfiumSource};
use crate::pipeline::store::ImageStore;
use crate::pipeline::vision::{recognize_cell, resolve_recognizer, CallPolicy, CellImage, FormulaRecognizer};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Timeout for downloading a URL input.
const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Stages of one run.
///
/// `Failed` is only reachable from `Opened`, when the document cannot be
/// parsed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Opened,
    PerPageExtraction,
    PerTableDedup,
    PerCellRender,
    PerCellRecognize,
    Assembled,
    Done,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Opened => "opened",
            RunStage::PerPageExtraction => "per-page extraction",
            RunStage::PerTableDedup => "per-table dedup",
            RunStage::PerCellRender => "per-cell render",
            RunStage::PerCellRecognize => "per-cell recognize",
            RunStage::Assembled => "assembled",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct RunState {
    stage: RunStage,
}

impl RunState {
    fn new() -> Self {
        debug!("run stage: {}", RunStage::Opened);
        Self {
            stage: RunStage::Opened,
        }
    }

    fn advance(&mut self, next: RunStage) {
        if self.stage != next {
            debug!("run stage: {} → {}", self.stage, next);
            self.stage = next;
        }
    }

    fn fail(&mut self, err: &TableFormulaError) {
        warn!("run stage: {} → {}: {}", self.stage, RunStage::Failed, err);
        self.stage = RunStage::Failed;
    }
}

/// Cooperative cancellation of a run (e.g. the client disconnected).
///
/// Once raised, no new recognition call is issued and no further page is
/// scanned. Calls already in flight finish or time out; cells whose call was
/// never issued get a [`CellError::RecognitionSkipped`] diagnostic.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Recognise the formulas in the table cells of a PDF.
///
/// This is the primary entry point for the library.
///
/// # Arguments
/// * `bytes` — Raw PDF bytes
/// * `project_id` — Storage namespace for the cell crops
/// * `config` — Run configuration
///
/// # Errors
/// Returns `Err(TableFormulaError)` only for fatal errors:
/// - empty input or not a PDF
/// - no vision backend configured
/// - unusable project id
/// - the document cannot be opened
///
/// # Example
/// ```rust,no_run
/// use edgequake_table2latex::{extract_table_formulas, RecognitionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes = std::fs::read("paper.pdf")?;
/// let config = RecognitionConfig::builder().page_range(Some(1), Some(2)).build()?;
/// let result = extract_table_formulas(bytes, "demo", &config).await?;
/// for cell in result.cells() {
///     println!("{:?} → {:?}", cell.content, cell.latex);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn extract_table_formulas(
    bytes: Vec<u8>,
    project_id: &str,
    config: &RecognitionConfig,
) -> Result<PipelineResult, TableFormulaError> {
    extract_with_cancel(bytes, project_id, config, &CancellationFlag::new()).await
}

/// [`extract_table_formulas`] with a cancellation flag.
pub async fn extract_with_cancel(
    bytes: Vec<u8>,
    project_id: &str,
    config: &RecognitionConfig,
    cancel: &CancellationFlag,
) -> Result<PipelineResult, TableFormulaError> {
    validate_pdf_bytes(&bytes)?;
    let recognizer = resolve_recognizer(config)?;
    let store = ImageStore::new(&config.storage_root, &config.url_prefix, project_id)?;

    let mut state = RunState::new();
    let opened = tokio::task::spawn_blocking(move || PdfiumSource::open(bytes))
        .await
        .map_err(|e| TableFormulaError::Internal(format!("Open task panicked: {}", e)))
        .and_then(|r| r);
    let source = match opened {
        Ok(source) => source,
        Err(e) => {
            state.fail(&e);
            return Err(e);
        }
    };

    run(state, Arc::new(source), recognizer, store, project_id, config, cancel).await
}

/// Run the pipeline over an already opened [`PageSource`].
///
/// Lets callers supply their own page access (pre-parsed documents, tests).
pub async fn extract_with_source(
    source: Arc<dyn PageSource>,
    project_id: &str,
    config: &RecognitionConfig,
    cancel: &CancellationFlag,
) -> Result<PipelineResult, TableFormulaError> {
    let recognizer = resolve_recognizer(config)?;
    let store = ImageStore::new(&config.storage_root, &config.url_prefix, project_id)?;
    run(RunState::new(), source, recognizer, store, project_id, config, cancel).await
}

/// Load a PDF from a local path or HTTP/HTTPS URL and run the pipeline on it.
pub async fn extract_from_input(
    input: impl AsRef<str>,
    project_id: &str,
    config: &RecognitionConfig,
) -> Result<PipelineResult, TableFormulaError> {
    let input = input.as_ref();
    info!("Starting table formula extraction: {}", input);
    let bytes = load_input(input, DOWNLOAD_TIMEOUT_SECS).await?;
    extract_table_formulas(bytes, project_id, config).await
}

/// Synchronous wrapper around [`extract_table_formulas`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    bytes: Vec<u8>,
    project_id: &str,
    config: &RecognitionConfig,
) -> Result<PipelineResult, TableFormulaError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| TableFormulaError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_table_formulas(bytes, project_id, config))
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Page-range diagnostics, recorded before any page is read.
fn record_plan(plan: &PagePlan, config: &RecognitionConfig, diagnostics: &mut Diagnostics) {
    if plan.inverted {
        warn!(
            "Invalid page range {:?}..{:?}: nothing to scan",
            config.page_start, config.page_end
        );
        diagnostics.push(Diagnostic {
            page: None,
            table_index: None,
            bbox: None,
            kind: DiagnosticKind::InvalidPageRange {
                page_start: config.page_start,
                page_end: config.page_end,
            },
            message: format!(
                "page_end ({}) is before page_start ({}); no pages scanned",
                config.page_end.unwrap_or_default(),
                config.page_start.unwrap_or_default()
            ),
        });
    } else if plan.out_of_document {
        let page_start = config.page_start.unwrap_or(1);
        warn!(
            "page_start {} is past the last page ({}): nothing to scan",
            page_start, plan.total_pages
        );
        diagnostics.push(Diagnostic {
            page: None,
            table_index: None,
            bbox: None,
            kind: DiagnosticKind::PageRangeOutOfDocument {
                page_start,
                total_pages: plan.total_pages,
            },
            message: format!(
                "page_start ({}) is past the end of the document ({} pages); no pages scanned",
                page_start, plan.total_pages
            ),
        });
    } else if plan.is_clamped() {
        info!(
            "Page range clamped to {} of {} pages (document has {}, max_pages={})",
            plan.indices.len(),
            plan.requested,
            plan.total_pages,
            config.max_pages
        );
        diagnostics.push(Diagnostic {
            page: None,
            table_index: None,
            bbox: None,
            kind: DiagnosticKind::PageRangeClamped {
                requested: plan.requested,
                effective: plan.indices.len(),
            },
            message: format!(
                "{} pages requested, {} scanned (document has {} pages, max_pages = {})",
                plan.requested,
                plan.indices.len(),
                plan.total_pages,
                config.max_pages
            ),
        });
    }
}

/// Record the pages a cancelled run never reached.
fn record_cancelled(pages_skipped: Vec<usize>, diagnostics: &mut Diagnostics) {
    warn!("Run cancelled: pages {:?} left unscanned", pages_skipped);
    let message = format!(
        "run cancelled; {} pages not scanned: {:?}",
        pages_skipped.len(),
        pages_skipped
    );
    diagnostics.push(Diagnostic {
        page: None,
        table_index: None,
        bbox: None,
        kind: DiagnosticKind::RunCancelled { pages_skipped },
        message,
    });
}

async fn scan(source: &Arc<dyn PageSource>, index: usize) -> Result<PageScan, String> {
    let src = Arc::clone(source);
    match tokio::task::spawn_blocking(move || src.scan_page(index)).await {
        Ok(Ok(scan)) => Ok(scan),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("Scan task panicked: {}", e)),
    }
}

/// What recognition produced for one page.
struct PageRecognition {
    latex: HashMap<usize, HashMap<BoxKey, String>>,
    failures: Vec<(CropJob, CellError)>,
    recognized: usize,
}

async fn recognize_page(
    recognizer: &Arc<dyn FormulaRecognizer>,
    page: usize,
    queue: Vec<(CropJob, Vec<u8>)>,
    config: &RecognitionConfig,
    cancel: &CancellationFlag,
) -> PageRecognition {
    let policy = CallPolicy::from_config(config);
    let mut outcomes: Vec<(CropJob, Result<String, CellError>)> = stream::iter(queue.into_iter().map(|(job, png)| {
        let recognizer = Arc::clone(recognizer);
        let cancel = cancel.clone();
        let cb = config.progress_callback.clone();
        async move {
            // Checked when the pool picks the cell up, i.e. right before the call.
            if cancel.is_cancelled() {
                return (job, Err(CellError::RecognitionSkipped));
            }
            if let Some(ref cb) = cb {
                cb.on_cell_start(page, job.table_index, job.cell_index);
            }
            let image = CellImage {
                page,
                table_index: job.table_index,
                cell_index: job.cell_index,
                bbox: job.bbox,
                png,
            };
            let result = recognize_cell(recognizer.as_ref(), &image, policy).await;
            if let Some(ref cb) = cb {
                match &result {
                    Ok(latex) => cb.on_cell_complete(page, job.table_index, job.cell_index, latex.len()),
                    Err(e) => cb.on_cell_error(page, job.table_index, job.cell_index, &e.to_string()),
                }
            }
            (job, result)
        }
    }))
    .buffer_unordered(config.concurrency)
    .collect()
    .await;

    outcomes.sort_by_key(|(job, _)| (job.table_index, job.cell_index));

    let mut out = PageRecognition {
        latex: HashMap::new(),
        failures: Vec::new(),
        recognized: 0,
    };
    for (job, result) in outcomes {
        match result {
            Ok(latex) => {
                out.recognized += 1;
                out.latex
                    .entry(job.table_index)
                    .or_default()
                    .insert(job.bbox.key(), latex);
            }
            Err(e) => out.failures.push((job, e)),
        }
    }
    out
}

async fn run(
    mut state: RunState,
    source: Arc<dyn PageSource>,
    recognizer: Arc<dyn FormulaRecognizer>,
    store: ImageStore,
    project_id: &str,
    config: &RecognitionConfig,
    cancel: &CancellationFlag,
) -> Result<PipelineResult, TableFormulaError> {
    let total_start = Instant::now();
    let settings = LatticeSettings::default();
    let mut diagnostics = Diagnostics::default();
    let mut stats = RunStats::default();

    let total_pages = source.page_count();
    let plan = config.page_plan(total_pages);
    info!(
        "Document has {} pages; scanning {:?} with {}",
        total_pages,
        plan.page_numbers(),
        recognizer.model()
    );
    record_plan(&plan, config, &mut diagnostics);

    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start(plan.indices.len());
    }

    let mut tables: Vec<TableRegion> = Vec::new();
    let mut images: Vec<RenderedCellImage> = Vec::new();
    let mut visited: Vec<usize> = Vec::with_capacity(plan.indices.len());

    for (n, &index) in plan.indices.iter().enumerate() {
        let page = index + 1;
        if cancel.is_cancelled() {
            let skipped = plan.indices[n..].iter().map(|i| i + 1).collect();
            record_cancelled(skipped, &mut diagnostics);
            break;
        }
        visited.push(page);

        // ── Extraction ───────────────────────────────────────────────────
        state.advance(RunStage::PerPageExtraction);
        let extract_start = Instant::now();
        let scanned = scan(&source, index).await;
        diagnostics.pages_scanned += 1;

        let page_scan = match scanned {
            Ok(s) => s,
            Err(detail) => {
                warn!("Page {}: table detection failed: {}", page, detail);
                diagnostics.page(
                    page,
                    DiagnosticKind::TableDetectionFailed { detail: detail.clone() },
                    format!("table detection failed on page {}: {}", page, detail),
                );
                diagnostics.pages.push(PageSummary {
                    page,
                    ..Default::default()
                });
                stats.extraction_duration_ms += extract_start.elapsed().as_millis() as u64;
                if let Some(ref cb) = config.progress_callback {
                    cb.on_page_scanned(page, 0, 0);
                }
                continue;
            }
        };

        let raw_tables = extract_tables(&page_scan, &settings);
        if raw_tables.is_empty() {
            let image_only = page_scan.is_image_only();
            let message = if image_only {
                format!("no structured table found on page {} (page appears to be a scanned image)", page)
            } else {
                format!("no structured table found on page {}", page)
            };
            info!("Page {}: {}", page, message);
            diagnostics.page(page, DiagnosticKind::NoTablesFound { image_only }, message);
            diagnostics.pages.push(PageSummary {
                page,
                ..Default::default()
            });
            stats.extraction_duration_ms += extract_start.elapsed().as_millis() as u64;
            if let Some(ref cb) = config.progress_callback {
                cb.on_page_scanned(page, 0, 0);
            }
            continue;
        }

        // ── Dedup ────────────────────────────────────────────────────────
        state.advance(RunStage::PerTableDedup);
        let mut regions: Vec<TableRegion> = raw_tables
            .into_iter()
            .map(|raw| {
                let (cells, dropped) = dedup_cells(raw.candidates);
                if dropped > 0 {
                    debug!("Page {} table {}: dropped {} duplicate cells", page, raw.table_index, dropped);
                }
                diagnostics.duplicate_cells_dropped += dropped;
                build_region(page, raw.table_index, raw.bbox, cells)
            })
            .collect();
        stats.extraction_duration_ms += extract_start.elapsed().as_millis() as u64;

        let cell_count: usize = regions.iter().map(|t| t.cells.len()).sum();
        diagnostics.tables_found += regions.len();
        diagnostics.cells_found += cell_count;
        diagnostics.pages.push(PageSummary {
            page,
            tables_found: regions.len(),
            cells_found: cell_count,
        });
        info!("Page {}: {} tables, {} cells", page, regions.len(), cell_count);
        if let Some(ref cb) = config.progress_callback {
            cb.on_page_scanned(page, regions.len(), cell_count);
        }

        // ── Render + store ───────────────────────────────────────────────
        state.advance(RunStage::PerCellRender);
        let render_start = Instant::now();
        let jobs: Vec<CropJob> = regions
            .iter()
            .flat_map(|t| {
                t.cells.iter().enumerate().map(|(cell_index, c)| CropJob {
                    table_index: t.table_index,
                    cell_index,
                    bbox: c.bbox,
                })
            })
            .collect();

        let crops: Vec<Result<CellCrop, CellError>> = match render_cells(
            Arc::clone(&source),
            index,
            (page_scan.width_pt, page_scan.height_pt),
            config.render_scale,
            jobs.clone(),
            config.cell_padding_px,
        )
        .await
        {
            Ok(crops) => crops,
            Err(e) => {
                warn!("Page {}: {}", page, e);
                let detail = e.to_string();
                jobs.iter()
                    .map(|_| Err(CellError::RenderFailed { detail: detail.clone() }))
                    .collect()
            }
        };

        let stored: Vec<(CropJob, Result<(RenderedCellImage, Vec<u8>), CellError>)> =
            stream::iter(jobs.into_iter().zip(crops).map(|(job, crop)| {
                let store = &store;
                async move {
                    let result = match crop {
                        Ok(c) => store
                            .store(page, job.table_index, job.cell_index, job.bbox, &c.png, c.width, c.height)
                            .await
                            .map(|img| (img, c.png)),
                        Err(e) => Err(e),
                    };
                    (job, result)
                }
            }))
            .buffered(config.concurrency)
            .collect()
            .await;
        stats.render_duration_ms += render_start.elapsed().as_millis() as u64;

        let mut queue = Vec::with_capacity(stored.len());
        for (job, result) in stored {
            match result {
                Ok((img, png)) => {
                    diagnostics.cells_rendered += 1;
                    images.push(img);
                    queue.push((job, png));
                }
                Err(e) => {
                    warn!("Page {} table {} cell {}: {}", page, job.table_index, job.cell_index, e);
                    if let Some(ref cb) = config.progress_callback {
                        cb.on_cell_error(page, job.table_index, job.cell_index, &e.to_string());
                    }
                    diagnostics.cell(page, job.table_index, job.bbox, e);
                }
            }
        }

        // ── Recognition ──────────────────────────────────────────────────
        state.advance(RunStage::PerCellRecognize);
        let recognize_start = Instant::now();
        let recognition = recognize_page(&recognizer, page, queue, config, cancel).await;
        stats.recognition_duration_ms += recognize_start.elapsed().as_millis() as u64;

        diagnostics.cells_recognized += recognition.recognized;
        for (job, e) in recognition.failures {
            diagnostics.cell(page, job.table_index, job.bbox, e);
        }

        for region in regions.iter_mut() {
            if let Some(latex) = recognition.latex.get(&region.table_index) {
                backfill(&mut region.cells, latex);
            }
        }
        tables.extend(regions);
    }

    state.advance(RunStage::Assembled);
    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    info!(
        "Extraction complete: {} tables, {} cells, {} images, {} recognised, {}ms total",
        diagnostics.tables_found,
        diagnostics.cells_found,
        images.len(),
        diagnostics.cells_recognized,
        stats.total_duration_ms
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_complete(diagnostics.cells_found, diagnostics.cells_recognized);
    }

    let result = PipelineResult {
        project_id: project_id.to_string(),
        model: recognizer.model().to_string(),
        limits: RunLimits {
            page_start: config.page_start,
            page_end: config.page_end,
            max_pages: config.max_pages,
            render_scale: config.render_scale,
            effective_pages: visited,
        },
        tables,
        rendered_cell_images: images,
        diagnostics,
        stats,
        extracted_at: Utc::now(),
    };
    state.advance(RunStage::Done);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_flag_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn stage_names() {
        assert_eq!(RunStage::PerCellRecognize.to_string(), "per-cell recognize");
        assert_eq!(RunStage::Failed.to_string(), "failed");
    }

    #[test]
    fn inverted_range_is_recorded() {
        let config = RecognitionConfig::builder()
            .page_range(Some(3), Some(2))
            .build()
            .unwrap();
        let plan = config.page_plan(5);
        let mut d = Diagnostics::default();
        record_plan(&plan, &config, &mut d);
        assert_eq!(d.entries.len(), 1);
        assert!(matches!(
            d.entries[0].kind,
            DiagnosticKind::InvalidPageRange {
                page_start: Some(3),
                page_end: Some(2)
            }
        ));
    }

    #[test]
    fn clamped_range_is_recorded() {
        let config = RecognitionConfig::builder().max_pages(2).build().unwrap();
        let plan = config.page_plan(5);
        let mut d = Diagnostics::default();
        record_plan(&plan, &config, &mut d);
        assert!(matches!(
            d.entries[0].kind,
            DiagnosticKind::PageRangeClamped {
                requested: 5,
                effective: 2
            }
        ));
    }

    #[test]
    fn range_past_the_document_is_recorded() {
        let config = RecognitionConfig::builder()
            .page_range(Some(7), None)
            .build()
            .unwrap();
        let plan = config.page_plan(5);
        let mut d = Diagnostics::default();
        record_plan(&plan, &config, &mut d);
        assert_eq!(d.entries.len(), 1);
        assert_eq!(
            d.entries[0].kind,
            DiagnosticKind::PageRangeOutOfDocument {
                page_start: 7,
                total_pages: 5
            }
        );
    }

    #[test]
    fn range_cut_by_document_end_is_recorded() {
        let config = RecognitionConfig::builder()
            .page_range(Some(3), Some(10))
            .max_pages(10)
            .build()
            .unwrap();
        let plan = config.page_plan(4);
        let mut d = Diagnostics::default();
        record_plan(&plan, &config, &mut d);
        assert_eq!(
            d.entries[0].kind,
            DiagnosticKind::PageRangeClamped {
                requested: 8,
                effective: 2
            }
        );
    }

    #[test]
    fn exact_range_records_nothing() {
        let config = RecognitionConfig::builder()
            .page_range(Some(1), Some(2))
            .build()
            .unwrap();
        let mut d = Diagnostics::default();
        record_plan(&config.page_plan(2), &config, &mut d);
        assert!(d.entries.is_empty());
    }

    #[test]
    fn cancelled_pages_are_listed() {
        let mut d = Diagnostics::default();
        record_cancelled(vec![2, 3], &mut d);
        assert_eq!(d.entries[0].kind, DiagnosticKind::RunCancelled { pages_skipped: vec![2, 3] });
        assert!(d.entries[0].message.contains("2 pages"));
    }

    #[tokio::test]
    async fn not_a_pdf_fails_before_anything_else() {
        let config = RecognitionConfig::default();
        let err = extract_table_formulas(b"hello".to_vec(), "p", &config).await.unwrap_err();
        assert!(matches!(err, TableFormulaError::NotAPdf { .. }));
    }
}
