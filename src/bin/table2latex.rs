//! CLI binary for edgequake-table2latex.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `RecognitionConfig` and prints the result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_table2latex::pipeline::input::load_input;
use edgequake_table2latex::{
    extract_with_cancel, CancellationFlag, PipelineResult, ProgressCallback, RecognitionConfig,
    RecognitionProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a spinner while pages are scanned, then a bar
/// over the cells found so far. Cells finish out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Per-cell wall-clock start times, keyed by (page, table, cell).
    start_times: Mutex<HashMap<(usize, usize, usize), Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    /// Switch to the bar style the first time cells are known.
    fn grow(&self, cells: usize) {
        if self.bar.length().unwrap_or(0) == 0 {
            let style = ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} cells  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS);
            self.bar.set_style(style);
            self.bar.set_prefix("Recognising");
        }
        self.bar.inc_length(cells as u64);
    }

    fn elapsed(&self, key: (usize, usize, usize)) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&key))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl RecognitionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize) {
        self.bar.set_prefix("Scanning");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Scanning {total_pages} pages for tables…"))
        ));
    }

    fn on_page_scanned(&self, page: usize, tables: usize, cells: usize) {
        if tables == 0 {
            self.bar
                .println(format!("  {} Page {:>3}  {}", dim("·"), page, dim("no table")));
            return;
        }
        self.bar.println(format!(
            "  {} Page {:>3}  {} tables, {} cells",
            cyan("▸"),
            page,
            tables,
            cells
        ));
        self.grow(cells);
    }

    fn on_cell_start(&self, page: usize, table_index: usize, cell_index: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert((page, table_index, cell_index), Instant::now());
        }
        self.bar
            .set_message(format!("p{page} t{table_index} c{cell_index}"));
    }

    fn on_cell_complete(&self, page: usize, table_index: usize, cell_index: usize, latex_len: usize) {
        let secs = self.elapsed((page, table_index, cell_index));
        self.bar.println(format!(
            "  {} p{:<3} t{:<2} c{:<4} {:<8}  {}",
            green("✓"),
            page,
            table_index,
            cell_index,
            dim(&format!("{latex_len:>4} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_cell_error(&self, page: usize, table_index: usize, cell_index: usize, error: &str) {
        let secs = self.elapsed((page, table_index, cell_index));
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} p{:<3} t{:<2} c{:<4} {}  {}",
            red("✗"),
            page,
            table_index,
            cell_index,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_cells: usize, recognized: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);

        if total_cells == 0 {
            eprintln!("{} no table cells found", cyan("⚠"));
        } else if failed == 0 && recognized == total_cells {
            eprintln!(
                "{} {} cells recognised",
                green("✔"),
                bold(&recognized.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} cells recognised  ({} failed)",
                if recognized == 0 { red("✘") } else { cyan("⚠") },
                bold(&recognized.to_string()),
                total_cells,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # First two pages, JSON to stdout (GLM backend from GLM_API_KEY)
  table2latex paper.pdf

  # Pages 3-6, store crops under ./static/projects/paper-42/images
  table2latex --project paper-42 --page-start 3 --page-end 6 --max-pages 4 paper.pdf

  # Use an edgequake-llm provider instead of GLM
  table2latex --provider openai --model gpt-4.1-mini paper.pdf -o cells.json

  # From a URL, sharper crops
  table2latex --render-scale 3 https://arxiv.org/pdf/1706.03762

BACKEND SELECTION (first match wins):
  --provider / EDGEQUAKE_PROVIDER   edgequake-llm provider by name
  GLM_API_KEY                       GLM vision endpoint (default model glm-4.6v-flash)
  EDGEQUAKE_LLM_PROVIDER            edgequake-llm provider by name
  OPENAI_API_KEY                    OpenAI (default model gpt-4.1-nano)
  ANTHROPIC_API_KEY, GEMINI_API_KEY, …  auto-detected by edgequake-llm

ENVIRONMENT VARIABLES:
  GLM_API_KEY             GLM API key
  GLM_API_BASE            Override the GLM endpoint base URL
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Provider for auto-detection
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)

OUTPUT:
  JSON with tables[].cells[] {content, bbox{x0,top,x1,bottom}, latex},
  rendered_cell_images[] {filename, url, width, height, bbox, …}
  and diagnostics (per-page and per-cell issues).
  Ctrl-C stops issuing new recognition calls and still prints the result.
"#;

/// Recognise formulas in PDF table cells and backfill them as LaTeX.
#[derive(Parser, Debug)]
#[command(
    name = "table2latex",
    version,
    about = "Recognise formulas in PDF table cells with Vision LLMs",
    long_about = "Detect ruled tables in a PDF, crop every cell, ask a Vision Language Model \
for the formula in each crop and return the table structure with LaTeX backfilled per cell. \
Supports the GLM vision endpoint and every edgequake-llm provider (OpenAI, Anthropic, Gemini, \
Ollama, …).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "TABLE2LATEX_OUTPUT")]
    output: Option<PathBuf>,

    /// Project id; crops are stored under <storage-dir>/projects/<id>/images.
    #[arg(long, env = "TABLE2LATEX_PROJECT", default_value = "default")]
    project: String,

    /// First page to scan (1-based).
    #[arg(long, env = "TABLE2LATEX_PAGE_START")]
    page_start: Option<usize>,

    /// Last page to scan (1-based, inclusive).
    #[arg(long, env = "TABLE2LATEX_PAGE_END")]
    page_end: Option<usize>,

    /// Upper bound on the number of pages scanned.
    #[arg(long, env = "TABLE2LATEX_MAX_PAGES", default_value_t = 2)]
    max_pages: usize,

    /// Page raster magnification (1.0 = 72 DPI).
    #[arg(long, env = "TABLE2LATEX_RENDER_SCALE", default_value_t = 2.0)]
    render_scale: f32,

    /// Vision model ID (e.g. glm-4.6v-flash, gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// edgequake-llm provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Concurrent recognition calls.
    #[arg(short, long, env = "TABLE2LATEX_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Pixels of context around each cell crop.
    #[arg(long, env = "TABLE2LATEX_PADDING", default_value_t = 10)]
    padding: u32,

    /// Root directory of the static image storage.
    #[arg(long, env = "TABLE2LATEX_STORAGE_DIR", default_value = "static")]
    storage_dir: PathBuf,

    /// URL prefix under which the storage directory is served.
    #[arg(long, env = "TABLE2LATEX_URL_PREFIX", default_value = "/static")]
    url_prefix: String,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "TABLE2LATEX_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max output tokens per cell.
    #[arg(long, env = "TABLE2LATEX_MAX_TOKENS", default_value_t = 1024)]
    max_tokens: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "TABLE2LATEX_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per cell on rate limits and server errors. Timeouts are never retried.
    #[arg(long, env = "TABLE2LATEX_MAX_RETRIES", default_value_t = 0)]
    max_retries: u32,

    /// Per-cell recognition timeout in seconds.
    #[arg(long, env = "TABLE2LATEX_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "TABLE2LATEX_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "TABLE2LATEX_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "TABLE2LATEX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "TABLE2LATEX_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn RecognitionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;

    let bytes = load_input(&cli.input, cli.download_timeout)
        .await
        .with_context(|| format!("Failed to load {}", cli.input))?;

    // ── Ctrl-C → cooperative cancellation ────────────────────────────────
    let cancel = CancellationFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} cancelling: no new recognition calls will be issued", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    let result = extract_with_cancel(bytes, &cli.project, &config, &cancel)
        .await
        .context("Extraction failed")?;

    let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;

    if let Some(ref output_path) = cli.output {
        tokio::fs::write(output_path, format!("{json}\n"))
            .await
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{json}").context("Failed to write to stdout")?;
    }

    if !cli.quiet {
        print_summary(&result, cli.output.as_ref(), show_progress);
    }

    Ok(())
}

/// Map CLI args to `RecognitionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<RecognitionConfig> {
    let mut builder = RecognitionConfig::builder()
        .page_range(cli.page_start, cli.page_end)
        .max_pages(cli.max_pages)
        .render_scale(cli.render_scale)
        .concurrency(cli.concurrency)
        .cell_padding_px(cli.padding)
        .storage_root(cli.storage_dir.clone())
        .url_prefix(cli.url_prefix.clone())
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout);

    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(result: &PipelineResult, output: Option<&PathBuf>, show_progress: bool) {
    let d = &result.diagnostics;
    if !show_progress {
        eprintln!(
            "Recognised {}/{} cells in {} tables ({} pages) in {}ms",
            d.cells_recognized, d.cells_found, d.tables_found, d.pages_scanned, result.stats.total_duration_ms
        );
    }
    for entry in result.diagnostics.run_notes().chain(result.diagnostics.page_failures()) {
        eprintln!("   {} {}", dim("·"), entry.message);
    }
    let failed = d.render_failures + d.recognition_failures + d.recognition_timeouts + d.recognition_skipped;
    if failed > 0 {
        eprintln!(
            "   {} render failures, {} recognition failures, {} timeouts, {} skipped",
            d.render_failures, d.recognition_failures, d.recognition_timeouts, d.recognition_skipped
        );
    }
    if let Some(path) = output {
        eprintln!(
            "   {}  {}  →  {}",
            dim(&result.model),
            dim(&format!("{}ms", result.stats.total_duration_ms)),
            bold(&path.display().to_string())
        );
    }
}
