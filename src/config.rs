//! Configuration types for table formula recognition.
//!
//! All run behaviour is controlled through [`RecognitionConfig`], built via
//! its [`RecognitionConfigBuilder`]. Setters clamp out-of-range values instead
//! of rejecting them: a caller asking for `max_pages = 0` or a negative render
//! scale gets the nearest usable value, never an error.

use crate::error::TableFormulaError;
use crate::pipeline::vision::FormulaRecognizer;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default vision model of the GLM backend.
pub const DEFAULT_MODEL: &str = "glm-4.6v-flash";

/// Default model when a named edgequake-llm provider is used.
pub const DEFAULT_PROVIDER_MODEL: &str = "gpt-4.1-nano";

const MIN_RENDER_SCALE: f32 = 0.25;
const MAX_RENDER_SCALE: f32 = 8.0;

/// Configuration for one table-formula run.
///
/// # Example
/// ```rust
/// use edgequake_table2latex::RecognitionConfig;
///
/// let config = RecognitionConfig::builder()
///     .page_range(Some(1), Some(3))
///     .max_pages(3)
///     .render_scale(3.0)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_pages, 3);
/// ```
#[derive(Clone)]
pub struct RecognitionConfig {
    /// First page to scan (1-based, inclusive). `None` = first page.
    pub page_start: Option<usize>,

    /// Last page to scan (1-based, inclusive). `None` = last page.
    pub page_end: Option<usize>,

    /// Upper bound on the number of pages scanned. Default: 2.
    pub max_pages: usize,

    /// Page raster magnification (1.0 = 72 DPI). Default: 2.0.
    pub render_scale: f32,

    /// Vision model identifier. `None` = backend default
    /// ([`DEFAULT_MODEL`] for GLM, [`DEFAULT_PROVIDER_MODEL`] otherwise).
    pub model: Option<String>,

    /// edgequake-llm provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed edgequake-llm provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed recognizer. Takes precedence over every provider setting.
    pub recognizer: Option<Arc<dyn FormulaRecognizer>>,

    /// Concurrent recognition calls per page. Default: 4.
    pub concurrency: usize,

    /// Per recognition call timeout in seconds. Default: 180.
    pub api_timeout_secs: u64,

    /// Retries on transient recognition errors. Default: 0 (at-most-once).
    ///
    /// A timed-out call is never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 2000.
    pub retry_backoff_ms: u64,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per cell. Default: 1024.
    pub max_tokens: usize,

    /// Pixels of context added around each cell crop. Default: 10.
    pub cell_padding_px: u32,

    /// Custom system prompt. If None, uses [`crate::prompts::TABLE_CELL_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    /// Root directory of the static image storage. Default: `static`.
    pub storage_root: PathBuf,

    /// URL prefix under which `storage_root` is served. Default: `/static`.
    pub url_prefix: String,

    /// Receives per-cell progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            page_start: None,
            page_end: None,
            max_pages: 2,
            render_scale: 2.0,
            model: None,
            provider_name: None,
            provider: None,
            recognizer: None,
            concurrency: 4,
            api_timeout_secs: 180,
            max_retries: 0,
            retry_backoff_ms: 2000,
            temperature: 0.1,
            max_tokens: 1024,
            cell_padding_px: 10,
            system_prompt: None,
            storage_root: PathBuf::from("static"),
            url_prefix: "/static".to_string(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RecognitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionConfig")
            .field("page_start", &self.page_start)
            .field("page_end", &self.page_end)
            .field("max_pages", &self.max_pages)
            .field("render_scale", &self.render_scale)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("recognizer", &self.recognizer.as_ref().map(|r| r.model().to_string()))
            .field("concurrency", &self.concurrency)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("cell_padding_px", &self.cell_padding_px)
            .field("storage_root", &self.storage_root)
            .field("url_prefix", &self.url_prefix)
            .finish()
    }
}

impl RecognitionConfig {
    /// Create a new builder for `RecognitionConfig`.
    pub fn builder() -> RecognitionConfigBuilder {
        RecognitionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Resolve the requested bounds against a document of `total_pages` pages.
    pub fn page_plan(&self, total_pages: usize) -> PagePlan {
        PagePlan::new(self.page_start, self.page_end, self.max_pages, total_pages)
    }
}

/// Builder for [`RecognitionConfig`].
#[derive(Debug)]
pub struct RecognitionConfigBuilder {
    config: RecognitionConfig,
}

impl RecognitionConfigBuilder {
    /// Set the inclusive 1-based page range. Page numbers below 1 become 1.
    pub fn page_range(mut self, start: Option<usize>, end: Option<usize>) -> Self {
        self.config.page_start = start.map(|p| p.max(1));
        self.config.page_end = end.map(|p| p.max(1));
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n.max(1);
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = clamp_scale(scale);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn recognizer(mut self, recognizer: Arc<dyn FormulaRecognizer>) -> Self {
        self.config.recognizer = Some(recognizer);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n.max(1);
        self
    }

    pub fn cell_padding_px(mut self, px: u32) -> Self {
        self.config.cell_padding_px = px;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    pub fn url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.url_prefix = prefix.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RecognitionConfig, TableFormulaError> {
        let c = &self.config;
        if c.storage_root.as_os_str().is_empty() {
            return Err(TableFormulaError::InvalidConfig(
                "storage root must not be empty".into(),
            ));
        }
        if let Some(ref model) = c.model {
            if model.trim().is_empty() {
                return Err(TableFormulaError::InvalidConfig(
                    "model must not be blank".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

fn clamp_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > 0.0 {
        scale.clamp(MIN_RENDER_SCALE, MAX_RENDER_SCALE)
    } else {
        2.0
    }
}

/// The effective set of pages a run will scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    /// 0-based page indices, ascending.
    pub indices: Vec<usize>,
    /// `page_end < page_start` was requested.
    pub inverted: bool,
    /// `page_start` lies past the last page of the document.
    pub out_of_document: bool,
    /// Pages the requested range names, before the document length and
    /// `max_pages` are applied.
    pub requested: usize,
    pub total_pages: usize,
}

impl PagePlan {
    /// Intersect `[page_start, page_end]` with the document, then keep at most
    /// `max_pages` pages from the front.
    pub fn new(
        page_start: Option<usize>,
        page_end: Option<usize>,
        max_pages: usize,
        total_pages: usize,
    ) -> Self {
        let inverted = matches!((page_start, page_end), (Some(s), Some(e)) if e < s);

        // 0-based, end exclusive.
        let start = page_start.map(|p| p.max(1) - 1).unwrap_or(0);
        let end = page_end.unwrap_or(total_pages);
        let out_of_document = !inverted && start >= total_pages;
        let requested = end.saturating_sub(start);

        let indices: Vec<usize> = if inverted {
            Vec::new()
        } else {
            (start..end.min(total_pages)).take(max_pages.max(1)).collect()
        };

        Self {
            indices,
            inverted,
            out_of_document,
            requested,
            total_pages,
        }
    }

    /// The range was cut by the document length or `max_pages`.
    pub fn is_clamped(&self) -> bool {
        !self.inverted && !self.out_of_document && self.requested > self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// 1-based page numbers.
    pub fn page_numbers(&self) -> Vec<usize> {
        self.indices.iter().map(|i| i + 1).collect()
    }
}
