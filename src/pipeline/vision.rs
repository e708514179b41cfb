//! Vision recognition: send one cell crop to a vision model, get LaTeX back.
//!
//! [`FormulaRecognizer`] is the capability the orchestrator depends on;
//! it never sees HTTP or provider types. Two implementations ship:
//!
//! * [`GlmRecognizer`](crate::pipeline::glm::GlmRecognizer), the default,
//!   talking to the GLM chat-completions endpoint with `GLM_API_KEY`;
//! * [`ProviderRecognizer`], wrapping any edgequake-llm provider
//!   (OpenAI, Anthropic, Gemini, Ollama, …).
//!
//! ## Call policy
//!
//! Each call is bounded by `api_timeout_secs`. A timed-out call is final.
//! With the default `max_retries = 0` every other failure is final too;
//! raising it retries transient failures (HTTP 429/5xx, transport errors)
//! with exponential backoff (`retry_backoff_ms * 2^attempt`).

use crate::config::{RecognitionConfig, DEFAULT_MODEL, DEFAULT_PROVIDER_MODEL};
use crate::error::{CellError, RecognitionError, TableFormulaError};
use crate::output::BoundingBox;
use crate::pipeline::encode::encode_cell;
use crate::pipeline::glm::GlmRecognizer;
use crate::pipeline::response::extract_latex;
use crate::prompts::{TABLE_CELL_INSTRUCTION, TABLE_CELL_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// A rendered cell handed to a recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct CellImage {
    /// 1-based page number.
    pub page: usize,
    pub table_index: usize,
    pub cell_index: usize,
    pub bbox: BoundingBox,
    pub png: Vec<u8>,
}

/// Recognises the formula in a cell image.
///
/// Returns the markup verbatim, or an empty string for a cell without a
/// formula. Implementations must be cheap to share across tasks.
#[async_trait]
pub trait FormulaRecognizer: Send + Sync {
    /// Model identifier reported in the run result.
    fn model(&self) -> &str;

    async fn recognize(&self, image: &CellImage) -> Result<String, RecognitionError>;
}

/// A [`FormulaRecognizer`] backed by an edgequake-llm provider.
pub struct ProviderRecognizer {
    provider: Arc<dyn LLMProvider>,
    model: String,
    system_prompt: String,
    options: CompletionOptions,
}

impl ProviderRecognizer {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>, config: &RecognitionConfig) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| TABLE_CELL_SYSTEM_PROMPT.to_string()),
            options: build_options(config),
        }
    }
}

#[async_trait]
impl FormulaRecognizer for ProviderRecognizer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn recognize(&self, image: &CellImage) -> Result<String, RecognitionError> {
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user_with_images(TABLE_CELL_INSTRUCTION, vec![encode_cell(&image.png)]),
        ];
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| RecognitionError::Provider(e.to_string()))?;
        debug!(
            "Cell p{} t{} #{}: {} input tokens, {} output tokens",
            image.page,
            image.table_index,
            image.cell_index,
            response.prompt_tokens,
            response.completion_tokens
        );
        extract_latex(&response.content)
    }
}

/// Build `CompletionOptions` from the run config.
fn build_options(config: &RecognitionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Timeout and retry settings for one recognition call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl CallPolicy {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self {
            timeout_secs: config.api_timeout_secs,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }
}

/// Recognise one cell under `policy`, folding every failure into a
/// [`CellError`].
pub async fn recognize_cell(
    recognizer: &dyn FormulaRecognizer,
    image: &CellImage,
    policy: CallPolicy,
) -> Result<String, CellError> {
    let start = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            let backoff = policy
                .retry_backoff_ms
                .saturating_mul(2u64.saturating_pow(attempt - 1));
            warn!(
                "Cell p{} t{} #{}: retry {}/{} after {}ms",
                image.page, image.table_index, image.cell_index, attempt, policy.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(Duration::from_secs(policy.timeout_secs), recognizer.recognize(image)).await {
            Err(_) => {
                warn!(
                    "Cell p{} t{} #{}: recognition timed out after {}s",
                    image.page, image.table_index, image.cell_index, policy.timeout_secs
                );
                return Err(CellError::RecognitionTimeout {
                    secs: policy.timeout_secs,
                });
            }
            Ok(Ok(latex)) => {
                debug!(
                    "Cell p{} t{} #{}: {} chars of LaTeX in {:?}",
                    image.page,
                    image.table_index,
                    image.cell_index,
                    latex.len(),
                    start.elapsed()
                );
                return Ok(latex);
            }
            Ok(Err(RecognitionError::Timeout { .. })) => {
                warn!(
                    "Cell p{} t{} #{}: HTTP client timed out",
                    image.page, image.table_index, image.cell_index
                );
                return Err(CellError::RecognitionTimeout {
                    secs: policy.timeout_secs,
                });
            }
            Ok(Err(e)) => {
                warn!(
                    "Cell p{} t{} #{}: attempt {} failed: {}",
                    image.page,
                    image.table_index,
                    image.cell_index,
                    attempt + 1,
                    e
                );
                if attempt >= policy.max_retries || !e.is_transient() {
                    return Err(CellError::RecognitionFailed { detail: e.to_string() });
                }
            }
        }
        attempt += 1;
    }
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, TableFormulaError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        TableFormulaError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve the recognizer, from most-specific to least-specific.
///
/// 1. **Pre-built recognizer** (`config.recognizer`), used as-is.
/// 2. **Pre-built provider** (`config.provider`), wrapped.
/// 3. **Named provider** (`config.provider_name`) via
///    [`ProviderFactory::create_llm_provider`], which reads that provider's
///    API key from the environment.
/// 4. **GLM** when `GLM_API_KEY` is set. The default backend.
/// 5. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 6. **OpenAI** when `OPENAI_API_KEY` is set.
/// 7. **Full auto-detection** via [`ProviderFactory::from_env`].
///
/// Nothing resolvable is a [`TableFormulaError::ProviderNotConfigured`],
/// raised before the document is opened.
pub fn resolve_recognizer(config: &RecognitionConfig) -> Result<Arc<dyn FormulaRecognizer>, TableFormulaError> {
    if let Some(ref recognizer) = config.recognizer {
        return Ok(Arc::clone(recognizer));
    }

    let provider_model = || config.model.clone().unwrap_or_else(|| DEFAULT_PROVIDER_MODEL.to_string());

    if let Some(ref provider) = config.provider {
        return Ok(Arc::new(ProviderRecognizer::new(Arc::clone(provider), provider_model(), config)));
    }

    if let Some(ref name) = config.provider_name {
        let model = provider_model();
        let provider = create_vision_provider(name, &model)?;
        info!("Vision backend: {} / {}", name, model);
        return Ok(Arc::new(ProviderRecognizer::new(provider, model, config)));
    }

    if let Some(api_key) = non_empty_env("GLM_API_KEY") {
        let model = config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let mut glm = GlmRecognizer::new(api_key, model, config)?;
        if let Some(base) = non_empty_env("GLM_API_BASE") {
            glm = glm.with_base_url(base);
        }
        info!("Vision backend: glm / {}", glm.model());
        return Ok(Arc::new(glm));
    }

    if let (Some(prov), Some(model)) = (non_empty_env("EDGEQUAKE_LLM_PROVIDER"), non_empty_env("EDGEQUAKE_MODEL")) {
        let provider = create_vision_provider(&prov, &model)?;
        info!("Vision backend: {} / {}", prov, model);
        return Ok(Arc::new(ProviderRecognizer::new(provider, model, config)));
    }

    if non_empty_env("OPENAI_API_KEY").is_some() {
        let model = provider_model();
        let provider = create_vision_provider("openai", &model)?;
        info!("Vision backend: openai / {}", model);
        return Ok(Arc::new(ProviderRecognizer::new(provider, model, config)));
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| TableFormulaError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision backend could be resolved from the environment.\n\
                Set GLM_API_KEY, OPENAI_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(Arc::new(ProviderRecognizer::new(llm_provider, provider_model(), config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        error: RecognitionError,
        delay: Duration,
    }

    impl Scripted {
        fn new(fail_first: u32, error: RecognitionError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                error,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl FormulaRecognizer for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn recognize(&self, _image: &CellImage) -> Result<String, RecognitionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            if n < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok("x^2".into())
            }
        }
    }

    fn image() -> CellImage {
        CellImage {
            page: 1,
            table_index: 0,
            cell_index: 0,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            png: vec![],
        }
    }

    fn policy(max_retries: u32) -> CallPolicy {
        CallPolicy {
            timeout_secs: 5,
            max_retries,
            retry_backoff_ms: 1,
        }
    }

    fn http(status: u16) -> RecognitionError {
        RecognitionError::Http {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn build_options_defaults() {
        let config = RecognitionConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(1024));
    }

    #[tokio::test]
    async fn baseline_is_at_most_once() {
        let r = Scripted::new(1, http(503));
        let out = recognize_cell(&r, &image(), policy(0)).await;
        assert!(matches!(out, Err(CellError::RecognitionFailed { .. })));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_when_enabled() {
        let r = Scripted::new(2, http(429));
        let out = recognize_cell(&r, &image(), policy(3)).await;
        assert_eq!(out.unwrap(), "x^2");
        assert_eq!(r.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let r = Scripted::new(5, http(401));
        let out = recognize_cell(&r, &image(), policy(3)).await;
        assert!(matches!(out, Err(CellError::RecognitionFailed { .. })));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_final() {
        let mut r = Scripted::new(0, http(500));
        r.delay = Duration::from_secs(60);
        let out = recognize_cell(&r, &image(), policy(3)).await;
        assert_eq!(out, Err(CellError::RecognitionTimeout { secs: 5 }));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_timeout_counts_as_timeout_and_is_not_retried() {
        let r = Scripted::new(5, RecognitionError::Timeout { secs: 10 });
        let out = recognize_cell(&r, &image(), policy(3)).await;
        assert_eq!(out, Err(CellError::RecognitionTimeout { secs: 5 }));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prebuilt_recognizer_wins() {
        let r: Arc<dyn FormulaRecognizer> = Arc::new(Scripted::new(0, http(500)));
        let config = RecognitionConfig::builder()
            .recognizer(Arc::clone(&r))
            .provider_name("does-not-exist")
            .build()
            .unwrap();
        let resolved = resolve_recognizer(&config).unwrap();
        assert_eq!(resolved.model(), "scripted");
    }
}
