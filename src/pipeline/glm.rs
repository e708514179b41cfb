//! GLM vision backend (Zhipu `chat/completions`).
//!
//! The default recognizer. One non-streaming POST per cell, bearer-auth with
//! `GLM_API_KEY`, thinking disabled so the reply is only the answer.

use crate::config::RecognitionConfig;
use crate::error::{RecognitionError, TableFormulaError};
use crate::pipeline::encode::png_data_uri;
use crate::pipeline::response::extract_latex;
use crate::pipeline::vision::{CellImage, FormulaRecognizer};
use crate::prompts::{TABLE_CELL_INSTRUCTION, TABLE_CELL_SYSTEM_PROMPT};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Public GLM API base.
pub const GLM_API_BASE: &str = "https://open.bigmodel.cn/api/paas/v4";

/// Extra seconds the HTTP client waits past `api_timeout_secs`, so the
/// per-call timeout of the recognition stage fires first.
const CLIENT_TIMEOUT_GRACE_SECS: u64 = 5;

/// Longest upstream error body kept in a diagnostic.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
    stream: bool,
    thinking: Thinking,
    do_sample: bool,
    top_p: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Content<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Content<'a> {
    Text(&'a str),
    Parts(Vec<Part<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Part<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
    clear_thinking: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// [`FormulaRecognizer`] for the GLM chat-completions API.
#[derive(Debug, Clone)]
pub struct GlmRecognizer {
    client: reqwest::Client,
    client_timeout_secs: u64,
    api_key: String,
    base_url: String,
    model: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
}

impl GlmRecognizer {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        config: &RecognitionConfig,
    ) -> Result<Self, TableFormulaError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                config.api_timeout_secs.saturating_add(CLIENT_TIMEOUT_GRACE_SECS),
            ))
            .build()
            .map_err(|e| TableFormulaError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            client_timeout_secs: config.api_timeout_secs.saturating_add(CLIENT_TIMEOUT_GRACE_SECS),
            api_key: api_key.into(),
            base_url: GLM_API_BASE.to_string(),
            model: model.into(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| TABLE_CELL_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Point at another deployment (proxy, self-hosted gateway, test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, png: &[u8]) -> Result<Vec<u8>, RecognitionError> {
        let data_uri = png_data_uri(png);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: Content::Text(&self.system_prompt),
                },
                Message {
                    role: "user",
                    content: Content::Parts(vec![
                        Part::Text {
                            text: TABLE_CELL_INSTRUCTION,
                        },
                        Part::ImageUrl {
                            image_url: ImageUrl { url: data_uri },
                        },
                    ]),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
            thinking: Thinking {
                kind: "disabled",
                clear_thinking: true,
            },
            do_sample: true,
            top_p: 0.95,
            response_format: ResponseFormat { kind: "text" },
        };
        serde_json::to_vec(&request).map_err(|e| RecognitionError::Transport(format!("request encoding: {}", e)))
    }

    /// A client-side timeout is final, unlike other transport failures.
    fn request_error(&self, e: reqwest::Error) -> RecognitionError {
        if e.is_timeout() {
            RecognitionError::Timeout {
                secs: self.client_timeout_secs,
            }
        } else {
            RecognitionError::Transport(e.to_string())
        }
    }
}

/// The assistant text of a chat-completions reply body.
fn reply_content(body: &str) -> Result<String, RecognitionError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| RecognitionError::MalformedResponse(format!("response body is not JSON: {}", e)))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| RecognitionError::MalformedResponse("response has no message content".into()))
}

#[async_trait]
impl FormulaRecognizer for GlmRecognizer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn recognize(&self, image: &CellImage) -> Result<String, RecognitionError> {
        let body = self.request_body(&image.png)?;
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.request_error(e))?;
        if !status.is_success() {
            return Err(RecognitionError::Http {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        let content = reply_content(&text)?;
        debug!(
            "GLM reply for p{} t{} #{}: {} chars",
            image.page,
            image.table_index,
            image.cell_index,
            content.len()
        );
        extract_latex(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BoundingBox;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn recognizer() -> GlmRecognizer {
        GlmRecognizer::new("test-key", "glm-4.6v-flash", &RecognitionConfig::default()).unwrap()
    }

    #[test]
    fn client_waits_longer_than_the_call_timeout() {
        let config = RecognitionConfig::builder().api_timeout_secs(30).build().unwrap();
        let glm = GlmRecognizer::new("k", "m", &config).unwrap();
        assert!(glm.client_timeout_secs > config.api_timeout_secs);
    }

    fn image() -> CellImage {
        CellImage {
            page: 1,
            table_index: 0,
            cell_index: 2,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            png: b"\x89PNG fake".to_vec(),
        }
    }

    #[test]
    fn request_payload_shape() {
        let body = recognizer().request_body(b"\x89PNG").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["model"], "glm-4.6v-flash");
        assert_eq!(json["stream"], false);
        assert_eq!(json["thinking"]["type"], "disabled");
        assert_eq!(json["response_format"]["type"], "text");
        assert_eq!(json["messages"][0]["role"], "system");
        let parts = &json["messages"][1]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn reply_content_reads_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"latex\":\"a\"}"}}]}"#;
        assert_eq!(reply_content(body).unwrap(), r#"{"latex":"a"}"#);
        assert!(reply_content(r#"{"choices":[]}"#).is_err());
        assert!(reply_content("<html>").is_err());
    }

    /// Serve one canned HTTP response on a local port, after reading the request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            if k.eq_ignore_ascii_case("content-length") {
                                v.trim().parse::<usize>().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn successful_reply_is_parsed() {
        let base = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"choices":[{"message":{"content":"```json\n{\"latex\": \"x_1\"}\n```"}}]}"#,
        )
        .await;
        let latex = recognizer().with_base_url(base).recognize(&image()).await.unwrap();
        assert_eq!(latex, "x_1");
    }

    #[tokio::test]
    async fn non_2xx_is_an_http_error() {
        let base = serve_once("HTTP/1.1 429 Too Many Requests", r#"{"error":{"code":"1305"}}"#).await;
        let err = recognizer().with_base_url(base).recognize(&image()).await.unwrap_err();
        match err {
            RecognitionError::Http { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("1305"));
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }
    }
}
