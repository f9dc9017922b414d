//! AI adapter: provider abstraction for the extraction service.
//!
//! A provider makes exactly one remote call per `complete` and classifies what
//! went wrong. Retrying, timeouts and validation live in `extract`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyze::schema::openai_response_format;
use crate::config::AiConfig;

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

/// What we send for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    /// Few-shot (user, assistant) turns placed before the real input.
    pub examples: Vec<(String, String)>,
    pub user: String,
}

/// Failure of a single call. Transient kinds are worth another attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error (HTTP {0})")]
    Server(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("model refused: {0}")]
    Refused(String),
    #[error("unreadable response: {0}")]
    Malformed(String),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Timeout
                | CallError::RateLimited { .. }
                | CallError::Server(_)
                | CallError::Transport(_)
        )
    }

    /// Server-suggested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status that is not a success.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => CallError::RateLimited { retry_after },
            408 => CallError::Timeout,
            500..=599 => CallError::Server(status),
            _ => CallError::Rejected { status, body },
        }
    }
}

/// Low-level provider: does a *real* remote call. Separated so the retrying
/// extractor is the same for production and tests.
pub trait Provider: Send + Sync + 'static {
    /// Returns the raw text content of the model's answer.
    fn complete<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>>;
    fn name(&self) -> &'static str;
}

/// Convenient alias used by callers.
pub type DynProvider = Arc<dyn Provider>;

/// Factory: build a provider according to config.
pub fn build_provider(config: &AiConfig) -> anyhow::Result<DynProvider> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "mock" => Ok(Arc::new(MockProvider {
            fixed: r#"{"actors": []}"#.to_string(),
        })),
        other => anyhow::bail!("Unsupported provider in config: {other}"),
    }
}

// ------------------------------------------------------------
// Concrete providers
// ------------------------------------------------------------

/// OpenAI provider (Chat Completions with structured output).
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    response_format: serde_json::Value,
}

impl OpenAiProvider {
    pub fn new(config: &AiConfig) -> anyhow::Result<Self> {
        if config.api_key.is_empty() {
            anyhow::bail!("OpenAI provider needs an API key");
        }
        // No client-wide timeout: the extractor bounds each call itself.
        let http = reqwest::Client::builder()
            .user_agent(concat!("news-insights/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            response_format: openai_response_format(),
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    content: Option<String>,
    refusal: Option<String>,
}

fn classify_transport(e: reqwest::Error) -> CallError {
    if e.is_timeout() {
        CallError::Timeout
    } else {
        CallError::Transport(e.to_string())
    }
}

impl Provider for OpenAiProvider {
    fn complete<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        Box::pin(async move {
            let mut messages = vec![Msg {
                role: "system",
                content: &prompt.system,
            }];
            for (user, assistant) in &prompt.examples {
                messages.push(Msg {
                    role: "user",
                    content: user,
                });
                messages.push(Msg {
                    role: "assistant",
                    content: assistant,
                });
            }
            messages.push(Msg {
                role: "user",
                content: &prompt.user,
            });

            let req = Req {
                model: &self.model,
                messages,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                response_format: &self.response_format,
            };

            let resp = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await
                .map_err(classify_transport)?;

            let status = resp.status();
            if !status.is_success() {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = resp.text().await.unwrap_or_default();
                return Err(CallError::from_status(status.as_u16(), body, retry_after));
            }

            let body: Resp = resp
                .json()
                .await
                .map_err(|e| CallError::Malformed(e.to_string()))?;
            let Some(choice) = body.choices.into_iter().next() else {
                return Err(CallError::Malformed("no choices".to_string()));
            };
            if let Some(refusal) = choice.message.refusal.filter(|r| !r.is_empty()) {
                return Err(CallError::Refused(refusal));
            }
            Ok(choice.message.content.unwrap_or_default())
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Answers every prompt with the same content; for dry runs (`AI_TEST_MODE=mock`).
#[derive(Clone)]
pub struct MockProvider {
    pub fixed: String,
}

impl Provider for MockProvider {
    fn complete<'a>(
        &'a self,
        _prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        let out = self.fixed.clone();
        Box::pin(async move { Ok(out) })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
