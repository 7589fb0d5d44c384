mod anthropic;
pub mod context;
mod openai;
pub mod retry;
pub mod session;
#[cfg(test)]
pub(crate) mod test_metrics;
pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use promptloop_common::config::{ProviderConfig, ProviderKind};

pub use anthropic::AnthropicProvider;
pub use context::CallContext;
pub use openai::OpenAiProvider;
pub use retry::RetryPolicy;
pub use session::{MultiTurnError, MultiTurnResult, DEFAULT_MAX_STEPS};
pub use types::{
    ContentBlock, EvalResult, Message, Request, Response, Role, StopReason, TokenUsage,
    ToolDefinition, ToolResult, ToolUse, Turn,
};

/// Boxed future returned by the object-safe provider traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Caller-supplied tool executor. `Err` text is fed back to the model as an
/// error-flagged tool result; it never aborts the loop.
pub type ToolExecutor =
    Box<dyn Fn(ToolUse) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Wrap an async closure as a [`ToolExecutor`].
pub fn tool_executor<F, Fut>(f: F) -> ToolExecutor
where
    F: Fn(ToolUse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    Box::new(move |tool_use| -> BoxFuture<'static, Result<String, String>> {
        Box::pin(f(tool_use))
    })
}

/// Structured error from a non-2xx backend response.
///
/// Fields are filled from whatever the backend's error envelope carries;
/// anything absent stays empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub error_type: String,
    pub message: String,
    pub request_id: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status {}", self.status)?;
        if !self.error_type.is_empty() {
            write!(f, " ({})", self.error_type)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if !self.request_id.is_empty() {
            write!(f, " [request_id={}]", self.request_id)?;
        }
        Ok(())
    }
}

/// Errors from LLM API calls and tool loops.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no API key for {provider}: configure api_key or set {env_var}")]
    MissingAuth { provider: String, env_var: String },

    #[error("LLM API error: {0}")]
    Api(ApiError),

    #[error("LLM HTTP error: {0}")]
    Http(String),

    #[error("LLM request timed out: {0}")]
    Timeout(String),

    #[error("LLM response parse error: {0}")]
    Parse(String),

    #[error("LLM call cancelled")]
    Cancelled,

    #[error("LLM call deadline exceeded")]
    DeadlineExceeded,

    #[error("model stopped for tool_use but issued no tool calls")]
    InconsistentStopReason,

    #[error("model requested {0} tool call(s) but no executor was supplied")]
    MissingExecutor(usize),

    #[error("reached max steps ({0}) without a final answer")]
    MaxStepsReached(u32),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(e.to_string())
        } else if e.is_decode() {
            LlmError::Parse(e.to_string())
        } else {
            LlmError::Http(e.to_string())
        }
    }
}

/// Backend-agnostic completion contract.
pub trait Provider: Send + Sync {
    /// Registry name of this provider instance.
    fn name(&self) -> &str;

    /// One round trip (retried on transient failures).
    fn complete<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Response, LlmError>>;

    /// `complete` plus latency measurement and text/tool-call extraction.
    fn complete_with_tools<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<EvalResult, LlmError>> {
        Box::pin(async move {
            let start = std::time::Instant::now();
            let outcome = self.complete(ctx, request).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        provider = self.name(),
                        latency_ms,
                        error = %e,
                        "Completion failed"
                    );
                    return Err(e);
                }
            };

            Ok(EvalResult {
                text_content: response.text(),
                tool_calls: response.tool_uses(),
                latency_ms,
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
                response,
            })
        })
    }

    /// Tool-loop support, for providers that have it.
    fn as_multi_turn(&self) -> Option<&dyn MultiTurnProvider> {
        None
    }
}

/// Providers that can drive a bounded multi-step tool loop.
pub trait MultiTurnProvider: Provider {
    /// Run the tool loop. `max_steps == 0` means [`DEFAULT_MAX_STEPS`].
    ///
    /// Every error carries the result accumulated up to the failure.
    fn complete_multi_turn<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a Request,
        executor: Option<&'a ToolExecutor>,
        max_steps: u32,
    ) -> BoxFuture<'a, Result<MultiTurnResult, MultiTurnError>>;
}

/// Build a provider for the configured backend, sharing `http`.
pub fn build_provider(config: &ProviderConfig, http: reqwest::Client) -> Arc<dyn Provider> {
    match config.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::with_client(config, http)),
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::with_client(config, http)),
    }
}

/// Explicit key first, then the environment. Empty values count as unset.
pub(crate) fn resolve_api_key(
    provider: &str,
    explicit: Option<&str>,
    env_var: &str,
) -> Result<String, LlmError> {
    if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(LlmError::MissingAuth {
            provider: provider.to_string(),
            env_var: env_var.to_string(),
        }),
    }
}

/// Explicit base URL first, then the environment, then the public endpoint.
pub(crate) fn resolve_base_url(config: &ProviderConfig) -> String {
    let from_env = std::env::var(config.kind.base_url_env())
        .ok()
        .filter(|v| !v.trim().is_empty());

    config
        .base_url
        .clone()
        .filter(|v| !v.trim().is_empty())
        .or(from_env)
        .unwrap_or_else(|| config.kind.default_base_url().to_string())
        .trim()
        .trim_end_matches('/')
        .to_string()
}

/// Race a single HTTP attempt against the call context.
pub(crate) async fn with_context<T>(
    ctx: &CallContext,
    attempt: impl Future<Output = Result<T, LlmError>>,
) -> Result<T, LlmError> {
    tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        result = attempt => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_key_wins() {
        let key = resolve_api_key("anthropic", Some(" sk-test "), "PROMPTLOOP_TEST_NEVER_SET")
            .unwrap();
        assert_eq!(key, "sk-test");
    }

    #[test]
    fn test_missing_key_reports_env_var() {
        let err = resolve_api_key("openai", Some("  "), "PROMPTLOOP_TEST_NEVER_SET").unwrap_err();
        match err {
            LlmError::MissingAuth { provider, env_var } => {
                assert_eq!(provider, "openai");
                assert_eq!(env_var, "PROMPTLOOP_TEST_NEVER_SET");
            }
            other => panic!("Expected MissingAuth, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_base_url_trimmed() {
        let mut config = ProviderConfig::new(ProviderKind::OpenAi);
        config.base_url = Some("http://localhost:9999/".into());
        assert_eq!(resolve_base_url(&config), "http://localhost:9999");
    }

    #[test]
    fn test_api_error_display_skips_empty_fields() {
        let err = ApiError {
            status: 503,
            ..ApiError::default()
        };
        assert_eq!(err.to_string(), "status 503");

        let err = ApiError {
            status: 400,
            error_type: "invalid_request_error".into(),
            message: "bad".into(),
            request_id: "req_1".into(),
        };
        assert_eq!(
            err.to_string(),
            "status 400 (invalid_request_error): bad [request_id=req_1]"
        );
    }

    #[test]
    fn test_build_provider_dispatches_on_kind() {
        let mut config = ProviderConfig::new(ProviderKind::Anthropic);
        config.name = Some("Claude".into());
        let provider = build_provider(&config, reqwest::Client::new());
        assert_eq!(provider.name(), "claude");
        assert!(provider.as_multi_turn().is_some());

        let provider = build_provider(&ProviderConfig::new(ProviderKind::OpenAi), reqwest::Client::new());
        assert_eq!(provider.name(), "openai");
    }
}
