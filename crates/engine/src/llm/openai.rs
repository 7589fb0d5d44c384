use std::time::Instant;

use promptloop_common::config::{ProviderConfig, ProviderKind};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::context::CallContext;
use super::retry::RetryPolicy;
use super::session::{self, MultiTurnError, MultiTurnResult};
use super::types::{
    parse_tool_arguments, ContentBlock, Request, Response, Role, StopReason, TokenUsage,
    ToolResult, Turn,
};
use super::{
    resolve_api_key, resolve_base_url, with_context, ApiError, BoxFuture, LlmError,
    MultiTurnProvider, Provider, ToolExecutor,
};

// ---------------------------------------------------------------------------
// Request wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Serialize)]
struct ChatTool<'a> {
    r#type: &'static str,
    function: ChatFunction<'a>,
}

#[derive(Serialize)]
struct ChatFunction<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    parameters: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ChatToolCallFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChatToolCallFunction {
    name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    arguments: String,
}

/// Compatible servers send explicit `null` where OpenAI omits the field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Response wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct OpenAiError {
    #[serde(default)]
    error: Option<OpenAiErrorDetail>,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

/// Flatten one turn into chat messages.
///
/// Tool results each become a `tool` message, in block order. Plain text
/// from a tool-role turn goes out as `user`: a `tool` message without a
/// `tool_call_id` is rejected by the backend.
fn turn_to_wire(turn: &Turn) -> Vec<ChatMessage> {
    match turn.role {
        Role::Assistant => vec![assistant_to_wire(&turn.content)],
        Role::System => vec![ChatMessage::text("system", joined_text(&turn.content))],
        Role::User | Role::Tool => {
            let mut wire = Vec::new();

            for block in &turn.content {
                match block {
                    ContentBlock::Text { text } => {
                        wire.push(ChatMessage::text("user", text.clone()));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        wire.push(ChatMessage {
                            role: "tool",
                            content: Some(content.clone()),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                    ContentBlock::ToolUse { .. } => {}
                }
            }

            wire
        }
    }
}

fn assistant_to_wire(content: &[ContentBlock]) -> ChatMessage {
    let mut tool_calls = Vec::new();

    for block in content {
        if let ContentBlock::ToolUse { id, name, input } = block {
            tool_calls.push(ChatToolCall {
                id: id.clone(),
                r#type: function_type(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: Value::Object(input.clone()).to_string(),
                },
            });
        }
    }

    let text = joined_text(content);

    ChatMessage {
        role: "assistant",
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    }
}

fn joined_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// The system prompt leads as its own message; seed messages follow in order.
fn seed_messages(request: &Request) -> (Vec<Turn>, Vec<ChatMessage>) {
    let turns: Vec<Turn> = request.messages.iter().map(Turn::from).collect();

    let mut wire = Vec::with_capacity(turns.len() + 1);
    if let Some(system) = request.system_prompt() {
        wire.push(ChatMessage::text("system", system.to_string()));
    }
    wire.extend(turns.iter().flat_map(turn_to_wire));

    (turns, wire)
}

fn parse_finish_reason(raw: Option<&str>) -> StopReason {
    match raw {
        None | Some("stop") => StopReason::EndTurn,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
    }
}

fn from_wire_response(resp: ChatResponse) -> Result<Response, LlmError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Parse("Empty choices array".into()))?;

    let mut content = Vec::new();

    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
    }

    for tc in choice.message.tool_calls {
        content.push(ContentBlock::ToolUse {
            input: parse_tool_arguments(&tc.function.arguments),
            id: tc.id,
            name: tc.function.name,
        });
    }

    let usage = resp.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    Ok(Response {
        role: choice
            .message
            .role
            .as_deref()
            .map(Role::parse)
            .unwrap_or(Role::Assistant),
        content,
        stop_reason: parse_finish_reason(choice.finish_reason.as_deref()),
        usage,
        id: resp.id,
        model: resp.model,
    })
}

fn parse_error(status: u16, request_id: Option<String>, body: &str) -> ApiError {
    let mut api = ApiError {
        status,
        request_id: request_id.unwrap_or_default(),
        ..ApiError::default()
    };

    match serde_json::from_str::<OpenAiError>(body) {
        Ok(OpenAiError {
            error: Some(detail),
        }) => {
            api.message = detail.message;
            api.error_type = match (detail.r#type, detail.code) {
                (Some(t), _) if !t.is_empty() => t,
                (_, Some(Value::String(code))) => code,
                _ => String::new(),
            };
        }
        Ok(_) => {}
        Err(_) => api.message = body.trim().to_string(),
    }

    api
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Adapter for the OpenAI Chat Completions API.
pub struct OpenAiProvider {
    http: reqwest::Client,
    name: String,
    api_key: Option<String>,
    api_key_env: String,
    chat_url: String,
    model: String,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &ProviderConfig, http: reqwest::Client) -> Self {
        debug_assert_eq!(config.kind, ProviderKind::OpenAi);

        // Accept base URLs given with or without the version segment.
        let base = resolve_base_url(config);
        let chat_url = if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        };

        Self {
            http,
            name: config.resolved_name(),
            api_key: config.api_key.clone(),
            api_key_env: config.resolved_api_key_env().to_string(),
            chat_url,
            model: config.resolved_model().to_string(),
            retry: RetryPolicy::from_config(config.max_retries, config.retry_base_delay_ms),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn api_key(&self) -> Result<String, LlmError> {
        resolve_api_key(&self.name, self.api_key.as_deref(), &self.api_key_env)
    }

    async fn send(
        &self,
        ctx: &CallContext,
        api_key: &str,
        messages: &[ChatMessage],
        request: &Request,
    ) -> Result<Response, LlmError> {
        let tools = request
            .tools
            .iter()
            .map(|t| ChatTool {
                r#type: "function",
                function: ChatFunction {
                    name: t.name.trim(),
                    description: t.description.as_deref(),
                    parameters: t.schema(),
                },
            })
            .collect();

        let body = ChatRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            messages,
            tools,
            temperature: request.temperature,
        };

        self.retry
            .run(ctx, "openai.chat_completions", || {
                with_context(ctx, self.send_once(api_key, &body))
            })
            .await
    }

    async fn send_once(&self, api_key: &str, body: &ChatRequest<'_>) -> Result<Response, LlmError> {
        let start = Instant::now();

        let sent = self
            .http
            .post(&self.chat_url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await;
        metrics::histogram!("llm.api.latency", "provider" => "openai", "model" => self.model.clone())
            .record(start.elapsed().as_secs_f64());

        let response = sent?;
        let status = response.status();

        if !status.is_success() {
            let request_id = response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(
                        provider = "openai",
                        status = status.as_u16(),
                        error = %e,
                        "Failed to read error response body"
                    );
                    String::new()
                }
            };
            let api = parse_error(status.as_u16(), request_id, &body);

            metrics::counter!("llm.api.errors", "provider" => "openai").increment(1);
            return Err(LlmError::Api(api));
        }

        let text = response.text().await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::Parse(format!("Failed to parse OpenAI response: {}", e)))?;

        let llm_response = from_wire_response(parsed)?;

        metrics::counter!("llm.api.input_tokens", "provider" => "openai")
            .increment(llm_response.usage.input_tokens);
        metrics::counter!("llm.api.output_tokens", "provider" => "openai")
            .increment(llm_response.usage.output_tokens);

        Ok(llm_response)
    }

    async fn complete_inner(
        &self,
        ctx: &CallContext,
        request: &Request,
    ) -> Result<Response, LlmError> {
        request.validate()?;
        let api_key = self.api_key()?;

        let (_, messages) = seed_messages(request);
        self.send(ctx, &api_key, &messages, request).await
    }

    /// Tool loop. The chat API is stateless, so the flattened message list
    /// grows every step: the assistant message carrying `tool_calls`, then
    /// one `tool` message per result in call order.
    async fn run_multi_turn(
        &self,
        ctx: &CallContext,
        request: &Request,
        executor: Option<&ToolExecutor>,
        max_steps: u32,
    ) -> Result<MultiTurnResult, MultiTurnError> {
        let mut result = MultiTurnResult::default();

        let api_key = match request.validate().and_then(|_| self.api_key()) {
            Ok(key) => key,
            Err(e) => return Err(MultiTurnError::new(result, e)),
        };
        let max_steps = session::effective_max_steps(max_steps);

        let (seed, mut messages) = seed_messages(request);
        result.history = seed;

        while result.steps < max_steps {
            if let Some(e) = ctx.error() {
                return Err(MultiTurnError::new(result, e));
            }

            let start = Instant::now();
            let outcome = self.send(ctx, &api_key, &messages, request).await;
            result.record_round_trip(start.elapsed());

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        provider = %self.name,
                        step = result.steps,
                        error = %e,
                        "Tool loop aborted by LLM error"
                    );
                    return Err(MultiTurnError::new(result, e));
                }
            };

            messages.push(assistant_to_wire(&response.content));
            result.history.push(Turn {
                role: response.role,
                content: response.content.clone(),
            });

            let tool_uses = response.tool_uses();
            let stop_reason = response.stop_reason.clone();

            tracing::debug!(
                provider = %self.name,
                step = result.steps,
                tool_calls = tool_uses.len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "Tool loop step complete"
            );
            result.record_response(response);

            if tool_uses.is_empty() {
                metrics::histogram!("llm.multi_turn.steps", "provider" => "openai")
                    .record(result.steps as f64);
                if stop_reason == StopReason::ToolUse {
                    return Err(MultiTurnError::new(result, LlmError::InconsistentStopReason));
                }
                return Ok(result);
            }

            let Some(executor) = executor else {
                let count = tool_uses.len();
                return Err(MultiTurnError::new(result, LlmError::MissingExecutor(count)));
            };

            let tool_results = session::execute_tools(executor, &tool_uses).await;
            messages.extend(tool_results.iter().map(tool_message));
            result.history.push(session::tool_results_turn(&tool_results));
            result.record_tools(tool_uses, tool_results);
        }

        tracing::warn!(provider = %self.name, max_steps, "Tool loop hit max steps");
        Err(MultiTurnError::new(result, LlmError::MaxStepsReached(max_steps)))
    }
}

fn tool_message(result: &ToolResult) -> ChatMessage {
    ChatMessage {
        role: "tool",
        content: Some(result.content.clone()),
        tool_calls: None,
        tool_call_id: Some(result.tool_use_id.clone()),
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        Box::pin(self.complete_inner(ctx, request))
    }

    fn as_multi_turn(&self) -> Option<&dyn MultiTurnProvider> {
        Some(self)
    }
}

impl MultiTurnProvider for OpenAiProvider {
    fn complete_multi_turn<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a Request,
        executor: Option<&'a ToolExecutor>,
        max_steps: u32,
    ) -> BoxFuture<'a, Result<MultiTurnResult, MultiTurnError>> {
        Box::pin(self.run_multi_turn(ctx, request, executor, max_steps))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
