use std::time::Instant;

use promptloop_common::config::{ProviderConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::CallContext;
use super::retry::RetryPolicy;
use super::session::{self, MultiTurnError, MultiTurnResult};
use super::types::{
    input_from_value, ContentBlock, Request, Response, Role, StopReason, TokenUsage, Turn,
};
use super::{
    resolve_api_key, resolve_base_url, with_context, ApiError, BoxFuture, LlmError,
    MultiTurnProvider, Provider, ToolExecutor,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Request wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [AnthropicMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    input_schema: Value,
}

// ---------------------------------------------------------------------------
// Response wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicError {
    #[serde(default)]
    error: Option<AnthropicErrorDetail>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    r#type: String,
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

/// Anthropic has no system or tool role in `messages`: system-role messages
/// fold into the `system` field and everything else non-assistant is `user`.
fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        Role::User | Role::System | Role::Tool => "user",
    }
}

fn to_wire_message(turn: &Turn) -> AnthropicMessage {
    let content = turn
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => AnthropicContentBlock::Text { text: text.clone() },
            ContentBlock::ToolUse { id, name, input } => AnthropicContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: Value::Object(input.clone()),
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => AnthropicContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
                is_error: *is_error,
            },
        })
        .collect();

    AnthropicMessage {
        role: wire_role(turn.role),
        content,
    }
}

/// Split a request into the `system` field and the seed conversation.
fn seed_conversation(request: &Request) -> (Option<String>, Vec<Turn>) {
    let mut system_parts: Vec<&str> = request.system_prompt().into_iter().collect();
    let mut turns = Vec::with_capacity(request.messages.len());

    for msg in &request.messages {
        if msg.role == Role::System {
            let text = msg.content.trim();
            if !text.is_empty() {
                system_parts.push(text);
            }
        } else {
            turns.push(Turn::from(msg));
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    (system, turns)
}

fn parse_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        None | Some("end_turn") => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some(other) => StopReason::Other(other.to_string()),
    }
}

fn from_wire_response(resp: AnthropicResponse) -> Response {
    let content = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            AnthropicResponseBlock::Text { text } => Some(ContentBlock::Text { text }),
            AnthropicResponseBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                id,
                name,
                input: input_from_value(input),
            }),
            AnthropicResponseBlock::Unsupported => None,
        })
        .collect();

    Response {
        role: resp.role.as_deref().map(Role::parse).unwrap_or(Role::Assistant),
        content,
        stop_reason: parse_stop_reason(resp.stop_reason.as_deref()),
        usage: TokenUsage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
        id: resp.id,
        model: resp.model,
    }
}

fn parse_error(status: u16, header_request_id: Option<String>, body: &str) -> ApiError {
    let mut api = ApiError {
        status,
        request_id: header_request_id.unwrap_or_default(),
        ..ApiError::default()
    };

    match serde_json::from_str::<AnthropicError>(body) {
        Ok(envelope) => {
            if let Some(detail) = envelope.error {
                api.error_type = detail.r#type;
                api.message = detail.message;
            }
            if api.request_id.is_empty() {
                api.request_id = envelope.request_id.unwrap_or_default();
            }
        }
        Err(_) => api.message = body.trim().to_string(),
    }

    api
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    http: reqwest::Client,
    name: String,
    api_key: Option<String>,
    api_key_env: String,
    messages_url: String,
    model: String,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &ProviderConfig, http: reqwest::Client) -> Self {
        debug_assert_eq!(config.kind, ProviderKind::Anthropic);

        Self {
            http,
            name: config.resolved_name(),
            api_key: config.api_key.clone(),
            api_key_env: config.resolved_api_key_env().to_string(),
            messages_url: format!("{}/v1/messages", resolve_base_url(config)),
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

    /// One round trip through the retry policy.
    async fn send(
        &self,
        ctx: &CallContext,
        api_key: &str,
        system: Option<&str>,
        messages: &[AnthropicMessage],
        request: &Request,
    ) -> Result<Response, LlmError> {
        let tools = request
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.trim(),
                description: t.description.as_deref(),
                input_schema: t.schema(),
            })
            .collect();

        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system,
            messages,
            tools,
            temperature: request.temperature,
        };

        self.retry
            .run(ctx, "anthropic.messages", || {
                with_context(ctx, self.send_once(api_key, &body))
            })
            .await
    }

    /// Single attempt.
    async fn send_once(
        &self,
        api_key: &str,
        body: &AnthropicRequest<'_>,
    ) -> Result<Response, LlmError> {
        let start = Instant::now();

        let sent = self
            .http
            .post(&self.messages_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await;
        metrics::histogram!("llm.api.latency", "provider" => "anthropic", "model" => self.model.clone())
            .record(start.elapsed().as_secs_f64());

        let response = sent?;
        let status = response.status();

        if !status.is_success() {
            let request_id = response
                .headers()
                .get("request-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(
                        provider = "anthropic",
                        status = status.as_u16(),
                        error = %e,
                        "Failed to read error response body"
                    );
                    String::new()
                }
            };
            let api = parse_error(status.as_u16(), request_id, &body);

            metrics::counter!("llm.api.errors", "provider" => "anthropic").increment(1);
            return Err(LlmError::Api(api));
        }

        let text = response.text().await?;
        let parsed: AnthropicResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::Parse(format!("Failed to parse Anthropic response: {}", e)))?;

        let llm_response = from_wire_response(parsed);

        metrics::counter!("llm.api.input_tokens", "provider" => "anthropic")
            .increment(llm_response.usage.input_tokens);
        metrics::counter!("llm.api.output_tokens", "provider" => "anthropic")
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

        let (system, turns) = seed_conversation(request);
        let messages: Vec<AnthropicMessage> = turns.iter().map(to_wire_message).collect();

        self.send(ctx, &api_key, system.as_deref(), &messages, request)
            .await
    }

    /// Tool loop. Anthropic replays the full block history every step, with
    /// each step's tool results packed into one user message.
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

        let (system, seed) = seed_conversation(request);
        let mut messages: Vec<AnthropicMessage> = seed.iter().map(to_wire_message).collect();
        result.history = seed;

        while result.steps < max_steps {
            if let Some(e) = ctx.error() {
                return Err(MultiTurnError::new(result, e));
            }

            let start = Instant::now();
            let outcome = self
                .send(ctx, &api_key, system.as_deref(), &messages, request)
                .await;
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

            let reply = Turn {
                role: response.role,
                content: response.content.clone(),
            };
            messages.push(to_wire_message(&reply));
            result.history.push(reply);

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
                metrics::histogram!("llm.multi_turn.steps", "provider" => "anthropic")
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
            let results_turn = session::tool_results_turn(&tool_results);
            messages.push(to_wire_message(&results_turn));
            result.history.push(results_turn);
            result.record_tools(tool_uses, tool_results);
        }

        tracing::warn!(provider = %self.name, max_steps, "Tool loop hit max steps");
        Err(MultiTurnError::new(result, LlmError::MaxStepsReached(max_steps)))
    }
}

impl Provider for AnthropicProvider {
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

impl MultiTurnProvider for AnthropicProvider {
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
