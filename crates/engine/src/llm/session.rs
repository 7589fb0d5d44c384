use std::time::Duration;

use super::types::{ContentBlock, Response, Role, ToolResult, ToolUse, Turn};
use super::{LlmError, ToolExecutor};

/// Step budget used when a caller passes `max_steps == 0`.
pub const DEFAULT_MAX_STEPS: u32 = 5;

/// Everything accumulated over a tool loop.
///
/// Only ever grows. Returned on success and inside [`MultiTurnError`], so a
/// caller can bill tokens and inspect progress even when the loop fails.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultiTurnResult {
    pub final_response: Option<Response>,
    pub all_responses: Vec<Response>,
    pub all_tool_calls: Vec<ToolUse>,
    pub all_tool_results: Vec<ToolResult>,
    pub total_latency_ms: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Round trips attempted, including one that failed.
    pub steps: u32,
    /// Conversation as replayed to the backend, seed messages included.
    pub history: Vec<Turn>,
}

impl MultiTurnResult {
    /// Account for one backend round trip, successful or not.
    pub(crate) fn record_round_trip(&mut self, latency: Duration) {
        self.steps += 1;
        self.total_latency_ms += latency.as_millis() as u64;
    }

    pub(crate) fn record_response(&mut self, response: Response) {
        self.total_input_tokens += response.usage.input_tokens;
        self.total_output_tokens += response.usage.output_tokens;
        self.all_responses.push(response.clone());
        self.final_response = Some(response);
    }

    pub(crate) fn record_tools(&mut self, calls: Vec<ToolUse>, results: Vec<ToolResult>) {
        self.all_tool_calls.extend(calls);
        self.all_tool_results.extend(results);
    }

    /// Concatenated text of the last response.
    pub fn final_text(&self) -> String {
        self.final_response
            .as_ref()
            .map(Response::text)
            .unwrap_or_default()
    }
}

/// A failed tool loop: the error plus everything accumulated before it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct MultiTurnError {
    pub partial: Box<MultiTurnResult>,
    #[source]
    pub error: LlmError,
}

impl MultiTurnError {
    pub(crate) fn new(partial: MultiTurnResult, error: LlmError) -> Self {
        Self {
            partial: Box::new(partial),
            error,
        }
    }
}

pub(crate) fn effective_max_steps(max_steps: u32) -> u32 {
    if max_steps == 0 {
        DEFAULT_MAX_STEPS
    } else {
        max_steps
    }
}

/// Run the executor once per tool use, in order.
///
/// Executor errors become error-flagged results rather than propagating.
pub(crate) async fn execute_tools(executor: &ToolExecutor, tool_uses: &[ToolUse]) -> Vec<ToolResult> {
    let mut results = Vec::with_capacity(tool_uses.len());

    for tool_use in tool_uses {
        let (content, is_error) = match executor(tool_use.clone()).await {
            Ok(content) => (content, false),
            Err(error) => {
                tracing::warn!(
                    tool = %tool_use.name,
                    tool_use_id = %tool_use.id,
                    error = %error,
                    "Tool execution failed, reporting to model"
                );
                (error, true)
            }
        };

        results.push(ToolResult {
            tool_use_id: tool_use.id.clone(),
            content,
            is_error,
        });
    }

    results
}

/// The user turn carrying one step's tool results, in tool-use order.
pub(crate) fn tool_results_turn(results: &[ToolResult]) -> Turn {
    Turn {
        role: Role::User,
        content: results.iter().cloned().map(ContentBlock::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tool_executor;
    use crate::llm::types::{StopReason, TokenUsage};
    use serde_json::Map;

    fn tool_use(id: &str, name: &str) -> ToolUse {
        ToolUse {
            id: id.into(),
            name: name.into(),
            input: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_tools_preserves_order_and_flags_errors() {
        let executor = tool_executor(|tool_use: ToolUse| async move {
            if tool_use.name == "broken" {
                Err("disk on fire".to_string())
            } else {
                Ok(format!("ran {}", tool_use.name))
            }
        });

        let uses = vec![
            tool_use("t1", "alpha"),
            tool_use("t2", "broken"),
            tool_use("t3", "gamma"),
        ];
        let results = execute_tools(&executor, &uses).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].tool_use_id, "t1");
        assert_eq!(results[0].content, "ran alpha");
        assert!(!results[0].is_error);
        assert_eq!(results[1].tool_use_id, "t2");
        assert_eq!(results[1].content, "disk on fire");
        assert!(results[1].is_error);
        assert_eq!(results[2].tool_use_id, "t3");
    }

    #[test]
    fn test_accounting_sums_responses() {
        let mut result = MultiTurnResult::default();
        let response = Response {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: "hi".into() }],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 7,
                output_tokens: 3,
            },
            id: None,
            model: None,
        };

        result.record_round_trip(Duration::from_millis(12));
        result.record_response(response.clone());
        result.record_round_trip(Duration::from_millis(8));
        result.record_response(response);

        assert_eq!(result.steps, 2);
        assert_eq!(result.total_latency_ms, 20);
        assert_eq!(result.total_input_tokens, 14);
        assert_eq!(result.total_output_tokens, 6);
        assert_eq!(result.all_responses.len(), 2);
        assert_eq!(result.final_text(), "hi");
    }

    #[test]
    fn test_zero_steps_means_default() {
        assert_eq!(effective_max_steps(0), DEFAULT_MAX_STEPS);
        assert_eq!(effective_max_steps(2), 2);
    }

    #[test]
    fn test_tool_results_turn_is_user_role() {
        let turn = tool_results_turn(&[ToolResult {
            tool_use_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        }]);
        assert_eq!(turn.role, Role::User);
        assert!(matches!(
            &turn.content[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "t1"
        ));
    }
}
