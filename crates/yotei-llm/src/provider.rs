use yotei_core::error::Result;
use yotei_core::types::{ChatRequest, ChatResponse, ReviewDecision, ToolDefinition};

/// Reserved tool name whose arguments are captured as a review decision
/// object instead of a schedule action.
pub const REVIEW_DECISION_TOOL_NAME: &str = "set_review_outcome";

/// Trait for LLM chat completion providers.
///
/// Implementations normalize their native wire formats (system-prompt
/// isolation, multi-block content, string-encoded arguments) into the
/// shared `ChatResponse` shape: plain text plus structured tool calls.
pub trait LlmProvider: Send + Sync {
    /// Send a chat request and receive a completion response.
    fn chat(&self, request: ChatRequest) -> impl std::future::Future<Output = Result<ChatResponse>> + Send;

    /// Send a chat request with tool definitions. The LLM may return tool
    /// invocations in the response's `tool_calls` field instead of (or
    /// alongside) text content. Default implementation falls back to
    /// `chat` (ignoring tools).
    fn chat_with_tools(
        &self,
        request: ChatRequest,
        _tools: &[ToolDefinition],
        _tool_choice: &str,
    ) -> impl std::future::Future<Output = Result<ChatResponse>> + Send {
        self.chat(request)
    }

    /// Return the provider name (e.g. "anthropic", "openai").
    fn name(&self) -> &str;
}

/// Build a `ReviewDecision` from the reserved tool's arguments.
pub(crate) fn decision_from_args(args: &serde_json::Value) -> ReviewDecision {
    ReviewDecision {
        action_required: args["action_required"].as_bool().unwrap_or(false),
        should_reply: args["should_reply"].as_bool().unwrap_or(false),
        reply: args["reply"].as_str().unwrap_or("").to_string(),
        notes: args["notes"].as_str().unwrap_or("").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_from_args() {
        let decision = decision_from_args(&json!({
            "action_required": true,
            "should_reply": false,
            "notes": "internal"
        }));
        assert!(decision.action_required);
        assert!(!decision.should_reply);
        assert_eq!(decision.reply, "");
        assert_eq!(decision.notes, "internal");
    }
}
