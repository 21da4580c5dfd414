use reqwest::Client;
use serde_json::json;
use yotei_core::error::{AgentError, Result};
use yotei_core::types::{ChatRequest, ChatResponse, ToolDefinition, ToolInvocation, Usage};

use crate::provider::{decision_from_args, LlmProvider, REVIEW_DECISION_TOOL_NAME};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Claude LLM provider.
pub struct AnthropicLlm {
    client: Client,
    api_key: String,
    model: String,
}

impl AnthropicLlm {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
        }
    }

    /// Split messages for the Anthropic API. Every system message — the
    /// orchestrator emits them mid-conversation as round feedback — is
    /// hoisted into one joined system prompt; the rest keep their roles.
    fn build_messages(request: &ChatRequest) -> (String, Vec<serde_json::Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages = Vec::new();

        for m in &request.messages {
            if m.role == "system" {
                if !m.content.trim().is_empty() {
                    system_parts.push(&m.content);
                }
                continue;
            }
            if m.role != "user" && m.role != "assistant" {
                continue;
            }
            messages.push(json!({
                "role": m.role,
                "content": [{ "type": "text", "text": m.content }],
            }));
        }

        (system_parts.join("\n"), messages)
    }

    async fn send(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Llm {
                provider: "anthropic".to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = response.status().as_u16();
        let response_text = response.text().await.map_err(|e| AgentError::Llm {
            provider: "anthropic".to_string(),
            message: format!("failed to read response body: {e}"),
        })?;

        if !(200..300).contains(&status) {
            return Err(AgentError::Http {
                status,
                body: response_text,
            });
        }

        serde_json::from_str(&response_text).map_err(|e| AgentError::Llm {
            provider: "anthropic".to_string(),
            message: format!("failed to parse response JSON: {e}"),
        })
    }

    fn parse_response(parsed: &serde_json::Value) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut decision = None;

        if let Some(blocks) = parsed["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(text) = block["text"].as_str() {
                            if !content.is_empty() && !text.trim().is_empty() {
                                content.push('\n');
                            }
                            content.push_str(text);
                        }
                    }
                    Some("tool_use") => {
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        let arguments = block["input"].clone();
                        if name == REVIEW_DECISION_TOOL_NAME {
                            decision = Some(decision_from_args(&arguments));
                            continue;
                        }
                        if name.is_empty() {
                            continue;
                        }
                        tool_calls.push(ToolInvocation { name, arguments });
                    }
                    _ => {}
                }
            }
        }

        let usage = match (
            parsed["usage"]["input_tokens"].as_u64(),
            parsed["usage"]["output_tokens"].as_u64(),
        ) {
            (Some(input), Some(output)) => Some(Usage {
                input_tokens: input as u32,
                output_tokens: output as u32,
            }),
            _ => None,
        };

        ChatResponse {
            content,
            tool_calls,
            decision,
            usage,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let (system, messages) = Self::build_messages(request);

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(1500),
            "messages": messages,
        });

        if !system.is_empty() {
            body.as_object_mut()
                .unwrap()
                .insert("system".to_string(), json!(system));
        }
        if let Some(temp) = request.temperature {
            body.as_object_mut()
                .unwrap()
                .insert("temperature".to_string(), json!(temp));
        }

        body
    }
}

impl LlmProvider for AnthropicLlm {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(&request);
        let parsed = self.send(&body).await?;
        Ok(Self::parse_response(&parsed))
    }

    async fn chat_with_tools(
        &self,
        request: ChatRequest,
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Result<ChatResponse> {
        let mut body = self.build_body(&request);

        let anthropic_tools: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let obj = body.as_object_mut().unwrap();
        obj.insert("tools".to_string(), json!(anthropic_tools));
        obj.insert("tool_choice".to_string(), json!({ "type": tool_choice }));

        let parsed = self.send(&body).await?;
        Ok(Self::parse_response(&parsed))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}
